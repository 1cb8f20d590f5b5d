/// SQL query text with named parameters.
///
/// Parameters are written in the query as quoted placeholders, `':name'`, and
/// supplied as a name → value map. [`Query::validate`] checks that both sides
/// agree; [`Query::normalized`] strips the quotes so the driver can bind the
/// values natively (`:name`).
use crate::error::{Error, Result};
use crate::value::Value;
use log::error;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    text: String,
    params: BTreeMap<String, Value>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Query {
            text: text.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a named parameter. The leading `:` is optional.
    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set_param(name, value);
        self
    }

    pub fn set_param(&mut self, name: &str, value: impl Into<Value>) {
        self.params.insert(placeholder_name(name), value.into());
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Parameters keyed by placeholder name, including the leading `:`.
    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    /// Checks the quoted placeholders against the supplied parameters.
    ///
    /// Fails when a placeholder has no parameter, when a quote opened before a
    /// placeholder is never closed, or when the number of distinct placeholders
    /// differs from the number of parameters.
    pub fn validate(&self) -> Result<()> {
        let chars: Vec<char> = self.text.chars().collect();
        let mut start: Option<usize> = None;
        let mut found = BTreeSet::new();
        let mut problems = Vec::new();

        for i in 0..chars.len() {
            if chars[i] != '\'' {
                continue;
            }
            match start {
                None if chars.get(i + 1) == Some(&':') => start = Some(i),
                None => {}
                Some(open) => {
                    let name: String = chars[open + 1..i].iter().collect();
                    if !self.params.contains_key(&name) {
                        problems.push(format!("parameter {} not found in passed parameters", name));
                    }
                    found.insert(name);
                    start = None;
                }
            }
        }

        if let Some(open) = start {
            problems.push(format!("unterminated delimiter at position {}", open));
        }
        if found.len() != self.params.len() {
            problems.push(format!(
                "query uses {} parameters but {} were passed",
                found.len(),
                self.params.len()
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            let message = problems.join("; ");
            error!("Invalid query: {}", message);
            Err(Error::InvalidQuery(message))
        }
    }

    /// Query text with every `':name'` placeholder unquoted to `:name`.
    pub fn normalized(&self) -> String {
        let mut text = self.text.clone();
        for name in self.params.keys() {
            text = text.replace(&format!("'{}'", name), name);
        }
        text
    }
}

fn placeholder_name(name: &str) -> String {
    if name.starts_with(':') {
        name.to_string()
    } else {
        format!(":{}", name)
    }
}
