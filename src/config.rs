/// Model configuration.
///
/// `ModelOptions` collects every behavioral switch of a [`SqlModel`]. It
/// deserializes from JSON with serde, and any field left out takes its
/// default.
///
/// [`SqlModel`]: crate::model::SqlModel
use crate::dataset::RowPolicy;
use crate::error::{Error, Result};
use crate::sequence::StorageHint;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Run loads on the blocking pool instead of the caller's thread.
    pub asynchronous: bool,
    /// Apply the rows materialized before an abort instead of discarding them.
    pub emit_on_abort: bool,
    pub report_progress: bool,
    /// Rows between progress notifications.
    pub progress_interval: usize,
    /// A refresh issued while loading restarts the load instead of failing.
    pub allow_continuous_refreshes: bool,
    pub storage: StorageHint,
    /// Column whose value identifies a row across reloads (partial refresh).
    pub identity_column: Option<String>,
    pub identity_table: Option<String>,
    pub replace_fields_on_add: bool,
    pub fields_to_replace: Vec<String>,
    pub default_field_values: BTreeMap<String, Value>,
    pub filter_enabled: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        ModelOptions {
            asynchronous: true,
            emit_on_abort: true,
            report_progress: false,
            progress_interval: 10,
            allow_continuous_refreshes: false,
            storage: StorageHint::FastReads,
            identity_column: None,
            identity_table: None,
            replace_fields_on_add: false,
            fields_to_replace: Vec::new(),
            default_field_values: BTreeMap::new(),
            filter_enabled: true,
        }
    }
}

impl ModelOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        let options: ModelOptions = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid model options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.progress_interval == 0 {
            return Err(Error::Config("progress_interval must be at least 1".to_string()));
        }
        if self.identity_column.as_deref() == Some("") {
            return Err(Error::Config("identity_column must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn row_policy(&self) -> RowPolicy {
        RowPolicy {
            replace_fields_on_add: self.replace_fields_on_add,
            fields_to_replace: self.fields_to_replace.clone(),
            default_field_values: self.default_field_values.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ModelOptions::default();
        assert!(options.asynchronous);
        assert!(options.emit_on_abort);
        assert!(!options.allow_continuous_refreshes);
        assert_eq!(options.progress_interval, 10);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let options = ModelOptions::from_json(
            r#"{
                "asynchronous": false,
                "storage": "fast_updates",
                "identity_column": "id",
                "default_field_values": { "status": { "Text": "new" } }
            }"#,
        )
        .unwrap();
        assert!(!options.asynchronous);
        assert_eq!(options.storage, StorageHint::FastUpdates);
        assert_eq!(options.identity_column.as_deref(), Some("id"));
        assert_eq!(options.default_field_values["status"], Value::from("new"));
        assert!(options.emit_on_abort);
        assert_eq!(options.row_policy().default_field_values.len(), 1);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            ModelOptions::from_json(r#"{ "progress_interval": 0 }"#),
            Err(Error::Config(_))
        ));
        assert!(ModelOptions::from_json(r#"{ "identity_column": "" }"#).is_err());
        assert!(ModelOptions::from_json("not json").is_err());
    }
}
