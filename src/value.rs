/// LiveSQL Values
///
/// A `Value` is the dynamically typed cell stored in every row of a dataset.
/// It mirrors the storage classes a SQL driver can hand back (integer, real,
/// text, blob, null) plus the boolean and calendar types most drivers decode
/// on top of them.
///
/// Equality is strict: `Int(1)` and `Real(1.0)` are different values. Text
/// rendering (`to_text`) is what substring filters and CSV-like exports see.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant of a [`Value`], used for column type checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Int,
    Real,
    Text,
    Bool,
    /// Days since 1970-01-01
    Date,
    /// Milliseconds since 1970-01-01T00:00:00
    DateTime,
    Blob,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Date(i32),
    DateTime(i64),
    Blob(Vec<u8>),
}

/// Hashable stand-in for a [`Value`], for indexing identity values.
///
/// Equal values give equal keys. Reals are keyed by their bits with `-0.0`
/// folded into `0.0`; NaN keys match each other although the values do not,
/// so a hit still has to be confirmed with `==`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Null,
    Int(i64),
    Real(u64),
    Text(String),
    Bool(bool),
    Date(i32),
    DateTime(i64),
    Blob(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Int(_) => ValueKind::Int,
            Value::Real(_) => ValueKind::Real,
            Value::Text(_) => ValueKind::Text,
            Value::Bool(_) => ValueKind::Bool,
            Value::Date(_) => ValueKind::Date,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Blob(_) => ValueKind::Blob,
        }
    }

    pub fn key(&self) -> ValueKey {
        match self {
            Value::Null => ValueKey::Null,
            Value::Int(v) => ValueKey::Int(*v),
            Value::Real(v) if *v == 0.0 => ValueKey::Real(0f64.to_bits()),
            Value::Real(v) => ValueKey::Real(v.to_bits()),
            Value::Text(v) => ValueKey::Text(v.clone()),
            Value::Bool(v) => ValueKey::Bool(*v),
            Value::Date(v) => ValueKey::Date(*v),
            Value::DateTime(v) => ValueKey::DateTime(*v),
            Value::Blob(v) => ValueKey::Blob(v.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of the value; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(v) => Some(v),
            _ => None,
        }
    }

    /// Text rendering of the value. Null renders as the empty string.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(v) => v.to_string(),
            Value::Real(v) => v.to_string(),
            Value::Text(v) => v.clone(),
            Value::Bool(v) => v.to_string(),
            Value::Date(days) => format_date(*days),
            Value::DateTime(ms) => format_datetime(*ms),
            Value::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Case-insensitive substring test on the text renderings of both values.
    pub fn contains_text(&self, needle: &Value) -> bool {
        self.to_text()
            .to_lowercase()
            .contains(&needle.to_text().to_lowercase())
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(v) => serde_json::Value::Number((*v).into()),
            Value::Real(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(v) => serde_json::Value::String(v.clone()),
            Value::Bool(v) => serde_json::Value::Bool(*v),
            Value::Date(days) => serde_json::Value::String(format_date(*days)),
            Value::DateTime(ms) => serde_json::Value::String(format_datetime(*ms)),
            Value::Blob(bytes) => serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::Number((*b).into())).collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// Calendar helpers (proleptic Gregorian, civil-from-days)

fn ymd_from_days(days: i32) -> (i32, u32, u32) {
    let z = days as i64 + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + if month <= 2 { 1 } else { 0 };
    (year as i32, month, day)
}

pub(crate) fn format_date(days: i32) -> String {
    let (year, month, day) = ymd_from_days(days);
    format!("{:04}-{:02}-{:02}", year, month, day)
}

pub(crate) fn format_datetime(ms: i64) -> String {
    const DAY_MS: i64 = 86_400_000;
    let days = ms.div_euclid(DAY_MS) as i32;
    let time_ms = ms.rem_euclid(DAY_MS);

    let hour = time_ms / 3_600_000;
    let minute = (time_ms % 3_600_000) / 60_000;
    let second = (time_ms % 60_000) / 1000;
    let millis = time_ms % 1000;

    let date = format_date(days);
    if millis > 0 {
        format!("{}T{:02}:{:02}:{:02}.{:03}", date, hour, minute, second, millis)
    } else {
        format!("{}T{:02}:{:02}:{:02}", date, hour, minute, second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_equality() {
        assert_eq!(Value::Int(1), Value::from(1i64));
        assert_ne!(Value::Int(1), Value::Real(1.0));
        assert_ne!(Value::Null, Value::Text(String::new()));
    }

    #[test]
    fn test_keys_follow_equality() {
        assert_eq!(Value::Real(0.0).key(), Value::Real(-0.0).key());
        assert_eq!(Value::from("x").key(), Value::from("x").key());
        assert_ne!(Value::Int(1).key(), Value::Real(1.0).key());
        assert_ne!(Value::Int(0).key(), Value::Null.key());
    }

    #[test]
    fn test_text_rendering() {
        assert_eq!(Value::Null.to_text(), "");
        assert_eq!(Value::Int(-7).to_text(), "-7");
        assert_eq!(Value::Bool(true).to_text(), "true");
        assert_eq!(Value::Date(0).to_text(), "1970-01-01");
        assert_eq!(Value::Date(19_723).to_text(), "2024-01-01");
        assert_eq!(Value::DateTime(86_400_000 + 3_723_004).to_text(), "1970-01-02T01:02:03.004");
        assert_eq!(Value::DateTime(-1000).to_text(), "1969-12-31T23:59:59");
    }

    #[test]
    fn test_contains_text_ignores_case() {
        let v = Value::from("Bob Marley");
        assert!(v.contains_text(&Value::from("bob")));
        assert!(v.contains_text(&Value::from("MARL")));
        assert!(!v.contains_text(&Value::from("alice")));
        assert!(Value::Int(1234).contains_text(&Value::Int(23)));
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn test_json() {
        assert_eq!(Value::Int(3).to_json(), serde_json::json!(3));
        assert_eq!(Value::Real(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(Value::from("a").to_json(), serde_json::json!("a"));
    }
}
