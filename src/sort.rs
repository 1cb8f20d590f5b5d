/// Ordering of the visible rows.
///
/// A [`SortKey`] names a column and direction. [`sort_rows`] orders a list of
/// dataset row indexes by that column; ties keep dataset order, so the result
/// is deterministic.
use crate::dataset::Dataset;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

static NULL: Value = Value::Null;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub order: SortOrder,
    /// Place nulls before every other value (after them otherwise), in
    /// either direction.
    pub nulls_first: bool,
}

impl SortKey {
    pub fn ascending(column: impl Into<String>) -> Self {
        SortKey {
            column: column.into(),
            order: SortOrder::Ascending,
            nulls_first: false,
        }
    }

    pub fn descending(column: impl Into<String>) -> Self {
        SortKey {
            column: column.into(),
            order: SortOrder::Descending,
            nulls_first: false,
        }
    }

    pub fn is_descending(&self) -> bool {
        self.order == SortOrder::Descending
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Real(_) => 2,
        Value::Date(_) => 3,
        Value::DateTime(_) => 4,
        Value::Text(_) => 5,
        Value::Blob(_) => 6,
    }
}

/// Natural ordering of two non-null values. Integers and reals compare
/// numerically; other mixed kinds order by kind.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Text(a), Value::Text(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Date(a), Value::Date(b)) => a.cmp(b),
        (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
        (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => kind_rank(a).cmp(&kind_rank(b)),
        },
    }
}

/// Compares two values under `key`, honoring direction and null placement.
pub fn compare_with_key(a: &Value, b: &Value, key: &SortKey) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) if key.nulls_first => Ordering::Less,
        (true, false) => Ordering::Greater,
        (false, true) if key.nulls_first => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ordering = compare_values(a, b);
            if key.is_descending() {
                ordering.reverse()
            } else {
                ordering
            }
        }
    }
}

/// Sorts dataset row indexes in place. Unknown columns leave the order alone.
pub fn sort_rows(rows: &mut [usize], dataset: &Dataset, key: &SortKey) {
    let Some(column) = dataset.column_index(&key.column) else {
        return;
    };
    let value = |row: usize| {
        dataset
            .row(row)
            .ok()
            .and_then(|r| r.field(column))
            .unwrap_or(&NULL)
    };
    rows.sort_by(|a, b| compare_with_key(value(*a), value(*b), key).then(a.cmp(b)));
}
