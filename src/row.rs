/// Row containers and column maps.
///
/// A `RowContainer` holds one row of a dataset together with its dirty-tracking
/// state: the original value of every field modified since the last clean, and
/// the `is_added` / `to_be_removed` markers used by pending-change workflows.
///
/// Invariants kept by every mutator:
/// - a field index is in `changed_fields` iff its current value differs from
///   the recorded original;
/// - the container is dirty iff `changed_fields` is non-empty or one of the
///   two markers is set.
use crate::value::Value;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ROW_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a row container, independent of its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(u64);

impl RowId {
    fn next() -> Self {
        RowId(NEXT_ROW_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct RowContainer {
    id: RowId,
    size: usize,
    fields: Vec<Value>,
    changed_fields: HashMap<usize, Value>,
    is_added: bool,
    to_be_removed: bool,
    is_valid: bool,
    is_initializing: bool,
}

impl RowContainer {
    /// Creates an empty container sized for `size` fields.
    ///
    /// Fields are appended with [`add_field`](Self::add_field) between
    /// `set_initializing(true)` and `set_initializing(false)`.
    pub fn new(size: usize) -> Self {
        RowContainer {
            id: RowId::next(),
            size,
            fields: Vec::with_capacity(size),
            changed_fields: HashMap::new(),
            is_added: false,
            to_be_removed: false,
            is_valid: true,
            is_initializing: false,
        }
    }

    /// Builds a locally added row from a column-name map.
    ///
    /// The result is marked `is_added`. If any of `columns` is absent from
    /// `fields` the container is flagged invalid.
    pub fn from_field_map(fields: &BTreeMap<String, Value>, columns: &[String]) -> Self {
        let mut row = RowContainer::new(columns.len());
        row.is_added = true;
        for column in columns {
            match fields.get(column) {
                Some(value) => row.fields.push(value.clone()),
                None => {
                    warn!("Row field map is missing column '{}'", column);
                    row.fields.push(Value::Null);
                    row.is_valid = false;
                }
            }
        }
        row
    }

    /// Builds a fully initialized, clean container from loaded values.
    pub fn from_values(values: Vec<Value>) -> Self {
        let mut row = RowContainer::new(values.len());
        row.fields = values;
        row
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn is_initializing(&self) -> bool {
        self.is_initializing
    }

    pub fn set_initializing(&mut self, initializing: bool) {
        self.is_initializing = initializing;
    }

    /// Appends a field during initialization. Returns false otherwise.
    pub fn add_field(&mut self, value: Value) -> bool {
        if !self.is_initializing {
            error!("Fields can only be added while the row is initializing");
            return false;
        }
        if self.fields.len() >= self.size {
            error!("Row already holds {} fields", self.size);
            return false;
        }
        self.fields.push(value);
        true
    }

    pub fn field(&self, index: usize) -> Option<&Value> {
        self.fields.get(index)
    }

    /// Returns the field at `index`, or `Value::Null` (with an error logged)
    /// when the index is out of range.
    pub fn field_value(&self, index: usize) -> Value {
        match self.fields.get(index) {
            Some(value) => value.clone(),
            None => {
                error!("Field index {} out of range [0, {})", index, self.fields.len());
                Value::Null
            }
        }
    }

    /// Sets a field, recording its original value on first change.
    ///
    /// Writing a value equal to the current one is a successful no-op.
    /// Writing back the recorded original clears the field's dirty flag.
    pub fn set_field_value(&mut self, index: usize, value: Value) -> bool {
        let Some(current) = self.fields.get_mut(index) else {
            error!("Field index {} out of range [0, {})", index, self.size);
            return false;
        };
        if *current == value {
            return true;
        }

        match self.changed_fields.get(&index) {
            Some(original) if *original == value => {
                self.changed_fields.remove(&index);
            }
            Some(_) => {}
            None => {
                self.changed_fields.insert(index, current.clone());
            }
        }
        *current = value;
        true
    }

    pub fn field_is_dirty(&self, index: usize) -> bool {
        self.changed_fields.contains_key(&index)
    }

    /// Recorded original value of a dirty field.
    pub fn original_value(&self, index: usize) -> Option<&Value> {
        self.changed_fields.get(&index)
    }

    pub fn changed_fields(&self) -> &HashMap<usize, Value> {
        &self.changed_fields
    }

    /// Restores a single field to its original value. Fails if it is not dirty.
    pub fn clean_field(&mut self, index: usize) -> bool {
        match self.changed_fields.remove(&index) {
            Some(original) => {
                self.fields[index] = original;
                true
            }
            None => {
                warn!("Field {} is not dirty, nothing to clean", index);
                false
            }
        }
    }

    /// Restores every changed field and clears `to_be_removed`.
    ///
    /// Fails only when the container is already clean. `is_added` is left
    /// alone, so an added row reports success and stays dirty until it is
    /// persisted or removed.
    pub fn clean_container(&mut self) -> bool {
        if !self.is_dirty() {
            info!("Container is already clean");
            return false;
        }
        for (index, original) in self.changed_fields.drain() {
            self.fields[index] = original;
        }
        self.to_be_removed = false;
        true
    }

    pub fn is_dirty(&self) -> bool {
        !self.changed_fields.is_empty() || self.is_added || self.to_be_removed
    }

    pub fn is_added(&self) -> bool {
        self.is_added
    }

    pub fn set_is_added(&mut self, added: bool) {
        self.is_added = added;
    }

    pub fn to_be_removed(&self) -> bool {
        self.to_be_removed
    }

    pub fn set_to_be_removed(&mut self, remove: bool) {
        self.to_be_removed = remove;
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }
}

/// Bidirectional column name / index mapping for a result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnMap {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl ColumnMap {
    /// Builds the map from result-set column names in order.
    ///
    /// Duplicate names keep their first position in the name-to-index map.
    pub fn from_names(names: Vec<String>) -> Self {
        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if index.contains_key(name) {
                warn!("Duplicate column name '{}' at position {}", name, i);
                continue;
            }
            index.insert(name.clone(), i);
        }
        ColumnMap { names, index }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
