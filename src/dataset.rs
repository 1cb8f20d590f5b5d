/// Dataset: the authoritative row store of a model.
///
/// A `Dataset` owns the ordered rows, the column maps of the last load, and the
/// set of dirty rows. All mutation happens here, from the owner context; load
/// workers only produce rows, which are applied with [`Dataset::apply_full`]
/// or [`Dataset::apply_partial`].
///
/// # Row storage
///
/// Rows are kept as `Arc<RowContainer>` in a [`Sequence`]. A [`Snapshot`]
/// shares the same `Arc`s, and mutating a row that a snapshot still holds
/// clones it first (`Arc::make_mut`), so filter workers always read a stable
/// copy without locks.
///
/// # Dirty tracking
///
/// `dirty` holds the [`RowId`] of every row whose `is_dirty()` is true. It is
/// resynchronized after each row mutation, and a `DirtyStateChanged` event is
/// queued whenever a row enters or leaves the set.
use crate::error::{Error, Result};
use crate::events::{EventQueue, ModelEvent};
use crate::loader::{find_identity, identity_lookup, ReconciliationKey};
use crate::row::{ColumnMap, RowContainer, RowId};
use crate::sequence::{new_sequence, Sequence, StorageHint};
use crate::value::{Value, ValueKind};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Rules applied by [`Dataset::add_row`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowPolicy {
    /// Overwrite `fields_to_replace` of a matching row instead of rejecting a duplicate.
    pub replace_fields_on_add: bool,
    pub fields_to_replace: Vec<String>,
    /// Values for columns the caller leaves out.
    pub default_field_values: BTreeMap<String, Value>,
}

/// Row markers that can be edited in bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFlag {
    Added,
    ToBeRemoved,
}

/// Read-only view of the rows at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    rows: Vec<Arc<RowContainer>>,
    columns: ColumnMap,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &ColumnMap {
        &self.columns
    }

    pub fn row(&self, index: usize) -> Option<&RowContainer> {
        self.rows.get(index).map(|row| row.as_ref())
    }

    pub fn rows(&self) -> impl Iterator<Item = &RowContainer> {
        self.rows.iter().map(|row| row.as_ref())
    }
}

pub struct Dataset {
    rows: Box<dyn Sequence<Arc<RowContainer>>>,
    columns: ColumnMap,
    kinds: Vec<Option<ValueKind>>,
    dirty: HashSet<RowId>,
    identity_column: Option<String>,
    identity_table: Option<String>,
    policy: RowPolicy,
    events: EventQueue,
}

impl Dataset {
    pub fn new(hint: StorageHint) -> Self {
        Dataset {
            rows: new_sequence(hint),
            columns: ColumnMap::default(),
            kinds: Vec::new(),
            dirty: HashSet::new(),
            identity_column: None,
            identity_table: None,
            policy: RowPolicy::default(),
            events: EventQueue::new(),
        }
    }

    pub fn with_policy(mut self, policy: RowPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn set_policy(&mut self, policy: RowPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> &RowPolicy {
        &self.policy
    }

    pub fn set_identity(&mut self, column: Option<String>, table: Option<String>) {
        self.identity_column = column;
        self.identity_table = table;
    }

    pub fn identity_column(&self) -> Option<&str> {
        self.identity_column.as_deref()
    }

    pub fn identity_table(&self) -> Option<&str> {
        self.identity_table.as_deref()
    }

    // ------------------------------------------------------------------
    // Shape and reads
    // ------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &ColumnMap {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.names().to_vec()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.index_of(name)
    }

    /// Kind of the first non-null value seen in each column at load time.
    pub fn column_kind(&self, column: usize) -> Option<ValueKind> {
        self.kinds.get(column).copied().flatten()
    }

    fn require_column(&self, name: &str) -> Result<usize> {
        self.columns.index_of(name).ok_or_else(|| {
            error!("Column '{}' not found", name);
            Error::ColumnNotFound(name.to_string())
        })
    }

    pub fn row(&self, index: usize) -> Result<&RowContainer> {
        self.rows
            .get(index)
            .map(|row| row.as_ref())
            .ok_or(Error::IndexOutOfRange { index, len: self.rows.len() })
    }

    pub fn rows(&self) -> impl Iterator<Item = &RowContainer> {
        self.rows.iter().map(|row| row.as_ref())
    }

    fn row_mut(&mut self, index: usize) -> Result<&mut RowContainer> {
        let len = self.rows.len();
        self.rows
            .get_mut(index)
            .map(Arc::make_mut)
            .ok_or(Error::IndexOutOfRange { index, len })
    }

    pub fn get_field_value(&self, row: usize, column: &str) -> Result<Value> {
        let col = self.require_column(column)?;
        Ok(self.row(row)?.field_value(col))
    }

    pub fn row_data(&self, row: usize) -> Result<BTreeMap<String, Value>> {
        let container = self.row(row)?;
        Ok(self
            .columns
            .names()
            .iter()
            .zip(container.fields())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect())
    }

    /// Distinct values per column, in first-seen order.
    pub fn unique_field_values(&self, columns: &[String]) -> Result<BTreeMap<String, Vec<Value>>> {
        let mut result = BTreeMap::new();
        for column in columns {
            let col = self.require_column(column)?;
            let mut values: Vec<Value> = Vec::new();
            for row in self.rows() {
                let value = row.field_value(col);
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            result.insert(column.clone(), values);
        }
        Ok(result)
    }

    pub fn find_first_row(&self, column: &str, value: &Value) -> Option<usize> {
        let col = self.columns.index_of(column)?;
        self.rows().position(|row| row.field(col) == Some(value))
    }

    /// First row whose fields equal every entry of `fields`.
    pub fn find_row(&self, fields: &BTreeMap<String, Value>) -> Option<usize> {
        let wanted: Vec<(usize, &Value)> = fields
            .iter()
            .map(|(name, value)| self.columns.index_of(name).map(|col| (col, value)))
            .collect::<Option<_>>()?;
        self.rows()
            .position(|row| wanted.iter().all(|(col, value)| row.field(*col) == Some(*value)))
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            rows: self.rows.iter().cloned().collect(),
            columns: self.columns.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Dirty state
    // ------------------------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn changed_rows_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn row_is_dirty(&self, row: usize) -> Result<bool> {
        Ok(self.row(row)?.is_dirty())
    }

    pub fn field_is_dirty(&self, row: usize, column: &str) -> Result<bool> {
        let col = self.require_column(column)?;
        Ok(self.row(row)?.field_is_dirty(col))
    }

    pub fn changed_rows_data(&self) -> Vec<BTreeMap<String, Value>> {
        if !self.is_dirty() {
            return Vec::new();
        }
        (0..self.len())
            .filter(|i| self.rows.get(*i).is_some_and(|row| row.is_dirty()))
            .filter_map(|i| self.row_data(i).ok())
            .collect()
    }

    fn update_row_state(&mut self, index: usize) {
        let Some(row) = self.rows.get(index) else {
            return;
        };
        let (id, dirty) = (row.id(), row.is_dirty());
        let changed = if dirty {
            self.dirty.insert(id)
        } else {
            self.dirty.remove(&id)
        };
        if changed {
            self.events.push(ModelEvent::DirtyStateChanged(self.is_dirty()));
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn set_field_value(&mut self, row: usize, column: &str, value: Value) -> Result<()> {
        let col = self.require_column(column)?;
        // Checked before `row_mut`, which would unshare a row held by a snapshot.
        if self.row(row)?.field(col) == Some(&value) {
            return Ok(());
        }
        let container = self.row_mut(row)?;
        if !container.set_field_value(col, value.clone()) {
            return Err(Error::IndexOutOfRange { index: col, len: container.len() });
        }
        self.events.push(ModelEvent::FieldChanged {
            row,
            column: column.to_string(),
            value,
        });
        self.update_row_state(row);
        Ok(())
    }

    /// Writes `fields` into every row. All columns are checked first.
    pub fn set_rows_data(&mut self, fields: &BTreeMap<String, Value>) -> Result<()> {
        for column in fields.keys() {
            self.require_column(column)?;
        }
        for row in 0..self.len() {
            for (column, value) in fields {
                self.set_field_value(row, column, value.clone())?;
            }
        }
        Ok(())
    }

    pub fn flag(&self, row: usize, flag: RowFlag) -> Result<bool> {
        let container = self.row(row)?;
        Ok(match flag {
            RowFlag::Added => container.is_added(),
            RowFlag::ToBeRemoved => container.to_be_removed(),
        })
    }

    pub fn set_flag(&mut self, row: usize, flag: RowFlag, state: bool) -> Result<()> {
        let container = self.row_mut(row)?;
        let current = match flag {
            RowFlag::Added => container.is_added(),
            RowFlag::ToBeRemoved => container.to_be_removed(),
        };
        if current == state {
            return Ok(());
        }
        match flag {
            RowFlag::Added => container.set_is_added(state),
            RowFlag::ToBeRemoved => container.set_to_be_removed(state),
        }
        self.events.push(ModelEvent::RowChanged { row });
        self.update_row_state(row);
        Ok(())
    }

    /// Toggles `to_be_removed`, returning the new state.
    pub fn flip_to_be_removed(&mut self, row: usize) -> Result<bool> {
        let state = !self.flag(row, RowFlag::ToBeRemoved)?;
        self.set_flag(row, RowFlag::ToBeRemoved, state)?;
        Ok(state)
    }

    /// Toggles `is_added`, returning the new state.
    pub fn flip_is_added(&mut self, row: usize) -> Result<bool> {
        let state = !self.flag(row, RowFlag::Added)?;
        self.set_flag(row, RowFlag::Added, state)?;
        Ok(state)
    }

    pub fn clean_field(&mut self, row: usize, column: &str) -> Result<()> {
        let col = self.require_column(column)?;
        let container = self.row_mut(row)?;
        if !container.clean_field(col) {
            return Err(Error::InvalidState(format!(
                "field '{}' of row {} is not dirty",
                column, row
            )));
        }
        let value = container.field_value(col);
        self.events.push(ModelEvent::FieldChanged {
            row,
            column: column.to_string(),
            value,
        });
        self.update_row_state(row);
        Ok(())
    }

    /// Restores a row's original values. Returns false if nothing was restored.
    pub fn clean_row(&mut self, row: usize) -> Result<bool> {
        if !self.row(row)?.is_dirty() {
            return Ok(false);
        }
        if !self.row_mut(row)?.clean_container() {
            return Ok(false);
        }
        self.events.push(ModelEvent::RowChanged { row });
        self.update_row_state(row);
        Ok(true)
    }

    pub fn clean_data(&mut self) -> Result<()> {
        if !self.is_dirty() {
            warn!("Dataset is already clean");
            return Err(Error::InvalidState("dataset is already clean".to_string()));
        }
        for row in 0..self.len() {
            if self.rows.get(row).is_some_and(|r| r.is_dirty()) {
                self.clean_row(row)?;
            }
        }
        Ok(())
    }

    /// Adds a locally created row at the end of the dataset.
    ///
    /// `unique_columns` name the fields that identify a duplicate. Returns
    /// the index of the new row, or of the existing row when the policy
    /// replaces fields of a duplicate.
    pub fn add_row(
        &mut self,
        fields: &BTreeMap<String, Value>,
        unique_columns: &[String],
    ) -> Result<usize> {
        if fields.is_empty() {
            warn!("Field values map is empty, row creation is not possible");
            return Err(Error::InvalidState("field values map is empty".to_string()));
        }

        if !unique_columns.is_empty() {
            if let Some(existing) = self.find_duplicate(fields, unique_columns)? {
                return self.handle_duplicate(existing, fields, unique_columns);
            }
        }

        let mut merged = fields.clone();
        for (column, value) in &self.policy.default_field_values {
            merged.entry(column.clone()).or_insert_with(|| value.clone());
        }

        for (i, name) in self.columns.names().iter().enumerate() {
            let Some(value) = merged.get(name) else {
                return Err(Error::MissingColumnValue(name.clone()));
            };
            if let Some(expected) = self.column_kind(i) {
                if !value.is_null() && value.kind() != expected {
                    return Err(Error::TypeMismatch {
                        column: name.clone(),
                        expected,
                        actual: value.kind(),
                    });
                }
            }
        }
        for name in merged.keys() {
            self.require_column(name)?;
        }

        let row = RowContainer::from_field_map(&merged, self.columns.names());
        if !row.is_valid() {
            return Err(Error::InvalidState("new row is missing column values".to_string()));
        }

        let index = self.rows.len();
        self.rows.append(Arc::new(row));
        self.events.push(ModelEvent::RowsInserted { first: index, last: index });
        self.update_row_state(index);
        Ok(index)
    }

    /// Adds rows in order, stopping at the first failure.
    pub fn add_rows(
        &mut self,
        rows: &[BTreeMap<String, Value>],
        unique_columns: &[String],
    ) -> Result<Vec<usize>> {
        rows.iter()
            .map(|fields| self.add_row(fields, unique_columns))
            .collect()
    }

    fn find_duplicate(
        &self,
        fields: &BTreeMap<String, Value>,
        unique_columns: &[String],
    ) -> Result<Option<usize>> {
        let mut wanted = Vec::with_capacity(unique_columns.len());
        for column in unique_columns {
            let col = self.require_column(column)?;
            let value = fields
                .get(column)
                .ok_or_else(|| Error::MissingColumnValue(column.clone()))?;
            wanted.push((col, value));
        }
        Ok(self
            .rows()
            .position(|row| wanted.iter().all(|(col, value)| row.field(*col) == Some(*value))))
    }

    fn handle_duplicate(
        &mut self,
        existing: usize,
        fields: &BTreeMap<String, Value>,
        unique_columns: &[String],
    ) -> Result<usize> {
        if self.policy.replace_fields_on_add && !self.policy.fields_to_replace.is_empty() {
            let replacements: Vec<(String, Value)> = self
                .policy
                .fields_to_replace
                .iter()
                .filter_map(|name| fields.get(name).map(|v| (name.clone(), v.clone())))
                .collect();
            for (name, _) in &replacements {
                self.require_column(name)?;
            }
            info!("Duplicate row {} found, replacing {} fields", existing, replacements.len());
            for (name, value) in replacements {
                self.set_field_value(existing, &name, value)?;
            }
            return Ok(existing);
        }

        if self.policy.replace_fields_on_add {
            warn!("Replace on add is set but no fields to replace are configured");
        }
        warn!("Duplicate row detected at {} for {:?}", existing, unique_columns);
        self.events.push(ModelEvent::DuplicateDetected { row: existing });
        Err(Error::DuplicateRow(unique_columns.to_vec()))
    }

    pub fn remove_row(&mut self, index: usize) -> Result<()> {
        let was_dirty = self.is_dirty();
        let removed = self.rows.delete(index)?;
        self.dirty.remove(&removed.id());
        self.events.push(ModelEvent::RowsRemoved { first: index, last: index });
        if was_dirty != self.is_dirty() {
            self.events.push(ModelEvent::DirtyStateChanged(self.is_dirty()));
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        let was_dirty = self.is_dirty();
        self.events.push(ModelEvent::ResetBegin);
        self.rows.clear();
        self.columns = ColumnMap::default();
        self.kinds.clear();
        self.dirty.clear();
        self.events.push(ModelEvent::ResetEnd);
        self.events.push(ModelEvent::DataCleared);
        if was_dirty {
            self.events.push(ModelEvent::DirtyStateChanged(false));
        }
    }

    // ------------------------------------------------------------------
    // Applying load results
    // ------------------------------------------------------------------

    /// Replaces every row and the column maps. Dirty state is reset.
    pub fn apply_full(&mut self, columns: ColumnMap, rows: Vec<RowContainer>) {
        let was_dirty = self.is_dirty();
        self.events.push(ModelEvent::ResetBegin);

        self.kinds = (0..columns.len())
            .map(|col| {
                rows.iter()
                    .filter_map(|row| row.field(col))
                    .find(|value| !value.is_null())
                    .map(Value::kind)
            })
            .collect();
        self.rows.clear();
        self.rows.extend_from(rows.into_iter().map(Arc::new).collect());
        self.columns = columns;
        self.dirty.clear();

        self.events.push(ModelEvent::ResetEnd);
        if was_dirty {
            self.events.push(ModelEvent::DirtyStateChanged(false));
        }
        info!("Dataset replaced: {} rows, {} columns", self.len(), self.columns.len());
    }

    /// Builds the reconciliation key for re-fetching `rows`.
    ///
    /// Fails if no identity column is configured or loaded, if a row index is
    /// out of range, or if two rows share an identity value.
    pub fn identity_values(&self, rows: &[usize]) -> Result<ReconciliationKey> {
        let column = self.identity_column.clone().ok_or_else(|| {
            Error::ReconciliationPrecondition("no identity column configured".to_string())
        })?;
        let col = self.columns.index_of(&column).ok_or_else(|| {
            Error::ReconciliationPrecondition(format!(
                "identity column '{}' not present in loaded columns",
                column
            ))
        })?;

        let mut previous: BTreeMap<usize, Value> = BTreeMap::new();
        let mut seen = HashMap::new();
        for &row in rows {
            let value = self.row(row)?.field_value(col);
            if let Some(other) = seen.insert(value.key(), row) {
                if other != row && previous.get(&other) == Some(&value) {
                    return Err(Error::ReconciliationPrecondition(format!(
                        "identity value {} appears in more than one requested row",
                        value
                    )));
                }
            }
            previous.insert(row, value);
        }
        Ok(ReconciliationKey { column, previous })
    }

    /// Applies a partial refresh.
    ///
    /// Each fetched row replaces the row at the old index its identity maps to
    /// in `refreshed`; then the `removed` indexes are deleted in descending
    /// order so earlier deletions do not shift later ones. Returns
    /// (replaced, removed) counts.
    pub fn apply_partial(
        &mut self,
        columns: &ColumnMap,
        rows: Vec<RowContainer>,
        refreshed: &BTreeMap<usize, Value>,
        removed: &[usize],
    ) -> Result<(usize, usize)> {
        let identity = self.identity_column.clone().ok_or_else(|| {
            Error::ReconciliationPrecondition("no identity column configured".to_string())
        })?;
        if columns.names() != self.columns.names() {
            return Err(Error::ReconciliationPrecondition(
                "partial result columns differ from loaded columns".to_string(),
            ));
        }
        let identity_index = columns.index_of(&identity).ok_or_else(|| {
            Error::ReconciliationPrecondition(format!("identity column '{}' missing", identity))
        })?;

        let mut removed: Vec<usize> = removed.iter().copied().filter(|i| *i < self.len()).collect();
        removed.sort_unstable();
        removed.dedup();

        let was_dirty = self.is_dirty();
        let lookup = identity_lookup(refreshed);
        let mut replaced = 0;
        for row in rows {
            let id = row.field_value(identity_index);
            let Some(old) = find_identity(&lookup, refreshed, &id) else {
                warn!("Refreshed row with identity {} has no previous index", id);
                continue;
            };
            if old >= self.len() {
                error!("Refreshed row index {} out of range [0, {})", old, self.len());
                continue;
            }
            let previous = self.rows.replace(old, Arc::new(row))?;
            self.dirty.remove(&previous.id());
            self.events.push(ModelEvent::RowChanged { row: old });
            replaced += 1;
        }

        for &index in removed.iter().rev() {
            let gone = self.rows.delete(index)?;
            self.dirty.remove(&gone.id());
            self.events.push(ModelEvent::RowsRemoved { first: index, last: index });
        }

        if was_dirty != self.is_dirty() {
            self.events.push(ModelEvent::DirtyStateChanged(self.is_dirty()));
        }
        info!(
            "Partial refresh completed. Reloaded: {}, removed: {}",
            replaced,
            removed.len()
        );
        let removed_count = removed.len();
        self.events.push(ModelEvent::PartialRefreshOutcome {
            refreshed: refreshed.clone(),
            removed,
        });
        Ok((replaced, removed_count))
    }

    // ------------------------------------------------------------------
    // Events and export
    // ------------------------------------------------------------------

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn drain_events(&mut self) -> Vec<ModelEvent> {
        self.events.drain()
    }

    pub(crate) fn notify(&mut self, event: ModelEvent) {
        self.events.push(event);
    }

    fn rows_to_json(&self, indexes: impl Iterator<Item = usize>) -> Result<String> {
        let rows: Vec<serde_json::Value> = indexes
            .filter_map(|i| self.rows.get(i))
            .map(|row| {
                let object: serde_json::Map<String, serde_json::Value> = self
                    .columns
                    .names()
                    .iter()
                    .zip(row.fields())
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect();
                serde_json::Value::Object(object)
            })
            .collect();
        serde_json::to_string_pretty(&rows)
            .map_err(|e| Error::InvalidState(format!("JSON serialization error: {}", e)))
    }

    /// Exports all rows as a JSON array of objects keyed by column name.
    pub fn to_json(&self) -> Result<String> {
        self.rows_to_json(0..self.len())
    }

    /// Exports only the dirty rows.
    pub fn changed_rows_json(&self) -> Result<String> {
        let dirty: Vec<usize> = (0..self.len())
            .filter(|i| self.rows.get(*i).is_some_and(|row| row.is_dirty()))
            .collect();
        self.rows_to_json(dirty.into_iter())
    }
}
