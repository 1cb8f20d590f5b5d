/// Model events and incremental index maintenance.
///
/// Every mutation of a dataset, and every load or filter milestone, is
/// recorded as a [`ModelEvent`] in an [`EventQueue`]. Consumers drain the
/// queue from the owner context after calling into the model, and derived
/// projections use the events to update their row indexes incrementally.
use crate::loader::LoadStatus;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// A load was dispatched.
    LoadStarted { partial: bool },

    /// Progress of the in-flight load (rows materialized so far).
    RowsLoaded(usize),

    /// A load finished; `status` tells success from failure.
    LoadCompleted { partial: bool, status: LoadStatus },

    /// The whole row set is about to be replaced.
    ResetBegin,
    ResetEnd,

    /// The dataset was emptied by `clear`.
    DataCleared,

    RowsInserted { first: usize, last: usize },
    RowsRemoved { first: usize, last: usize },

    /// A row was replaced wholesale (partial refresh).
    RowChanged { row: usize },

    FieldChanged { row: usize, column: String, value: Value },

    /// The dataset as a whole became dirty or clean.
    DirtyStateChanged(bool),

    /// `add_row` found an existing row with the same unique fields.
    DuplicateDetected { row: usize },

    /// Outcome of a partial refresh: old index → identity of refreshed rows,
    /// and the old indexes removed because their identity no longer exists.
    PartialRefreshOutcome {
        refreshed: BTreeMap<usize, Value>,
        removed: Vec<usize>,
    },

    FilterStarted,
    FilterCompleted { visible: usize },

    Sorted { column: String, descending: bool },
}

/// Buffer of events awaiting the consumer.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    events: Vec<ModelEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: ModelEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[ModelEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn drain(&mut self) -> Vec<ModelEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Shifts source-row indexes held by a projection after inserts and deletes.
pub struct IndexAdjuster;

impl IndexAdjuster {
    /// Returns None if `index` was the deleted row.
    pub fn adjust_for_delete(index: usize, delete_index: usize) -> Option<usize> {
        if index == delete_index {
            None
        } else if index > delete_index {
            Some(index - 1)
        } else {
            Some(index)
        }
    }

    pub fn adjust_set_for_insert(set: &mut BTreeSet<usize>, insert_index: usize) {
        let shifted: Vec<usize> = set.split_off(&insert_index).into_iter().collect();
        set.extend(shifted.into_iter().map(|i| i + 1));
    }

    /// Returns true if the deleted row was in the set.
    pub fn adjust_set_for_delete(set: &mut BTreeSet<usize>, delete_index: usize) -> bool {
        let tail = set.split_off(&delete_index);
        let mut was_member = false;
        for index in tail {
            match Self::adjust_for_delete(index, delete_index) {
                Some(shifted) => {
                    set.insert(shifted);
                }
                None => was_member = true,
            }
        }
        was_member
    }
}
