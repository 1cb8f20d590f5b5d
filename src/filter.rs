/// Filter projection over a dataset.
///
/// A `FilterProjection` holds per-column predicates and the set of dataset
/// rows that satisfy all of them. The set is computed by a filter pass that
/// runs on tokio's blocking pool over a [`Snapshot`], and is then kept up to
/// date incrementally as the dataset changes.
///
/// # Passes
///
/// Starting a pass cancels the one in flight. Every pass is tagged with a
/// generation; a result whose generation is not the latest is discarded, so
/// the visible set only ever comes from the most recent pass. A cancelled pass
/// leaves the previous visible set in place.
///
/// # Incremental maintenance
///
/// While no pass is in flight, [`FilterProjection::apply_changes`] updates the
/// visible set from dataset events: inserts and removals shift indexes, and a
/// changed row is re-evaluated against all predicates.
use crate::dataset::{Dataset, Snapshot};
use crate::events::{IndexAdjuster, ModelEvent};
use crate::row::{ColumnMap, RowContainer};
use crate::value::Value;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub value: Value,
    /// Exact equality when true, case-insensitive substring otherwise.
    pub exact: bool,
}

impl Predicate {
    pub fn exact(value: impl Into<Value>) -> Self {
        Predicate {
            value: value.into(),
            exact: true,
        }
    }

    pub fn contains(value: impl Into<Value>) -> Self {
        Predicate {
            value: value.into(),
            exact: false,
        }
    }

    pub fn matches(&self, candidate: &Value) -> bool {
        if self.exact {
            *candidate == self.value
        } else {
            candidate.contains_text(&self.value)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Visibility {
    /// No active predicates: every row is visible.
    All,
    /// Indexes of the visible dataset rows.
    Rows(BTreeSet<usize>),
}

#[derive(Debug, Clone)]
pub struct FilterMessage {
    generation: u64,
    /// None when the pass was cancelled.
    visible: Option<BTreeSet<usize>>,
}

#[derive(Debug)]
struct Pass {
    generation: u64,
    cancel: Arc<AtomicBool>,
}

type ResolvedPredicates = Vec<(Option<usize>, Predicate)>;

fn resolve(predicates: &BTreeMap<String, Predicate>, columns: &ColumnMap) -> ResolvedPredicates {
    predicates
        .iter()
        .map(|(column, predicate)| {
            let index = columns.index_of(column);
            if index.is_none() {
                warn!("Filter column '{}' not found, no row can match", column);
            }
            (index, predicate.clone())
        })
        .collect()
}

fn row_matches(row: &RowContainer, predicates: &ResolvedPredicates) -> bool {
    predicates.iter().all(|(index, predicate)| match index {
        Some(index) => row.field(*index).is_some_and(|value| predicate.matches(value)),
        None => false,
    })
}

/// Evaluates every row of `snapshot`. Returns None if cancelled part way.
pub fn run_pass(
    snapshot: &Snapshot,
    predicates: &ResolvedPredicates,
    cancel: &AtomicBool,
) -> Option<BTreeSet<usize>> {
    let mut visible = BTreeSet::new();
    for (index, row) in snapshot.rows().enumerate() {
        if cancel.load(Ordering::Acquire) {
            return None;
        }
        if row_matches(row, predicates) {
            visible.insert(index);
        }
    }
    Some(visible)
}

pub struct FilterProjection {
    predicates: BTreeMap<String, Predicate>,
    enabled: bool,
    visibility: Visibility,
    pass: Option<Pass>,
    generation: u64,
    asynchronous: bool,
    runtime: Option<Handle>,
    sender: UnboundedSender<FilterMessage>,
}

impl FilterProjection {
    pub fn new() -> (Self, UnboundedReceiver<FilterMessage>) {
        let (sender, receiver) = unbounded_channel();
        let projection = FilterProjection {
            predicates: BTreeMap::new(),
            enabled: true,
            visibility: Visibility::All,
            pass: None,
            generation: 0,
            asynchronous: true,
            runtime: None,
            sender,
        };
        (projection, receiver)
    }

    pub fn set_runtime(&mut self, runtime: Handle) {
        self.runtime = Some(runtime);
    }

    /// When false, passes always run inline on the caller's thread.
    pub fn set_asynchronous(&mut self, asynchronous: bool) {
        self.asynchronous = asynchronous;
    }

    pub fn predicates(&self) -> &BTreeMap<String, Predicate> {
        &self.predicates
    }

    pub fn filter_value(&self, column: &str) -> Option<&Value> {
        self.predicates.get(column).map(|p| &p.value)
    }

    /// Sets the predicate for `column`, returning the one it replaces.
    pub fn add_predicate(&mut self, column: &str, predicate: Predicate) -> Option<Predicate> {
        self.predicates.insert(column.to_string(), predicate)
    }

    pub fn remove_predicate(&mut self, column: &str) -> Option<Predicate> {
        let removed = self.predicates.remove(column);
        if self.predicates.is_empty() {
            self.show_all();
        }
        removed
    }

    pub fn clear_predicates(&mut self) {
        self.predicates.clear();
        self.show_all();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A disabled projection keeps its predicates but shows every row.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.show_all();
        }
    }

    /// True when predicates restrict the visible rows.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.predicates.is_empty()
    }

    pub fn is_filtering(&self) -> bool {
        self.pass.is_some()
    }

    pub fn visibility(&self) -> &Visibility {
        &self.visibility
    }

    pub fn is_visible(&self, row: usize) -> bool {
        match &self.visibility {
            Visibility::All => true,
            Visibility::Rows(rows) => rows.contains(&row),
        }
    }

    fn show_all(&mut self) {
        self.cancel();
        self.visibility = Visibility::All;
    }

    /// Cancels the pass in flight. Returns false if there was none.
    pub fn cancel(&mut self) -> bool {
        match self.pass.take() {
            Some(pass) => {
                debug!("Cancelling filter pass {}", pass.generation);
                pass.cancel.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// A full load is starting: stop filtering and hide everything until the
    /// new rows are filtered.
    pub fn on_load_started(&mut self) {
        self.cancel();
        if self.is_active() {
            self.visibility = Visibility::Rows(BTreeSet::new());
        }
    }

    /// Starts a pass over `snapshot`, cancelling any pass in flight.
    ///
    /// Returns the pass generation, or None when no predicate is active (the
    /// projection then shows every row). Without a tokio runtime, or when set
    /// synchronous, the pass runs inline; its result is still delivered
    /// through the channel.
    pub fn start_pass(&mut self, snapshot: Snapshot) -> Option<u64> {
        self.cancel();
        if !self.is_active() {
            self.visibility = Visibility::All;
            return None;
        }

        self.generation += 1;
        let generation = self.generation;
        let cancel = Arc::new(AtomicBool::new(false));
        self.pass = Some(Pass {
            generation,
            cancel: cancel.clone(),
        });

        let predicates = resolve(&self.predicates, snapshot.columns());
        let sender = self.sender.clone();
        info!(
            "Filter pass {} started over {} rows with {} predicates",
            generation,
            snapshot.len(),
            predicates.len()
        );
        let job = move || {
            let visible = run_pass(&snapshot, &predicates, &cancel);
            if sender.send(FilterMessage { generation, visible }).is_err() {
                debug!("Filter receiver dropped, pass {} result discarded", generation);
            }
        };

        let runtime = if self.asynchronous {
            self.runtime.clone().or_else(|| Handle::try_current().ok())
        } else {
            None
        };
        match runtime {
            Some(handle) => {
                handle.spawn_blocking(job);
            }
            None => job(),
        }
        Some(generation)
    }

    /// Applies a pass result. Returns true if it became the visible set.
    pub fn apply_message(&mut self, message: FilterMessage) -> bool {
        let current = self.pass.as_ref().map(|p| p.generation);
        if current != Some(message.generation) {
            debug!("Discarding stale filter pass {}", message.generation);
            return false;
        }
        self.pass = None;
        match message.visible {
            Some(visible) => {
                info!("Filter pass {} completed: {} rows visible", message.generation, visible.len());
                self.visibility = Visibility::Rows(visible);
                true
            }
            None => false,
        }
    }

    /// Updates the visible set from dataset events.
    ///
    /// Must not be called while a pass is in flight: the pass result would
    /// overwrite these updates. Returns true if the visible set changed.
    pub fn apply_changes(&mut self, changes: &[ModelEvent], dataset: &Dataset) -> bool {
        if !self.is_active() {
            return false;
        }
        let predicates = resolve(&self.predicates, dataset.columns());
        let Visibility::Rows(visible) = &mut self.visibility else {
            return false;
        };

        // Changed rows are re-evaluated after the whole batch, against the
        // final dataset, so their indexes follow the later inserts and removals.
        let mut touched: BTreeSet<usize> = BTreeSet::new();
        let mut modified = false;
        for change in changes {
            match change {
                ModelEvent::RowsInserted { first, last } => {
                    for index in *first..=*last {
                        IndexAdjuster::adjust_set_for_insert(visible, index);
                        IndexAdjuster::adjust_set_for_insert(&mut touched, index);
                        touched.insert(index);
                    }
                }
                ModelEvent::RowsRemoved { first, last } => {
                    for index in (*first..=*last).rev() {
                        modified |= IndexAdjuster::adjust_set_for_delete(visible, index);
                        IndexAdjuster::adjust_set_for_delete(&mut touched, index);
                    }
                }
                ModelEvent::FieldChanged { row, .. } | ModelEvent::RowChanged { row } => {
                    touched.insert(*row);
                }
                _ => {}
            }
        }
        for row in touched {
            let matches = dataset
                .row(row)
                .is_ok_and(|container| row_matches(container, &predicates));
            modified |= if matches {
                visible.insert(row)
            } else {
                visible.remove(&row)
            };
        }
        modified
    }
}
