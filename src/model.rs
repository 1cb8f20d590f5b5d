/// SQL-backed table model.
///
/// `SqlModel` ties a [`Dataset`], a [`Loader`] and a [`FilterProjection`]
/// together and is the only thing an application talks to. All of its methods
/// run on the owner's context; loads and filter passes run on tokio's blocking
/// pool and report back over channels that the owner drains with
/// [`SqlModel::process_pending`] or awaits with [`SqlModel::next_completion`].
///
/// # Example
///
/// ```ignore
/// let mut model = SqlModel::new(Arc::new(provider), ModelOptions::default())?;
/// model.refresh(Query::new("SELECT id, name FROM people"))?;
/// model.settle().await;
/// model.add_filter("name", "bo", false);
/// model.settle().await;
/// for row in model.visible_rows() {
///     println!("{:?}", model.dataset().row_data(*row)?);
/// }
/// ```
///
/// # Visible rows
///
/// Row indexes taken by the mutation methods are dataset indexes. The visible
/// projection (filtered, then sorted) is exposed through
/// [`SqlModel::visible_rows`], with [`SqlModel::source_row`] and
/// [`SqlModel::visible_row`] mapping between the two.
use crate::config::ModelOptions;
use crate::dataset::{Dataset, RowFlag};
use crate::driver::{ConnectionProvider, DriverError, ErrorSink, LogErrorSink};
use crate::error::{Error, Result};
use crate::events::ModelEvent;
use crate::filter::{FilterMessage, FilterProjection, Predicate, Visibility};
use crate::loader::{
    AbortHandle, LoadOutcome, LoadRequest, LoadStatus, Loader, LoaderMessage, OperationId,
};
use crate::query::Query;
use crate::sort::{sort_rows, SortKey};
use crate::value::Value;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;

enum Completion {
    Loader(Option<LoaderMessage>),
    Filter(Option<FilterMessage>),
}

pub struct SqlModel {
    options: ModelOptions,
    dataset: Dataset,
    loader: Loader,
    loader_rx: UnboundedReceiver<LoaderMessage>,
    filter: FilterProjection,
    filter_rx: UnboundedReceiver<FilterMessage>,
    status: LoadStatus,
    last_query: Option<Query>,
    last_error: Option<DriverError>,
    sort: Option<SortKey>,
    /// Visible dataset rows in display order.
    order: Vec<usize>,
}

impl SqlModel {
    /// Creates a model that reports driver errors through the log.
    pub fn new(provider: Arc<dyn ConnectionProvider>, options: ModelOptions) -> Result<Self> {
        Self::with_error_sink(provider, Arc::new(LogErrorSink), options)
    }

    pub fn with_error_sink(
        provider: Arc<dyn ConnectionProvider>,
        sink: Arc<dyn ErrorSink>,
        options: ModelOptions,
    ) -> Result<Self> {
        options.validate()?;

        let (mut loader, loader_rx) = Loader::new(provider, sink);
        loader.set_progress_interval(options.progress_interval);

        let (mut filter, filter_rx) = FilterProjection::new();
        filter.set_enabled(options.filter_enabled);
        filter.set_asynchronous(options.asynchronous);

        let mut dataset = Dataset::new(options.storage).with_policy(options.row_policy());
        dataset.set_identity(options.identity_column.clone(), options.identity_table.clone());

        Ok(SqlModel {
            options,
            dataset,
            loader,
            loader_rx,
            filter,
            filter_rx,
            status: LoadStatus::NotInitialized,
            last_query: None,
            last_error: None,
            sort: None,
            order: Vec::new(),
        })
    }

    /// Runs loads and filter passes on `runtime` instead of the ambient one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.set_runtime(runtime);
        self
    }

    pub fn set_runtime(&mut self, runtime: Handle) {
        self.loader.set_runtime(runtime.clone());
        self.filter.set_runtime(runtime);
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn load_status(&self) -> LoadStatus {
        self.status
    }

    pub fn is_loading(&self) -> bool {
        self.loader.is_loading()
    }

    pub fn is_filtering(&self) -> bool {
        self.filter.is_filtering()
    }

    pub fn last_query(&self) -> Option<&Query> {
        self.last_query.as_ref()
    }

    /// Driver error of the last failed load.
    pub fn last_error(&self) -> Option<&DriverError> {
        self.last_error.as_ref()
    }

    /// Outcome of the last load as a `Result`: `Connection` or `Query` for a
    /// failed load, `Aborted` for an aborted one.
    pub fn check_load(&self) -> Result<()> {
        let driver_error = || {
            self.last_error
                .clone()
                .unwrap_or_else(|| DriverError::new(None, "load failed"))
        };
        match self.status {
            LoadStatus::DatabaseError => Err(driver_error().into_connection_error()),
            LoadStatus::QueryError => Err(driver_error().into_query_error()),
            LoadStatus::Aborted => Err(Error::Aborted),
            _ => Ok(()),
        }
    }

    pub fn current_operation(&self) -> Option<OperationId> {
        self.loader.current_operation()
    }

    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.loader.abort_handle()
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Starts a full refresh with `query`.
    ///
    /// While a load is in flight this fails with `Busy`, unless continuous
    /// refreshes are allowed, in which case the in-flight load is superseded.
    pub fn refresh(&mut self, query: Query) -> Result<OperationId> {
        query.validate()?;
        if self.loader.is_loading() {
            if !self.options.allow_continuous_refreshes {
                error!("Data refresh is not possible, model is still loading data");
                return Err(Error::Busy);
            }
            self.loader.restart_operation(query.clone());
        }
        let operation = self.dispatch(LoadRequest::new(query.clone()))?;
        self.last_query = Some(query);
        Ok(operation)
    }

    /// Runs the last full-refresh query again.
    pub fn refresh_last(&mut self) -> Result<OperationId> {
        let query = self
            .last_query
            .clone()
            .ok_or_else(|| Error::InvalidState("no query has been run yet".to_string()))?;
        self.refresh(query)
    }

    /// Re-fetches the dataset rows `rows` with `query`, which must select them
    /// by their identity column. Rows the query no longer returns are removed.
    /// An empty `rows` makes this a full refresh.
    pub fn refresh_rows(&mut self, query: Query, rows: &[usize]) -> Result<OperationId> {
        if rows.is_empty() {
            return self.refresh(query);
        }
        query.validate()?;
        if self.loader.is_loading() {
            error!("Partial refresh is not possible, model is still loading data");
            return Err(Error::Busy);
        }
        if self.dataset.is_empty() {
            return Err(Error::InvalidState(
                "partial refresh of an empty dataset".to_string(),
            ));
        }
        let key = self.dataset.identity_values(rows)?;
        self.dispatch(LoadRequest::new(query).partial(key))
    }

    fn dispatch(&mut self, request: LoadRequest) -> Result<OperationId> {
        let partial = request.is_partial();
        let request = LoadRequest {
            asynchronous: self.options.asynchronous,
            report_progress: self.options.report_progress,
            emit_on_abort: self.options.emit_on_abort,
            ..request
        };
        let operation = self.loader.load_data(request)?;

        if !partial {
            self.filter.on_load_started();
            self.rebuild_order();
        }
        self.status = LoadStatus::Loading;
        self.last_error = None;
        self.dataset.notify(ModelEvent::LoadStarted { partial });
        self.pump();
        Ok(operation)
    }

    /// Asks the in-flight load to stop. Returns false if nothing is loading.
    pub fn request_abort(&mut self) -> bool {
        let requested = self.loader.abort_operation();
        if !requested {
            warn!("Abort requested but no load is in progress");
        }
        requested
    }

    /// Forgets the last query, so `refresh_last` fails until a new refresh.
    pub fn clear_query(&mut self) {
        self.last_query = None;
    }

    // ------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------

    /// Handles every loader and filter message already received, without
    /// waiting. Returns the number of messages handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(message) = self.loader_rx.try_recv() {
                self.handle_loader_message(message);
            } else if let Ok(message) = self.filter_rx.try_recv() {
                self.handle_filter_message(message);
            } else {
                break;
            }
            handled += 1;
        }
        handled
    }

    /// Waits for the next loader or filter message and handles it. Returns
    /// false immediately when neither a load nor a filter pass is running.
    pub async fn next_completion(&mut self) -> bool {
        if !self.is_loading() && !self.is_filtering() {
            return false;
        }
        let completion = tokio::select! {
            message = self.loader_rx.recv() => Completion::Loader(message),
            message = self.filter_rx.recv() => Completion::Filter(message),
        };
        match completion {
            Completion::Loader(Some(message)) => self.handle_loader_message(message),
            Completion::Filter(Some(message)) => self.handle_filter_message(message),
            _ => return false,
        }
        true
    }

    /// Waits until no load and no filter pass is in flight.
    pub async fn settle(&mut self) {
        self.process_pending();
        while self.is_loading() || self.is_filtering() {
            if !self.next_completion().await {
                break;
            }
        }
    }

    fn handle_loader_message(&mut self, message: LoaderMessage) {
        match message {
            LoaderMessage::Progress { operation, rows } => {
                if self.loader.is_current(operation) {
                    self.dataset.notify(ModelEvent::RowsLoaded(rows));
                }
            }
            LoaderMessage::Completed(outcome) => self.complete_load(outcome),
        }
    }

    fn complete_load(&mut self, outcome: LoadOutcome) {
        if !self.loader.finish(outcome.operation) {
            return;
        }
        let LoadOutcome {
            operation,
            mut status,
            partial,
            columns,
            rows,
            data_attached,
            refreshed,
            removed,
            mut error,
        } = outcome;

        if data_attached {
            if partial {
                let mark = self.dataset.events().len();
                match self.dataset.apply_partial(&columns, rows, &refreshed, &removed) {
                    Ok(_) => {
                        // Indexes shifted; the pass started below is over the new rows.
                        self.filter.cancel();
                        self.apply_changes_since(mark);
                    }
                    Err(err) => {
                        error!("Partial refresh of operation {} not applied: {}", operation, err);
                        status = LoadStatus::QueryError;
                        error = Some(DriverError::new(None, err.to_string()));
                    }
                }
            } else {
                self.dataset.apply_full(columns, rows);
            }
        } else if let Some(err) = &error {
            debug!("Operation {} failed, dataset left intact: {}", operation, err);
        }

        self.status = status;
        self.last_error = error;
        self.dataset.notify(ModelEvent::LoadCompleted { partial, status });
        self.run_filter();
        self.rebuild_order();
    }

    fn handle_filter_message(&mut self, message: FilterMessage) {
        if self.filter.apply_message(message) {
            self.rebuild_order();
            self.dataset.notify(ModelEvent::FilterCompleted {
                visible: self.order.len(),
            });
        }
    }

    /// Synchronous models handle their own completions before returning.
    fn pump(&mut self) {
        if !self.options.asynchronous {
            self.process_pending();
        }
    }

    fn run_filter(&mut self) {
        if self.filter.start_pass(self.dataset.snapshot()).is_some() {
            self.dataset.notify(ModelEvent::FilterStarted);
        }
    }

    fn rebuild_order(&mut self) {
        let mut order: Vec<usize> = (0..self.dataset.len())
            .filter(|row| self.filter.is_visible(*row))
            .collect();
        if let Some(key) = &self.sort {
            sort_rows(&mut order, &self.dataset, key);
        }
        self.order = order;
    }

    fn apply_changes_since(&mut self, mark: usize) {
        let changes = self.dataset.events().events().get(mark..).unwrap_or_default();
        self.filter.apply_changes(changes, &self.dataset);
    }

    /// Runs a dataset mutation, then brings the projection up to date with
    /// the events it produced. A pass in flight was started over the old
    /// rows, so it is replaced by a new one.
    fn edit<T>(&mut self, mutation: impl FnOnce(&mut Dataset) -> Result<T>) -> Result<T> {
        let mark = self.dataset.events().len();
        let result = mutation(&mut self.dataset);
        let restart = self.filter.cancel();
        self.apply_changes_since(mark);
        if restart {
            self.run_filter();
        }
        self.rebuild_order();
        self.pump();
        result
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn set_field_value(&mut self, row: usize, column: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.edit(|dataset| dataset.set_field_value(row, column, value))
    }

    /// Writes `fields` into every row.
    pub fn set_rows_data(&mut self, fields: &BTreeMap<String, Value>) -> Result<()> {
        self.edit(|dataset| dataset.set_rows_data(fields))
    }

    fn ensure_loaded(&self) -> Result<()> {
        match self.status {
            LoadStatus::Refreshed | LoadStatus::Empty => Ok(()),
            status => {
                error!("Row creation is not possible in load status {:?}", status);
                Err(Error::InvalidState(format!(
                    "rows cannot be added in load status {:?}",
                    status
                )))
            }
        }
    }

    /// Adds a row. See [`Dataset::add_row`] for the duplicate rules.
    pub fn add_row(
        &mut self,
        fields: &BTreeMap<String, Value>,
        unique_columns: &[String],
    ) -> Result<usize> {
        self.ensure_loaded()?;
        self.edit(|dataset| dataset.add_row(fields, unique_columns))
    }

    pub fn add_rows(
        &mut self,
        rows: &[BTreeMap<String, Value>],
        unique_columns: &[String],
    ) -> Result<Vec<usize>> {
        self.ensure_loaded()?;
        self.edit(|dataset| dataset.add_rows(rows, unique_columns))
    }

    pub fn remove_row(&mut self, row: usize) -> Result<()> {
        self.edit(|dataset| dataset.remove_row(row))
    }

    pub fn flip_to_be_removed(&mut self, row: usize) -> Result<bool> {
        self.edit(|dataset| dataset.flip_to_be_removed(row))
    }

    pub fn flip_is_added(&mut self, row: usize) -> Result<bool> {
        self.edit(|dataset| dataset.flip_is_added(row))
    }

    pub fn clean_field(&mut self, row: usize, column: &str) -> Result<()> {
        self.edit(|dataset| dataset.clean_field(row, column))
    }

    pub fn clean_row(&mut self, row: usize) -> Result<bool> {
        self.edit(|dataset| dataset.clean_row(row))
    }

    pub fn clean_data(&mut self) -> Result<()> {
        self.edit(|dataset| dataset.clean_data())
    }

    /// Drops every row and the column maps. Rejected while loading.
    pub fn clear(&mut self) -> Result<()> {
        if self.loader.is_loading() {
            error!("Clearing data is not possible, model is still loading data");
            return Err(Error::Busy);
        }
        self.dataset.clear();
        self.run_filter();
        self.rebuild_order();
        self.pump();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------

    /// Sets the predicate for `column` (exact equality, or case-insensitive
    /// substring) and refilters.
    pub fn add_filter(&mut self, column: &str, value: impl Into<Value>, exact: bool) {
        let predicate = Predicate {
            value: value.into(),
            exact,
        };
        self.filter.add_predicate(column, predicate);
        self.refilter();
    }

    /// Removes the predicate for `column`. Returns false if there was none.
    pub fn remove_filter(&mut self, column: &str) -> bool {
        if self.filter.remove_predicate(column).is_none() {
            warn!("No filter set for column '{}'", column);
            return false;
        }
        self.refilter();
        true
    }

    pub fn clear_filters(&mut self) {
        self.filter.clear_predicates();
        self.rebuild_order();
    }

    pub fn filter_value(&self, column: &str) -> Option<&Value> {
        self.filter.filter_value(column)
    }

    pub fn filter_enabled(&self) -> bool {
        self.filter.is_enabled()
    }

    /// A disabled filter keeps its predicates but shows every row.
    pub fn set_filter_enabled(&mut self, enabled: bool) {
        self.filter.set_enabled(enabled);
        self.refilter();
    }

    fn refilter(&mut self) {
        self.run_filter();
        self.rebuild_order();
        self.pump();
    }

    pub fn visibility(&self) -> &Visibility {
        self.filter.visibility()
    }

    /// Orders the visible rows by `column`. Nulls go last.
    pub fn sort_column(&mut self, column: &str, descending: bool) -> Result<()> {
        if self.dataset.column_index(column).is_none() {
            error!("Cannot sort by unknown column '{}'", column);
            return Err(Error::ColumnNotFound(column.to_string()));
        }
        self.sort = Some(if descending {
            SortKey::descending(column)
        } else {
            SortKey::ascending(column)
        });
        self.rebuild_order();
        info!("Sorted {} rows by '{}'", self.order.len(), column);
        self.dataset.notify(ModelEvent::Sorted {
            column: column.to_string(),
            descending,
        });
        Ok(())
    }

    /// Back to dataset order.
    pub fn clear_sort(&mut self) {
        self.sort = None;
        self.rebuild_order();
    }

    pub fn sort_key(&self) -> Option<&SortKey> {
        self.sort.as_ref()
    }

    pub fn visible_len(&self) -> usize {
        self.order.len()
    }

    pub fn visible_rows(&self) -> &[usize] {
        &self.order
    }

    /// Dataset index of the row shown at `visible`.
    pub fn source_row(&self, visible: usize) -> Result<usize> {
        self.order.get(visible).copied().ok_or_else(|| {
            error!("Invalid visible row {} requested", visible);
            Error::IndexOutOfRange {
                index: visible,
                len: self.order.len(),
            }
        })
    }

    /// Visible position of dataset row `source`, if it is shown.
    pub fn visible_row(&self, source: usize) -> Option<usize> {
        self.order.iter().position(|row| *row == source)
    }

    /// Toggles `flag` on every visible row.
    pub fn invert_state(&mut self, flag: RowFlag) -> Result<()> {
        let rows = self.order.clone();
        self.edit(|dataset| {
            for row in rows {
                let state = !dataset.flag(row, flag)?;
                dataset.set_flag(row, flag, state)?;
            }
            Ok(())
        })
    }

    /// Sets `flag` on every visible row.
    pub fn set_state(&mut self, flag: RowFlag) -> Result<()> {
        self.normalize_state(flag, true)
    }

    /// Clears `flag` on every visible row.
    pub fn remove_state(&mut self, flag: RowFlag) -> Result<()> {
        self.normalize_state(flag, false)
    }

    /// Brings `flag` of every visible row to `state`.
    pub fn normalize_state(&mut self, flag: RowFlag, state: bool) -> Result<()> {
        let rows = self.order.clone();
        self.edit(|dataset| {
            for row in rows {
                dataset.set_flag(row, flag, state)?;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Events and export
    // ------------------------------------------------------------------

    pub fn drain_events(&mut self) -> Vec<ModelEvent> {
        self.dataset.drain_events()
    }

    pub fn to_json(&self) -> Result<String> {
        self.dataset.to_json()
    }

    pub fn changed_rows_json(&self) -> Result<String> {
        self.dataset.changed_rows_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDatabase;
    use crate::driver::RowHook;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const PEOPLE: &str = "SELECT id, name FROM people";
    const NOBODY: &str = "SELECT id FROM people WHERE 0";

    fn people(rows: &[(i64, &str)]) -> Vec<Vec<Value>> {
        rows.iter()
            .map(|(id, name)| vec![Value::Int(*id), Value::from(*name)])
            .collect()
    }

    fn database() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.add_result(PEOPLE, &["id", "name"], people(&[(1, "a"), (2, "b"), (3, "c")]));
        db
    }

    fn synchronous() -> ModelOptions {
        ModelOptions {
            asynchronous: false,
            identity_column: Some("id".to_string()),
            ..ModelOptions::default()
        }
    }

    fn loaded(db: &MemoryDatabase) -> SqlModel {
        let mut model = SqlModel::new(Arc::new(db.clone()), synchronous()).unwrap();
        model.refresh(Query::new(PEOPLE)).unwrap();
        assert_eq!(model.load_status(), LoadStatus::Refreshed);
        model
    }

    fn fields(id: i64, name: &str) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), Value::Int(id));
        fields.insert("name".to_string(), Value::from(name));
        fields
    }

    fn name(model: &SqlModel, row: usize) -> Value {
        model.dataset().get_field_value(row, "name").unwrap()
    }

    #[test]
    fn test_synchronous_refresh() {
        let mut model = loaded(&database());
        assert!(!model.is_loading());
        assert!(model.check_load().is_ok());
        assert_eq!(model.dataset().len(), 3);
        assert_eq!(model.visible_rows(), &[0, 1, 2]);

        let events = model.drain_events();
        assert_eq!(events.first(), Some(&ModelEvent::LoadStarted { partial: false }));
        assert!(events.contains(&ModelEvent::LoadCompleted {
            partial: false,
            status: LoadStatus::Refreshed
        }));
    }

    #[test]
    fn test_filter_then_remove_shows_all() {
        let mut model = loaded(&database());
        model.add_filter("name", "b", false);
        assert_eq!(model.visible_rows(), &[1]);
        assert_eq!(model.filter_value("name"), Some(&Value::from("b")));

        assert!(model.remove_filter("name"));
        assert_eq!(model.visibility(), &Visibility::All);
        assert_eq!(model.visible_len(), 3);
        assert!(!model.remove_filter("name"));
    }

    #[test]
    fn test_disabled_filter_shows_all() {
        let mut model = loaded(&database());
        model.add_filter("id", 2, true);
        assert_eq!(model.visible_len(), 1);
        model.set_filter_enabled(false);
        assert!(!model.filter_enabled());
        assert_eq!(model.visible_len(), 3);
        model.set_filter_enabled(true);
        assert_eq!(model.visible_rows(), &[1]);
    }

    #[test]
    fn test_empty_result_is_not_an_error() {
        let db = database();
        db.add_result(NOBODY, &["id"], vec![]);
        let mut model = loaded(&db);

        model.refresh(Query::new(NOBODY)).unwrap();
        assert_eq!(model.load_status(), LoadStatus::Empty);
        assert!(model.last_error().is_none());
        assert!(model.dataset().is_empty());
        assert_eq!(model.dataset().column_names(), vec!["id".to_string()]);
    }

    #[test]
    fn test_query_error_keeps_data() {
        let db = database();
        db.add_error("SELECT broken", DriverError::new(Some(1), "syntax error"));
        let mut model = loaded(&db);

        model.refresh(Query::new("SELECT broken")).unwrap();
        assert_eq!(model.load_status(), LoadStatus::QueryError);
        assert_eq!(model.last_error().and_then(|e| e.code), Some(1));
        assert_eq!(
            model.check_load(),
            Err(Error::Query { code: Some(1), message: "syntax error".into() })
        );
        assert_eq!(model.dataset().len(), 3);
        assert_eq!(model.last_query().map(Query::text), Some("SELECT broken"));
    }

    #[test]
    fn test_invalid_query_is_rejected_before_loading() {
        let mut model = loaded(&database());
        let query = Query::new("SELECT id FROM people WHERE id = ':id'");
        assert!(matches!(model.refresh(query), Err(Error::InvalidQuery(_))));
        assert_eq!(model.load_status(), LoadStatus::Refreshed);
    }

    #[test]
    fn test_full_refresh_resets_dirty_state() {
        let mut model = loaded(&database());
        model.set_field_value(0, "name", "changed").unwrap();
        model.flip_to_be_removed(2).unwrap();
        assert!(model.dataset().is_dirty());

        model.refresh_last().unwrap();
        assert!(!model.dataset().is_dirty());
        assert_eq!(name(&model, 0), Value::from("a"));
    }

    #[test]
    fn test_partial_refresh_preserves_other_rows() {
        let db = database();
        let single = "SELECT id, name FROM people WHERE id IN (2)";
        db.add_result(single, &["id", "name"], people(&[(2, "B")]));
        let mut model = loaded(&db);

        model.set_field_value(0, "name", "A!").unwrap();
        model.set_field_value(1, "name", "b?").unwrap();
        model.set_field_value(2, "name", "C!").unwrap();
        model.refresh_rows(Query::new(single), &[1]).unwrap();

        assert_eq!(model.load_status(), LoadStatus::Refreshed);
        assert_eq!(name(&model, 0), Value::from("A!"));
        assert_eq!(name(&model, 1), Value::from("B"));
        assert_eq!(name(&model, 2), Value::from("C!"));
        assert!(!model.dataset().row_is_dirty(1).unwrap());
        assert!(model.dataset().row_is_dirty(0).unwrap());
        assert_eq!(model.dataset().changed_rows_count(), 2);
    }

    #[test]
    fn test_partial_refresh_removes_missing_rows() {
        let db = database();
        let pair = "SELECT id, name FROM people WHERE id IN (2, 3)";
        db.add_result(pair, &["id", "name"], people(&[(2, "b2")]));
        let mut model = loaded(&db);
        model.add_filter("name", "b", false);

        model.refresh_rows(Query::new(pair), &[1, 2]).unwrap();
        assert_eq!(model.dataset().len(), 2);
        assert_eq!(name(&model, 1), Value::from("b2"));
        assert_eq!(model.visible_rows(), &[1]);
        assert!(model.drain_events().contains(&ModelEvent::PartialRefreshOutcome {
            refreshed: [(1, Value::Int(2))].into_iter().collect(),
            removed: vec![2],
        }));
    }

    #[test]
    fn test_partial_refresh_with_empty_result_removes_requested_rows() {
        let db = database();
        let gone = "SELECT id, name FROM people WHERE id IN (1, 3)";
        db.add_result(gone, &["id", "name"], vec![]);
        let mut model = loaded(&db);
        model.set_field_value(1, "name", "b!").unwrap();

        model.refresh_rows(Query::new(gone), &[0, 2]).unwrap();
        assert_eq!(model.load_status(), LoadStatus::Empty);
        assert!(model.check_load().is_ok());
        assert_eq!(model.dataset().len(), 1);
        assert_eq!(name(&model, 0), Value::from("b!"));
        assert!(model.dataset().is_dirty());
        assert_eq!(model.visible_rows(), &[0]);
        assert!(model.drain_events().contains(&ModelEvent::PartialRefreshOutcome {
            refreshed: BTreeMap::new(),
            removed: vec![0, 2],
        }));
    }

    #[test]
    fn test_partial_refresh_preconditions() {
        let db = database();
        let mut model = SqlModel::new(Arc::new(db.clone()), synchronous()).unwrap();
        assert!(matches!(
            model.refresh_rows(Query::new(PEOPLE), &[0]),
            Err(Error::InvalidState(_))
        ));

        let mut model = SqlModel::new(
            Arc::new(db),
            ModelOptions {
                identity_column: None,
                ..synchronous()
            },
        )
        .unwrap();
        model.refresh(Query::new(PEOPLE)).unwrap();
        assert!(matches!(
            model.refresh_rows(Query::new(PEOPLE), &[0]),
            Err(Error::ReconciliationPrecondition(_))
        ));
    }

    #[test]
    fn test_add_row_requires_loaded_data() {
        let db = database();
        let mut model = SqlModel::new(Arc::new(db.clone()), synchronous()).unwrap();
        assert!(matches!(
            model.add_row(&fields(4, "d"), &[]),
            Err(Error::InvalidState(_))
        ));

        let mut model = loaded(&db);
        model.add_filter("name", "d", false);
        let index = model.add_row(&fields(4, "dd"), &[]).unwrap();
        assert_eq!(index, 3);
        assert_eq!(model.visible_rows(), &[3]);
        assert!(model.dataset().row(3).unwrap().is_added());

        let err = model.add_row(&fields(4, "d"), &["id".to_string()]).unwrap_err();
        assert_eq!(err, Error::DuplicateRow(vec!["id".to_string()]));
    }

    #[test]
    fn test_mutations_keep_filter_current() {
        let mut model = loaded(&database());
        model.add_filter("name", "b", false);
        model.set_field_value(0, "name", "bob").unwrap();
        assert_eq!(model.visible_rows(), &[0, 1]);

        model.remove_row(0).unwrap();
        assert_eq!(model.visible_rows(), &[0]);
        assert_eq!(model.dataset().len(), 2);
    }

    #[test]
    fn test_sorting_and_row_mapping() {
        let db = MemoryDatabase::new();
        db.add_result(PEOPLE, &["id", "name"], people(&[(1, "c"), (2, "a"), (3, "b")]));
        let mut model = loaded(&db);

        model.sort_column("name", false).unwrap();
        assert_eq!(model.visible_rows(), &[1, 2, 0]);
        model.sort_column("name", true).unwrap();
        assert_eq!(model.visible_rows(), &[0, 2, 1]);
        assert_eq!(model.source_row(1).unwrap(), 2);
        assert_eq!(model.visible_row(1), Some(2));
        assert!(model.source_row(3).is_err());
        assert!(matches!(
            model.sort_column("age", false),
            Err(Error::ColumnNotFound(_))
        ));

        model.set_field_value(1, "name", "z").unwrap();
        assert_eq!(model.visible_rows(), &[1, 0, 2]);
        model.clear_sort();
        assert_eq!(model.visible_rows(), &[0, 1, 2]);
    }

    #[test]
    fn test_state_helpers_touch_visible_rows_only() {
        let mut model = loaded(&database());
        model.add_filter("id", 2, true);

        model.set_state(RowFlag::ToBeRemoved).unwrap();
        assert!(model.dataset().flag(1, RowFlag::ToBeRemoved).unwrap());
        assert!(!model.dataset().flag(0, RowFlag::ToBeRemoved).unwrap());

        model.invert_state(RowFlag::ToBeRemoved).unwrap();
        assert!(!model.dataset().flag(1, RowFlag::ToBeRemoved).unwrap());

        model.remove_filter("id");
        model.normalize_state(RowFlag::Added, true).unwrap();
        assert!(model.dataset().rows().all(|row| row.is_added()));
        model.remove_state(RowFlag::Added).unwrap();
        assert!(!model.dataset().is_dirty());
    }

    #[test]
    fn test_clean_operations() {
        let mut model = loaded(&database());
        model.set_field_value(0, "name", "x").unwrap();
        model.set_field_value(1, "name", "y").unwrap();
        model.clean_field(0, "name").unwrap();
        assert_eq!(name(&model, 0), Value::from("a"));
        assert!(model.clean_field(0, "name").is_err());

        model.clean_data().unwrap();
        assert!(!model.dataset().is_dirty());
        assert!(model.clean_data().is_err());
    }

    #[test]
    fn test_clear() {
        let mut model = loaded(&database());
        model.add_filter("name", "a", false);
        model.clear().unwrap();
        assert!(model.dataset().is_empty());
        assert_eq!(model.visible_len(), 0);
        assert!(model.drain_events().contains(&ModelEvent::DataCleared));
    }

    #[test]
    fn test_progress_events() {
        let db = MemoryDatabase::new();
        db.add_result(
            PEOPLE,
            &["id", "name"],
            people(&[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")]),
        );
        let options = ModelOptions {
            report_progress: true,
            progress_interval: 2,
            ..synchronous()
        };
        let mut model = SqlModel::new(Arc::new(db), options).unwrap();
        model.refresh(Query::new(PEOPLE)).unwrap();

        let progress: Vec<usize> = model
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                ModelEvent::RowsLoaded(rows) => Some(rows),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0, 2, 4, 5]);
    }

    #[tokio::test]
    async fn test_asynchronous_refresh_and_busy() {
        let db = database();
        let mut model = SqlModel::new(Arc::new(db), ModelOptions::default()).unwrap();

        model.refresh(Query::new(PEOPLE)).unwrap();
        assert_eq!(model.load_status(), LoadStatus::Loading);
        assert_eq!(model.refresh(Query::new(PEOPLE)), Err(Error::Busy));
        assert_eq!(model.clear(), Err(Error::Busy));

        model.settle().await;
        assert_eq!(model.load_status(), LoadStatus::Refreshed);
        assert_eq!(model.dataset().len(), 3);

        model.add_filter("name", "c", false);
        assert!(model.is_filtering());
        model.settle().await;
        assert_eq!(model.visible_rows(), &[2]);
        assert!(!model.next_completion().await);
    }

    #[tokio::test]
    async fn test_continuous_refresh_uses_latest_query() {
        let db = database();
        db.add_result("SELECT id, name FROM other", &["id", "name"], people(&[(9, "z")]));
        let options = ModelOptions {
            allow_continuous_refreshes: true,
            ..ModelOptions::default()
        };
        let mut model = SqlModel::new(Arc::new(db), options).unwrap();

        model.refresh(Query::new(PEOPLE)).unwrap();
        model.refresh(Query::new("SELECT id, name FROM other")).unwrap();
        model.settle().await;

        assert_eq!(model.load_status(), LoadStatus::Refreshed);
        assert_eq!(model.dataset().len(), 1);
        assert_eq!(name(&model, 0), Value::from("z"));
    }

    /// Blocks the driver before fetching row `at`, once, until released.
    fn gate(
        db: &MemoryDatabase,
        at: usize,
    ) -> (std::sync::mpsc::Receiver<()>, std::sync::mpsc::Sender<()>) {
        let (reached_tx, reached_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let fired = AtomicBool::new(false);
        let hook: RowHook = Arc::new(move |pos| {
            if pos == at && !fired.swap(true, Ordering::SeqCst) {
                reached_tx.send(()).unwrap();
                release_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5))
                    .unwrap();
            }
        });
        db.on_row(Some(hook));
        (reached_rx, release_tx)
    }

    async fn abort_second_load(emit_on_abort: bool) -> SqlModel {
        let db = database();
        let many = "SELECT id, name FROM many";
        db.add_result(
            many,
            &["id", "name"],
            people(&[(10, "p"), (11, "q"), (12, "r"), (13, "s"), (14, "t")]),
        );
        let options = ModelOptions {
            emit_on_abort,
            ..ModelOptions::default()
        };
        let mut model = SqlModel::new(Arc::new(db.clone()), options).unwrap();
        model.refresh(Query::new(PEOPLE)).unwrap();
        model.settle().await;

        let (reached, release) = gate(&db, 2);
        model.refresh(Query::new(many)).unwrap();
        reached.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(model.request_abort());
        release.send(()).unwrap();
        model.settle().await;

        assert_eq!(model.load_status(), LoadStatus::Aborted);
        assert!(!model.request_abort());
        model
    }

    #[tokio::test]
    async fn test_partial_removal_keeps_visible_rows_matching() {
        let db = database();
        let first = "SELECT id, name FROM people WHERE id IN (1)";
        db.add_result(first, &["id", "name"], vec![]);
        let options = ModelOptions {
            identity_column: Some("id".to_string()),
            ..ModelOptions::default()
        };
        let mut model = SqlModel::new(Arc::new(db), options).unwrap();
        model.refresh(Query::new(PEOPLE)).unwrap();
        model.settle().await;
        model.add_filter("name", "b", false);
        model.settle().await;
        assert_eq!(model.visible_rows(), &[1]);

        // Handle the load completion only; the follow-up pass may still run.
        model.refresh_rows(Query::new(first), &[0]).unwrap();
        while model.is_loading() {
            assert!(model.next_completion().await);
        }
        assert_eq!(model.dataset().len(), 2);
        assert_eq!(model.visible_rows(), &[0]);
        assert_eq!(name(&model, 0), Value::from("b"));

        model.settle().await;
        assert_eq!(model.visible_rows(), &[0]);
    }

    #[tokio::test]
    async fn test_aborted_partial_refresh_applies_fetched_rows() {
        let db = database();
        let all = "SELECT id, name FROM people WHERE id IN (1, 2, 3)";
        db.add_result(all, &["id", "name"], people(&[(1, "A"), (2, "B")]));
        let options = ModelOptions {
            identity_column: Some("id".to_string()),
            ..ModelOptions::default()
        };
        let mut model = SqlModel::new(Arc::new(db.clone()), options).unwrap();
        model.refresh(Query::new(PEOPLE)).unwrap();
        model.settle().await;

        let (reached, release) = gate(&db, 1);
        model.refresh_rows(Query::new(all), &[0, 1, 2]).unwrap();
        reached.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(model.request_abort());
        release.send(()).unwrap();
        model.settle().await;

        assert_eq!(model.load_status(), LoadStatus::Aborted);
        assert_eq!(model.check_load(), Err(Error::Aborted));
        // Row 2 was not returned, but the fetch stopped early, so it stays.
        assert_eq!(model.dataset().len(), 3);
        assert_eq!(name(&model, 0), Value::from("A"));
        assert_eq!(name(&model, 1), Value::from("B"));
        assert_eq!(name(&model, 2), Value::from("c"));
    }

    #[tokio::test]
    async fn test_abort_without_emit_leaves_dataset() {
        let model = abort_second_load(false).await;
        assert_eq!(model.dataset().len(), 3);
        assert_eq!(name(&model, 0), Value::from("a"));
    }

    #[tokio::test]
    async fn test_abort_with_emit_applies_loaded_rows() {
        let model = abort_second_load(true).await;
        assert_eq!(model.dataset().len(), 3);
        assert_eq!(name(&model, 0), Value::from("p"));
    }
}
