/// Data loader.
///
/// A `Loader` runs one load operation at a time. Each operation opens its own
/// connection, executes the query, and materializes rows into
/// [`RowContainer`]s. The result, a [`LoadOutcome`], is sent back to the
/// owner over an unbounded channel together with optional progress messages.
///
/// # Execution modes
///
/// - Asynchronous: the operation runs on tokio's blocking pool
///   (`spawn_blocking`), and the owner drains the channel later.
/// - Synchronous: the operation runs inline and its messages are already in
///   the channel when `load_data` returns.
///
/// # Abort and restart
///
/// Each operation carries its own abort and restart flags, checked before
/// every row is fetched from the driver. An aborted operation reports `Aborted` with either its partial
/// rows or nothing, depending on `emit_on_abort`. An operation superseded by
/// [`Loader::restart_operation`] emits nothing at all.
///
/// The operation stays current until the owner hands its outcome to
/// [`Loader::finish`]; outcomes of superseded operations are rejected there.
use crate::driver::{ConnectionProvider, DriverError, ErrorSink, RowReceiver, Severity};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::row::{ColumnMap, RowContainer};
use crate::value::{Value, ValueKey};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Load status of a model, and the terminal status of a load operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadStatus {
    #[default]
    NotInitialized,
    Loading,
    /// Rows were returned and applied.
    Refreshed,
    /// The query ran and returned no rows.
    Empty,
    /// The statement failed.
    QueryError,
    /// The connection could not be opened.
    DatabaseError,
    Aborted,
}

impl LoadStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, LoadStatus::Refreshed | LoadStatus::Empty)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, LoadStatus::QueryError | LoadStatus::DatabaseError)
    }
}

pub type OperationId = u64;

/// Identity values of the rows a partial refresh re-fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationKey {
    pub column: String,
    /// Current dataset index → identity value.
    pub previous: BTreeMap<usize, Value>,
}

/// Index of `values` by identity, for matching fetched rows in one lookup.
pub(crate) fn identity_lookup(values: &BTreeMap<usize, Value>) -> HashMap<ValueKey, usize> {
    values.iter().map(|(index, value)| (value.key(), *index)).collect()
}

/// Old index of the row whose identity is `identity`, if it was requested.
pub(crate) fn find_identity(
    lookup: &HashMap<ValueKey, usize>,
    values: &BTreeMap<usize, Value>,
    identity: &Value,
) -> Option<usize> {
    lookup
        .get(&identity.key())
        .copied()
        .filter(|index| values.get(index) == Some(identity))
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub query: Query,
    pub asynchronous: bool,
    pub report_progress: bool,
    pub emit_on_abort: bool,
    /// Present for partial refreshes.
    pub reconciliation: Option<ReconciliationKey>,
}

impl LoadRequest {
    pub fn new(query: Query) -> Self {
        LoadRequest {
            query,
            asynchronous: true,
            report_progress: false,
            emit_on_abort: true,
            reconciliation: None,
        }
    }

    pub fn synchronous(mut self) -> Self {
        self.asynchronous = false;
        self
    }

    pub fn with_progress(mut self, report: bool) -> Self {
        self.report_progress = report;
        self
    }

    pub fn with_emit_on_abort(mut self, emit: bool) -> Self {
        self.emit_on_abort = emit;
        self
    }

    pub fn partial(mut self, key: ReconciliationKey) -> Self {
        self.reconciliation = Some(key);
        self
    }

    pub fn is_partial(&self) -> bool {
        self.reconciliation.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub operation: OperationId,
    pub status: LoadStatus,
    pub partial: bool,
    pub columns: ColumnMap,
    pub rows: Vec<RowContainer>,
    /// False when an aborted load discarded its rows; the dataset must then
    /// be left untouched.
    pub data_attached: bool,
    /// Old index → identity value of rows found again (partial only).
    pub refreshed: BTreeMap<usize, Value>,
    /// Old indexes whose identity was not returned (partial only), ascending.
    pub removed: Vec<usize>,
    pub error: Option<DriverError>,
}

#[derive(Debug, Clone)]
pub enum LoaderMessage {
    Progress { operation: OperationId, rows: usize },
    Completed(LoadOutcome),
}

#[derive(Debug)]
struct OperationState {
    id: OperationId,
    abort: AtomicBool,
    restart: AtomicBool,
}

impl OperationState {
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// Aborts the operation it was taken from, from any thread.
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<OperationState>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.abort.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.aborted()
    }

    pub fn operation(&self) -> OperationId {
        self.0.id
    }
}

pub struct Loader {
    provider: Arc<dyn ConnectionProvider>,
    sink: Arc<dyn ErrorSink>,
    runtime: Option<Handle>,
    sender: UnboundedSender<LoaderMessage>,
    current: Option<Arc<OperationState>>,
    query: Option<Query>,
    progress_interval: usize,
    next_id: OperationId,
}

impl Loader {
    pub const DEFAULT_PROGRESS_INTERVAL: usize = 10;

    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        sink: Arc<dyn ErrorSink>,
    ) -> (Self, UnboundedReceiver<LoaderMessage>) {
        let (sender, receiver) = unbounded_channel();
        let loader = Loader {
            provider,
            sink,
            runtime: None,
            sender,
            current: None,
            query: None,
            progress_interval: Self::DEFAULT_PROGRESS_INTERVAL,
            next_id: 1,
        };
        (loader, receiver)
    }

    /// Runtime used for asynchronous loads. Defaults to the ambient runtime.
    pub fn set_runtime(&mut self, runtime: Handle) {
        self.runtime = Some(runtime);
    }

    pub fn set_progress_interval(&mut self, interval: usize) {
        self.progress_interval = interval.max(1);
    }

    pub fn is_loading(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_operation(&self) -> Option<OperationId> {
        self.current.as_ref().map(|state| state.id)
    }

    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.current.clone().map(AbortHandle)
    }

    /// Query of the most recent (or pending restarted) operation.
    pub fn query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    /// Starts a load operation. Fails with `Busy` if one is in flight.
    pub fn load_data(&mut self, request: LoadRequest) -> Result<OperationId> {
        if let Some(current) = &self.current {
            warn!("Loader is busy with operation {}", current.id);
            return Err(Error::Busy);
        }

        let runtime = if request.asynchronous {
            match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
                Some(handle) => Some(handle),
                None => {
                    return Err(Error::InvalidState(
                        "asynchronous load requires a tokio runtime".to_string(),
                    ))
                }
            }
        } else {
            None
        };

        let state = Arc::new(OperationState {
            id: self.next_id,
            abort: AtomicBool::new(false),
            restart: AtomicBool::new(false),
        });
        self.next_id += 1;
        self.current = Some(state.clone());
        self.query = Some(request.query.clone());

        info!(
            "Loader operation {} starting ({}, {})",
            state.id,
            if request.asynchronous { "asynchronous" } else { "synchronous" },
            if request.is_partial() { "partial" } else { "full" },
        );

        let job = LoadJob {
            provider: self.provider.clone(),
            sink: self.sink.clone(),
            state: state.clone(),
            request,
            interval: self.progress_interval,
            sender: self.sender.clone(),
        };
        match runtime {
            Some(handle) => {
                handle.spawn_blocking(move || job.run());
            }
            None => job.run(),
        }
        Ok(state.id)
    }

    /// Requests the in-flight operation to stop. Returns false if idle.
    pub fn abort_operation(&self) -> bool {
        match &self.current {
            Some(state) => {
                info!("Abort requested for loader operation {}", state.id);
                state.abort.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Supersedes the in-flight operation (if any) and records `query` for
    /// the next one. The superseded operation stops at its next row check and
    /// emits nothing.
    pub fn restart_operation(&mut self, query: Query) {
        if let Some(state) = self.current.take() {
            info!("Restart requested, superseding loader operation {}", state.id);
            state.restart.store(true, Ordering::Release);
            state.abort.store(true, Ordering::Release);
        }
        self.query = Some(query);
    }

    /// Accepts an outcome if it belongs to the current operation, which then
    /// stops being current. Returns false for stale outcomes.
    pub fn finish(&mut self, operation: OperationId) -> bool {
        match &self.current {
            Some(state) if state.id == operation => {
                self.current = None;
                true
            }
            _ => {
                debug!("Ignoring stale outcome of loader operation {}", operation);
                false
            }
        }
    }

    /// Whether a progress message belongs to the current operation.
    pub fn is_current(&self, operation: OperationId) -> bool {
        self.current_operation() == Some(operation)
    }
}

struct LoadJob {
    provider: Arc<dyn ConnectionProvider>,
    sink: Arc<dyn ErrorSink>,
    state: Arc<OperationState>,
    request: LoadRequest,
    interval: usize,
    sender: UnboundedSender<LoaderMessage>,
}

impl LoadJob {
    fn run(self) {
        if let Some(outcome) = self.execute() {
            self.send(LoaderMessage::Completed(outcome));
        }
    }

    fn send(&self, message: LoaderMessage) {
        if self.sender.send(message).is_err() {
            debug!("Loader receiver dropped, operation {} result discarded", self.state.id);
        }
    }

    fn progress(&self, rows: usize) {
        if self.request.report_progress {
            self.send(LoaderMessage::Progress {
                operation: self.state.id,
                rows,
            });
        }
    }

    fn outcome(&self, status: LoadStatus) -> LoadOutcome {
        LoadOutcome {
            operation: self.state.id,
            status,
            partial: self.request.is_partial(),
            columns: ColumnMap::default(),
            rows: Vec::new(),
            data_attached: false,
            refreshed: BTreeMap::new(),
            removed: Vec::new(),
            error: None,
        }
    }

    fn failed(&self, status: LoadStatus, error: DriverError) -> LoadOutcome {
        self.sink.report(Severity::Error, &error);
        let mut outcome = self.outcome(status);
        outcome.error = Some(error);
        outcome
    }

    fn aborted(&self, mut outcome: LoadOutcome) -> Option<LoadOutcome> {
        if self.state.restart.load(Ordering::Acquire) {
            info!("Loader operation {} superseded by restart", self.state.id);
            return None;
        }
        info!(
            "Loader operation {} aborted after {} rows",
            self.state.id,
            outcome.rows.len()
        );
        outcome.status = LoadStatus::Aborted;
        outcome.removed.clear();
        if self.request.emit_on_abort {
            outcome.data_attached = true;
        } else {
            outcome.rows.clear();
            outcome.refreshed.clear();
            outcome.data_attached = false;
        }
        Some(outcome)
    }

    fn execute(&self) -> Option<LoadOutcome> {
        if self.state.aborted() {
            return self.aborted(self.outcome(LoadStatus::Aborted));
        }

        let mut conn = match self.provider.open() {
            Ok(conn) => conn,
            Err(err) => {
                warn!("Loader operation {}: cannot open connection: {}", self.state.id, err);
                return Some(self.failed(LoadStatus::DatabaseError, err));
            }
        };

        let sql = self.request.query.normalized();
        let mut fetch = Fetch::new(self);
        if let Err(err) = conn.execute(&sql, self.request.query.params(), &mut fetch) {
            warn!("Loader operation {}: query failed: {}", self.state.id, err);
            return Some(self.failed(LoadStatus::QueryError, err));
        }
        let Fetch {
            mut outcome,
            pending,
            failure,
            ..
        } = fetch;
        if let Some(err) = failure {
            return Some(self.failed(LoadStatus::QueryError, err));
        }

        // The cadence already reported a count that is a multiple of the interval.
        if outcome.rows.len() % self.interval != 0 {
            self.progress(outcome.rows.len());
        }
        outcome.removed = pending.into_keys().collect();

        if self.state.aborted() {
            return self.aborted(outcome);
        }

        outcome.data_attached = true;
        if outcome.rows.is_empty() {
            outcome.status = LoadStatus::Empty;
        }
        info!(
            "Loader operation {} finished: {:?}, {} rows",
            self.state.id,
            outcome.status,
            outcome.rows.len()
        );
        Some(outcome)
    }
}

/// Materializes the rows a driver streams for one operation.
struct Fetch<'a> {
    job: &'a LoadJob,
    outcome: LoadOutcome,
    identity_index: Option<usize>,
    lookup: HashMap<ValueKey, usize>,
    /// Requested rows not returned so far (partial only).
    pending: BTreeMap<usize, Value>,
    failure: Option<DriverError>,
}

impl<'a> Fetch<'a> {
    fn new(job: &'a LoadJob) -> Self {
        let key = job.request.reconciliation.as_ref();
        Fetch {
            job,
            outcome: job.outcome(LoadStatus::Refreshed),
            identity_index: None,
            lookup: key.map(|k| identity_lookup(&k.previous)).unwrap_or_default(),
            pending: key.map(|k| k.previous.clone()).unwrap_or_default(),
            failure: None,
        }
    }

    fn proceed(&self) -> ControlFlow<()> {
        if self.job.state.aborted() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

impl RowReceiver for Fetch<'_> {
    fn columns(&mut self, names: &[String]) -> ControlFlow<()> {
        let columns = ColumnMap::from_names(names.to_vec());
        if let Some(key) = &self.job.request.reconciliation {
            match columns.index_of(&key.column) {
                Some(index) => self.identity_index = Some(index),
                None => {
                    self.failure = Some(DriverError::new(
                        None,
                        format!("identity column '{}' missing from result set", key.column),
                    ));
                    return ControlFlow::Break(());
                }
            }
        }
        self.outcome.columns = columns;
        self.job.progress(0);
        self.proceed()
    }

    fn row(&mut self, values: Vec<Value>) -> ControlFlow<()> {
        let mut row = RowContainer::new(self.outcome.columns.len());
        row.set_initializing(true);
        let mut values = values.into_iter();
        for _ in 0..self.outcome.columns.len() {
            row.add_field(values.next().unwrap_or(Value::Null));
        }
        row.set_initializing(false);

        if let (Some(key), Some(index)) = (&self.job.request.reconciliation, self.identity_index) {
            let identity = row.field_value(index);
            match find_identity(&self.lookup, &key.previous, &identity) {
                Some(old_index) => {
                    self.pending.remove(&old_index);
                    self.outcome.refreshed.insert(old_index, identity);
                }
                None => warn!("Refreshed row with identity {:?} was not requested", identity),
            }
        }

        self.outcome.rows.push(row);
        if self.outcome.rows.len() % self.job.interval == 0 {
            self.job.progress(self.outcome.rows.len());
        }
        self.proceed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDatabase;
    use crate::driver::RowHook;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(Severity, DriverError)>>);

    impl ErrorSink for RecordingSink {
        fn report(&self, severity: Severity, error: &DriverError) {
            self.0.lock().unwrap().push((severity, error.clone()));
        }
    }

    const PEOPLE: &str = "SELECT id, name FROM people";

    fn people_db(count: i64) -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.add_result(
            PEOPLE,
            &["id", "name"],
            (1..=count)
                .map(|i| vec![Value::Int(i), Value::from(format!("p{}", i))])
                .collect(),
        );
        db
    }

    fn completed(rx: &mut UnboundedReceiver<LoaderMessage>) -> LoadOutcome {
        loop {
            match rx.try_recv().expect("no loader message") {
                LoaderMessage::Completed(outcome) => return outcome,
                LoaderMessage::Progress { .. } => continue,
            }
        }
    }

    #[test]
    fn test_synchronous_full_load() {
        let db = people_db(3);
        let (mut loader, mut rx) = Loader::new(Arc::new(db), Arc::new(RecordingSink::default()));

        let op = loader.load_data(LoadRequest::new(Query::new(PEOPLE)).synchronous()).unwrap();
        let outcome = completed(&mut rx);
        assert_eq!(outcome.operation, op);
        assert_eq!(outcome.status, LoadStatus::Refreshed);
        assert!(outcome.data_attached);
        assert_eq!(outcome.columns.names(), &["id".to_string(), "name".to_string()]);
        assert_eq!(outcome.rows.len(), 3);
        assert_eq!(outcome.rows[2].field_value(1), Value::from("p3"));
        assert!(outcome.rows.iter().all(|r| !r.is_dirty() && !r.is_initializing()));
    }

    #[test]
    fn test_busy_until_finished() {
        let (mut loader, mut rx) =
            Loader::new(Arc::new(people_db(1)), Arc::new(RecordingSink::default()));
        let op = loader.load_data(LoadRequest::new(Query::new(PEOPLE)).synchronous()).unwrap();
        assert!(loader.is_loading());
        assert_eq!(
            loader.load_data(LoadRequest::new(Query::new(PEOPLE)).synchronous()),
            Err(Error::Busy)
        );

        let outcome = completed(&mut rx);
        assert!(!loader.finish(op + 100));
        assert!(loader.finish(outcome.operation));
        assert!(!loader.is_loading());
        assert!(loader.load_data(LoadRequest::new(Query::new(PEOPLE)).synchronous()).is_ok());
    }

    #[test]
    fn test_empty_result() {
        let db = MemoryDatabase::new();
        db.add_result("SELECT id FROM nothing", &["id"], vec![]);
        let (mut loader, mut rx) = Loader::new(Arc::new(db), Arc::new(RecordingSink::default()));
        loader
            .load_data(LoadRequest::new(Query::new("SELECT id FROM nothing")).synchronous())
            .unwrap();
        let outcome = completed(&mut rx);
        assert_eq!(outcome.status, LoadStatus::Empty);
        assert_eq!(outcome.columns.len(), 1);
        assert!(outcome.rows.is_empty());
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_query_error_reaches_sink() {
        let db = MemoryDatabase::new();
        db.add_error("SELECT bad", DriverError::new(Some(1), "syntax error"));
        let sink = Arc::new(RecordingSink::default());
        let (mut loader, mut rx) = Loader::new(Arc::new(db), sink.clone());
        loader.load_data(LoadRequest::new(Query::new("SELECT bad")).synchronous()).unwrap();

        let outcome = completed(&mut rx);
        assert_eq!(outcome.status, LoadStatus::QueryError);
        assert_eq!(outcome.error, Some(DriverError::new(Some(1), "syntax error")));
        let reported = sink.0.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].0, Severity::Error);
    }

    #[test]
    fn test_connection_error() {
        let db = people_db(2);
        db.fail_open(Some(DriverError::new(Some(14), "unable to open database file")));
        let (mut loader, mut rx) = Loader::new(Arc::new(db), Arc::new(RecordingSink::default()));
        loader.load_data(LoadRequest::new(Query::new(PEOPLE)).synchronous()).unwrap();
        let outcome = completed(&mut rx);
        assert_eq!(outcome.status, LoadStatus::DatabaseError);
        assert_eq!(outcome.error.map(|e| e.code), Some(Some(14)));
    }

    #[test]
    fn test_parameters_are_bound_after_normalization() {
        let db = MemoryDatabase::new();
        db.add_result("SELECT id FROM people WHERE id = :id", &["id"], vec![vec![Value::Int(2)]]);
        let (mut loader, mut rx) =
            Loader::new(Arc::new(db.clone()), Arc::new(RecordingSink::default()));
        let query = Query::new("SELECT id FROM people WHERE id = ':id'").with_param("id", 2);
        loader.load_data(LoadRequest::new(query).synchronous()).unwrap();

        assert_eq!(completed(&mut rx).rows.len(), 1);
        let executed = db.executed();
        assert_eq!(executed[0].1.get(":id"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_progress_messages() {
        let (mut loader, mut rx) =
            Loader::new(Arc::new(people_db(25)), Arc::new(RecordingSink::default()));
        loader.set_progress_interval(10);
        loader
            .load_data(LoadRequest::new(Query::new(PEOPLE)).synchronous().with_progress(true))
            .unwrap();

        let mut progress = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let LoaderMessage::Progress { rows, .. } = message {
                progress.push(rows);
            }
        }
        assert_eq!(progress, vec![0, 10, 20, 25]);
    }

    #[test]
    fn test_progress_not_repeated_on_interval_boundary() {
        let (mut loader, mut rx) =
            Loader::new(Arc::new(people_db(20)), Arc::new(RecordingSink::default()));
        loader.set_progress_interval(10);
        loader
            .load_data(LoadRequest::new(Query::new(PEOPLE)).synchronous().with_progress(true))
            .unwrap();

        let mut progress = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let LoaderMessage::Progress { rows, .. } = message {
                progress.push(rows);
            }
        }
        assert_eq!(progress, vec![0, 10, 20]);
    }

    #[test]
    fn test_partial_refresh_with_empty_result() {
        let db = MemoryDatabase::new();
        let sql = "SELECT id, name FROM people WHERE id IN (1, 2)";
        db.add_result(sql, &["id", "name"], vec![]);
        let (mut loader, mut rx) = Loader::new(Arc::new(db), Arc::new(RecordingSink::default()));
        let key = ReconciliationKey {
            column: "id".to_string(),
            previous: [(0, Value::Int(1)), (3, Value::Int(2))].into_iter().collect(),
        };
        loader
            .load_data(LoadRequest::new(Query::new(sql)).synchronous().partial(key))
            .unwrap();

        let outcome = completed(&mut rx);
        assert_eq!(outcome.status, LoadStatus::Empty);
        assert!(outcome.data_attached);
        assert!(outcome.refreshed.is_empty());
        assert_eq!(outcome.removed, vec![0, 3]);
    }

    #[test]
    fn test_partial_refresh_sets() {
        let db = MemoryDatabase::new();
        let sql = "SELECT id, name FROM people WHERE id IN (1, 2, 3)";
        db.add_result(
            sql,
            &["id", "name"],
            vec![
                vec![Value::Int(3), Value::from("c")],
                vec![Value::Int(1), Value::from("a")],
            ],
        );
        let (mut loader, mut rx) = Loader::new(Arc::new(db), Arc::new(RecordingSink::default()));
        let key = ReconciliationKey {
            column: "id".to_string(),
            previous: [(0, Value::Int(1)), (4, Value::Int(2)), (7, Value::Int(3))]
                .into_iter()
                .collect(),
        };
        loader
            .load_data(LoadRequest::new(Query::new(sql)).synchronous().partial(key))
            .unwrap();

        let outcome = completed(&mut rx);
        assert!(outcome.partial);
        assert_eq!(outcome.status, LoadStatus::Refreshed);
        assert_eq!(
            outcome.refreshed,
            [(0, Value::Int(1)), (7, Value::Int(3))].into_iter().collect()
        );
        assert_eq!(outcome.removed, vec![4]);
    }

    #[test]
    fn test_partial_refresh_missing_identity_column() {
        let (mut loader, mut rx) =
            Loader::new(Arc::new(people_db(1)), Arc::new(RecordingSink::default()));
        let key = ReconciliationKey {
            column: "uid".to_string(),
            previous: [(0, Value::Int(1))].into_iter().collect(),
        };
        loader
            .load_data(LoadRequest::new(Query::new(PEOPLE)).synchronous().partial(key))
            .unwrap();
        assert_eq!(completed(&mut rx).status, LoadStatus::QueryError);
    }

    #[test]
    fn test_async_requires_runtime() {
        let (mut loader, _rx) =
            Loader::new(Arc::new(people_db(1)), Arc::new(RecordingSink::default()));
        assert!(matches!(
            loader.load_data(LoadRequest::new(Query::new(PEOPLE))),
            Err(Error::InvalidState(_))
        ));
        assert!(!loader.is_loading());
    }

    /// Blocks the driver before fetching row `at`, until released.
    fn gate(db: &MemoryDatabase, at: usize) -> (std::sync::mpsc::Receiver<()>, std::sync::mpsc::Sender<()>) {
        let (reached_tx, reached_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let fired = AtomicBool::new(false);
        let hook: RowHook = Arc::new(move |pos| {
            if pos == at && !fired.swap(true, Ordering::SeqCst) {
                reached_tx.send(()).unwrap();
                release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5)).unwrap();
            }
        });
        db.on_row(Some(hook));
        (reached_rx, release_tx)
    }

    async fn abort_after_three_rows(emit_on_abort: bool) -> LoadOutcome {
        let db = people_db(5);
        let (reached, release) = gate(&db, 2);
        let (mut loader, mut rx) = Loader::new(Arc::new(db), Arc::new(RecordingSink::default()));
        loader
            .load_data(LoadRequest::new(Query::new(PEOPLE)).with_emit_on_abort(emit_on_abort))
            .unwrap();

        reached.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(loader.abort_operation());
        release.send(()).unwrap();

        match rx.recv().await.unwrap() {
            LoaderMessage::Completed(outcome) => {
                assert!(loader.finish(outcome.operation));
                outcome
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_discards_rows() {
        let outcome = abort_after_three_rows(false).await;
        assert_eq!(outcome.status, LoadStatus::Aborted);
        assert!(!outcome.data_attached);
        assert!(outcome.rows.is_empty());
    }

    #[tokio::test]
    async fn test_abort_emits_partial_rows() {
        let outcome = abort_after_three_rows(true).await;
        assert_eq!(outcome.status, LoadStatus::Aborted);
        assert!(outcome.data_attached);
        assert_eq!(outcome.rows.len(), 3);
    }

    #[tokio::test]
    async fn test_aborted_partial_refresh_keeps_refreshed_rows() {
        let db = people_db(5);
        let (reached, release) = gate(&db, 1);
        let (mut loader, mut rx) = Loader::new(Arc::new(db), Arc::new(RecordingSink::default()));
        let key = ReconciliationKey {
            column: "id".to_string(),
            previous: [(0, Value::Int(1)), (1, Value::Int(2)), (7, Value::Int(99))]
                .into_iter()
                .collect(),
        };
        loader.load_data(LoadRequest::new(Query::new(PEOPLE)).partial(key)).unwrap();

        reached.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(loader.abort_operation());
        release.send(()).unwrap();

        let outcome = match rx.recv().await.unwrap() {
            LoaderMessage::Completed(outcome) => outcome,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(outcome.status, LoadStatus::Aborted);
        assert!(outcome.data_attached);
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(
            outcome.refreshed,
            [(0, Value::Int(1)), (1, Value::Int(2))].into_iter().collect()
        );
        // Identity 99 was never seen, but the fetch did not reach the end.
        assert!(outcome.removed.is_empty());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_abort_stops_sqlite_fetch() {
        use crate::driver::sqlite::SqliteProvider;

        let dir = tempfile::tempdir().unwrap();
        let provider = SqliteProvider::new(dir.path().join("counter.db"));
        let (mut loader, mut rx) = Loader::new(Arc::new(provider), Arc::new(RecordingSink::default()));
        let endless = Query::new(
            "WITH RECURSIVE counter(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM counter) \
             SELECT n FROM counter",
        );
        loader
            .load_data(LoadRequest::new(endless).with_progress(true))
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await.unwrap() {
                    LoaderMessage::Progress { rows, .. } => {
                        if rows >= 50 {
                            loader.abort_operation();
                        }
                    }
                    LoaderMessage::Completed(outcome) => return outcome,
                }
            }
        })
        .await
        .expect("abort did not stop the fetch");

        assert_eq!(outcome.status, LoadStatus::Aborted);
        assert!(outcome.rows.len() >= 50);
        assert_eq!(outcome.rows[0].field_value(0), Value::Int(1));
    }

    #[tokio::test]
    async fn test_restart_suppresses_superseded_operation() {
        let db = people_db(5);
        db.add_result("SELECT id FROM other", &["id"], vec![vec![Value::Int(42)]]);
        let (reached, release) = gate(&db, 1);
        let (mut loader, mut rx) = Loader::new(Arc::new(db), Arc::new(RecordingSink::default()));

        let first = loader.load_data(LoadRequest::new(Query::new(PEOPLE))).unwrap();
        reached.recv_timeout(Duration::from_secs(5)).unwrap();

        loader.restart_operation(Query::new("SELECT id FROM other"));
        let query = loader.query().cloned().unwrap();
        let second = loader.load_data(LoadRequest::new(query)).unwrap();
        assert_ne!(first, second);
        release.send(()).unwrap();

        let outcome = match rx.recv().await.unwrap() {
            LoaderMessage::Completed(outcome) => outcome,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(outcome.operation, second);
        assert_eq!(outcome.rows.len(), 1);
        assert!(loader.finish(second));

        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err(), "superseded operation must not emit");
    }
}
