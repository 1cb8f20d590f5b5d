/// In-memory scripted database.
///
/// Results are registered per statement text (after placeholder
/// normalization). Executing an unknown statement fails like a missing table
/// would. Clones share the same script, so a test can keep a handle and
/// change the data between loads.
use super::{Connection, ConnectionProvider, DriverError, DriverResult, RowHook, RowReceiver};
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
enum Response {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Error(DriverError),
}

#[derive(Default)]
struct MemoryState {
    responses: HashMap<String, Response>,
    open_error: Option<DriverError>,
    executed: Vec<(String, BTreeMap<String, Value>)>,
    row_hook: Option<RowHook>,
}

#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the result set returned for `sql`.
    pub fn add_result(&self, sql: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        let response = Response::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        };
        self.state().responses.insert(sql.to_string(), response);
    }

    /// Makes executing `sql` fail with `error`.
    pub fn add_error(&self, sql: &str, error: DriverError) {
        self.state()
            .responses
            .insert(sql.to_string(), Response::Error(error));
    }

    /// Makes every subsequent `open` fail (or succeed again with `None`).
    pub fn fail_open(&self, error: Option<DriverError>) {
        self.state().open_error = error;
    }

    /// Installs a hook called before each row of any result is fetched.
    pub fn on_row(&self, hook: Option<RowHook>) {
        self.state().row_hook = hook;
    }

    /// Statements executed so far, with their bound parameters.
    pub fn executed(&self) -> Vec<(String, BTreeMap<String, Value>)> {
        self.state().executed.clone()
    }
}

impl ConnectionProvider for MemoryDatabase {
    fn open(&self) -> DriverResult<Box<dyn Connection>> {
        if let Some(err) = &self.state().open_error {
            return Err(err.clone());
        }
        Ok(Box::new(MemoryConnection { db: self.clone() }))
    }
}

struct MemoryConnection {
    db: MemoryDatabase,
}

impl Connection for MemoryConnection {
    fn execute(
        &mut self,
        sql: &str,
        params: &BTreeMap<String, Value>,
        receiver: &mut dyn RowReceiver,
    ) -> DriverResult<()> {
        // The hook may block, so the script lock is released before fetching.
        let (response, hook) = {
            let mut state = self.db.state();
            state.executed.push((sql.to_string(), params.clone()));
            (state.responses.get(sql).cloned(), state.row_hook.clone())
        };
        let (columns, rows) = match response {
            Some(Response::Rows { columns, rows }) => (columns, rows),
            Some(Response::Error(err)) => return Err(err),
            None => return Err(DriverError::new(Some(1), format!("no such statement: {}", sql))),
        };

        if receiver.columns(&columns).is_break() {
            return Ok(());
        }
        for (position, values) in rows.into_iter().enumerate() {
            if let Some(hook) = &hook {
                hook(position);
            }
            if receiver.row(values).is_break() {
                break;
            }
        }
        Ok(())
    }
}
