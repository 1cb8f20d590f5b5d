/// Database driver seam.
///
/// A load operation opens its own connection through a [`ConnectionProvider`]
/// on the worker that runs it and executes one statement. The driver streams
/// the result into a [`RowReceiver`] one row at a time and fetches the next
/// row only when the receiver asks for it, so a load can stop a large fetch
/// between rows. Failures are reported to an [`ErrorSink`] before the load
/// completes.
///
/// Two drivers ship with the crate: [`memory`] (scripted results, used by the
/// tests) and `sqlite` (rusqlite, behind the `sqlite` feature).
use crate::error::Error;
use crate::value::Value;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use thiserror::Error as ThisError;

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Error reported by a driver: optional native code plus message.
#[derive(Debug, Clone, PartialEq, ThisError)]
#[error("{message} (code {code:?})")]
pub struct DriverError {
    pub code: Option<i32>,
    pub message: String,
}

impl DriverError {
    pub fn new(code: Option<i32>, message: impl Into<String>) -> Self {
        DriverError {
            code,
            message: message.into(),
        }
    }

    pub fn into_connection_error(self) -> Error {
        Error::Connection {
            code: self.code,
            message: self.message,
        }
    }

    pub fn into_query_error(self) -> Error {
        Error::Query {
            code: self.code,
            message: self.message,
        }
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Opens connections. Shared across workers, so it must be thread-safe;
/// the connections it returns are used by a single worker only.
pub trait ConnectionProvider: Send + Sync {
    fn open(&self) -> DriverResult<Box<dyn Connection>>;
}

pub trait Connection {
    /// Executes `sql`, binding `params` by placeholder name (`:name`), and
    /// streams the result set into `receiver`.
    ///
    /// A `Break` from the receiver ends the fetch early; that is not an
    /// error.
    fn execute(
        &mut self,
        sql: &str,
        params: &BTreeMap<String, Value>,
        receiver: &mut dyn RowReceiver,
    ) -> DriverResult<()>;
}

/// Consumer side of a streamed result set.
pub trait RowReceiver {
    /// Called once with the result column names, before the first fetch.
    fn columns(&mut self, names: &[String]) -> ControlFlow<()>;

    /// Called with each fetched row. The next row is fetched only after
    /// `Continue`.
    fn row(&mut self, values: Vec<Value>) -> ControlFlow<()>;
}

/// Called with the position of each row just before the driver fetches it.
pub type RowHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Receiver that keeps everything, optionally stopping after `limit` rows.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Collected {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub limit: Option<usize>,
}

#[cfg(test)]
impl RowReceiver for Collected {
    fn columns(&mut self, names: &[String]) -> ControlFlow<()> {
        self.columns = names.to_vec();
        ControlFlow::Continue(())
    }

    fn row(&mut self, values: Vec<Value>) -> ControlFlow<()> {
        self.rows.push(values);
        match self.limit {
            Some(limit) if self.rows.len() >= limit => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Receives driver failures (and other diagnostics) as they happen.
pub trait ErrorSink: Send + Sync {
    fn report(&self, severity: Severity, error: &DriverError);
}

/// Error sink that forwards to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, severity: Severity, err: &DriverError) {
        match severity {
            Severity::Info => info!("SQL: {}", err),
            Severity::Warning => warn!("SQL: {}", err),
            Severity::Error => error!("SQL: {}", err),
        }
    }
}
