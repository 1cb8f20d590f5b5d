/// Error taxonomy for LiveSQL.
///
/// Loader-level failures (`Connection`, `Query`, `Aborted`) are terminal for
/// a load operation; `SqlModel::check_load` reports them for the last load. Validation failures (`IndexOutOfRange`, `TypeMismatch`, ...) are
/// recovered locally: the operation that returns them has left every piece of
/// state untouched.
use crate::value::ValueKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The connection handle could not be opened.
    #[error("connection failed (code {code:?}): {message}")]
    Connection { code: Option<i32>, message: String },

    /// The statement failed to execute.
    #[error("query failed (code {code:?}): {message}")]
    Query { code: Option<i32>, message: String },

    #[error("operation aborted")]
    Aborted,

    /// Partial refresh cannot proceed (identity column missing, duplicate identities, ...).
    #[error("partial refresh precondition failed: {0}")]
    ReconciliationPrecondition(String),

    #[error("index {index} out of range [0, {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("column '{0}' not found")]
    ColumnNotFound(String),

    #[error("missing value for column '{0}'")]
    MissingColumnValue(String),

    #[error("type mismatch for column '{column}': expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("duplicate row for columns {0:?}")]
    DuplicateRow(Vec<String>),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A load is already in flight and restart semantics were not requested.
    #[error("loader is busy")]
    Busy,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),
}
