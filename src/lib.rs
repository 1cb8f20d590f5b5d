/// LiveSQL - SQL-backed live tables
///
/// Loads the result of a SQL query into an in-memory, editable table, keeps
/// track of every local change, and maintains a filtered and sorted view of
/// the rows. Loads and filter passes run on tokio's blocking pool and can be
/// aborted or superseded; the owner applies their results from its own
/// context.

pub mod config;
pub mod dataset;
pub mod driver;
pub mod error;
pub mod events;
pub mod filter;
pub mod loader;
pub mod model;
pub mod query;
pub mod row;
pub mod sequence;
pub mod sort;
pub mod value;

pub use config::ModelOptions;
pub use dataset::{Dataset, RowFlag, RowPolicy, Snapshot};
pub use driver::memory::MemoryDatabase;
#[cfg(feature = "sqlite")]
pub use driver::sqlite::SqliteProvider;
pub use driver::{
    Connection, ConnectionProvider, DriverError, ErrorSink, LogErrorSink, RowReceiver, Severity,
};
pub use error::{Error, Result};
pub use events::{EventQueue, IndexAdjuster, ModelEvent};
pub use filter::{FilterProjection, Predicate, Visibility};
pub use loader::{
    AbortHandle, LoadOutcome, LoadRequest, LoadStatus, Loader, LoaderMessage, OperationId,
    ReconciliationKey,
};
pub use model::SqlModel;
pub use query::Query;
pub use row::{ColumnMap, RowContainer, RowId};
pub use sequence::{ArraySequence, Sequence, StorageHint, TieredVectorSequence};
pub use sort::{SortKey, SortOrder};
pub use value::{Value, ValueKey, ValueKind};
