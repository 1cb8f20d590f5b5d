/// SQLite driver backed by rusqlite.
///
/// Each `open` creates a fresh connection to the configured database, so every
/// load runs on its own handle. Rows are stepped out of the live statement and
/// handed to the receiver one at a time; nothing is buffered here.
use super::{Connection, ConnectionProvider, DriverError, DriverResult, RowReceiver};
use crate::value::{format_date, format_datetime, Value};
use log::debug;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::OpenFlags;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SqliteProvider {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteProvider {
            path: path.into(),
            flags: OpenFlags::default(),
        }
    }

    /// Opens connections read-only.
    pub fn read_only(mut self) -> Self {
        self.flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        self
    }
}

impl ConnectionProvider for SqliteProvider {
    fn open(&self) -> DriverResult<Box<dyn Connection>> {
        debug!("Opening SQLite connection to {}", self.path.display());
        let conn = rusqlite::Connection::open_with_flags(&self.path, self.flags)
            .map_err(driver_error)?;
        Ok(Box::new(SqliteConnection { conn }))
    }
}

struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl Connection for SqliteConnection {
    fn execute(
        &mut self,
        sql: &str,
        params: &BTreeMap<String, Value>,
        receiver: &mut dyn RowReceiver,
    ) -> DriverResult<()> {
        let mut stmt = self.conn.prepare(sql).map_err(driver_error)?;
        for (name, value) in params {
            if let Some(index) = stmt.parameter_index(name).map_err(driver_error)? {
                stmt.raw_bind_parameter(index, value).map_err(driver_error)?;
            }
        }

        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        if receiver.columns(&columns).is_break() {
            return Ok(());
        }
        let count = columns.len();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next().map_err(driver_error)? {
            let mut values = Vec::with_capacity(count);
            for i in 0..count {
                values.push(from_sql(row.get_ref(i).map_err(driver_error)?));
            }
            if receiver.row(values).is_break() {
                debug!("Fetch stopped by receiver");
                break;
            }
        }
        Ok(())
    }
}

fn driver_error(err: rusqlite::Error) -> DriverError {
    match &err {
        rusqlite::Error::SqliteFailure(code, message) => DriverError::new(
            Some(code.extended_code),
            message.clone().unwrap_or_else(|| err.to_string()),
        ),
        _ => DriverError::new(None, err.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Int(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Bool(v) => ToSqlOutput::Owned(SqlValue::Integer(*v as i64)),
            Value::Date(days) => ToSqlOutput::Owned(SqlValue::Text(format_date(*days))),
            Value::DateTime(ms) => ToSqlOutput::Owned(SqlValue::Text(format_datetime(*ms))),
            Value::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Collected;

    fn seeded() -> (tempfile::TempDir, SqliteProvider) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, score REAL, photo BLOB);
             INSERT INTO people VALUES (1, 'alice', 1.5, NULL);
             INSERT INTO people VALUES (2, 'bob', NULL, x'0102');",
        )
        .unwrap();
        (dir, SqliteProvider::new(path))
    }

    #[test]
    fn test_query_with_named_parameter() {
        let (_dir, provider) = seeded();
        let mut conn = provider.open().unwrap();
        let mut params = BTreeMap::new();
        params.insert(":id".to_string(), Value::Int(2));

        let mut collected = Collected::default();
        conn.execute(
            "SELECT id, name, score, photo FROM people WHERE id = :id",
            &params,
            &mut collected,
        )
        .unwrap();
        assert_eq!(collected.columns.len(), 4);
        assert_eq!(collected.columns[1], "name");
        assert_eq!(
            collected.rows,
            vec![vec![
                Value::Int(2),
                Value::from("bob"),
                Value::Null,
                Value::Blob(vec![1, 2]),
            ]]
        );
    }

    #[test]
    fn test_receiver_stops_unbounded_statement() {
        let (_dir, provider) = seeded();
        let mut conn = provider.open().unwrap();
        let mut collected = Collected {
            limit: Some(3),
            ..Collected::default()
        };
        conn.execute(
            "WITH RECURSIVE counter(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM counter) SELECT n FROM counter",
            &BTreeMap::new(),
            &mut collected,
        )
        .unwrap();
        assert_eq!(
            collected.rows,
            vec![vec![Value::Int(1)], vec![Value::Int(2)], vec![Value::Int(3)]]
        );
    }

    #[test]
    fn test_bad_statement_reports_code() {
        let (_dir, provider) = seeded();
        let mut conn = provider.open().unwrap();
        let err = conn
            .execute("SELECT * FROM missing", &BTreeMap::new(), &mut Collected::default())
            .unwrap_err();
        assert!(err.code.is_some());
        assert!(err.message.contains("missing"));
    }

    #[test]
    fn test_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SqliteProvider::new(dir.path().join("nope").join("x.db")).read_only();
        assert!(provider.open().is_err());
    }
}
