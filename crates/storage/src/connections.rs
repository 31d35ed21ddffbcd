use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::debug;

use crate::error::StorageError;
use crate::schema::init_core_schema;

/// Logical schema holding the fixed catalog tables.
pub const CORE_SCHEMA: &str = "core";
/// Logical schema holding the dynamic per-participant tables.
pub const DATA_SCHEMA: &str = "data";

/// A cached connection scoped to one logical schema. Shared across callers;
/// every operation locks it for the duration of its statement(s).
pub type SchemaConn = Arc<Mutex<Connection>>;

/// Lazily-established, lock-protected registry of one connection per logical
/// schema.
///
/// Each logical schema is a separate database file under `root`. A schema's
/// connection opens the core database as its main database and attaches the
/// schema's file, so statements see the catalog tables plus the schema's own
/// tables (the search-path contract). Attaching creates the file when
/// missing, which is this backend's `CREATE SCHEMA IF NOT EXISTS`.
///
/// The check-then-insert sequence on the cache runs under one mutex; two
/// threads racing on a cold schema name get the same connection.
pub struct Connections {
    root: PathBuf,
    cache: Mutex<HashMap<String, SchemaConn>>,
}

impl Connections {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the cached connection for `schema`, establishing it on first
    /// use.
    pub fn get(&self, schema: &str) -> Result<SchemaConn, StorageError> {
        if !valid_schema_name(schema) {
            return Err(StorageError::Connection(format!(
                "invalid schema name: {schema}"
            )));
        }

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| StorageError::Connection("connection cache poisoned".into()))?;
        if let Some(conn) = cache.get(schema) {
            return Ok(Arc::clone(conn));
        }

        let conn = Connection::open(self.root.join("core.db"))?;
        init_core_schema(&conn)?;
        if schema != CORE_SCHEMA {
            let path = self.root.join(format!("{schema}.db"));
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS \"{schema}\""),
                [path.to_string_lossy()],
            )?;
        }
        debug!(schema, "opened schema connection");

        let conn = Arc::new(Mutex::new(conn));
        cache.insert(schema.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Flushes and drops every cached connection. With `commit`, any open
    /// explicit transaction is committed first; otherwise it is rolled back
    /// when the connection closes.
    pub fn close_all(&self, commit: bool) -> Result<(), StorageError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| StorageError::Connection("connection cache poisoned".into()))?;
        for (schema, conn) in cache.drain() {
            let guard = lock(&conn)?;
            if commit && !guard.is_autocommit() {
                guard.execute_batch("COMMIT")?;
            }
            debug!(schema = schema.as_str(), "closed schema connection");
        }
        Ok(())
    }
}

/// Locks a schema connection, mapping mutex poisoning to a storage error.
pub(crate) fn lock(conn: &SchemaConn) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|_| StorageError::Connection("schema connection poisoned".into()))
}

fn valid_schema_name(schema: &str) -> bool {
    let mut chars = schema.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_are_restricted() {
        assert!(valid_schema_name("data"));
        assert!(valid_schema_name("c12_archive"));
        assert!(!valid_schema_name(""));
        assert!(!valid_schema_name("1data"));
        assert!(!valid_schema_name("data; drop table campaign"));
    }

    #[test]
    fn get_returns_cached_connection() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let connections = Connections::new(dir.path())?;
        let first = connections.get(DATA_SCHEMA)?;
        let second = connections.get(DATA_SCHEMA)?;
        assert!(Arc::ptr_eq(&first, &second));
        Ok(())
    }
}
