use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ConfigStore contract
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigStoreError {
    #[error("config database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("config store lock poisoned")]
    LockPoisoned,
}

/// Key lookup service mapping `(group, name)` to a value.
///
/// A missing key is `Ok(None)`; only backend failures are errors.
pub trait ConfigStore: Send + Sync {
    fn lookup(&self, group: &str, name: &str) -> Result<Option<String>, ConfigStoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Parameter groups held in memory: group → name → value.
pub type ParameterGroups = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    groups: ParameterGroups,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_groups(groups: ParameterGroups) -> Self {
        Self { groups }
    }

    pub fn insert(&mut self, group: &str, name: &str, value: impl Into<String>) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string(), value.into());
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with(mut self, group: &str, name: &str, value: impl Into<String>) -> Self {
        self.insert(group, name, value);
        self
    }
}

impl ConfigStore for MemoryConfigStore {
    fn lookup(&self, group: &str, name: &str) -> Result<Option<String>, ConfigStoreError> {
        Ok(self
            .groups
            .get(group)
            .and_then(|names| names.get(name))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

const SCHEMA: &str = r#"CREATE TABLE IF NOT EXISTS config (
    "group" TEXT NOT NULL,
    name    TEXT NOT NULL,
    value   TEXT
)"#;

/// Parameter store backed by a single `config("group", name, value)` table.
///
/// `rusqlite::Connection` is not `Sync`, so access goes through a mutex. Lookups
/// only ever happen from the worker that holds the execution gate, so there is
/// no contention in practice.
pub struct SqliteConfigStore {
    conn: Mutex<Connection>,
}

impl SqliteConfigStore {
    pub fn open(path: &Path) -> Result<Self, ConfigStoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, ConfigStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, ConfigStoreError> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ConfigStoreError> {
        self.conn.lock().map_err(|_| ConfigStoreError::LockPoisoned)
    }

    /// Replace the whole table with `rows` of `(group, name, value)`.
    /// Returns the number of rows written.
    pub fn replace_all(&self, rows: &[(String, String, String)]) -> Result<usize, ConfigStoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM config", [])?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(r#"INSERT INTO config ("group", name, value) VALUES (?1, ?2, ?3)"#)?;
            for (group, name, value) in rows {
                count += stmt.execute(params![group, name, value])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// All name/value pairs stored under `group`.
    pub fn entries(&self, group: &str) -> Result<BTreeMap<String, String>, ConfigStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(r#"SELECT name, value FROM config WHERE "group" = ?1"#)?;
        let rows = stmt.query_map(params![group], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            if let Some(value) = value {
                out.insert(name, value);
            }
        }
        Ok(out)
    }

    /// Reverse lookup: `(group, name)` pairs whose value equals `value`.
    pub fn names_for_value(&self, value: &str) -> Result<Vec<(String, String)>, ConfigStoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(r#"SELECT "group", name FROM config WHERE value = ?1 ORDER BY "group", name"#)?;
        let rows = stmt.query_map(params![value], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

impl ConfigStore for SqliteConfigStore {
    fn lookup(&self, group: &str, name: &str) -> Result<Option<String>, ConfigStoreError> {
        let conn = self.conn()?;
        let value: Option<Option<String>> = conn
            .query_row(
                r#"SELECT value FROM config WHERE "group" = ?1 AND name = ?2"#,
                params![group, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten())
    }
}
