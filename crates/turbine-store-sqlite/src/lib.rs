use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

mod stores;

pub use stores::{ComponentStore, RecentEnvironmentsStore, SettingsStore, VisibleEnvironmentsStore};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv_entries (
  key TEXT PRIMARY KEY CHECK (length(key) > 0),
  value_json TEXT NOT NULL CHECK (json_valid(value_json)),
  updated_at TEXT NOT NULL
);
";

/// Persistent JSON key-value storage shared by every store service.
pub trait KeyValueBackend: Send + Sync {
    /// Read the value stored under `key`.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Insert or overwrite the value stored under `key`.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be written.
    fn set(&self, key: &str, value: &Value) -> Result<()>;

    /// Delete `key`; absent keys are not an error.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be written.
    fn remove(&self, key: &str) -> Result<()>;

    /// List stored keys in ascending order.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    fn keys(&self) -> Result<Vec<String>>;
}

pub type SharedBackend = Arc<dyn KeyValueBackend>;

pub(crate) fn load_json<T: DeserializeOwned>(
    backend: &dyn KeyValueBackend,
    key: &str,
) -> Result<Option<T>> {
    match backend.get(key)? {
        Some(value) => {
            let decoded = serde_json::from_value(value)
                .with_context(|| format!("failed to decode stored value for key {key}"))?;
            Ok(Some(decoded))
        }
        None => Ok(None),
    }
}

pub(crate) fn save_json<T: Serialize>(
    backend: &dyn KeyValueBackend,
    key: &str,
    value: &T,
) -> Result<()> {
    let encoded = serde_json::to_value(value)
        .with_context(|| format!("failed to encode value for key {key}"))?;
    backend.set(key, &encoded)
}

/// Volatile backend used by tests and one-shot tooling.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> SharedBackend {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Value>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("memory backend mutex poisoned"))
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub invalid_json_keys: Vec<String>,
    pub entry_count: usize,
    pub schema_status: SchemaStatus,
}

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open a SQLite-backed key-value store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database with the latest schema applied.
    ///
    /// # Errors
    /// Returns an error when the database cannot be created or migrated.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.migrate()?;
        Ok(backend)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.lock()?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&conn)?;
        let pending_versions: Vec<i64> = ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect();

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.lock()?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&conn)?;
        if version < 1 {
            let tx = conn
                .transaction()
                .context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::info!(version = 1, "applied kv schema migration");
        }

        let version = current_schema_version(&conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run quick-check, stored-JSON validity, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let (quick_check_message, invalid_json_keys, entry_count) = {
            let conn = self.lock()?;
            let quick_check_message: String = conn
                .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
                .context("failed to run PRAGMA quick_check")?;

            let mut stmt = conn
                .prepare("SELECT key, value_json FROM kv_entries ORDER BY key ASC")
                .context("failed to prepare kv_entries scan")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut invalid_json_keys = Vec::new();
            let mut entry_count = 0_usize;
            for row in rows {
                let (key, value_json) = row?;
                entry_count += 1;
                if serde_json::from_str::<Value>(&value_json).is_err() {
                    invalid_json_keys.push(key);
                }
            }
            (quick_check_message, invalid_json_keys, entry_count)
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            invalid_json_keys,
            entry_count,
            schema_status: self.schema_status()?,
        })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create backup directory {}", parent.display())
            })?;
        }

        self.lock()?
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }
}

impl KeyValueBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row("SELECT value_json FROM kv_entries WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read key {key}"))?;

        raw.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("stored value for key {key} is not valid JSON"))
        })
        .transpose()
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        let encoded = serde_json::to_string(value)
            .with_context(|| format!("failed to serialize value for key {key}"))?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO kv_entries(key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value_json = excluded.value_json,
               updated_at = excluded.updated_at",
            params![key, encoded, now_rfc3339()?],
        )
        .with_context(|| format!("failed to write key {key}"))?;
        tx.commit().context("failed to commit write transaction")?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?
            .execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
            .with_context(|| format!("failed to delete key {key}"))?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key FROM kv_entries ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
