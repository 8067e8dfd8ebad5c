use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use context_store_core::atomic::{copy_atomic, read_json};
use context_store_core::config::{RetentionPolicy, META_FILE, STATE_FILE};
use context_store_core::merge::canonical_string;
use context_store_core::retention::{apply_retention, unique_backup_path, BackupSeries, RetentionReport};
use context_store_core::state::file_stamp;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;
const MEMORY_PATH: &str = ":memory:";
const DB_EXTENSION: &str = "sqlite3";

pub const DB_BACKUPS: BackupSeries<'static> =
    BackupSeries { prefix: "context_store_backup_", extension: DB_EXTENSION };
pub const SYSTEM_ACTOR: &str = "system";
pub const MIGRATION_ACTOR: &str = "migration_script";
pub const META_JSON_KEY: &str = "meta.json";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS states (
  app TEXT NOT NULL,
  serial TEXT NOT NULL,
  payload TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (app, serial)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS states_meta (
  app TEXT NOT NULL,
  serial TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  checksum TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (app, serial)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS context_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  app TEXT NOT NULL,
  serial TEXT NOT NULL,
  payload TEXT,
  change_type TEXT NOT NULL CHECK (change_type IN ('upsert','migrate','delete')),
  actor TEXT NOT NULL,
  changed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS store_meta (
  app TEXT NOT NULL,
  key TEXT NOT NULL,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (app, key)
) WITHOUT ROWID;
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_context_history_app_serial
  ON context_history(app, serial, id);
CREATE INDEX IF NOT EXISTS idx_states_meta_updated
  ON states_meta(app, updated_at);
";

const UPSERT_STATE_SQL: &str = r"
INSERT INTO states(app, serial, payload, updated_at) VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(app, serial) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at
";

const UPSERT_STATE_META_SQL: &str = r"
INSERT INTO states_meta(app, serial, version, checksum, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?5)
ON CONFLICT(app, serial) DO UPDATE SET
  version = excluded.version,
  checksum = excluded.checksum,
  updated_at = excluded.updated_at
";

const INSERT_HISTORY_SQL: &str = r"
INSERT INTO context_history(app, serial, payload, change_type, actor, changed_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
";

const SELECT_STATE_SQL: &str = r"
SELECT s.app, s.serial, s.payload, m.version, m.checksum, m.created_at, s.updated_at
FROM states s
JOIN states_meta m ON m.app = s.app AND m.serial = s.serial
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Upsert,
    Migrate,
    Delete,
}

impl ChangeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Migrate => "migrate",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upsert" => Some(Self::Upsert),
            "migrate" => Some(Self::Migrate),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub app: String,
    pub serial: String,
    pub payload: Value,
    pub version: i64,
    pub checksum: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub app: String,
    pub serial: String,
    pub payload: Option<Value>,
    pub change_type: ChangeType,
    pub actor: String,
    pub changed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub version: i64,
    pub checksum: String,
    /// Whether the checksum differs from the previous row's.
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub app: String,
    pub imported: usize,
    pub snapshots: Vec<PathBuf>,
    pub meta_imported: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbBackup {
    pub path: PathBuf,
    pub retention: RetentionReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub app: Option<String>,
    pub apps: i64,
    pub states: i64,
    pub history: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub journal_mode: String,
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub schema_version: i64,
    pub tables: Vec<String>,
}

/// SHA-256 of the key-sorted compact JSON encoding, lowercase hex.
#[must_use]
pub fn compute_checksum(payload: &Value) -> String {
    let digest = Sha256::digest(canonical_string(payload).as_bytes());
    format!("{digest:x}")
}

/// Durable per-entry state with checksums, versions and an audit trail.
#[derive(Debug)]
pub struct SqliteStateStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStateStore {
    /// Open the database at `path` and configure WAL journaling.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        if path != Path::new(MEMORY_PATH) {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create parent directory for database {}", path.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, path: path.to_path_buf() })
    }

    /// Open and bring the schema to the latest version.
    ///
    /// # Errors
    /// Returns an error when opening or migrating fails.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `BEGIN IMMEDIATE`: the write lock is taken before the first read.
    fn write_transaction(&mut self) -> rusqlite::Result<Transaction<'_>> {
        self.conn.transaction_with_behavior(TransactionBehavior::Immediate)
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        current_schema_version(&self.conn)
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 && table_exists(&self.conn, "states")? {
            // Tables from an unversioned file; v1 statements are idempotent.
            tracing::info!(path = %self.path.display(), "adopting unversioned context store schema");
        }

        if version < 1 {
            let tx = self.write_transaction().context("failed to start migration v1")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            version = 1;
        }

        if version < 2 {
            let tx = self.write_transaction().context("failed to start migration v2")?;
            tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
            record_schema_version(&tx, 2)?;
            tx.commit().context("failed to commit migration v2")?;
            version = 2;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    /// Replace the row for `(app, serial)`, bump its version and append an
    /// `upsert` history row. The write is unconditional.
    ///
    /// # Errors
    /// Returns an error when the payload cannot be encoded or the transaction fails.
    pub fn upsert_state(&mut self, app: &str, serial: &str, payload: &Value) -> Result<UpsertOutcome> {
        let tx = self.write_transaction().context("failed to start transaction")?;
        let outcome = write_state(&tx, app, serial, payload, ChangeType::Upsert, SYSTEM_ACTOR)?;
        tx.commit().context("failed to commit state upsert")?;
        tracing::debug!(app, serial, version = outcome.version, changed = outcome.changed, "upserted durable state");
        Ok(outcome)
    }

    /// Remove `(app, serial)` and record a `delete` history row. Returns whether a row existed.
    ///
    /// # Errors
    /// Returns an error when the transaction fails.
    pub fn delete_state(&mut self, app: &str, serial: &str) -> Result<bool> {
        let tx = self.write_transaction().context("failed to start transaction")?;
        let removed = tx
            .execute("DELETE FROM states WHERE app = ?1 AND serial = ?2", params![app, serial])
            .context("failed to delete state row")?;
        tx.execute("DELETE FROM states_meta WHERE app = ?1 AND serial = ?2", params![app, serial])
            .context("failed to delete state meta row")?;
        if removed > 0 {
            tx.execute(
                INSERT_HISTORY_SQL,
                params![app, serial, Option::<String>::None, ChangeType::Delete.as_str(), SYSTEM_ACTOR, now_rfc3339()?],
            )
            .context("failed to append delete history row")?;
        }
        tx.commit().context("failed to commit state delete")?;
        Ok(removed > 0)
    }

    /// # Errors
    /// Returns an error when the query fails or the stored payload is not JSON.
    pub fn load_state(&self, app: &str, serial: &str) -> Result<Option<StateRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_STATE_SQL} WHERE s.app = ?1 AND s.serial = ?2"),
                params![app, serial],
                raw_state_row,
            )
            .optional()
            .with_context(|| format!("failed to load state {app}/{serial}"))?;
        raw.map(RawState::into_record).transpose()
    }

    /// Every entry of `app`, ordered by serial.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored payload is not JSON.
    pub fn list_app_states(&self, app: &str) -> Result<Vec<StateRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_STATE_SQL} WHERE s.app = ?1 ORDER BY s.serial ASC"))
            .context("failed to prepare app state query")?;
        let rows = stmt.query_map(params![app], raw_state_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_apps(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT app FROM states ORDER BY app ASC")
            .context("failed to prepare app list query")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut apps = Vec::new();
        for row in rows {
            apps.push(row?);
        }
        Ok(apps)
    }

    /// Audit trail of `(app, serial)`, oldest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row is malformed.
    pub fn history(&self, app: &str, serial: &str) -> Result<Vec<HistoryRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, app, serial, payload, change_type, actor, changed_at
                 FROM context_history
                 WHERE app = ?1 AND serial = ?2
                 ORDER BY id ASC",
            )
            .context("failed to prepare history query")?;
        let mut rows = stmt.query(params![app, serial])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let payload_raw: Option<String> = row.get(3)?;
            let change_type_raw: String = row.get(4)?;
            records.push(HistoryRecord {
                id: row.get(0)?,
                app: row.get(1)?,
                serial: row.get(2)?,
                payload: payload_raw
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()
                    .context("failed to deserialize history payload")?,
                change_type: ChangeType::parse(&change_type_raw)
                    .ok_or_else(|| anyhow!("unknown change_type: {change_type_raw}"))?,
                actor: row.get(5)?,
                changed_at: row.get(6)?,
            });
        }
        Ok(records)
    }

    /// # Errors
    /// Returns an error when the value cannot be encoded or the write fails.
    pub fn upsert_store_meta(&self, app: &str, key: &str, value: &Value) -> Result<()> {
        upsert_store_meta(&self.conn, app, key, value)
    }

    /// # Errors
    /// Returns an error when the query fails or the stored value is not JSON.
    pub fn load_store_meta(&self, app: &str, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM store_meta WHERE app = ?1 AND key = ?2",
                params![app, key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to load store meta {app}/{key}"))?;
        raw.map(|raw| serde_json::from_str(&raw).context("failed to deserialize store meta"))
            .transpose()
    }

    /// Snapshot the live database with the native backup API. A `.sqlite3`
    /// suffix is appended when `dest` lacks one.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be created or backup fails.
    pub fn backup_db(&self, dest: &Path) -> Result<PathBuf> {
        let dest = with_db_extension(dest);
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", dest.display())
            })?;
        }
        self.conn
            .backup(DatabaseName::Main, &dest, None)
            .with_context(|| format!("failed to create sqlite backup at {}", dest.display()))?;
        tracing::info!(path = %dest.display(), "durable store backup written");
        Ok(dest)
    }

    /// Back up into `dir` as `context_store_backup_<ts>.sqlite3`, then apply `policy`.
    ///
    /// # Errors
    /// Returns an error when the backup or the retention listing fails.
    pub fn backup_with_retention(&self, dir: &Path, policy: &RetentionPolicy) -> Result<DbBackup> {
        let dest = unique_backup_path(dir, DB_BACKUPS, OffsetDateTime::now_utc())?;
        let path = self.backup_db(&dest)?;
        let retention = apply_retention(dir, DB_BACKUPS, policy)?;
        Ok(DbBackup { path, retention })
    }

    /// Replace this database with the contents of `src`, then migrate.
    ///
    /// # Errors
    /// Returns an error when `src` is missing, restore fails, or migrations fail.
    pub fn restore_db(&mut self, src: &Path) -> Result<()> {
        if !src.exists() {
            return Err(anyhow!("backup file does not exist: {}", src.display()));
        }
        self.conn
            .restore(DatabaseName::Main, src, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| format!("failed to restore sqlite backup from {}", src.display()))?;
        self.migrate()?;
        tracing::info!(src = %src.display(), "durable store restored");
        Ok(())
    }

    /// Import `<store_dir>/state.json` for `app`.
    ///
    /// Before any row changes, the database and the existing `state.json` and
    /// `meta.json` are copied into `<store_dir>/backups/`. Every entry is then
    /// written with a `migrate` history row, and `meta.json` is kept in
    /// `store_meta` under the key `meta.json`.
    ///
    /// # Errors
    /// Returns an error when a snapshot fails, `state.json` is not a JSON
    /// object, or the import transaction fails.
    pub fn migrate_from_state_json(&mut self, app: &str, store_dir: &Path) -> Result<MigrationReport> {
        let state_path = store_dir.join(STATE_FILE);
        let meta_path = store_dir.join(META_FILE);
        let backup_dir = store_dir.join("backups");
        let stamp = file_stamp(OffsetDateTime::now_utc())?;

        let mut snapshots = Vec::new();
        if self.path != Path::new(MEMORY_PATH) {
            let db_snapshot = backup_dir.join(format!("pre_migration_{stamp}.{DB_EXTENSION}"));
            snapshots.push(self.backup_db(&db_snapshot)?);
        }
        for (source, name) in [(&state_path, "state"), (&meta_path, "meta")] {
            if source.is_file() {
                let dest = backup_dir.join(format!("pre_migration_{name}_{stamp}.json"));
                copy_atomic(source, &dest)
                    .with_context(|| format!("failed to snapshot {}", source.display()))?;
                snapshots.push(dest);
            }
        }

        let state = match read_json(&state_path)
            .with_context(|| format!("failed to read {}", state_path.display()))?
        {
            None => serde_json::Map::new(),
            Some(Value::Object(state)) => state,
            Some(_) => return Err(anyhow!("{} is not a JSON object", state_path.display())),
        };
        let meta = read_json(&meta_path).unwrap_or_else(|err| {
            tracing::warn!(path = %meta_path.display(), error = %err, "skipping unreadable meta.json");
            None
        });

        let tx = self.write_transaction().context("failed to start migration import")?;
        for (serial, payload) in &state {
            write_state(&tx, app, serial, payload, ChangeType::Migrate, MIGRATION_ACTOR)?;
        }
        let meta_imported = match &meta {
            Some(meta) => {
                upsert_store_meta(&tx, app, META_JSON_KEY, meta)?;
                true
            }
            None => false,
        };
        tx.commit().context("failed to commit migration import")?;

        tracing::info!(app, imported = state.len(), meta_imported, "imported state.json into durable store");
        Ok(MigrationReport { app: app.to_string(), imported: state.len(), snapshots, meta_imported })
    }

    /// Row counts, for one app or the whole store.
    ///
    /// # Errors
    /// Returns an error when a count query fails.
    pub fn stats(&self, app: Option<&str>) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<i64> {
            self.conn
                .query_row(sql, params![app], |row| row.get(0))
                .with_context(|| format!("failed to run count query: {sql}"))
        };
        Ok(StoreStats {
            app: app.map(ToOwned::to_owned),
            apps: count("SELECT COUNT(DISTINCT app) FROM states WHERE ?1 IS NULL OR app = ?1")?,
            states: count("SELECT COUNT(*) FROM states WHERE ?1 IS NULL OR app = ?1")?,
            history: count("SELECT COUNT(*) FROM context_history WHERE ?1 IS NULL OR app = ?1")?,
        })
    }

    /// Journal mode, `quick_check` result and table list.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn health_check(&self) -> Result<HealthReport> {
        let journal_mode: String = self
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .context("failed to read journal_mode")?;
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .context("failed to list tables")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tables = Vec::new();
        for row in rows {
            tables.push(row?);
        }

        Ok(HealthReport {
            journal_mode,
            quick_check_ok: quick_check_message.eq_ignore_ascii_case("ok"),
            quick_check_message,
            schema_version: self.schema_version()?,
            tables,
        })
    }
}

struct RawState {
    app: String,
    serial: String,
    payload: String,
    version: i64,
    checksum: String,
    created_at: String,
    updated_at: String,
}

impl RawState {
    fn into_record(self) -> Result<StateRecord> {
        let payload = serde_json::from_str(&self.payload)
            .with_context(|| format!("failed to deserialize payload for {}/{}", self.app, self.serial))?;
        Ok(StateRecord {
            app: self.app,
            serial: self.serial,
            payload,
            version: self.version,
            checksum: self.checksum,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn raw_state_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawState> {
    Ok(RawState {
        app: row.get(0)?,
        serial: row.get(1)?,
        payload: row.get(2)?,
        version: row.get(3)?,
        checksum: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn write_state(
    conn: &Connection,
    app: &str,
    serial: &str,
    payload: &Value,
    change_type: ChangeType,
    actor: &str,
) -> Result<UpsertOutcome> {
    let now = now_rfc3339()?;
    let checksum = compute_checksum(payload);
    let encoded = serde_json::to_string(payload).context("failed to serialize state payload")?;

    let previous: Option<(i64, String)> = conn
        .query_row(
            "SELECT version, checksum FROM states_meta WHERE app = ?1 AND serial = ?2",
            params![app, serial],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("failed to read previous state version")?;
    let version = previous.as_ref().map_or(1, |(version, _)| version + 1);
    let changed = !matches!(&previous, Some((_, old)) if *old == checksum);

    conn.execute(UPSERT_STATE_SQL, params![app, serial, encoded, now])
        .context("failed to write state row")?;
    conn.execute(UPSERT_STATE_META_SQL, params![app, serial, version, checksum, now])
        .context("failed to write state meta row")?;
    conn.execute(INSERT_HISTORY_SQL, params![app, serial, encoded, change_type.as_str(), actor, now])
        .context("failed to append history row")?;

    Ok(UpsertOutcome { version, checksum, changed })
}

fn upsert_store_meta(conn: &Connection, app: &str, key: &str, value: &Value) -> Result<()> {
    let encoded = serde_json::to_string(value).context("failed to serialize store meta")?;
    conn.execute(
        "INSERT INTO store_meta(app, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(app, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![app, key, encoded, now_rfc3339()?],
    )
    .with_context(|| format!("failed to write store meta {app}/{key}"))?;
    Ok(())
}

fn with_db_extension(dest: &Path) -> PathBuf {
    if dest.extension().is_some_and(|ext| ext == DB_EXTENSION) {
        return dest.to_path_buf();
    }
    let mut name = dest.as_os_str().to_owned();
    name.push(".");
    name.push(DB_EXTENSION);
    PathBuf::from(name)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use ulid::Ulid;

    use super::*;

    fn memory_store() -> Result<SqliteStateStore> {
        SqliteStateStore::open_migrated(Path::new(MEMORY_PATH))
    }

    fn temp_dir(prefix: &str) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()));
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(dir)
    }

    #[test]
    fn migrate_is_idempotent_and_reaches_latest() -> Result<()> {
        let mut store = memory_store()?;
        store.migrate()?;
        assert_eq!(store.schema_version()?, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn version_increases_on_every_upsert_and_checksum_tracks_content() -> Result<()> {
        let mut store = memory_store()?;
        let first = store.upsert_state("app", "AB01", &json!({"STATUS": {"a": 1}}))?;
        let second = store.upsert_state("app", "AB01", &json!({"STATUS": {"a": 2}}))?;
        let third = store.upsert_state("app", "AB01", &json!({"STATUS": {"a": 2}}))?;

        assert_eq!((first.version, second.version, third.version), (1, 2, 3));
        assert_ne!(first.checksum, second.checksum);
        assert_eq!(second.checksum, third.checksum);
        assert!(first.changed && second.changed && !third.changed);

        let record = store.load_state("app", "AB01")?.ok_or_else(|| anyhow!("row missing"))?;
        assert_eq!(record.version, 3);
        assert_eq!(record.payload, json!({"STATUS": {"a": 2}}));
        Ok(())
    }

    #[test]
    fn checksum_ignores_key_order() -> Result<()> {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"d": 2, "c": 3}}"#)?;
        let b: Value = serde_json::from_str(r#"{"a": {"c": 3, "d": 2}, "b": 1}"#)?;
        assert_eq!(compute_checksum(&a), compute_checksum(&b));
        assert_eq!(compute_checksum(&a).len(), 64);
        Ok(())
    }

    #[test]
    fn history_is_append_only_across_delete() -> Result<()> {
        let mut store = memory_store()?;
        store.upsert_state("app", "S1", &json!({"v": 1}))?;
        store.upsert_state("app", "S1", &json!({"v": 2}))?;
        assert!(store.delete_state("app", "S1")?);
        assert!(!store.delete_state("app", "S1")?);
        assert!(store.load_state("app", "S1")?.is_none());

        let history = store.history("app", "S1")?;
        let kinds: Vec<ChangeType> = history.iter().map(|row| row.change_type).collect();
        assert_eq!(kinds, vec![ChangeType::Upsert, ChangeType::Upsert, ChangeType::Delete]);
        assert_eq!(history[1].payload, Some(json!({"v": 2})));
        assert!(history[2].payload.is_none());

        store.upsert_state("app", "S1", &json!({"v": 3}))?;
        let record = store.load_state("app", "S1")?.ok_or_else(|| anyhow!("row missing"))?;
        assert_eq!(record.version, 1);
        Ok(())
    }

    #[test]
    fn listing_and_stats_are_scoped_by_app() -> Result<()> {
        let mut store = memory_store()?;
        store.upsert_state("b-app", "S2", &json!({}))?;
        store.upsert_state("a-app", "S1", &json!({}))?;
        store.upsert_state("a-app", "S0", &json!({}))?;

        assert_eq!(store.list_apps()?, vec!["a-app", "b-app"]);
        let serials: Vec<String> = store.list_app_states("a-app")?.into_iter().map(|r| r.serial).collect();
        assert_eq!(serials, vec!["S0", "S1"]);

        let all = store.stats(None)?;
        assert_eq!((all.apps, all.states, all.history), (2, 3, 3));
        let scoped = store.stats(Some("a-app"))?;
        assert_eq!((scoped.apps, scoped.states), (1, 2));
        Ok(())
    }

    #[test]
    fn store_meta_round_trips() -> Result<()> {
        let store = memory_store()?;
        assert!(store.load_store_meta("app", "k")?.is_none());
        store.upsert_store_meta("app", "k", &json!({"x": 1}))?;
        store.upsert_store_meta("app", "k", &json!({"x": 2}))?;
        assert_eq!(store.load_store_meta("app", "k")?, Some(json!({"x": 2})));
        Ok(())
    }

    #[test]
    fn backup_and_restore_round_trip() -> Result<()> {
        let dir = temp_dir("ctx-sqlite-backup")?;
        let mut source = SqliteStateStore::open_migrated(&dir.join("source.sqlite3"))?;
        source.upsert_state("app", "S1", &json!({"v": 1}))?;

        let backup = source.backup_db(&dir.join("snapshot"))?;
        assert_eq!(backup.file_name().and_then(|n| n.to_str()), Some("snapshot.sqlite3"));

        let mut target = memory_store()?;
        target.restore_db(&backup)?;
        let record = target.load_state("app", "S1")?.ok_or_else(|| anyhow!("row missing"))?;
        assert_eq!(record.payload, json!({"v": 1}));

        assert!(target.restore_db(&dir.join("missing.sqlite3")).is_err());
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn backup_retention_keeps_most_recent() -> Result<()> {
        let dir = temp_dir("ctx-sqlite-retention")?;
        let store = SqliteStateStore::open_migrated(&dir.join("store.sqlite3"))?;
        let backups = dir.join("backups");
        let policy = RetentionPolicy { keep_days: 0, max_backups: 2, max_total_bytes: 0 };

        let mut created = Vec::new();
        for _ in 0..7 {
            created.push(store.backup_with_retention(&backups, &policy)?.path);
        }
        let remaining: Vec<PathBuf> = context_store_core::retention::list_backups(&backups, DB_BACKUPS)?
            .into_iter()
            .map(|file| file.path)
            .collect();
        assert_eq!(remaining.as_slice(), &created[created.len() - 2..]);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn migration_snapshots_before_importing() -> Result<()> {
        let dir = temp_dir("ctx-sqlite-migrate")?;
        let store_dir = dir.join("MCUnode").join("context_store");
        fs::create_dir_all(&store_dir)?;
        fs::write(store_dir.join(STATE_FILE), r#"{"AB01": {"STATUS": {"a": 1}}, "CD02": {"SETUP": {}}}"#)?;
        fs::write(store_dir.join(META_FILE), r#"{"app": "MCUnode"}"#)?;

        let mut store = SqliteStateStore::open_migrated(&dir.join("context_store.sqlite3"))?;
        let report = store.migrate_from_state_json("MCUnode", &store_dir)?;
        assert_eq!(report.imported, 2);
        assert!(report.meta_imported);
        assert_eq!(report.snapshots.len(), 3);
        assert!(report.snapshots.iter().all(|path| path.exists()));

        let history = store.history("MCUnode", "AB01")?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].change_type, ChangeType::Migrate);
        assert_eq!(history[0].actor, MIGRATION_ACTOR);
        assert_eq!(store.load_store_meta("MCUnode", META_JSON_KEY)?, Some(json!({"app": "MCUnode"})));

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn health_check_reports_wal_and_tables() -> Result<()> {
        let dir = temp_dir("ctx-sqlite-health")?;
        let store = SqliteStateStore::open_migrated(&dir.join("store.sqlite3"))?;
        let health = store.health_check()?;
        assert_eq!(health.journal_mode, "wal");
        assert!(health.quick_check_ok);
        for table in ["context_history", "schema_migrations", "states", "states_meta", "store_meta"] {
            assert!(health.tables.iter().any(|name| name == table), "missing {table}");
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
