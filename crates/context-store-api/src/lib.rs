use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use context_store_core::config::{StoreConfig, BACKUP_DIR, DB_FILE};
use context_store_core::persist::{AppFailure, BackupSweep, PersistReport, PersistenceManager, SaveOutcome};
use context_store_core::{ContextError, ContextRegistry, EntryMirror, MergeOptions, SharedTarget};
use context_store_sqlite::{
    DbBackup, HealthReport, HistoryRecord, MigrationReport, SqliteStateStore, StateRecord, StoreStats,
    UpsertOutcome,
};
use serde::Serialize;
use serde_json::Value;

pub mod restore;
pub mod scheduler;

pub use restore::{AppRestore, AppVerification, RestoreSource, RestoreSummary, VerifyReport};
pub use scheduler::{Scheduler, SchedulerState, SchedulerStats, TaskRecord, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AutosaveReport {
    pub persisted: Vec<PersistReport>,
    pub mirrored: usize,
    pub failed: Vec<AppFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackupReport {
    pub states: BackupSweep,
    pub db: Option<DbBackup>,
}

/// Copies `state.json` entries into the sqlite store while the file lock is held.
#[derive(Debug)]
struct DurableMirror {
    db_path: PathBuf,
}

impl DurableMirror {
    fn open(&self) -> context_store_core::Result<SqliteStateStore> {
        SqliteStateStore::open_migrated(&self.db_path).map_err(mirror_error)
    }
}

impl EntryMirror for DurableMirror {
    fn entry_written(&self, app: &str, key: &str, entry: &Value) -> context_store_core::Result<()> {
        self.open()?.upsert_state(app, key, entry).map_err(mirror_error)?;
        Ok(())
    }

    fn entry_removed(&self, app: &str, key: &str) -> context_store_core::Result<bool> {
        if !self.db_path.is_file() {
            return Ok(false);
        }
        self.open()?.delete_state(app, key).map_err(mirror_error)
    }
}

fn mirror_error(err: anyhow::Error) -> ContextError {
    ContextError::Mirror(format!("{err:#}"))
}

/// Top-level application object: owns configuration, the in-memory registry,
/// the file persistence manager and the location of the durable store.
#[derive(Debug)]
pub struct ContextStore {
    config: StoreConfig,
    registry: Arc<ContextRegistry>,
    persistence: PersistenceManager,
    db_path: PathBuf,
}

impl ContextStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, config: StoreConfig) -> Self {
        let root = root.into();
        let db_path = config.db_path.clone().unwrap_or_else(|| root.join(DB_FILE));
        let registry = Arc::new(ContextRegistry::new());
        let mirror = Arc::new(DurableMirror { db_path: db_path.clone() });
        let persistence = PersistenceManager::new(root, config.clone())
            .with_registry(Arc::clone(&registry))
            .with_mirror(mirror);
        Self { config, registry, persistence, db_path }
    }

    #[must_use]
    pub fn from_env(root: impl Into<PathBuf>) -> Self {
        Self::new(root, StoreConfig::from_env())
    }

    #[must_use]
    pub fn with_merge_options(mut self, merge: MergeOptions) -> Self {
        self.persistence = self.persistence.with_merge_options(merge);
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.persistence.root()
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn persistence(&self) -> &PersistenceManager {
        &self.persistence
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open the durable store, migrating it to the latest schema.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open_durable(&self) -> Result<SqliteStateStore> {
        SqliteStateStore::open_migrated(&self.db_path)
    }

    /// # Errors
    /// Returns an error when the project root cannot be listed.
    pub fn apps(&self) -> Result<Vec<String>> {
        self.persistence.discover_apps().context("failed to discover apps")
    }

    /// The registry entry for `app`, created empty on first use.
    ///
    /// # Errors
    /// Returns an error only if the registry refuses to create the entry.
    pub fn get_or_create_registry_entry(&self, app: &str) -> Result<SharedTarget> {
        self.registry
            .get_or_create_registry_entry(app, true)
            .with_context(|| format!("registry has no entry for {app}"))
    }

    /// Merge `value` at `STATUS.<path>`; the entry reaches the durable store under the same lock.
    ///
    /// # Errors
    /// Returns an error when either write fails.
    pub fn save_status_path<S: AsRef<str>>(
        &self,
        app: &str,
        serial: &str,
        path: &[S],
        value: Value,
        command: Option<&str>,
    ) -> Result<SaveOutcome> {
        self.persistence
            .save_status_path(app, serial, path, value, command)
            .with_context(|| format!("failed to save status for {app}/{serial}"))
    }

    /// Merge `value` under `block_name`; the entry reaches the durable store under the same lock.
    ///
    /// # Errors
    /// Returns an error when either write fails.
    pub fn save_block_top_level(
        &self,
        app: &str,
        serial: &str,
        block_name: &str,
        value: Value,
        command: Option<&str>,
    ) -> Result<SaveOutcome> {
        self.persistence
            .save_block_top_level(app, serial, block_name, value, command)
            .with_context(|| format!("failed to save block {block_name} for {app}/{serial}"))
    }

    /// # Errors
    /// Returns an error when the durable store cannot be opened or written.
    pub fn upsert_state(&self, app: &str, serial: &str, payload: &Value) -> Result<UpsertOutcome> {
        let mut store = self.open_durable()?;
        store.upsert_state(app, serial, payload)
    }

    /// Merge every registered app's in-memory state onto disk and mirror the
    /// written entries into the durable store. Per-app failures are reported.
    #[must_use]
    pub fn autosave_all(&self) -> AutosaveReport {
        let mut report = AutosaveReport::default();
        for app in self.registry.app_names() {
            match self.persistence.persist_registry_state(&app) {
                Ok(persisted) => {
                    report.mirrored += persisted.mirrored;
                    report.persisted.push(persisted);
                }
                Err(err) => {
                    tracing::error!(app = %app, error = %err, "autosave failed");
                    report.failed.push(AppFailure { app, error: err.to_string() });
                }
            }
        }
        report
    }

    /// Back up every app's `state.json` and, when present, the durable store.
    ///
    /// # Errors
    /// Returns an error when the project root cannot be listed or the database backup fails.
    pub fn backup_all(&self) -> Result<BackupReport> {
        let states = self
            .persistence
            .backup_all_states(&self.config.retention)
            .context("failed to back up app states")?;
        let db = if self.db_path.is_file() { Some(self.backup_db()?) } else { None };
        Ok(BackupReport { states, db })
    }

    /// Snapshot the durable store into `<db dir>/backups/` and apply retention.
    ///
    /// # Errors
    /// Returns an error when the backup fails.
    pub fn backup_db(&self) -> Result<DbBackup> {
        let dir = self.db_path.parent().map_or_else(|| PathBuf::from(BACKUP_DIR), |p| p.join(BACKUP_DIR));
        self.open_durable()?.backup_with_retention(&dir, &self.config.retention)
    }

    /// # Errors
    /// Returns an error when the backup fails.
    pub fn backup_db_to(&self, dest: &Path) -> Result<PathBuf> {
        self.open_durable()?.backup_db(dest)
    }

    /// Import `app`'s `state.json` into the durable store.
    ///
    /// # Errors
    /// Returns an error when the import fails.
    pub fn migrate_json(&self, app: &str) -> Result<MigrationReport> {
        let layout = self.persistence.ensure_context_store(app)?;
        let mut store = self.open_durable()?;
        store.migrate_from_state_json(app, layout.store_dir())
    }

    /// # Errors
    /// Returns an error when the durable store cannot be read.
    pub fn db_states(&self, app: &str, serial: Option<&str>) -> Result<Vec<StateRecord>> {
        let store = self.open_durable()?;
        match serial {
            Some(serial) => Ok(store.load_state(app, serial)?.into_iter().collect()),
            None => store.list_app_states(app),
        }
    }

    /// # Errors
    /// Returns an error when the durable store cannot be read.
    pub fn db_history(&self, app: &str, serial: &str) -> Result<Vec<HistoryRecord>> {
        self.open_durable()?.history(app, serial)
    }

    /// # Errors
    /// Returns an error when the durable store cannot be read.
    pub fn db_stats(&self, app: Option<&str>) -> Result<StoreStats> {
        self.open_durable()?.stats(app)
    }

    /// # Errors
    /// Returns an error when a health probe fails.
    pub fn db_health(&self) -> Result<HealthReport> {
        self.open_durable()?.health_check()
    }

    /// Check durable rows against the registry for `apps` (every discovered
    /// app when `None`), restoring where they disagree unless `dry_run`.
    ///
    /// # Errors
    /// Returns an error only when the project root cannot be listed.
    pub fn verify_restore(&self, apps: Option<&[String]>, dry_run: bool) -> Result<VerifyReport> {
        let selected: Vec<String> = self
            .apps()?
            .into_iter()
            .filter(|app| match apps {
                Some(wanted) => wanted.contains(app),
                None => true,
            })
            .collect();
        Ok(restore::verify_restore(self, &selected, dry_run))
    }

    /// Run the startup restore cascade for every discovered app.
    ///
    /// # Errors
    /// Returns an error only when the project root cannot be listed.
    pub fn restore_all(&self) -> Result<RestoreSummary> {
        let apps = self.apps()?;
        Ok(restore::restore_apps(self, &apps))
    }
}
