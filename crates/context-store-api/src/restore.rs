//! Startup restore cascade: durable store, then per-block files, then the
//! aggregated `state.json`, then an empty context. Nothing here propagates an
//! error; every failed source is logged and the next one is tried.

use std::collections::BTreeMap;

use anyhow::Result;
use context_store_core::block::normalize_for_restore;
use context_store_core::state::MEMORY_BLOCK;
use context_store_core::{ContextError, RegisterBlock};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::ContextStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    Durable,
    BlockFiles,
    StateFile,
    Empty,
}

impl RestoreSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::BlockFiles => "block_files",
            Self::StateFile => "state_file",
            Self::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppRestore {
    pub app: String,
    pub source: RestoreSource,
    pub blocks: usize,
    pub entries: usize,
    /// Sources that failed before the winning one, as `source: error`.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub apps: Vec<AppRestore>,
}

impl RestoreSummary {
    #[must_use]
    pub fn source_of(&self, app: &str) -> Option<RestoreSource> {
        self.apps.iter().find(|restore| restore.app == app).map(|restore| restore.source)
    }
}

/// Durable-store entries against registry entries for one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppVerification {
    pub app: String,
    /// `None` when the durable store could not be read.
    pub durable_entries: Option<usize>,
    pub registry_entries: usize,
    /// Source used when a restore was performed.
    pub restored: Option<RestoreSource>,
    pub issue: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    pub issues: usize,
    pub apps: Vec<AppVerification>,
}

#[derive(Debug, Default)]
struct Restored {
    blocks: BTreeMap<String, RegisterBlock>,
    state: Map<String, Value>,
    memory_key: Option<String>,
}

impl Restored {
    fn from_state(state: Map<String, Value>) -> Self {
        let (blocks, memory_key) = extract_memory(&state);
        Self { blocks, state, memory_key }
    }

    fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.state.is_empty()
    }
}

pub(crate) fn restore_apps(store: &ContextStore, apps: &[String]) -> RestoreSummary {
    RestoreSummary { apps: apps.iter().map(|app| restore_app(store, app)).collect() }
}

/// Restore one app into the registry and report which source won.
#[must_use]
pub fn restore_app(store: &ContextStore, app: &str) -> AppRestore {
    let mut errors = Vec::new();
    let mut winner = (RestoreSource::Empty, Restored::default());
    for source in [RestoreSource::Durable, RestoreSource::BlockFiles, RestoreSource::StateFile] {
        let loaded = match source {
            RestoreSource::Durable => from_durable(store, app),
            RestoreSource::BlockFiles => Ok(from_block_files(store, app)),
            RestoreSource::StateFile => Ok(from_state_file(store, app)),
            RestoreSource::Empty => Ok(None),
        };
        match loaded {
            Ok(Some(restored)) if !restored.is_empty() => {
                winner = (source, restored);
                break;
            }
            Ok(_) => tracing::debug!(app, source = source.as_str(), "restore source empty"),
            Err(err) => {
                let err = ContextError::Restore(format!("{err:#}"));
                tracing::warn!(app, source = source.as_str(), error = %err, "restore source failed; trying next");
                errors.push(format!("{}: {err}", source.as_str()));
            }
        }
    }

    let (source, restored) = winner;
    let report = AppRestore {
        app: app.to_string(),
        source,
        blocks: restored.blocks.len(),
        entries: restored.state.len(),
        errors,
    };
    install(store, app, restored);
    tracing::info!(app, source = source.as_str(), blocks = report.blocks, entries = report.entries, "restored app context");
    report
}

/// Compare each app's durable rows with its registry state. Unless `dry_run`,
/// apps with an empty or disagreeing registry are restored first.
#[must_use]
pub fn verify_restore(store: &ContextStore, apps: &[String], dry_run: bool) -> VerifyReport {
    let verified: Vec<AppVerification> = apps.iter().map(|app| verify_app(store, app, dry_run)).collect();
    let issues = verified.iter().filter(|app| app.issue.is_some()).count();
    if issues > 0 {
        tracing::warn!(issues, dry_run, "restore verification found discrepancies");
    }
    VerifyReport { checked: verified.len(), issues, apps: verified }
}

fn verify_app(store: &ContextStore, app: &str, dry_run: bool) -> AppVerification {
    let durable_entries = durable_count(store, app);
    let disagrees = |registry: usize| matches!(durable_entries, Some(durable) if durable > 0 && durable != registry);
    let mut registry_entries = registry_count(store, app);
    let mut restored = None;
    let mut issue = None;

    if !dry_run && (registry_entries == 0 || disagrees(registry_entries)) {
        let report = restore_app(store, app);
        registry_entries = registry_count(store, app);
        if report.source == RestoreSource::Empty && !report.errors.is_empty() {
            issue = Some(format!("restore failed: {}", report.errors.join("; ")));
        }
        restored = Some(report.source);
    }
    if issue.is_none() && disagrees(registry_entries) {
        issue = durable_entries
            .map(|durable| format!("durable store has {durable} entries, registry has {registry_entries}"));
    }
    tracing::info!(app, ?durable_entries, registry_entries, restored = restored.map(RestoreSource::as_str), "verified restore");
    AppVerification { app: app.to_string(), durable_entries, registry_entries, restored, issue }
}

fn durable_count(store: &ContextStore, app: &str) -> Option<usize> {
    if !store.db_path().is_file() {
        return Some(0);
    }
    match store.open_durable().and_then(|durable| durable.list_app_states(app)) {
        Ok(rows) => Some(rows.len()),
        Err(err) => {
            tracing::warn!(app, error = %format!("{err:#}"), "durable store unreadable during verification");
            None
        }
    }
}

fn registry_count(store: &ContextStore, app: &str) -> usize {
    store.registry().snapshot_state(app).unwrap_or_default().len()
}

fn install(store: &ContextStore, app: &str, restored: Restored) {
    let Some(target) = store.registry().get_or_create_registry_entry(app, true) else {
        tracing::error!(app, "registry refused restored context");
        return;
    };
    let mut context = target.lock();
    for (name, block) in restored.blocks {
        if !context.set_block(&name, block) {
            tracing::warn!(app, block = %name, "context rejected restored block");
        }
    }
    for (key, value) in restored.state {
        context.set_state(&key, value);
    }
    if let Some(key) = restored.memory_key {
        context.bind_memory_key(&key);
    }
}

fn from_durable(store: &ContextStore, app: &str) -> Result<Option<Restored>> {
    if !store.db_path().is_file() {
        return Ok(None);
    }
    let rows = store.open_durable()?.list_app_states(app)?;
    if rows.is_empty() {
        return Ok(None);
    }
    let state: Map<String, Value> = rows.into_iter().map(|row| (row.serial, row.payload)).collect();
    Ok(Some(Restored::from_state(state)))
}

fn from_block_files(store: &ContextStore, app: &str) -> Option<Restored> {
    let blocks = store.persistence().load_json_blocks(app);
    (!blocks.is_empty()).then(|| Restored { blocks, ..Restored::default() })
}

fn from_state_file(store: &ContextStore, app: &str) -> Option<Restored> {
    let state = store.persistence().load_state(app);
    (!state.is_empty()).then(|| Restored::from_state(state))
}

/// Blocks stored under each entry's `MEMORY`, plus the first key that carried them.
fn extract_memory(state: &Map<String, Value>) -> (BTreeMap<String, RegisterBlock>, Option<String>) {
    let mut blocks = BTreeMap::new();
    let mut memory_key = None;
    for (key, entry) in state {
        let Some(memory) = entry.get(MEMORY_BLOCK).and_then(Value::as_object) else {
            continue;
        };
        memory_key.get_or_insert_with(|| key.clone());
        for (name, payload) in memory {
            match RegisterBlock::from_json(&normalize_for_restore(payload.clone())) {
                Ok(block) => {
                    blocks.insert(name.clone(), block);
                }
                Err(err) => tracing::warn!(key = %key, block = %name, error = %err, "skipping malformed memory block"),
            }
        }
    }
    (blocks, memory_key)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::anyhow;
    use context_store_core::{ProtocolLayout, StoreConfig};
    use serde_json::json;
    use ulid::Ulid;

    use super::*;

    fn store(prefix: &str) -> ContextStore {
        let root = std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()));
        ContextStore::new(root, StoreConfig::default())
    }

    fn fresh(store: &ContextStore) -> ContextStore {
        ContextStore::new(store.root().to_path_buf(), store.config().clone())
    }

    #[test]
    fn durable_rows_win_when_present() -> Result<()> {
        let store = store("ctx-restore-db");
        store.save_status_path("app", "S1", &["a"], json!(1), None)?;

        let restarted = fresh(&store);
        let report = restore_app(&restarted, "app");
        assert_eq!(report.source, RestoreSource::Durable);
        assert_eq!(report.entries, 1);

        let target = restarted.registry().get("app").ok_or_else(|| anyhow!("not registered"))?;
        assert_eq!(target.lock().get_state("S1").map(|entry| entry["STATUS"]["a"].clone()), Some(json!(1)));

        fs::remove_dir_all(store.root())?;
        Ok(())
    }

    #[test]
    fn block_files_are_used_without_durable_rows() -> Result<()> {
        let store = store("ctx-restore-blocks");
        store.persistence().save_json_block("app", "MODBUS", &RegisterBlock::sequential(0, 4, json!(0)))?;

        let report = restore_app(&fresh(&store), "app");
        assert_eq!(report.source, RestoreSource::BlockFiles);
        assert_eq!(report.blocks, 1);

        fs::remove_dir_all(store.root())?;
        Ok(())
    }

    #[test]
    fn state_file_memory_maps_become_blocks() -> Result<()> {
        let store = store("ctx-restore-state");
        store.persistence().create_or_update_slave_context(
            "LSISsocket",
            "10.0.0.5",
            2004,
            &ProtocolLayout::ls_xgt_tcp(4, true),
            true,
        )?;

        let restarted = fresh(&store);
        let report = restore_app(&restarted, "LSISsocket");
        assert_eq!(report.source, RestoreSource::StateFile);
        assert_eq!(report.blocks, 3);

        let target = restarted.registry().get("LSISsocket").ok_or_else(|| anyhow!("not registered"))?;
        let persisted = target.lock().persisted_state();
        assert!(persisted["10.0.0.5:2004"]["MEMORY"]["%RB"].is_object());

        fs::remove_dir_all(store.root())?;
        Ok(())
    }

    #[test]
    fn verification_restores_empty_registries() -> Result<()> {
        let store = store("ctx-restore-verify");
        store.save_status_path("app", "S1", &["a"], json!(1), None)?;
        store.save_status_path("app", "S2", &["a"], json!(2), None)?;
        let apps = vec!["app".to_string()];

        let restarted = fresh(&store);
        let dry = verify_restore(&restarted, &apps, true);
        assert_eq!(dry.issues, 1);
        assert_eq!(dry.apps[0].durable_entries, Some(2));
        assert_eq!(dry.apps[0].registry_entries, 0);
        assert_eq!(dry.apps[0].restored, None);

        let report = verify_restore(&restarted, &apps, false);
        assert_eq!(report.issues, 0);
        assert_eq!(report.apps[0].registry_entries, 2);
        assert_eq!(report.apps[0].restored, Some(RestoreSource::Durable));

        let again = verify_restore(&restarted, &apps, false);
        assert_eq!(again.apps[0].restored, None);

        fs::remove_dir_all(store.root())?;
        Ok(())
    }

    #[test]
    fn corrupt_sources_fall_through_to_empty() -> Result<()> {
        let store = store("ctx-restore-empty");
        let layout = store.persistence().ensure_context_store("app")?;
        fs::write(layout.state_path(), b"{ not json")?;
        fs::write(store.db_path(), b"not a database")?;

        let report = restore_app(&fresh(&store), "app");
        assert_eq!(report.source, RestoreSource::Empty);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("durable"));

        fs::remove_dir_all(store.root())?;
        Ok(())
    }
}
