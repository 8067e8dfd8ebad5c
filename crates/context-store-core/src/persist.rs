//! Per-application state files and the read-merge-write cycle around them.
//!
//! Every write goes through [`PersistenceManager::update_entry`]: take the app
//! lock and the cross-process lock on `state.json`, load the current file, let
//! the caller mutate one entry, strip `processed_data`, stamp `Meta`, and write
//! the whole map back atomically. The registry and any [`EntryMirror`] see the
//! written entry before either lock is released, so they observe writes in
//! file order.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::atomic::{read_json, read_state_map, write_json_atomic};
use crate::block::{normalize_for_restore, RegisterBlock};
use crate::config::{RetentionPolicy, StoreConfig, STATE_FILE};
use crate::context::ProtocolLayout;
use crate::error::{ContextError, Result};
use crate::layout::{discover_apps, is_reserved_file, AppLayout, META_SIDECAR_SUFFIX};
use crate::lock::LockManager;
use crate::merge::{canonical_string, deep_merge, find_matching_key, ListMerge, MergeOptions};
use crate::registry::{ContextRegistry, SharedTarget};
use crate::retention::{apply_retention, unique_backup_path, BackupSeries, RetentionReport};
use crate::state::{
    build_nested, entry_changed, file_stamp, rfc3339, stamp_meta, strip_processed_data, utc_seconds, Serial,
    MEMORY_BLOCK, META_BLOCK, PROCESSED_DATA_KEY, SETUP_BLOCK, STATUS_BLOCK,
};

pub const STATE_BACKUPS: BackupSeries<'static> = BackupSeries { prefix: "state-", extension: "json" };

/// Result of one entry write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveOutcome {
    /// Whether the entry's data changed; `Meta` timestamps are not considered.
    pub changed: bool,
    pub path: PathBuf,
    pub entry: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistReport {
    pub app: String,
    pub entries: usize,
    pub changed: bool,
    /// Entries handed to the mirror; zero when nothing changed or no mirror is set.
    pub mirrored: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    /// Whether `state.json` held the entry.
    pub removed: bool,
    /// Whether the mirror held a copy of it.
    pub mirror_removed: bool,
}

/// How sidecars for the same file combine when merged into `meta.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaMergeStrategy {
    /// The most recently modified sidecar replaces the recorded metadata.
    #[default]
    Latest,
    /// Top-level keys are overlaid onto the recorded metadata.
    Merge,
}

impl MetaMergeStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Merge => "merge",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "latest" => Some(Self::Latest),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetaGeneration {
    Created { path: PathBuf },
    NoState,
    AlreadyExists,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedMeta {
    pub app: String,
    #[serde(flatten)]
    pub outcome: MetaGeneration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetaMigration {
    pub app: String,
    pub migrated: bool,
    /// Sidecar file names merged into `meta.json`.
    pub sources: Vec<String>,
    pub meta_path: Option<PathBuf>,
    pub backed_up: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Secondary copy of `state.json` entries, updated while the file lock is held.
pub trait EntryMirror: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// Returns [`ContextError::Mirror`] when the copy cannot be written.
    fn entry_written(&self, app: &str, key: &str, entry: &Value) -> Result<()>;

    /// # Errors
    /// Returns [`ContextError::Mirror`] when the copy cannot be removed.
    fn entry_removed(&self, app: &str, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupOutcome {
    pub app: String,
    pub path: PathBuf,
    pub retention: RetentionReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppFailure {
    pub app: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackupSweep {
    pub completed: Vec<BackupOutcome>,
    pub skipped: Vec<String>,
    pub failed: Vec<AppFailure>,
}

#[derive(Debug)]
pub struct PersistenceManager {
    root: PathBuf,
    config: StoreConfig,
    locks: LockManager,
    registry: Arc<ContextRegistry>,
    mirror: Option<Arc<dyn EntryMirror>>,
    merge: MergeOptions,
}

impl PersistenceManager {
    /// Manager for every application directory under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, config: StoreConfig) -> Self {
        let root = root.into();
        let lock_dir = if root.is_dir() { root.clone() } else { std::env::temp_dir() };
        let locks = LockManager::new(config.lock.clone(), &lock_dir);
        Self {
            root,
            config,
            locks,
            registry: Arc::new(ContextRegistry::new()),
            mirror: None,
            merge: MergeOptions::default(),
        }
    }

    /// Share `registry` so writes are mirrored into the in-memory contexts.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ContextRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Copy every written or removed entry into `mirror` under the file lock.
    #[must_use]
    pub fn with_mirror(mut self, mirror: Arc<dyn EntryMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    #[must_use]
    pub fn with_merge_options(mut self, merge: MergeOptions) -> Self {
        self.merge = merge;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
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
    pub fn merge_options(&self) -> MergeOptions {
        self.merge
    }

    #[must_use]
    pub fn lock_backend(&self) -> &'static str {
        self.locks.backend_name()
    }

    #[must_use]
    pub fn layout(&self, app: &str) -> AppLayout {
        AppLayout::new(&self.root, app)
    }

    /// # Errors
    /// Returns an error when the project root cannot be listed.
    pub fn discover_apps(&self) -> Result<Vec<String>> {
        discover_apps(&self.root)
    }

    /// # Errors
    /// Returns an error when the directories cannot be created.
    pub fn ensure_context_store(&self, app: &str) -> Result<AppLayout> {
        let layout = self.layout(app);
        layout.ensure()?;
        Ok(layout)
    }

    /// Current `state.json` for `app`; empty when missing or unreadable.
    #[must_use]
    pub fn load_state(&self, app: &str) -> Map<String, Value> {
        read_state_map(&self.layout(app).state_path())
    }

    #[must_use]
    pub fn load_entry(&self, app: &str, serial: &str) -> Option<Value> {
        self.load_state(app).remove(Serial::parse(serial).as_str())
    }

    /// Run `apply` against the entry stored under `key`, inside one lock
    /// acquisition, and write the result back.
    ///
    /// With `verify`, the file is read back under the same lock and rewritten
    /// once when the stored entry does not match.
    ///
    /// # Errors
    /// Propagates lock timeouts, write failures and errors returned by `apply`.
    pub fn update_entry<F>(&self, app: &str, key: &str, command: Option<&str>, verify: bool, apply: F) -> Result<SaveOutcome>
    where
        F: FnOnce(&mut Map<String, Value>) -> Result<()>,
    {
        let layout = self.ensure_context_store(app)?;
        let path = layout.state_path();
        let (changed, entry) = self.locks.with_lock(app, &path, || {
            let mut state = read_state_map(&path);
            let before = state.get(key).cloned();
            let mut entry = match &before {
                Some(Value::Object(existing)) => existing.clone(),
                _ => Map::new(),
            };
            apply(&mut entry)?;

            let mut entry = Value::Object(entry);
            strip_processed_data(&mut entry);
            let changed = entry_changed(before.as_ref(), &entry);
            if let Value::Object(map) = &mut entry {
                stamp_meta(map, command, OffsetDateTime::now_utc())?;
            }
            state.insert(key.to_string(), entry.clone());
            let state = Value::Object(state);
            write_json_atomic(&path, &state)?;

            if verify {
                let stored = read_state_map(&path).remove(key);
                if stored.as_ref().map(canonical_string) != Some(canonical_string(&entry)) {
                    tracing::warn!(app, key, "written entry did not read back; rewriting");
                    write_json_atomic(&path, &state)?;
                }
            }

            if self.registry.sync_entry(app, key, &entry) {
                tracing::debug!(app, key, "synced entry into registry");
            }
            if let Some(mirror) = &self.mirror {
                mirror.entry_written(app, key, &entry)?;
            }
            Ok((changed, entry))
        })?;

        tracing::debug!(app, key, changed, "saved state entry");
        Ok(SaveOutcome { changed, path, entry })
    }

    /// Merge `value` at `STATUS.<path>` for `serial`.
    ///
    /// # Errors
    /// Propagates lock and write failures.
    pub fn save_status_path<S: AsRef<str>>(
        &self,
        app: &str,
        serial: &str,
        path: &[S],
        value: Value,
        command: Option<&str>,
    ) -> Result<SaveOutcome> {
        let mut full: Vec<&str> = vec![STATUS_BLOCK];
        full.extend(path.iter().map(AsRef::as_ref));
        let fragment = build_nested(&full, value);
        let options = self.merge;
        self.update_entry(app, Serial::parse(serial).as_str(), command, false, |entry| {
            merge_into(entry, &fragment, &options);
            Ok(())
        })
    }

    /// Merge `value` under the top-level `block_name` of `serial`'s entry, then
    /// verify it reads back.
    ///
    /// # Errors
    /// Propagates lock and write failures.
    pub fn save_block_top_level(
        &self,
        app: &str,
        serial: &str,
        block_name: &str,
        value: Value,
        command: Option<&str>,
    ) -> Result<SaveOutcome> {
        let fragment = build_nested(&[block_name], value);
        let options = self.merge;
        self.update_entry(app, Serial::parse(serial).as_str(), command, true, |entry| {
            merge_into(entry, &fragment, &options);
            Ok(())
        })
    }

    /// # Errors
    /// Propagates lock and write failures.
    pub fn save_setup(&self, app: &str, serial: &str, setup: Value, command: Option<&str>) -> Result<SaveOutcome> {
        self.save_block_top_level(app, serial, SETUP_BLOCK, setup, command)
    }

    /// Pull the STATUS tree out of a processed device payload and merge it.
    ///
    /// # Errors
    /// Propagates lock and write failures.
    pub fn save_status_with_meta(&self, app: &str, serial: &str, command: &str, processed: &Value) -> Result<SaveOutcome> {
        let mut status = locate_status(processed).clone();
        strip_processed_data(&mut status);
        self.save_block_top_level(app, serial, STATUS_BLOCK, status, Some(command))
    }

    /// Write `STATUS.<mid>.<sub> = kv`. An existing `sub` is left alone unless
    /// `overwrite_if_exists` is set. Both keys match spelling variants.
    ///
    /// # Errors
    /// Propagates lock and write failures.
    #[allow(clippy::too_many_arguments)]
    pub fn save_status_nested(
        &self,
        app: &str,
        serial: &str,
        mid: &str,
        sub: &str,
        kv: Value,
        overwrite_if_exists: bool,
        command: Option<&str>,
    ) -> Result<SaveOutcome> {
        self.update_entry(app, Serial::parse(serial).as_str(), command, false, |entry| {
            with_object_slot(entry, STATUS_BLOCK, |status| {
                let mid_key = find_matching_key(status, mid).unwrap_or_else(|| mid.to_string());
                with_object_slot(status, &mid_key, |mid_map| match find_matching_key(mid_map, sub) {
                    Some(existing) if !overwrite_if_exists => {
                        tracing::debug!(app, mid = %mid_key, sub = %existing, "keeping existing status value");
                    }
                    Some(existing) => {
                        mid_map.insert(existing, kv);
                    }
                    None => {
                        mid_map.insert(sub.to_string(), kv);
                    }
                });
            });
            Ok(())
        })
    }

    /// Merge each command's unwrapped `processed_data` into `entry[command]`.
    ///
    /// `block` maps command names to payloads; `commands` restricts which are taken.
    ///
    /// # Errors
    /// Propagates lock and write failures.
    pub fn upsert_processed_block(
        &self,
        app: &str,
        serial: &str,
        block: &Value,
        list_merge: ListMerge,
        commands: Option<&[&str]>,
    ) -> Result<SaveOutcome> {
        let options = self.merge.with_lists(list_merge);
        let selected: Vec<(String, Value)> = block
            .as_object()
            .into_iter()
            .flatten()
            .filter(|(command, _)| match commands {
                Some(wanted) => wanted.contains(&command.as_str()),
                None => true,
            })
            .filter_map(|(command, payload)| {
                payload.get(PROCESSED_DATA_KEY).map(|data| (command.clone(), data.clone()))
            })
            .collect();
        if selected.is_empty() {
            tracing::debug!(app, serial, "no processed_data found in block");
        }

        self.update_entry(app, Serial::parse(serial).as_str(), None, false, |entry| {
            let now = OffsetDateTime::now_utc();
            for (command, data) in &selected {
                let fragment = build_nested(&[command.as_str()], data.clone());
                merge_into(entry, &fragment, &options);
                stamp_meta(entry, Some(command.as_str()), now)?;
            }
            Ok(())
        })
    }

    /// Remove `serial`'s entry from `state.json`, the registry and the mirror.
    ///
    /// # Errors
    /// Propagates lock, write and mirror failures.
    pub fn delete_entry(&self, app: &str, serial: &str) -> Result<DeleteOutcome> {
        let path = self.layout(app).state_path();
        let key = Serial::parse(serial);
        if !path.exists() {
            let mirror_removed = self.remove_mirrored(app, key.as_str())?;
            return Ok(DeleteOutcome { removed: false, mirror_removed });
        }
        let outcome = self.locks.with_lock(app, &path, || {
            let mut state = read_state_map(&path);
            let removed = state.remove(key.as_str()).is_some();
            if removed {
                write_json_atomic(&path, &Value::Object(state))?;
                if let Some(target) = self.registry.get(app) {
                    target.lock().clear_state(Some(key.as_str()));
                }
            }
            let mirror_removed = self.remove_mirrored(app, key.as_str())?;
            Ok(DeleteOutcome { removed, mirror_removed })
        })?;
        if outcome.removed {
            tracing::info!(app, serial = %key, "deleted state entry");
        }
        Ok(outcome)
    }

    fn remove_mirrored(&self, app: &str, key: &str) -> Result<bool> {
        match &self.mirror {
            Some(mirror) => mirror.entry_removed(app, key),
            None => Ok(false),
        }
    }

    /// Merge the in-memory state of `app` onto `state.json`. An empty
    /// in-memory state never touches the file.
    ///
    /// # Errors
    /// Propagates lock and write failures.
    pub fn persist_registry_state(&self, app: &str) -> Result<PersistReport> {
        let snapshot = self.registry.snapshot_state(app).unwrap_or_default();
        if snapshot.is_empty() {
            tracing::debug!(app, "no in-memory state to persist");
            return Ok(PersistReport { app: app.to_string(), entries: 0, changed: false, mirrored: 0 });
        }
        let mut incoming = Value::Object(snapshot);
        strip_processed_data(&mut incoming);
        let entries = incoming.as_object().map_or(0, Map::len);

        let layout = self.ensure_context_store(app)?;
        let path = layout.state_path();
        let options = self.merge;
        let (changed, mirrored) = self.locks.with_lock(app, &path, || {
            let mut state = Value::Object(read_state_map(&path));
            if !deep_merge(&mut state, &incoming, &options) {
                return Ok((false, 0));
            }
            write_json_atomic(&path, &state)?;

            let mut mirrored = 0;
            if let (Some(mirror), Some(incoming)) = (&self.mirror, incoming.as_object()) {
                for key in incoming.keys() {
                    if let Some(entry) = state.get(key) {
                        mirror.entry_written(app, key, entry)?;
                        mirrored += 1;
                    }
                }
            }
            Ok((true, mirrored))
        })?;
        tracing::debug!(app, entries, changed, mirrored, "persisted registry state");
        Ok(PersistReport { app: app.to_string(), entries, changed, mirrored })
    }

    /// Install `layout`'s blocks into `app`'s context and, with `persist`,
    /// record them under the `"<host>:<port>"` entry's `MEMORY`.
    ///
    /// # Errors
    /// Propagates lock and write failures when persisting.
    pub fn create_or_update_slave_context(
        &self,
        app: &str,
        host: &str,
        port: u16,
        layout: &ProtocolLayout,
        persist: bool,
    ) -> Result<SharedTarget> {
        let key = format!("{host}:{port}");
        let blocks = layout.build_blocks();
        let memory: Map<String, Value> =
            blocks.iter().map(|(name, block)| (name.clone(), block.to_json_for(name))).collect();

        let Some(target) = self.registry.get_or_create_registry_entry(app, true) else {
            return Err(ContextError::Validation(format!("registry refused entry for {app}")));
        };
        {
            let mut context = target.lock();
            for (name, block) in blocks {
                context.set_block(&name, block);
            }
            context.bind_memory_key(&key);
        }
        tracing::info!(app, key = %key, layout = layout.as_str(), persist, "slave context prepared");

        if persist {
            self.update_entry(app, &key, None, false, |entry| {
                entry.insert(MEMORY_BLOCK.to_string(), Value::Object(memory));
                let created = utc_seconds(OffsetDateTime::now_utc())?;
                with_object_slot(entry, META_BLOCK, |meta| {
                    meta.entry("created").or_insert(Value::String(created));
                });
                Ok(())
            })?;
        }
        Ok(target)
    }

    /// Write `context_store/<name>.json` and refresh `meta.json`.
    ///
    /// # Errors
    /// Propagates lock and write failures.
    pub fn save_json_block(&self, app: &str, name: &str, block: &RegisterBlock) -> Result<PathBuf> {
        let layout = self.ensure_context_store(app)?;
        let path = layout.block_path(name)?;
        let payload = block.to_json_for(name);
        self.locks.with_lock(app, &path, || write_json_atomic(&path, &payload))?;

        let meta_path = layout.meta_path();
        let now = utc_seconds(OffsetDateTime::now_utc())?;
        let filename = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        self.locks.with_lock(app, &meta_path, || {
            let mut meta = match read_json(&meta_path) {
                Ok(Some(Value::Object(meta))) => meta,
                _ => Map::new(),
            };
            meta.entry("created").or_insert_with(|| Value::String(now.clone()));
            meta.insert("filename".to_string(), Value::String(filename));
            meta.insert("app".to_string(), Value::String(app.to_string()));
            meta.insert("updated".to_string(), Value::String(now));
            write_json_atomic(&meta_path, &Value::Object(meta))
        })?;
        tracing::debug!(app, block = name, path = %path.display(), "saved block file");
        Ok(path)
    }

    /// Every per-block file of `app`, keyed by block name. Unreadable files are skipped.
    #[must_use]
    pub fn load_json_blocks(&self, app: &str) -> BTreeMap<String, RegisterBlock> {
        self.block_files(app)
            .into_iter()
            .filter_map(|(name, path, _)| load_block_file(&path).map(|block| (name, block)))
            .collect()
    }

    /// The block file modified most recently, if any parses.
    #[must_use]
    pub fn load_most_recent_json_block(&self, app: &str) -> Option<(String, RegisterBlock)> {
        let mut files = self.block_files(app);
        files.sort_by(|a, b| b.2.cmp(&a.2));
        files.into_iter().find_map(|(name, path, _)| load_block_file(&path).map(|block| (name, block)))
    }

    fn block_files(&self, app: &str) -> Vec<(String, PathBuf, std::time::SystemTime)> {
        let dir = self.layout(app).store_dir().to_path_buf();
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if is_reserved_file(&file_name) || !path.is_file() {
                    return None;
                }
                let name = file_name.strip_suffix(".json")?.to_string();
                let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
                Some((name, path, modified))
            })
            .collect()
    }

    /// Write a default `meta.json` for every app that has a `state.json` but no
    /// metadata yet. `apps` restricts the sweep; per-app failures are reported.
    ///
    /// # Errors
    /// Returns an error only when the project root cannot be listed.
    pub fn generate_meta_from_state(&self, apps: Option<&[String]>) -> Result<Vec<GeneratedMeta>> {
        let mut generated = Vec::new();
        for app in self.discover_apps()? {
            if apps.is_some_and(|wanted| !wanted.contains(&app)) {
                continue;
            }
            let outcome = self.generate_meta(&app).unwrap_or_else(|err| {
                tracing::warn!(app = %app, error = %err, "meta generation failed");
                MetaGeneration::Failed { error: err.to_string() }
            });
            generated.push(GeneratedMeta { app, outcome });
        }
        Ok(generated)
    }

    fn generate_meta(&self, app: &str) -> Result<MetaGeneration> {
        let layout = self.ensure_context_store(app)?;
        let state_path = layout.state_path();
        if !state_path.is_file() {
            return Ok(MetaGeneration::NoState);
        }
        let meta_path = layout.meta_path();
        self.locks.with_lock(app, &meta_path, || {
            if meta_path.exists() {
                return Ok(MetaGeneration::AlreadyExists);
            }
            let now = OffsetDateTime::now_utc();
            let created = fs::metadata(&state_path)
                .and_then(|metadata| metadata.modified())
                .map_or(now, OffsetDateTime::from);
            let meta = serde_json::json!({
                "filename": STATE_FILE,
                "app": app,
                "created": utc_seconds(created)?,
                "created_raw": rfc3339(created)?,
                "updated": utc_seconds(now)?,
            });
            write_json_atomic(&meta_path, &meta)?;
            tracing::info!(app, path = %meta_path.display(), "generated meta.json from state");
            Ok(MetaGeneration::Created { path: meta_path.clone() })
        })
    }

    /// Fold every `*.meta.json` sidecar of every app into that app's
    /// `meta.json` under `files.<name>`. With `backup`, merged sidecars are
    /// moved to `meta_backups/<file>.<stamp>`; otherwise they stay in place.
    ///
    /// # Errors
    /// Returns an error only when the project root cannot be listed.
    pub fn migrate_meta_files(&self, strategy: MetaMergeStrategy, backup: bool) -> Result<Vec<MetaMigration>> {
        Ok(self.discover_apps()?.iter().map(|app| self.migrate_meta(app, strategy, backup)).collect())
    }

    fn migrate_meta(&self, app: &str, strategy: MetaMergeStrategy, backup: bool) -> MetaMigration {
        let layout = self.layout(app);
        let mut report = MetaMigration { app: app.to_string(), ..MetaMigration::default() };
        let sidecars = match sidecar_files(layout.store_dir()) {
            Ok(sidecars) => sidecars,
            Err(err) => {
                report.errors.push(err.to_string());
                return report;
            }
        };
        if sidecars.is_empty() {
            return report;
        }

        let meta_path = layout.meta_path();
        let merged = self.locks.with_lock(app, &meta_path, || {
            let mut meta = match read_json(&meta_path) {
                Ok(Some(Value::Object(meta))) => meta,
                _ => Map::new(),
            };
            let mut files = match meta.remove("files") {
                Some(Value::Object(files)) => files,
                _ => Map::new(),
            };
            let mut sources = Vec::new();
            for (file_name, path) in &sidecars {
                let sidecar = match read_json(path) {
                    Ok(Some(sidecar)) => sidecar,
                    Ok(None) => continue,
                    Err(err) => {
                        report.errors.push(format!("failed to read {file_name}: {err}"));
                        continue;
                    }
                };
                let target = file_name.get(..file_name.len() - META_SIDECAR_SUFFIX.len()).unwrap_or(file_name.as_str());
                merge_sidecar(&mut files, target, sidecar, strategy);
                sources.push((file_name.clone(), path.clone()));
            }
            if sources.is_empty() {
                return Ok(sources);
            }

            let now = OffsetDateTime::now_utc();
            meta.insert("files".to_string(), Value::Object(files));
            meta.insert(
                "sources".to_string(),
                Value::Array(sources.iter().map(|(name, _)| Value::String(name.clone())).collect()),
            );
            meta.insert("merge_strategy".to_string(), Value::String(strategy.as_str().to_string()));
            meta.insert("merged_at".to_string(), Value::String(utc_seconds(now)?));
            write_json_atomic(&meta_path, &Value::Object(meta))?;

            if backup {
                let backup_dir = layout.meta_backup_dir();
                fs::create_dir_all(&backup_dir).map_err(|err| ContextError::io(&backup_dir, err))?;
                let stamp = file_stamp(now)?;
                for (name, path) in &sources {
                    let dest = backup_dir.join(format!("{name}.{stamp}"));
                    match fs::rename(path, &dest) {
                        Ok(()) => report.backed_up.push(dest),
                        Err(err) => report.errors.push(format!("failed to back up {name}: {err}")),
                    }
                }
            }
            Ok(sources)
        });

        match merged {
            Ok(sources) if !sources.is_empty() => {
                report.migrated = true;
                report.sources = sources.into_iter().map(|(name, _)| name).collect();
                report.meta_path = Some(meta_path);
                tracing::info!(app, sources = report.sources.len(), strategy = strategy.as_str(), "merged meta sidecars");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(app, error = %err, "meta migration failed");
                report.errors.push(err.to_string());
            }
        }
        report
    }

    /// Copy `state.json` to `backups/state-<ts>.json` under the app lock, then
    /// apply `policy`. `Ok(None)` when the app has no state file.
    ///
    /// # Errors
    /// Propagates lock and copy failures.
    pub fn backup_state(&self, app: &str, policy: &RetentionPolicy) -> Result<Option<BackupOutcome>> {
        let layout = self.layout(app);
        let state_path = layout.state_path();
        if !state_path.is_file() {
            return Ok(None);
        }
        let backup_dir = layout.backup_dir();
        let dest = self.locks.with_lock(app, &state_path, || {
            let dest = unique_backup_path(&backup_dir, STATE_BACKUPS, OffsetDateTime::now_utc())?;
            crate::atomic::copy_atomic(&state_path, &dest)?;
            Ok(dest)
        })?;
        let retention = apply_retention(&backup_dir, STATE_BACKUPS, policy)?;
        tracing::info!(app, path = %dest.display(), removed = retention.removed(), "state backup written");
        Ok(Some(BackupOutcome { app: app.to_string(), path: dest, retention }))
    }

    /// Back up every discovered app. Per-app failures are logged and reported.
    ///
    /// # Errors
    /// Returns an error only when the project root cannot be listed.
    pub fn backup_all_states(&self, policy: &RetentionPolicy) -> Result<BackupSweep> {
        let mut sweep = BackupSweep::default();
        for app in self.discover_apps()? {
            match self.backup_state(&app, policy) {
                Ok(Some(outcome)) => sweep.completed.push(outcome),
                Ok(None) => sweep.skipped.push(app),
                Err(err) => {
                    tracing::error!(app = %app, error = %err, "state backup failed");
                    sweep.failed.push(AppFailure { app, error: err.to_string() });
                }
            }
        }
        Ok(sweep)
    }
}

/// `*.meta.json` sidecars in `dir`, oldest first.
fn sidecar_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(ContextError::io(dir, err)),
    };
    let mut sidecars: Vec<(SystemTime, String, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let file_name = entry.file_name().to_str()?.to_string();
            if !file_name.to_ascii_lowercase().ends_with(META_SIDECAR_SUFFIX) || !entry.path().is_file() {
                return None;
            }
            let modified = entry.metadata().and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, file_name, entry.path()))
        })
        .collect();
    sidecars.sort();
    Ok(sidecars.into_iter().map(|(_, name, path)| (name, path)).collect())
}

fn merge_sidecar(files: &mut Map<String, Value>, target: &str, sidecar: Value, strategy: MetaMergeStrategy) {
    if strategy == MetaMergeStrategy::Merge {
        if let (Some(Value::Object(existing)), Value::Object(incoming)) = (files.get_mut(target), &sidecar) {
            existing.extend(incoming.clone());
            return;
        }
    }
    files.insert(target.to_string(), sidecar);
}

fn merge_into(entry: &mut Map<String, Value>, fragment: &Value, options: &MergeOptions) {
    let mut target = Value::Object(std::mem::take(entry));
    deep_merge(&mut target, fragment, options);
    if let Value::Object(map) = target {
        *entry = map;
    }
}

/// Run `f` on `map[key]`, replacing a missing or non-object value with an empty object.
fn with_object_slot<R>(map: &mut Map<String, Value>, key: &str, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
    let mut inner = match map.remove(key) {
        Some(Value::Object(inner)) => inner,
        _ => Map::new(),
    };
    let out = f(&mut inner);
    map.insert(key.to_string(), Value::Object(inner));
    out
}

/// Top-level `STATUS`, else the first nested object that carries one, else the payload.
fn locate_status(processed: &Value) -> &Value {
    if let Some(status) = processed.get(STATUS_BLOCK) {
        return status;
    }
    processed
        .as_object()
        .and_then(|map| map.values().find_map(|child| child.get(STATUS_BLOCK)))
        .unwrap_or(processed)
}

fn load_block_file(path: &Path) -> Option<RegisterBlock> {
    let raw = match read_json(path) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "skipping unreadable block file");
            return None;
        }
    };
    match RegisterBlock::from_json(&normalize_for_restore(raw)) {
        Ok(block) => Some(block),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "skipping malformed block file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::{anyhow, Result};
    use serde_json::json;
    use ulid::Ulid;

    use super::*;
    use crate::context::SlaveContext;

    fn manager(prefix: &str) -> PersistenceManager {
        let root = std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()));
        PersistenceManager::new(root, StoreConfig::default())
    }

    fn cleanup(manager: &PersistenceManager) -> Result<()> {
        if manager.root().exists() {
            fs::remove_dir_all(manager.root())?;
        }
        Ok(())
    }

    #[test]
    fn status_path_creates_nested_entry_with_meta() -> Result<()> {
        let manager = manager("ctx-persist-status");
        let outcome = manager.save_status_path("app", "ab01", &["Temp", "Ch1"], json!(21.5), Some("READ"))?;
        assert!(outcome.changed);

        let entry = manager.load_entry("app", "AB01").ok_or_else(|| anyhow!("entry missing"))?;
        assert_eq!(entry["STATUS"]["Temp"]["Ch1"], json!(21.5));
        assert!(entry["Meta"]["last_updated"].as_str().is_some_and(|s| s.ends_with('Z')));
        assert!(entry["Meta"]["READ"].is_string());

        let again = manager.save_status_path("app", "AB01", &["Temp", "Ch1"], json!(21.5), Some("READ"))?;
        assert!(!again.changed);

        cleanup(&manager)
    }

    #[test]
    fn typo_variants_collapse_onto_one_key() -> Result<()> {
        let manager = manager("ctx-persist-typo");
        manager.save_status_path("app", "S1", &["Digital_Input_Threshod"], json!({"x": 1}), None)?;
        manager.save_status_path("app", "S1", &["Digital_Input_Threshold"], json!({"y": 2}), None)?;

        let entry = manager.load_entry("app", "S1").ok_or_else(|| anyhow!("entry missing"))?;
        let status = entry["STATUS"].as_object().ok_or_else(|| anyhow!("status missing"))?;
        assert_eq!(status.len(), 1);
        assert_eq!(status["Digital_Input_Threshod"], json!({"x": 1, "y": 2}));

        cleanup(&manager)
    }

    #[test]
    fn processed_data_is_unwrapped_and_never_persisted() -> Result<()> {
        let manager = manager("ctx-persist-processed");
        let block = json!({
            "ANALOG": {"processed_data": {"ch": [1, 2]}, "raw": "ignored"},
            "DIGITAL": {"processed_data": {"di": true}},
            "NOISE": {"raw": 1}
        });
        let outcome = manager.upsert_processed_block(
            "app",
            "S1",
            &block,
            ListMerge::AppendDedup { sort: true },
            Some(&["ANALOG", "NOISE"]),
        )?;
        assert_eq!(outcome.entry["ANALOG"], json!({"ch": [1, 2]}));
        assert!(outcome.entry.get("DIGITAL").is_none());
        assert!(outcome.entry.get("NOISE").is_none());
        assert!(outcome.entry["Meta"]["ANALOG"].is_string());

        let block = json!({"ANALOG": {"processed_data": {"ch": [3, 1]}}});
        manager.upsert_processed_block("app", "S1", &block, ListMerge::AppendDedup { sort: true }, None)?;
        let text = fs::read_to_string(manager.layout("app").state_path())?;
        assert!(!text.contains(PROCESSED_DATA_KEY));
        let entry = manager.load_entry("app", "S1").ok_or_else(|| anyhow!("entry missing"))?;
        assert_eq!(entry["ANALOG"]["ch"], json!([1, 2, 3]));

        cleanup(&manager)
    }

    #[test]
    fn status_with_meta_finds_nested_status() -> Result<()> {
        let manager = manager("ctx-persist-meta");
        let processed = json!({"device": {"STATUS": {"run": 1, "processed_data": {"x": 1}}}});
        let outcome = manager.save_status_with_meta("app", "S1", "POLL", &processed)?;
        assert_eq!(outcome.entry["STATUS"], json!({"run": 1}));
        assert!(outcome.entry["Meta"]["POLL"].is_string());
        cleanup(&manager)
    }

    #[test]
    fn nested_status_respects_overwrite_flag() -> Result<()> {
        let manager = manager("ctx-persist-nested");
        manager.save_status_nested("app", "S1", "Relay", "State", json!("on"), false, None)?;
        manager.save_status_nested("app", "S1", "relay", "state", json!("off"), false, None)?;
        let entry = manager.load_entry("app", "S1").ok_or_else(|| anyhow!("entry missing"))?;
        assert_eq!(entry["STATUS"]["Relay"]["State"], json!("on"));

        manager.save_status_nested("app", "S1", "relay", "state", json!("off"), true, None)?;
        let entry = manager.load_entry("app", "S1").ok_or_else(|| anyhow!("entry missing"))?;
        assert_eq!(entry["STATUS"]["Relay"], json!({"State": "off"}));
        cleanup(&manager)
    }

    #[test]
    fn writes_sync_registered_context() -> Result<()> {
        let manager = manager("ctx-persist-sync");
        let target = manager.registry().register("app", SlaveContext::new());
        manager.save_setup("app", "s1", json!({"mode": 2}), Some("SET"))?;
        let synced = target.lock().get_state("S1").cloned().ok_or_else(|| anyhow!("not synced"))?;
        assert_eq!(synced["SETUP"], json!({"mode": 2}));
        cleanup(&manager)
    }

    #[test]
    fn empty_registry_state_never_overwrites_disk() -> Result<()> {
        let manager = manager("ctx-persist-empty");
        manager.save_setup("app", "S1", json!({"mode": 1}), None)?;
        manager.registry().register("app", SlaveContext::new());

        let report = manager.persist_registry_state("app")?;
        assert!(!report.changed);
        assert!(manager.load_entry("app", "S1").is_some());

        manager.registry().get_or_create_registry_entry("app", false)
            .ok_or_else(|| anyhow!("missing"))?
            .lock()
            .set_state("S2", json!({"STATUS": {"a": 1}}));
        let report = manager.persist_registry_state("app")?;
        assert!(report.changed);
        let state = manager.load_state("app");
        assert!(state.contains_key("S1") && state.contains_key("S2"));
        cleanup(&manager)
    }

    #[test]
    fn slave_context_is_persisted_under_host_port() -> Result<()> {
        let manager = manager("ctx-persist-slave");
        let target =
            manager.create_or_update_slave_context("LSISsocket", "10.0.0.5", 2004, &ProtocolLayout::ls_xgt_tcp(4, true), true)?;
        assert_eq!(target.lock().block_names(), vec!["%MB", "%RB", "%WB"]);

        let entry = manager
            .load_state("LSISsocket")
            .remove("10.0.0.5:2004")
            .ok_or_else(|| anyhow!("entry missing"))?;
        assert!(entry["MEMORY"]["%MB"]["values"].is_array());
        assert!(entry["Meta"]["created"].is_string());
        assert!(entry["Meta"]["last_updated"].is_string());
        cleanup(&manager)
    }

    #[test]
    fn block_files_round_trip_and_skip_state() -> Result<()> {
        let manager = manager("ctx-persist-blocks");
        manager.save_setup("app", "S1", json!({}), None)?;
        manager.save_json_block("app", "MODBUS", &RegisterBlock::sequential(0, 3, json!(0)))?;
        manager.save_json_block("app", "%MB", &RegisterBlock::sparse(0, 2, json!(0)))?;

        let blocks = manager.load_json_blocks("app");
        assert_eq!(blocks.keys().collect::<Vec<_>>(), vec!["%MB", "MODBUS"]);
        assert_eq!(blocks["MODBUS"].size(), 3);

        let meta = read_json(&manager.layout("app").meta_path())?.ok_or_else(|| anyhow!("meta missing"))?;
        assert_eq!(meta["app"], json!("app"));
        assert_eq!(meta["filename"], json!("%MB.json"));
        assert!(manager.load_most_recent_json_block("app").is_some());
        cleanup(&manager)
    }

    #[test]
    fn backups_are_bounded_by_retention() -> Result<()> {
        let manager = manager("ctx-persist-backup");
        let policy = RetentionPolicy { keep_days: 0, max_backups: 3, max_total_bytes: 0 };
        assert!(manager.backup_state("app", &policy)?.is_none());

        manager.save_setup("app", "S1", json!({"v": 0}), None)?;
        let mut created = Vec::new();
        for _ in 0..8 {
            let outcome = manager.backup_state("app", &policy)?.ok_or_else(|| anyhow!("no backup"))?;
            created.push(outcome.path);
        }
        let remaining: Vec<PathBuf> =
            crate::retention::list_backups(&manager.layout("app").backup_dir(), STATE_BACKUPS)?
                .into_iter()
                .map(|file| file.path)
                .collect();
        assert_eq!(remaining.as_slice(), &created[created.len() - 3..]);

        let sweep = manager.backup_all_states(&policy)?;
        assert_eq!(sweep.completed.len(), 1);
        cleanup(&manager)
    }

    #[test]
    fn reserved_block_names_never_clobber_state_files() -> Result<()> {
        let manager = manager("ctx-persist-reserved");
        manager.save_setup("app", "S1", json!({"mode": 1}), None)?;
        for name in ["state", "meta", "MODBUS.meta"] {
            let result = manager.save_json_block("app", name, &RegisterBlock::sequential(0, 1, json!(0)));
            assert!(matches!(result, Err(ContextError::Validation(_))), "{name} accepted");
        }
        assert!(manager.load_entry("app", "S1").is_some());
        assert!(!manager.layout("app").meta_path().exists());
        cleanup(&manager)
    }

    #[test]
    fn meta_is_generated_only_where_state_exists() -> Result<()> {
        let manager = manager("ctx-persist-genmeta");
        manager.save_setup("with_state", "S1", json!({}), None)?;
        manager.ensure_context_store("bare")?;
        manager.save_setup("documented", "S1", json!({}), None)?;
        manager.save_json_block("documented", "MODBUS", &RegisterBlock::sequential(0, 1, json!(0)))?;

        let generated = manager.generate_meta_from_state(None)?;
        let outcome = |app: &str| generated.iter().find(|g| g.app == app).map(|g| g.outcome.clone());
        assert_eq!(outcome("bare"), Some(MetaGeneration::NoState));
        assert_eq!(outcome("documented"), Some(MetaGeneration::AlreadyExists));
        let meta_path = manager.layout("with_state").meta_path();
        assert_eq!(outcome("with_state"), Some(MetaGeneration::Created { path: meta_path.clone() }));

        let meta = read_json(&meta_path)?.ok_or_else(|| anyhow!("meta missing"))?;
        assert_eq!(meta["filename"], json!("state.json"));
        assert_eq!(meta["app"], json!("with_state"));
        assert!(meta["created_raw"].is_string());

        let only = manager.generate_meta_from_state(Some(&["bare".to_string()]))?;
        assert_eq!(only.len(), 1);
        cleanup(&manager)
    }

    #[test]
    fn meta_sidecars_merge_into_meta_json() -> Result<()> {
        let manager = manager("ctx-persist-sidecars");
        let layout = manager.ensure_context_store("app")?;
        manager.save_json_block("app", "MODBUS", &RegisterBlock::sequential(0, 1, json!(0)))?;
        fs::write(layout.store_dir().join("MODBUS.json.meta.json"), r#"{"owner": "plc", "rev": 1}"#)?;
        fs::write(layout.store_dir().join("broken.meta.json"), b"{ nope")?;

        let report = manager.migrate_meta_files(MetaMergeStrategy::Latest, true)?;
        assert_eq!(report.len(), 1);
        assert!(report[0].migrated);
        assert_eq!(report[0].sources, vec!["MODBUS.json.meta.json"]);
        assert_eq!(report[0].errors.len(), 1);
        assert_eq!(report[0].backed_up.len(), 1);
        assert!(!layout.store_dir().join("MODBUS.json.meta.json").exists());
        assert!(layout.meta_backup_dir().is_dir());

        let meta = read_json(&layout.meta_path())?.ok_or_else(|| anyhow!("meta missing"))?;
        assert_eq!(meta["files"]["MODBUS.json"], json!({"owner": "plc", "rev": 1}));
        assert_eq!(meta["app"], json!("app"));
        assert_eq!(meta["merge_strategy"], json!("latest"));

        fs::write(layout.store_dir().join("MODBUS.json.meta.json"), r#"{"rev": 2}"#)?;
        manager.migrate_meta_files(MetaMergeStrategy::Merge, false)?;
        let meta = read_json(&layout.meta_path())?.ok_or_else(|| anyhow!("meta missing"))?;
        assert_eq!(meta["files"]["MODBUS.json"], json!({"owner": "plc", "rev": 2}));
        assert!(layout.store_dir().join("MODBUS.json.meta.json").exists());
        assert_eq!(manager.load_json_blocks("app").keys().collect::<Vec<_>>(), vec!["MODBUS"]);

        fs::write(layout.store_dir().join("MODBUS.json.meta.json"), r#"{"rev": 3}"#)?;
        manager.migrate_meta_files(MetaMergeStrategy::Latest, false)?;
        let meta = read_json(&layout.meta_path())?.ok_or_else(|| anyhow!("meta missing"))?;
        assert_eq!(meta["files"]["MODBUS.json"], json!({"rev": 3}));
        cleanup(&manager)
    }

    #[test]
    fn delete_entry_removes_only_that_serial() -> Result<()> {
        let manager = manager("ctx-persist-delete");
        manager.save_setup("app", "S1", json!({}), None)?;
        manager.save_setup("app", "S2", json!({}), None)?;
        assert!(manager.delete_entry("app", "s1")?.removed);
        assert!(!manager.delete_entry("app", "s1")?.removed);
        assert_eq!(manager.load_state("app").keys().collect::<Vec<_>>(), vec!["S2"]);
        cleanup(&manager)
    }
}
