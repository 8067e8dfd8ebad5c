use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{BACKUP_DIR, CONTEXT_STORE_DIR, META_BACKUP_DIR, META_FILE, STATE_FILE};
use crate::error::{ContextError, Result};

/// On-disk paths for one application: `<root>/<app>/context_store/...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLayout {
    app: String,
    store_dir: PathBuf,
}

impl AppLayout {
    #[must_use]
    pub fn new(root: &Path, app: &str) -> Self {
        Self { app: app.to_string(), store_dir: root.join(app).join(CONTEXT_STORE_DIR) }
    }

    #[must_use]
    pub fn app(&self) -> &str {
        &self.app
    }

    #[must_use]
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.store_dir.join(STATE_FILE)
    }

    #[must_use]
    pub fn meta_path(&self) -> PathBuf {
        self.store_dir.join(META_FILE)
    }

    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.store_dir.join(BACKUP_DIR)
    }

    #[must_use]
    pub fn meta_backup_dir(&self) -> PathBuf {
        self.store_dir.join(META_BACKUP_DIR)
    }

    /// Per-block file `<name>.json`. Path separators in `name` are flattened.
    ///
    /// # Errors
    /// Returns a validation error for empty names and names that would land on
    /// `state.json`, `meta.json` or a `*.meta.json` sidecar.
    pub fn block_path(&self, name: &str) -> Result<PathBuf> {
        let safe: String = name.chars().map(|c| if matches!(c, '/' | '\\') { '_' } else { c }).collect();
        let file_name = format!("{safe}.json");
        if safe.trim().is_empty() || is_reserved_file(&file_name) {
            return Err(ContextError::Validation(format!("block name `{name}` is reserved")));
        }
        Ok(self.store_dir.join(file_name))
    }

    /// Create `context_store/` and `backups/` if missing.
    ///
    /// # Errors
    /// Returns an error when the directories cannot be created.
    pub fn ensure(&self) -> Result<()> {
        let backups = self.backup_dir();
        fs::create_dir_all(&backups).map_err(|err| ContextError::io(backups, err))
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.store_dir.is_dir()
    }
}

/// Files in `context_store/` that never hold a register block.
#[must_use]
pub fn is_reserved_file(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    lower == STATE_FILE || lower == META_FILE || lower.ends_with(META_SIDECAR_SUFFIX)
}

/// Suffix of the legacy per-file metadata sidecars merged by meta migration.
pub const META_SIDECAR_SUFFIX: &str = ".meta.json";

/// Names of every directory under `root` that holds a `context_store/`, sorted.
///
/// # Errors
/// Returns an error when `root` cannot be listed.
pub fn discover_apps(root: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(ContextError::io(root, err)),
    };
    let mut apps: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().join(CONTEXT_STORE_DIR).is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(ToOwned::to_owned))
        .collect();
    apps.sort();
    Ok(apps)
}
