use std::path::PathBuf;
use std::time::Duration;

pub const CONTEXT_STORE_DIR: &str = "context_store";
pub const STATE_FILE: &str = "state.json";
pub const META_FILE: &str = "meta.json";
pub const BACKUP_DIR: &str = "backups";
pub const META_BACKUP_DIR: &str = "meta_backups";
pub const DB_FILE: &str = "context_store.sqlite3";

pub const ENV_LOCK_TIMEOUT: &str = "CONTEXT_LOCK_TIMEOUT";
pub const ENV_LOCK_RETRIES: &str = "CONTEXT_LOCK_RETRIES";
pub const ENV_LOCK_STRATEGY: &str = "CONTEXT_LOCK_STRATEGY";
pub const ENV_DB_PATH: &str = "CONTEXT_STORE_DB_PATH";
pub const ENV_BACKUP_ENABLED: &str = "CONTEXT_BACKUP_ENABLED";
pub const ENV_BACKUP_INTERVAL: &str = "CONTEXT_BACKUP_INTERVAL";
pub const ENV_AUTOSAVE_INTERVAL: &str = "CONTEXT_AUTOSAVE_INTERVAL";
pub const ENV_BACKUP_KEEP_DAYS: &str = "CONTEXT_BACKUP_KEEP_DAYS";
pub const ENV_BACKUP_MAX_FILES: &str = "CONTEXT_BACKUP_MAX_FILES";
pub const ENV_BACKUP_MAX_BYTES: &str = "CONTEXT_BACKUP_MAX_BYTES";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LOCK_RETRIES: u32 = 5;
const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_KEEP_DAYS: u64 = 30;
const DEFAULT_MAX_BACKUPS: usize = 100;
const DEFAULT_MAX_TOTAL_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockStrategy {
    /// Probe the context store directory and pick the first backend that works there.
    #[default]
    Auto,
    DirMutex,
    AdvisoryFile,
}

impl LockStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::DirMutex => "dir",
            Self::AdvisoryFile => "file",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "dir" | "lockdir" => Some(Self::DirMutex),
            "file" | "flock" => Some(Self::AdvisoryFile),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub strategy: LockStrategy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            max_retries: DEFAULT_LOCK_RETRIES,
            strategy: LockStrategy::Auto,
        }
    }
}

/// Backup pruning limits. A zero limit disables that pruning stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RetentionPolicy {
    pub keep_days: u64,
    pub max_backups: usize,
    pub max_total_bytes: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_days: DEFAULT_KEEP_DAYS,
            max_backups: DEFAULT_MAX_BACKUPS,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub lock: LockConfig,
    pub retention: RetentionPolicy,
    pub backup_enabled: bool,
    pub backup_interval: Duration,
    pub autosave_interval: Duration,
    pub db_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            retention: RetentionPolicy::default(),
            backup_enabled: true,
            backup_interval: DEFAULT_BACKUP_INTERVAL,
            autosave_interval: DEFAULT_AUTOSAVE_INTERVAL,
            db_path: None,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through `lookup`, falling back to defaults for
    /// unset or malformed values.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let lock = LockConfig {
            timeout: read_seconds(&lookup, ENV_LOCK_TIMEOUT).unwrap_or(defaults.lock.timeout),
            max_retries: read_parsed(&lookup, ENV_LOCK_RETRIES)
                .unwrap_or(defaults.lock.max_retries),
            strategy: lookup(ENV_LOCK_STRATEGY)
                .and_then(|raw| {
                    let parsed = LockStrategy::parse(&raw);
                    if parsed.is_none() {
                        tracing::warn!(key = ENV_LOCK_STRATEGY, value = %raw, "ignoring unknown lock strategy");
                    }
                    parsed
                })
                .unwrap_or(defaults.lock.strategy),
        };

        let retention = RetentionPolicy {
            keep_days: read_parsed(&lookup, ENV_BACKUP_KEEP_DAYS)
                .unwrap_or(defaults.retention.keep_days),
            max_backups: read_parsed(&lookup, ENV_BACKUP_MAX_FILES)
                .unwrap_or(defaults.retention.max_backups),
            max_total_bytes: lookup(ENV_BACKUP_MAX_BYTES)
                .map_or(defaults.retention.max_total_bytes, |raw| parse_bytes(&raw)),
        };

        Self {
            lock,
            retention,
            backup_enabled: lookup(ENV_BACKUP_ENABLED)
                .and_then(|raw| parse_flag(&raw))
                .unwrap_or(defaults.backup_enabled),
            backup_interval: read_seconds(&lookup, ENV_BACKUP_INTERVAL)
                .unwrap_or(defaults.backup_interval),
            autosave_interval: read_seconds(&lookup, ENV_AUTOSAVE_INTERVAL)
                .unwrap_or(defaults.autosave_interval),
            db_path: lookup(ENV_DB_PATH).filter(|raw| !raw.trim().is_empty()).map(PathBuf::from),
        }
    }
}

fn read_parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring malformed configuration value");
            None
        }
    }
}

fn read_seconds<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let seconds: f64 = read_parsed(lookup, key)?;
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) => Some(duration),
        Err(err) => {
            tracing::warn!(key, seconds, error = %err, "ignoring out-of-range duration");
            None
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a human-friendly size such as `100`, `10K`, `5MB` or `1G` (powers of 1024).
///
/// Unparsable input yields 0, which disables size-based pruning.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn parse_bytes(raw: &str) -> u64 {
    const SUFFIXES: [(&str, u64); 7] = [
        ("GB", 1 << 30),
        ("G", 1 << 30),
        ("MB", 1 << 20),
        ("M", 1 << 20),
        ("KB", 1 << 10),
        ("K", 1 << 10),
        ("B", 1),
    ];

    let upper = raw.trim().to_ascii_uppercase();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| upper.strip_suffix(suffix).map(|rest| (rest.trim(), *mult)))
        .unwrap_or((upper.as_str(), 1));

    match number.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => (value * multiplier as f64) as u64,
        _ => 0,
    }
}
