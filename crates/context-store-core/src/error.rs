use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("lock on {path} not acquired after {attempts} attempts")]
    LockTimeout { path: PathBuf, attempts: u32 },
    #[error("atomic write to {path} failed: {source}")]
    AtomicWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("restore failed: {0}")]
    Restore(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("no such memory: {0}")]
    NoSuchMemory(String),
    #[error("no such slave: {0}")]
    NoSuchSlave(u8),
    #[error("entry mirror failed: {0}")]
    Mirror(String),
    #[error("timestamp formatting failed: {0}")]
    Time(#[from] time::error::Format),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ContextError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Whether the failure leaves durability of a write in doubt.
    #[must_use]
    pub fn is_write_failure(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::AtomicWrite { .. } | Self::Io { .. })
    }
}
