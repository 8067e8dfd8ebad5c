//! Register-block data model and crash-safe JSON persistence for per-application
//! device state.

pub mod atomic;
pub mod block;
pub mod config;
pub mod context;
pub mod error;
pub mod layout;
pub mod lock;
pub mod merge;
pub mod persist;
pub mod registry;
pub mod retention;
pub mod state;

pub use block::{BlockKind, RegisterBlock};
pub use config::{LockConfig, LockStrategy, RetentionPolicy, StoreConfig};
pub use context::{MemoryInfo, ProtocolLayout, ServerContext, SlaveContext, StateTarget};
pub use error::{ContextError, Result};
pub use layout::AppLayout;
pub use lock::{CrossProcessLock, LockManager};
pub use merge::{ListMerge, MergeOptions, Promotion};
pub use persist::{
    BackupOutcome, BackupSweep, DeleteOutcome, EntryMirror, GeneratedMeta, MetaGeneration, MetaMergeStrategy,
    MetaMigration, PersistReport, PersistenceManager, SaveOutcome,
};
pub use registry::{ContextRegistry, SharedTarget};
pub use retention::{BackupSeries, RetentionReport};
pub use state::Serial;
