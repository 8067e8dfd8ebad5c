use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use context_store_core::{
    EntryMirror, LockConfig, LockStrategy, PersistenceManager, SlaveContext, StoreConfig,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use ulid::Ulid;

const WRITERS: usize = 6;
const ITERATIONS: usize = 8;

fn contended_config(strategy: LockStrategy) -> StoreConfig {
    StoreConfig {
        lock: LockConfig { timeout: Duration::from_secs(30), max_retries: 200, strategy },
        ..StoreConfig::default()
    }
}

fn temp_files(dir: &Path) -> Result<Vec<String>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.ends_with(".tmp") {
            found.push(name);
        }
    }
    Ok(found)
}

/// Each writer owns a separate manager, so only the cross-process lock serializes them.
fn hammer_same_key(strategy: LockStrategy) -> Result<()> {
    let root = std::env::temp_dir().join(format!("ctx-stress-{}-{}", strategy.as_str(), Ulid::new()));
    fs::create_dir_all(&root)?;

    let mut handles = Vec::new();
    for writer in 0..WRITERS {
        let manager = PersistenceManager::new(root.clone(), contended_config(strategy));
        handles.push(thread::spawn(move || -> context_store_core::Result<()> {
            for count in 0..ITERATIONS {
                manager.update_entry("MCUnode", "127.0.0.1:5020", None, false, |entry| {
                    entry.insert("count".to_string(), json!(count));
                    entry.insert(format!("writer_{writer}"), json!(count));
                    Ok(())
                })?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        let Ok(result) = handle.join() else {
            return Err(anyhow!("writer thread panicked"));
        };
        result?;
    }

    let store_dir = root.join("MCUnode").join("context_store");
    let text = fs::read_to_string(store_dir.join("state.json"))?;
    let state: Value = serde_json::from_str(&text)?;
    let state = state.as_object().ok_or_else(|| anyhow!("state is not an object"))?;
    assert_eq!(state.len(), 1);

    let entry = &state["127.0.0.1:5020"];
    assert_eq!(entry["count"], json!(ITERATIONS - 1));
    for writer in 0..WRITERS {
        assert_eq!(entry[format!("writer_{writer}")], json!(ITERATIONS - 1), "writer {writer} lost updates");
    }
    assert!(temp_files(&store_dir)?.is_empty());

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn advisory_lock_writers_never_tear_state() -> Result<()> {
    hammer_same_key(LockStrategy::AdvisoryFile)
}

#[test]
fn dir_mutex_writers_never_tear_state() -> Result<()> {
    hammer_same_key(LockStrategy::DirMutex)
}

#[test]
fn threads_sharing_a_manager_keep_disjoint_subtrees() -> Result<()> {
    let root = std::env::temp_dir().join(format!("ctx-fairness-{}", Ulid::new()));
    let manager = Arc::new(PersistenceManager::new(root.clone(), StoreConfig::default()));

    let mut handles = Vec::new();
    for side in ["left", "right"] {
        let manager = Arc::clone(&manager);
        handles.push(thread::spawn(move || -> context_store_core::Result<()> {
            for i in 0..20 {
                let key = format!("k{i}");
                manager.save_status_path("app", "AB01", &[side, key.as_str()], json!(i), None)?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        let Ok(result) = handle.join() else {
            return Err(anyhow!("writer thread panicked"));
        };
        result?;
    }

    let entry = manager.load_entry("app", "AB01").ok_or_else(|| anyhow!("entry missing"))?;
    for side in ["left", "right"] {
        let subtree = entry["STATUS"][side].as_object().ok_or_else(|| anyhow!("{side} missing"))?;
        assert_eq!(subtree.len(), 20);
    }

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[derive(Debug, Default)]
struct RecordingMirror {
    entries: Mutex<BTreeMap<(String, String), Value>>,
}

impl EntryMirror for RecordingMirror {
    fn entry_written(&self, app: &str, key: &str, entry: &Value) -> context_store_core::Result<()> {
        self.entries.lock().insert((app.to_string(), key.to_string()), entry.clone());
        Ok(())
    }

    fn entry_removed(&self, app: &str, key: &str) -> context_store_core::Result<bool> {
        Ok(self.entries.lock().remove(&(app.to_string(), key.to_string())).is_some())
    }
}

#[test]
fn mirror_and_registry_follow_file_order() -> Result<()> {
    let root = std::env::temp_dir().join(format!("ctx-mirror-order-{}", Ulid::new()));
    let mirror = Arc::new(RecordingMirror::default());
    let manager = Arc::new(
        PersistenceManager::new(root.clone(), StoreConfig::default())
            .with_mirror(Arc::clone(&mirror) as Arc<dyn EntryMirror>),
    );
    let target = manager.registry().register("app", SlaveContext::new());

    let mut handles = Vec::new();
    for writer in 0..8_i64 {
        let manager = Arc::clone(&manager);
        handles.push(thread::spawn(move || -> context_store_core::Result<()> {
            for i in 0..15 {
                manager.save_status_path("app", "S1", &["v"], json!(writer * 1000 + i), None)?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        let Ok(result) = handle.join() else {
            return Err(anyhow!("writer thread panicked"));
        };
        result?;
    }

    let on_disk = manager.load_entry("app", "S1").ok_or_else(|| anyhow!("entry missing"))?;
    let mirrored = mirror.entries.lock().get(&("app".to_string(), "S1".to_string())).cloned();
    assert_eq!(mirrored.as_ref(), Some(&on_disk));
    assert_eq!(target.lock().get_state("S1"), Some(&on_disk));

    let deleted = manager.delete_entry("app", "s1")?;
    assert!(deleted.removed && deleted.mirror_removed);
    assert!(mirror.entries.lock().is_empty());
    assert!(target.lock().get_state("S1").is_none());

    fs::remove_dir_all(&root)?;
    Ok(())
}
