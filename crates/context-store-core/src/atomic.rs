use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::error::{ContextError, Result};
use crate::merge::canonicalize;

const RENAME_ATTEMPTS: u32 = 6;
const RENAME_BACKOFF: Duration = Duration::from_millis(20);
const TEMP_SUFFIX: &str = "tmp";

/// Write `value` as pretty, key-sorted JSON to `path` via temp file, fsync and rename.
///
/// # Errors
/// Returns [`ContextError::AtomicWrite`] when the rename keeps failing, or an
/// I/O error when the temp file cannot be written.
pub fn write_json_atomic(path: &Path, value: &Value) -> Result<()> {
    let mut body = pretty_json(&canonicalize(value))?;
    body.push(b'\n');
    write_bytes_atomic(path, &body)
}

/// Copy `source` onto `dest` with the same temp-and-rename protocol.
///
/// # Errors
/// Returns an error when `source` cannot be read or the write fails.
pub fn copy_atomic(source: &Path, dest: &Path) -> Result<()> {
    let bytes = fs::read(source).map_err(|err| ContextError::io(source, err))?;
    write_bytes_atomic(dest, &bytes)
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(&dir).map_err(|err| ContextError::io(&dir, err))?;
    let temp = temp_path(path);

    let result = write_temp(&temp, bytes).and_then(|()| rename_with_retry(&temp, path));
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    cleanup_stale_temps(path);
    if result.is_ok() {
        sync_dir(&dir);
    }
    result
}

fn write_temp(temp: &Path, bytes: &[u8]) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp)
        .map_err(|err| ContextError::io(temp, err))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes).map_err(|err| ContextError::io(temp, err))?;
    let file = writer.into_inner().map_err(|err| ContextError::io(temp, err.into_error()))?;
    file.sync_all().map_err(|err| ContextError::io(temp, err))
}

fn rename_with_retry(temp: &Path, path: &Path) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fs::rename(temp, path) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::PermissionDenied && attempt < RENAME_ATTEMPTS => {
                tracing::debug!(path = %path.display(), attempt, "rename denied; retrying");
                thread::sleep(RENAME_BACKOFF.saturating_mul(1 << (attempt - 1)));
            }
            Err(err) => {
                tracing::error!(path = %path.display(), attempt, error = %err, "atomic rename failed");
                return Err(ContextError::AtomicWrite { path: path.to_path_buf(), source: err });
            }
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|handle| handle.sync_all()) {
        tracing::debug!(path = %dir.display(), error = %err, "directory fsync skipped");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn temp_path(path: &Path) -> PathBuf {
    path.with_file_name(format!("{}.{}.{}.{TEMP_SUFFIX}", file_stem(path), std::process::id(), Ulid::new()))
}

fn file_stem(path: &Path) -> String {
    path.file_stem().map(|stem| stem.to_string_lossy().into_owned()).unwrap_or_default()
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Remove temp files left next to `path` by this process.
pub fn cleanup_stale_temps(path: &Path) {
    let prefix = format!("{}.{}.", file_stem(path), std::process::id());
    let suffix = format!(".{TEMP_SUFFIX}");
    let Ok(entries) = fs::read_dir(parent_dir(path)) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(&suffix) {
            if let Err(err) = fs::remove_file(entry.path()) {
                tracing::debug!(path = %entry.path().display(), error = %err, "could not remove temp file");
            }
        }
    }
}

/// Read and parse a JSON file. `Ok(None)` when the file does not exist.
///
/// # Errors
/// Returns an error when the file exists but cannot be read or parsed.
pub fn read_json(path: &Path) -> Result<Option<Value>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ContextError::io(path, err)),
    }
}

/// Load an aggregated state file as a map. Missing, unreadable, corrupt or
/// non-object files yield an empty map.
#[must_use]
pub fn read_state_map(path: &Path) -> Map<String, Value> {
    match read_json(path) {
        Ok(Some(Value::Object(map))) => map,
        Ok(Some(other)) => {
            tracing::warn!(path = %path.display(), kind = json_kind(&other), "state file is not an object; treating as empty");
            Map::new()
        }
        Ok(None) => Map::new(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "state file unreadable; treating as empty");
            Map::new()
        }
    }
}

/// Pretty JSON with 2-space indent, non-ASCII kept verbatim.
///
/// # Errors
/// Returns an error when `value` cannot be serialized.
pub fn pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(value)?)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
