use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::RetentionPolicy;
use crate::error::{ContextError, Result};
use crate::state::file_stamp;

const SECONDS_PER_DAY: u64 = 86_400;

/// Which files in a backup directory belong to one backup series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupSeries<'a> {
    pub prefix: &'a str,
    pub extension: &'a str,
}

impl BackupSeries<'_> {
    #[must_use]
    pub fn matches(&self, file_name: &str) -> bool {
        file_name.starts_with(self.prefix)
            && Path::new(file_name).extension().is_some_and(|ext| ext == self.extension)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub removed_by_age: Vec<PathBuf>,
    pub removed_by_size: Vec<PathBuf>,
    pub removed_by_count: Vec<PathBuf>,
    pub kept: usize,
    pub kept_bytes: u64,
}

impl RetentionReport {
    #[must_use]
    pub fn removed(&self) -> usize {
        self.removed_by_age.len() + self.removed_by_size.len() + self.removed_by_count.len()
    }
}

/// Backups in `dir` belonging to `series`, oldest first (ties broken by name).
///
/// # Errors
/// Returns an error when the directory exists but cannot be listed.
pub fn list_backups(dir: &Path, series: BackupSeries<'_>) -> Result<Vec<BackupFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(ContextError::io(dir, err)),
    };
    let mut files = Vec::new();
    for entry in entries.flatten() {
        if !series.matches(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_file() {
            files.push(BackupFile {
                path: entry.path(),
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(files)
}

/// Decide which backups to delete: age first, then total size, then count.
/// Input must be sorted oldest first; the report lists paths, nothing is touched.
#[must_use]
pub fn plan_retention(files: &[BackupFile], policy: &RetentionPolicy, now: SystemTime) -> RetentionReport {
    let mut report = RetentionReport::default();
    let mut remaining: Vec<&BackupFile> = files.iter().collect();

    if policy.keep_days > 0 {
        let max_age = Duration::from_secs(policy.keep_days.saturating_mul(SECONDS_PER_DAY));
        let cutoff = now.checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);
        remaining.retain(|file| {
            let expired = file.modified < cutoff;
            if expired {
                report.removed_by_age.push(file.path.clone());
            }
            !expired
        });
    }

    if policy.max_total_bytes > 0 {
        let mut total: u64 = remaining.iter().map(|file| file.size).sum();
        let mut dropped = 0;
        while total > policy.max_total_bytes && dropped < remaining.len() {
            total -= remaining[dropped].size;
            report.removed_by_size.push(remaining[dropped].path.clone());
            dropped += 1;
        }
        remaining.drain(..dropped);
    }

    if policy.max_backups > 0 && remaining.len() > policy.max_backups {
        let excess = remaining.len() - policy.max_backups;
        report.removed_by_count.extend(remaining.drain(..excess).map(|file| file.path.clone()));
    }

    report.kept = remaining.len();
    report.kept_bytes = remaining.iter().map(|file| file.size).sum();
    report
}

/// Plan and execute retention for `series` in `dir`. Deletion failures are logged and skipped.
///
/// # Errors
/// Returns an error when the directory cannot be listed.
pub fn apply_retention(dir: &Path, series: BackupSeries<'_>, policy: &RetentionPolicy) -> Result<RetentionReport> {
    let files = list_backups(dir, series)?;
    let report = plan_retention(&files, policy, SystemTime::now());
    for path in report.removed_by_age.iter().chain(&report.removed_by_size).chain(&report.removed_by_count) {
        if let Err(err) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove expired backup");
        }
    }
    if report.removed() > 0 {
        tracing::info!(
            dir = %dir.display(),
            removed = report.removed(),
            kept = report.kept,
            "applied backup retention"
        );
    }
    Ok(report)
}

/// `<dir>/<prefix><stamp>.<ext>`, or `<prefix><stamp>_NNN.<ext>` when that name is taken.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn unique_backup_path(dir: &Path, series: BackupSeries<'_>, at: OffsetDateTime) -> Result<PathBuf> {
    let stamp = file_stamp(at)?;
    let candidate = dir.join(format!("{}{stamp}.{}", series.prefix, series.extension));
    if !candidate.exists() {
        return Ok(candidate);
    }
    let mut counter = 1_u32;
    loop {
        let candidate = dir.join(format!("{}{stamp}_{counter:03}.{}", series.prefix, series.extension));
        if !candidate.exists() {
            return Ok(candidate);
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use ulid::Ulid;

    use super::*;

    const SERIES: BackupSeries<'static> = BackupSeries { prefix: "state-", extension: "json" };

    fn file(name: &str, size: u64, age_days: u64, now: SystemTime) -> BackupFile {
        BackupFile {
            path: PathBuf::from(name),
            size,
            modified: now - Duration::from_secs(age_days * SECONDS_PER_DAY),
        }
    }

    fn policy(keep_days: u64, max_backups: usize, max_total_bytes: u64) -> RetentionPolicy {
        RetentionPolicy { keep_days, max_backups, max_total_bytes }
    }

    #[test]
    fn stages_run_age_then_size_then_count() {
        let now = SystemTime::now();
        let files = vec![
            file("a", 10, 40, now),
            file("b", 10, 5, now),
            file("c", 10, 4, now),
            file("d", 10, 3, now),
            file("e", 10, 2, now),
            file("f", 10, 1, now),
        ];
        let report = plan_retention(&files, &policy(30, 3, 40), now);
        assert_eq!(report.removed_by_age, vec![PathBuf::from("a")]);
        assert_eq!(report.removed_by_size, vec![PathBuf::from("b")]);
        assert_eq!(report.removed_by_count, vec![PathBuf::from("c")]);
        assert_eq!(report.kept, 3);
        assert_eq!(report.kept_bytes, 30);
    }

    #[test]
    fn zero_limits_disable_stages() {
        let now = SystemTime::now();
        let files = vec![file("a", 1_000, 400, now), file("b", 1_000, 1, now)];
        let report = plan_retention(&files, &policy(0, 0, 0), now);
        assert_eq!(report.removed(), 0);
        assert_eq!(report.kept, 2);
    }

    #[test]
    fn series_matching_is_by_prefix_and_extension() {
        assert!(SERIES.matches("state-20240101T000000.json"));
        assert!(!SERIES.matches("state-20240101T000000.json.tmp"));
        assert!(!SERIES.matches("meta.json"));
    }

    #[test]
    fn unique_names_get_a_counter_suffix() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("ctx-retention-{}", Ulid::new()));
        fs::create_dir_all(&dir)?;
        let at = OffsetDateTime::UNIX_EPOCH;

        let first = unique_backup_path(&dir, SERIES, at)?;
        fs::write(&first, b"{}")?;
        let second = unique_backup_path(&dir, SERIES, at)?;
        assert_eq!(first.file_name().and_then(|n| n.to_str()), Some("state-19700101T000000.json"));
        assert_eq!(second.file_name().and_then(|n| n.to_str()), Some("state-19700101T000000_001.json"));

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
