use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::config::LoggingConfig;
use crate::targets::SUBSYSTEMS;

struct LogFile {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

/// Deletes logs older than `keep_days`, then the oldest remaining ones until
/// the directory fits `max_total_mb`. Only files the subscriber writes are
/// considered. Returns the number of files removed.
pub fn run_retention(root: &Path, component: &str, cfg: &LoggingConfig) -> Result<usize> {
    let log_root = root.join("logs");
    let mut entries = collect_log_files(&log_root, component)?;
    let mut removed = 0;

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(
            cfg.keep_days.saturating_mul(24 * 60 * 60),
        ))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    entries.retain(|entry| {
        if entry.modified >= cutoff {
            return true;
        }
        match fs::remove_file(&entry.path) {
            Ok(()) => {
                removed += 1;
                false
            }
            Err(err) => {
                tracing::warn!("Failed to remove old log {}: {}", entry.path.display(), err);
                true
            }
        }
    });

    let cap = cfg.max_total_bytes();
    let mut total_size: u64 = entries.iter().map(|e| e.size).sum();
    if total_size > cap {
        entries.sort_by_key(|e| e.modified);
        for entry in entries {
            if total_size <= cap {
                break;
            }
            if let Err(err) = fs::remove_file(&entry.path) {
                tracing::warn!(
                    "Failed to remove log {} during size cap cleanup: {}",
                    entry.path.display(),
                    err
                );
                continue;
            }
            removed += 1;
            total_size = total_size.saturating_sub(entry.size);
        }
    }

    if removed > 0 {
        tracing::debug!("Log retention removed {} file(s)", removed);
    }
    Ok(removed)
}

fn collect_log_files(log_root: &Path, component: &str) -> Result<Vec<LogFile>> {
    let mut files = Vec::new();
    if !log_root.exists() {
        return Ok(files);
    }

    let entries =
        fs::read_dir(log_root).with_context(|| format!("reading {}", log_root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("iterating {}", log_root.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_log_name(name, component) {
            continue;
        }

        let metadata = fs::metadata(&path).with_context(|| format!("stat {}", path.display()))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.push(LogFile {
            path,
            modified,
            size: metadata.len(),
        });
    }

    Ok(files)
}

fn is_log_name(name: &str, component: &str) -> bool {
    let matches = |stem: &str| name.starts_with(stem) && name[stem.len()..].starts_with(".log");
    matches(component) || SUBSYSTEMS.iter().any(|target| matches(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_log(dir: &Path, name: &str, bytes: usize, age: Duration) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![b'x'; bytes]).unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
        path
    }

    #[test]
    fn only_our_files_are_log_files() {
        assert!(is_log_name("netpilotd.log.2026-10-01", "netpilotd"));
        assert!(is_log_name("route.log", "netpilotd"));
        assert!(!is_log_name("routes.txt", "netpilotd"));
        assert!(!is_log_name("settings.json", "netpilotd"));
    }

    #[test]
    fn old_logs_are_removed() {
        let root = TempDir::new().unwrap();
        let logs = root.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        let day = Duration::from_secs(24 * 60 * 60);
        let stale = write_log(&logs, "dns.log.2026-09-01", 10, day * 30);
        let fresh = write_log(&logs, "dns.log.2026-10-17", 10, day);
        let foreign = write_log(&logs, "notes.txt", 10, day * 30);

        let removed = run_retention(root.path(), "netpilotd", &LoggingConfig::default()).unwrap();
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn size_cap_drops_the_oldest_first() {
        let root = TempDir::new().unwrap();
        let logs = root.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        let hour = Duration::from_secs(60 * 60);
        let mib = 1024 * 1024;
        let oldest = write_log(&logs, "netpilotd.log.1", mib, hour * 3);
        let middle = write_log(&logs, "netpilotd.log.2", mib, hour * 2);
        let newest = write_log(&logs, "netpilotd.log.3", mib, hour);

        let cfg = LoggingConfig {
            max_total_mb: 2,
            ..LoggingConfig::default()
        };
        run_retention(root.path(), "netpilotd", &cfg).unwrap();
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
    }
}
