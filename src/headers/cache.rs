//! Persisted record of when each subproject's headers were last extracted.
//!
//! Stored as a JSON map of subproject path to Unix timestamp (seconds,
//! fractional). The file is replaced atomically on [`RebuildCache::save`]
//! while an exclusive lock is held on a sidecar `.lock` file.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use time::OffsetDateTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug)]
pub struct RebuildCache {
    path: PathBuf,
    entries: BTreeMap<String, f64>,
    dirty: bool,
}

impl RebuildCache {
    /// Load the cache at `path`. A missing file is an empty cache; an
    /// unreadable one is discarded with a warning so the pass re-extracts
    /// everything.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let bytes =
                fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("discarding corrupt rebuild cache {}: {e}", path.display());
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, subunit: &Path) -> Option<f64> {
        self.entries.get(&key(subunit)).copied()
    }

    /// True when `subunit` has no entry, or any file beneath it was modified
    /// after its entry.
    pub fn needs_refresh(&self, subunit: &Path) -> Result<bool> {
        let Some(extracted_at) = self.entry(subunit) else {
            return Ok(true);
        };
        for entry in WalkDir::new(subunit) {
            let entry = entry.with_context(|| format!("Failed to walk {}", subunit.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            let modified = match modified.duration_since(UNIX_EPOCH) {
                Ok(d) => d.as_secs_f64(),
                Err(_) => continue,
            };
            if modified > extracted_at {
                debug!("{} changed since last extraction", entry.path().display());
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Record an extraction of `subunit` at `at` (Unix seconds).
    pub fn mark(&mut self, subunit: &Path, at: f64) {
        self.entries.insert(key(subunit), at);
        self.dirty = true;
    }

    /// Record an extraction of `subunit` now.
    pub fn mark_refreshed(&mut self, subunit: &Path) {
        self.mark(subunit, now_unix());
    }

    /// Write the cache back if anything changed.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let _lock = CacheLock::acquire(&self.path)?;
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        let tmp = tmp_path(&self.path);
        fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        self.dirty = false;
        Ok(())
    }
}

fn key(subunit: &Path) -> String {
    subunit.display().to_string()
}

fn now_unix() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp-{}", std::process::id()));
    path.with_file_name(name)
}

/// Exclusive lock on `<cache>.lock`, held for the duration of a save.
struct CacheLock {
    _file: File,
}

impl CacheLock {
    fn acquire(cache: &Path) -> Result<Self> {
        let mut name = cache.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        let lock_path = cache.with_file_name(name);

        // Never unlinked: another process may hold it.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    const T: i64 = 1_700_000_000;

    fn subproject(root: &Path) -> PathBuf {
        let dir = root.join("subprojects/libgui");
        fs::create_dir_all(dir.join("widgets")).unwrap();
        fs::write(dir.join("meson.build"), "").unwrap();
        fs::write(dir.join("widgets/button.h"), "").unwrap();
        for file in ["meson.build", "widgets/button.h"] {
            set_file_mtime(dir.join(file), FileTime::from_unix_time(T - 100, 0)).unwrap();
        }
        dir
    }

    #[test]
    fn missing_file_is_empty_cache() {
        let temp = TempDir::new().unwrap();
        let cache = RebuildCache::load(&temp.path().join("cache.json")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn unknown_subunit_needs_refresh() {
        let temp = TempDir::new().unwrap();
        let dir = subproject(temp.path());
        let cache = RebuildCache::load(&temp.path().join("cache.json")).unwrap();
        assert!(cache.needs_refresh(&dir).unwrap());
    }

    #[test]
    fn newer_nested_file_triggers_refresh() {
        let temp = TempDir::new().unwrap();
        let dir = subproject(temp.path());
        let mut cache = RebuildCache::load(&temp.path().join("cache.json")).unwrap();
        cache.mark(&dir, T as f64);
        assert!(!cache.needs_refresh(&dir).unwrap());

        set_file_mtime(dir.join("widgets/button.h"), FileTime::from_unix_time(T + 2, 0)).unwrap();
        assert!(cache.needs_refresh(&dir).unwrap());
    }

    #[test]
    fn older_file_does_not_trigger_refresh() {
        let temp = TempDir::new().unwrap();
        let dir = subproject(temp.path());
        let mut cache = RebuildCache::load(&temp.path().join("cache.json")).unwrap();
        cache.mark(&dir, T as f64);

        set_file_mtime(dir.join("widgets/button.h"), FileTime::from_unix_time(T - 2, 0)).unwrap();
        assert!(!cache.needs_refresh(&dir).unwrap());
    }

    #[test]
    fn save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("caches/header_rebuild_cache.json");
        let dir = subproject(temp.path());

        let mut cache = RebuildCache::load(&path).unwrap();
        cache.mark(&dir, T as f64);
        cache.save().unwrap();

        let reloaded = RebuildCache::load(&path).unwrap();
        assert_eq!(reloaded.entry(&dir), Some(T as f64));
        // Only the cache and its lock remain; the temporary was renamed away.
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2, "{names:?}");
    }

    #[test]
    fn corrupt_cache_is_discarded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.json");
        fs::write(&path, "not json").unwrap();
        assert!(RebuildCache::load(&path).unwrap().is_empty());
    }

    #[test]
    fn mark_refreshed_uses_current_time() {
        let temp = TempDir::new().unwrap();
        let mut cache = RebuildCache::load(&temp.path().join("cache.json")).unwrap();
        cache.mark_refreshed(Path::new("/src/programs/subprojects/libc"));
        let at = cache.entry(Path::new("/src/programs/subprojects/libc")).unwrap();
        assert!(at > T as f64);
    }
}
