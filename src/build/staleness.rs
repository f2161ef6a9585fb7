//! Timestamp-based staleness between a source file and its staged copy.
//!
//! The build systems we drive share no dependency graph, so the only signal
//! available across all of them is the filesystem modification time.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

use crate::error::BuildError;

/// Seconds a source must be newer than its copy before we recopy.
///
/// Some filesystems (FAT, network mounts) round mtimes, so a freshly made
/// copy can look slightly older than its source.
pub const MTIME_TOLERANCE_SECS: f64 = 1.0;

/// True if `destination` is missing, or `source` is newer than it by more
/// than [`MTIME_TOLERANCE_SECS`].
pub fn needs_update(source: &Path, destination: &Path) -> Result<bool> {
    let source_mtime = match fs::metadata(source) {
        Ok(meta) => meta.modified()?,
        Err(_) => {
            return Err(BuildError::MissingArtifact {
                what: "source file".to_string(),
                path: source.to_path_buf(),
            }
            .into())
        }
    };
    let dest_mtime = match fs::metadata(destination) {
        Ok(meta) => meta.modified()?,
        Err(_) => return Ok(true),
    };
    Ok(seconds_between(dest_mtime, source_mtime) > MTIME_TOLERANCE_SECS)
}

/// Copy `source` to `destination` if it is stale, creating parent
/// directories. Returns whether a copy happened.
pub fn copy_if_stale(source: &Path, destination: &Path) -> Result<bool> {
    if !needs_update(source, destination)? {
        debug!("up to date: {}", destination.display());
        return Ok(false);
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::copy(source, destination).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            source.display(),
            destination.display()
        )
    })?;
    Ok(true)
}

/// `later - earlier` in fractional seconds, negative when `later` is older.
fn seconds_between(earlier: SystemTime, later: SystemTime) -> f64 {
    match later.duration_since(earlier) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    fn pair(temp: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
        let src = temp.path().join("src.h");
        let dst = temp.path().join("dst.h");
        fs::write(&src, "a").unwrap();
        fs::write(&dst, "a").unwrap();
        (src, dst)
    }

    #[test]
    fn missing_destination_needs_update() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.h");
        fs::write(&src, "a").unwrap();
        assert!(needs_update(&src, &temp.path().join("nope.h")).unwrap());
    }

    #[test]
    fn missing_source_is_fatal() {
        let temp = TempDir::new().unwrap();
        let err = needs_update(&temp.path().join("gone.h"), &temp.path().join("dst.h"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn exactly_one_second_newer_is_not_stale() {
        let temp = TempDir::new().unwrap();
        let (src, dst) = pair(&temp);
        set_file_mtime(&dst, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        set_file_mtime(&src, FileTime::from_unix_time(1_000_001, 0)).unwrap();
        assert!(!needs_update(&src, &dst).unwrap());
    }

    #[test]
    fn more_than_one_second_newer_is_stale() {
        let temp = TempDir::new().unwrap();
        let (src, dst) = pair(&temp);
        set_file_mtime(&dst, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        set_file_mtime(&src, FileTime::from_unix_time(1_000_001, 500_000_000)).unwrap();
        assert!(needs_update(&src, &dst).unwrap());
    }

    #[test]
    fn older_source_is_not_stale() {
        let temp = TempDir::new().unwrap();
        let (src, dst) = pair(&temp);
        set_file_mtime(&src, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        set_file_mtime(&dst, FileTime::from_unix_time(1_000_100, 0)).unwrap();
        assert!(!needs_update(&src, &dst).unwrap());
    }

    #[test]
    fn copy_if_stale_creates_parents_then_skips() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("amc.h");
        fs::write(&src, "#pragma once\n").unwrap();
        let dst = temp.path().join("usr/include/kernel/amc.h");

        assert!(copy_if_stale(&src, &dst).unwrap());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "#pragma once\n");
        assert!(!copy_if_stale(&src, &dst).unwrap());
    }
}
