//! Staged root (sysroot) layout and the plain-copy stages that fill it.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::build::staleness::copy_if_stale;
use crate::config::HeaderCopy;

/// Platform metadata that never belongs in the image.
const IGNORED_FILE_NAMES: &[&str] = &[".DS_Store"];

/// Create the staged root's directory skeleton.
///
/// ```rust,ignore
/// use axle_builder::build::filesystem::create_sysroot_dirs;
///
/// create_sysroot_dirs(&ctx.sysroot())?;
/// ```
pub fn create_sysroot_dirs(root: &Path) -> Result<()> {
    for dir in ["usr/include", "usr/applications", "usr/lib"] {
        let path = root.join(dir);
        if !path.exists() {
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
        }
    }
    Ok(())
}

/// Mirror the distribution overlay into the staged root, copying only files
/// that are missing or stale. Returns the number of files copied.
pub fn overlay_dist_tree(dist: &Path, root: &Path) -> Result<usize> {
    if !dist.is_dir() {
        debug!("no distribution overlay at {}", dist.display());
        return Ok(0);
    }

    let mut copied = 0;
    for entry in WalkDir::new(dist).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dist.display()))?;
        let name = entry.file_name().to_string_lossy();
        if IGNORED_FILE_NAMES.contains(&name.as_ref()) {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(dist)
            .context("overlay entry outside its root")?;
        let target = root.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if copy_if_stale(entry.path(), &target)? {
            info!("Copying {} to {}", entry.path().display(), target.display());
            copied += 1;
        }
    }
    Ok(copied)
}

/// Copy the fixed list of headers other units include before any Meson
/// subproject has installed them. Sources are relative to `repo_root`,
/// destinations to the staged root. A directory source is mirrored
/// recursively.
pub fn stage_static_headers(repo_root: &Path, root: &Path, headers: &[HeaderCopy]) -> Result<usize> {
    let mut copied = 0;
    for header in headers {
        let source = repo_root.join(&header.source);
        let destination = root.join(&header.destination);
        if source.is_dir() {
            copied += mirror_dir(&source, &destination)?;
        } else if copy_if_stale(&source, &destination)? {
            info!(
                "Copying header {} to {}",
                source.display(),
                destination.display()
            );
            copied += 1;
        }
    }
    Ok(copied)
}

fn mirror_dir(source: &Path, destination: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(source) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(source)?;
        if copy_if_stale(entry.path(), &destination.join(relative))? {
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_sysroot_dirs() {
        let temp = TempDir::new().unwrap();
        create_sysroot_dirs(temp.path()).unwrap();

        assert!(temp.path().join("usr/include").is_dir());
        assert!(temp.path().join("usr/applications").is_dir());
        assert!(temp.path().join("usr/lib").is_dir());
    }

    #[test]
    fn overlay_skips_platform_metadata() {
        let temp = TempDir::new().unwrap();
        let dist = temp.path().join("os_dist");
        let root = temp.path().join("sysroot");
        fs::create_dir_all(dist.join("config/fonts")).unwrap();
        fs::write(dist.join("config/fonts/8x8.bin"), [0u8; 8]).unwrap();
        fs::write(dist.join("config/.DS_Store"), "junk").unwrap();
        fs::write(dist.join("motd"), "hello").unwrap();

        assert_eq!(overlay_dist_tree(&dist, &root).unwrap(), 2);
        assert!(root.join("config/fonts/8x8.bin").is_file());
        assert!(root.join("motd").is_file());
        assert!(!root.join("config/.DS_Store").exists());

        assert_eq!(overlay_dist_tree(&dist, &root).unwrap(), 0);
    }

    #[test]
    fn missing_overlay_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        assert_eq!(
            overlay_dist_tree(&temp.path().join("none"), temp.path()).unwrap(),
            0
        );
    }

    #[test]
    fn static_headers_copy_files_and_directories() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        let root = temp.path().join("sysroot");
        fs::create_dir_all(repo.join("kernel/util/amc")).unwrap();
        fs::write(repo.join("kernel/util/amc/amc.h"), "amc").unwrap();
        fs::create_dir_all(repo.join("libc/include/sys")).unwrap();
        fs::write(repo.join("libc/include/sys/types.h"), "types").unwrap();

        let headers = vec![
            HeaderCopy {
                source: "kernel/util/amc/amc.h".into(),
                destination: "usr/include/kernel/amc.h".into(),
            },
            HeaderCopy {
                source: "libc/include".into(),
                destination: "usr/include".into(),
            },
        ];
        assert_eq!(stage_static_headers(&repo, &root, &headers).unwrap(), 2);
        assert_eq!(
            fs::read_to_string(root.join("usr/include/kernel/amc.h")).unwrap(),
            "amc"
        );
        assert!(root.join("usr/include/sys/types.h").is_file());
        assert_eq!(stage_static_headers(&repo, &root, &headers).unwrap(), 0);
    }
}
