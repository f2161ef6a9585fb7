//! Architecture-specific source staging.
//!
//! Files that differ per architecture are kept next to their canonical name
//! as `<name>.<arch>.arch_specific`. Before the kernel build, the active
//! architecture's variant is copied over the canonical name so the
//! makefiles never have to know about the convention.

use anyhow::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::build::staleness::copy_if_stale;
use crate::error::BuildError;

/// A source file with one variant per architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchSpecificFile {
    pub canonical: PathBuf,
}

impl ArchSpecificFile {
    pub fn new(canonical: impl Into<PathBuf>) -> Self {
        Self {
            canonical: canonical.into(),
        }
    }

    /// `<canonical>.<arch>.arch_specific`
    pub fn variant(&self, arch: &str) -> PathBuf {
        variant_path(&self.canonical, arch)
    }
}

pub fn variant_path(canonical: &Path, arch: &str) -> PathBuf {
    let mut name = OsString::from(canonical.as_os_str());
    name.push(format!(".{arch}.arch_specific"));
    PathBuf::from(name)
}

/// Stage the `arch` variant of every file in `files` (relative to `root`).
///
/// Returns the number of files copied; a rerun with nothing changed copies
/// nothing. A missing variant is fatal.
pub fn stage_arch_specific(root: &Path, files: &[ArchSpecificFile], arch: &str) -> Result<usize> {
    let mut copied = 0;
    for file in files {
        let canonical = root.join(&file.canonical);
        let variant = root.join(file.variant(arch));
        if !variant.is_file() {
            return Err(BuildError::MissingArchVariant { canonical, variant }.into());
        }
        if copy_if_stale(&variant, &canonical)? {
            debug!("{} -> {}", variant.display(), canonical.display());
            copied += 1;
        }
    }
    if copied > 0 {
        info!("staged {copied} {arch} source file(s)");
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn files() -> Vec<ArchSpecificFile> {
        vec![
            ArchSpecificFile::new("boot/boot.s"),
            ArchSpecificFile::new("kernel/vmm/vmm.h"),
        ]
    }

    fn seed(root: &Path) {
        for file in files() {
            let variant = root.join(file.variant("x86_64"));
            fs::create_dir_all(variant.parent().unwrap()).unwrap();
            fs::write(&variant, format!("x86_64 {}", file.canonical.display())).unwrap();
        }
    }

    #[test]
    fn variant_appends_arch_suffix() {
        assert_eq!(
            ArchSpecificFile::new("kernel/vmm/vmm.c").variant("x86_64"),
            PathBuf::from("kernel/vmm/vmm.c.x86_64.arch_specific")
        );
    }

    #[test]
    fn staging_is_idempotent() {
        let temp = TempDir::new().unwrap();
        seed(temp.path());

        assert_eq!(stage_arch_specific(temp.path(), &files(), "x86_64").unwrap(), 2);
        assert_eq!(
            fs::read_to_string(temp.path().join("boot/boot.s")).unwrap(),
            "x86_64 boot/boot.s"
        );
        assert_eq!(stage_arch_specific(temp.path(), &files(), "x86_64").unwrap(), 0);
    }

    #[test]
    fn missing_variant_is_fatal() {
        let temp = TempDir::new().unwrap();
        seed(temp.path());
        let err = stage_arch_specific(temp.path(), &files(), "aarch64").unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::MissingArchVariant { variant, .. }) => {
                assert!(variant.ends_with("boot/boot.s.aarch64.arch_specific"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
