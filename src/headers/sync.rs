//! Copy every subproject's installed headers into the staged root before any
//! subproject is configured.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use super::cache::RebuildCache;
use super::meson::{BuildDescription, MesonDescription};
use crate::build::staleness::copy_if_stale;
use crate::error::BuildError;

/// Directory under the programs root holding Meson subprojects.
pub const SUBPROJECTS_DIR: &str = "subprojects";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeaderSyncReport {
    pub extracted: usize,
    pub skipped: usize,
    pub copied: usize,
}

/// Walk the `subproject()` calls of `<programs_root>/meson.build`, re-extract
/// header installs for subprojects that changed since `cache` last saw them,
/// and copy those headers into `staged_root`.
///
/// The caller saves `cache` once the pass has finished.
pub fn sync_subproject_headers(
    programs_root: &Path,
    staged_root: &Path,
    cache: &mut RebuildCache,
) -> Result<HeaderSyncReport> {
    let root_description = programs_root.join("meson.build");
    if !root_description.is_file() {
        debug!("no {}, skipping header sync", root_description.display());
        return Ok(HeaderSyncReport::default());
    }
    let root = MesonDescription::load(&root_description)?;

    let mut report = HeaderSyncReport::default();
    for name in root.subproject_names() {
        let dir = programs_root.join(SUBPROJECTS_DIR).join(&name);
        if !dir.is_dir() {
            return Err(BuildError::MissingArtifact {
                what: format!("subproject '{name}'"),
                path: dir,
            }
            .into());
        }
        if !cache.needs_refresh(&dir)? {
            report.skipped += 1;
            continue;
        }

        let description = dir.join("meson.build");
        let mappings = if description.is_file() {
            MesonDescription::load(&description)?
                .list_header_installations()
                .with_context(|| format!("Extracting headers of subproject '{name}'"))?
        } else {
            Vec::new()
        };
        for mapping in &mappings {
            let destination = staged_root.join(&mapping.destination);
            if copy_if_stale(&mapping.source, &destination)? {
                info!(
                    "Copying {} to {}",
                    mapping.source.display(),
                    destination.display()
                );
                report.copied += 1;
            }
        }
        cache.mark_refreshed(&dir);
        report.extracted += 1;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn fixture(root: &Path) {
        write(
            &root.join("programs/meson.build"),
            "project('programs', 'c')\nsubproject('libamc')\nsubproject('awm')\n",
        );
        write(
            &root.join("programs/subprojects/libamc/meson.build"),
            "hdrs = files('libamc.h')\ninstall_headers(hdrs, subdir: 'libamc')\n",
        );
        write(&root.join("programs/subprojects/libamc/libamc.h"), "// amc\n");
        write(
            &root.join("programs/subprojects/awm/meson.build"),
            "install_headers('awm_messages.h', install_dir: '/usr/include/awm')\n",
        );
        write(&root.join("programs/subprojects/awm/awm_messages.h"), "// awm\n");
    }

    #[test]
    fn copies_headers_then_skips_unchanged() {
        let temp = TempDir::new().unwrap();
        fixture(temp.path());
        let programs = temp.path().join("programs");
        let sysroot = temp.path().join("sysroot");
        let mut cache = RebuildCache::load(&temp.path().join("cache.json")).unwrap();

        let first = sync_subproject_headers(&programs, &sysroot, &mut cache).unwrap();
        assert_eq!(
            first,
            HeaderSyncReport {
                extracted: 2,
                skipped: 0,
                copied: 2
            }
        );
        assert!(sysroot.join("usr/include/libamc/libamc.h").is_file());
        assert!(sysroot.join("usr/include/awm/awm_messages.h").is_file());

        let second = sync_subproject_headers(&programs, &sysroot, &mut cache).unwrap();
        assert_eq!(second.skipped, 2);
        assert_eq!(second.extracted, 0);
    }

    #[test]
    fn missing_subproject_is_reported() {
        let temp = TempDir::new().unwrap();
        write(
            &temp.path().join("programs/meson.build"),
            "subproject('ghost')\n",
        );
        let mut cache = RebuildCache::load(&temp.path().join("cache.json")).unwrap();
        let err = sync_subproject_headers(
            &temp.path().join("programs"),
            &temp.path().join("sysroot"),
            &mut cache,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn no_root_description_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let mut cache = RebuildCache::load(&temp.path().join("cache.json")).unwrap();
        let report =
            sync_subproject_headers(temp.path(), &temp.path().join("sysroot"), &mut cache).unwrap();
        assert_eq!(report, HeaderSyncReport::default());
    }
}
