//! Userspace programs built with Meson.
//!
//! Every directory under the programs root is an independent Meson project.
//! Configuration (`meson setup`) runs once per unit, synchronously; compile
//! and install then fan out over a [`WorkerPool`].

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::build::context::BuildContext;
use crate::build::kernel::file_name;
use crate::build::pool::{FailurePolicy, PoolReport, Task, WorkerPool};
use crate::build::staleness::needs_update;
use crate::error::BuildError;
use crate::process::Cmd;

/// Name of the per-unit Meson build directory.
pub const BUILD_DIR: &str = "build";

/// Which programs to rebuild, and how hard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramBuildPolicy {
    /// Skip units with no file accessed within `recent_window`.
    pub only_recently_updated: bool,
    /// Wipe and rebuild exactly these units. When non-empty, no other unit
    /// is considered.
    pub force_rebuild: Vec<String>,
    /// Wipe and rebuild every unit.
    pub force_rebuild_all: bool,
    pub recent_window: Duration,
}

impl Default for ProgramBuildPolicy {
    fn default() -> Self {
        Self {
            only_recently_updated: false,
            force_rebuild: Vec::new(),
            force_rebuild_all: false,
            recent_window: Duration::from_secs(180),
        }
    }
}

impl ProgramBuildPolicy {
    fn is_forced(&self, name: &str) -> bool {
        self.force_rebuild_all || self.force_rebuild.iter().any(|n| n == name)
    }
}

/// One Meson project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDir {
    pub name: String,
    pub path: PathBuf,
}

impl ProgramDir {
    pub fn new(path: PathBuf) -> Self {
        Self {
            name: file_name(&path),
            path,
        }
    }

    pub fn build_dir(&self) -> PathBuf {
        self.path.join(BUILD_DIR)
    }

    pub fn is_configured(&self) -> bool {
        self.build_dir().is_dir()
    }
}

/// Directories under `root`, minus the denylist and hidden entries, sorted.
pub fn enumerate_programs(root: &Path, denylist: &[String]) -> Result<Vec<ProgramDir>> {
    let mut programs = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("Failed to read {}", root.display()))? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let unit = ProgramDir::new(path);
        if unit.name.starts_with('.') || denylist.contains(&unit.name) {
            continue;
        }
        programs.push(unit);
    }
    programs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(programs)
}

/// Apply `policy` to the programs root. Every selected unit must carry a
/// `meson.build`.
pub fn select_programs(
    root: &Path,
    denylist: &[String],
    policy: &ProgramBuildPolicy,
    now: SystemTime,
) -> Result<Vec<ProgramDir>> {
    let candidates = if policy.force_rebuild.is_empty() {
        enumerate_programs(root, denylist)?
    } else {
        policy
            .force_rebuild
            .iter()
            .map(|name| ProgramDir::new(root.join(name)))
            .filter(|unit| !denylist.contains(&unit.name))
            .collect()
    };

    let mut selected = Vec::new();
    for unit in candidates {
        if !unit.path.is_dir() {
            bail!("No such program: {}", unit.path.display());
        }
        if policy.only_recently_updated
            && !policy.is_forced(&unit.name)
            && !recently_accessed(&unit.path, policy.recent_window, now)?
        {
            debug!("{}: not touched recently, skipping", unit.name);
            continue;
        }
        let description = unit.path.join("meson.build");
        if !description.is_file() {
            return Err(BuildError::MissingArtifact {
                what: format!("Meson description for program '{}'", unit.name),
                path: description,
            }
            .into());
        }
        selected.push(unit);
    }
    Ok(selected)
}

/// Whether any source file in `dir` was accessed within `window` of `now`.
/// The Meson build directory is not considered.
pub fn recently_accessed(dir: &Path, window: Duration, now: SystemTime) -> Result<bool> {
    let cutoff = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || e.file_name() != BUILD_DIR);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.metadata()?.accessed()? >= cutoff {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Render the Meson cross file from its template, prefixing a `[constants]`
/// block that names the repository root. Only rewritten when the template
/// changed.
pub fn generate_cross_file(ctx: &BuildContext) -> Result<PathBuf> {
    let template = ctx
        .programs_root()
        .join(&ctx.config.programs.cross_file_template);
    let generated = ctx.generated_cross_file();
    if !template.is_file() {
        return Err(BuildError::MissingArtifact {
            what: "Meson cross file template".to_string(),
            path: template,
        }
        .into());
    }
    if !needs_update(&template, &generated)? {
        return Ok(generated);
    }

    info!("Generating {}", generated.display());
    let body = fs::read_to_string(&template)
        .with_context(|| format!("Failed to read {}", template.display()))?;
    let rendered = format!(
        "[constants]\n{}_repo_root = '{}'\n{}",
        ctx.config.product,
        ctx.repo_root.display(),
        body
    );
    fs::write(&generated, rendered)
        .with_context(|| format!("Failed to write {}", generated.display()))?;
    Ok(generated)
}

/// Parse `meson introspect --installed` output into install destinations.
pub fn parse_installed(json: &str) -> Result<Vec<PathBuf>> {
    let map: BTreeMap<String, String> =
        serde_json::from_str(json).context("Unexpected `meson introspect --installed` output")?;
    Ok(map.into_values().map(PathBuf::from).collect())
}

/// Fail if two units install to the same destination.
pub fn check_disjoint_installs(claims: &[(String, Vec<PathBuf>)]) -> Result<()> {
    let mut owners: BTreeMap<&Path, &str> = BTreeMap::new();
    for (unit, destinations) in claims {
        for destination in destinations {
            if let Some(first) = owners.insert(destination.as_path(), unit.as_str()) {
                if first != unit.as_str() {
                    return Err(BuildError::OverlappingInstall {
                        destination: destination.clone(),
                        first: first.to_string(),
                        second: unit.clone(),
                    }
                    .into());
                }
            }
        }
    }
    Ok(())
}

fn configure(unit: &ProgramDir, cross_file: &Path) -> Result<()> {
    info!("Running one-time Meson configuration in {}", unit.path.display());
    Cmd::new("meson")
        .args(["setup", BUILD_DIR, "--cross-file"])
        .arg_path(cross_file)
        .dir(&unit.path)
        .error_msg(&format!("Configuring {} failed", unit.name))
        .run()?;
    Ok(())
}

fn installed_destinations(unit: &ProgramDir) -> Result<Vec<PathBuf>> {
    let out = Cmd::new("meson")
        .args(["introspect", "--installed", BUILD_DIR])
        .dir(&unit.path)
        .quiet()
        .error_msg(&format!("Introspecting {} failed", unit.name))
        .run_capturing()?;
    parse_installed(out.text())
        .with_context(|| format!("Reading install targets of {}", unit.name))
}

fn compile_and_install(unit: &ProgramDir) -> Result<()> {
    Cmd::new("meson")
        .args(["compile", "-C", BUILD_DIR])
        .dir(&unit.path)
        .error_msg(&format!("Compiling {} failed", unit.name))
        .run()?;
    Cmd::new("meson")
        .args(["install", "-C", BUILD_DIR, "--only-changed"])
        .dir(&unit.path)
        .error_msg(&format!("Installing {} failed", unit.name))
        .run()?;
    Ok(())
}

/// Configure, then compile and install the programs `policy` selects.
pub fn build_programs(ctx: &BuildContext, policy: &ProgramBuildPolicy) -> Result<PoolReport> {
    println!("=== Building Meson programs ===");
    let cross_file = generate_cross_file(ctx)?;
    let units = select_programs(
        &ctx.programs_root(),
        &ctx.config.programs.denylist,
        policy,
        SystemTime::now(),
    )?;
    if units.is_empty() {
        println!("  [SKIP] No programs selected");
        return Ok(PoolReport {
            completed: Vec::new(),
        });
    }

    let mut claims = Vec::with_capacity(units.len());
    for unit in &units {
        if policy.is_forced(&unit.name) && unit.build_dir().exists() {
            info!("Forcing rebuild of {}", unit.name);
            fs::remove_dir_all(unit.build_dir())
                .with_context(|| format!("Failed to wipe {}", unit.build_dir().display()))?;
        }
        if !unit.is_configured() {
            configure(unit, &cross_file)?;
        }
        claims.push((unit.name.clone(), installed_destinations(unit)?));
    }
    check_disjoint_installs(&claims)?;

    let failure_policy = if ctx.config.programs.fail_fast {
        FailurePolicy::FailFast
    } else {
        FailurePolicy::RunToCompletion
    };
    let pool = WorkerPool::new(ctx.config.programs.workers, failure_policy);
    info!("Building {} program(s) on {} workers", units.len(), pool.width());

    let tasks = units
        .iter()
        .map(|unit| Task::new(unit.name.clone(), move || compile_and_install(unit)))
        .collect();
    pool.run(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use filetime::{set_file_atime, FileTime};
    use tempfile::TempDir;

    const NOW: u64 = 1_700_000_000;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(NOW)
    }

    fn program(root: &Path, name: &str, accessed: u64, configured: bool) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("meson.build"), "project('x', 'c')\n").unwrap();
        fs::write(dir.join("main.c"), "int main(void) { return 0; }\n").unwrap();
        for file in ["meson.build", "main.c"] {
            set_file_atime(dir.join(file), FileTime::from_unix_time(accessed as i64, 0)).unwrap();
        }
        if configured {
            fs::create_dir_all(dir.join(BUILD_DIR)).unwrap();
        }
    }

    fn names(units: &[ProgramDir]) -> Vec<&str> {
        units.iter().map(|u| u.name.as_str()).collect()
    }

    fn denylist() -> Vec<String> {
        vec!["vim".to_string()]
    }

    #[test]
    fn enumerate_skips_denylist_and_files() {
        let temp = TempDir::new().unwrap();
        program(temp.path(), "awm", NOW, false);
        program(temp.path(), "vim", NOW, false);
        fs::write(temp.path().join("meson.build"), "").unwrap();

        let units = enumerate_programs(temp.path(), &denylist()).unwrap();
        assert_eq!(names(&units), ["awm"]);
    }

    #[test]
    fn recency_filter_uses_access_window() {
        let temp = TempDir::new().unwrap();
        program(temp.path(), "fresh", NOW - 10, true);
        program(temp.path(), "stale", NOW - 3600, true);

        let policy = ProgramBuildPolicy {
            only_recently_updated: true,
            ..Default::default()
        };
        let units = select_programs(temp.path(), &denylist(), &policy, now()).unwrap();
        assert_eq!(names(&units), ["fresh"]);
    }

    #[test]
    fn unconfigured_stale_units_are_filtered_too() {
        let temp = TempDir::new().unwrap();
        program(temp.path(), "stale_unit", NOW - 3600, false);
        program(temp.path(), "new_program", NOW - 10, false);

        let policy = ProgramBuildPolicy {
            only_recently_updated: true,
            ..Default::default()
        };
        let units = select_programs(temp.path(), &denylist(), &policy, now()).unwrap();
        assert_eq!(names(&units), ["new_program"]);
    }

    #[test]
    fn forced_units_are_the_only_candidates() {
        let temp = TempDir::new().unwrap();
        program(temp.path(), "awm", NOW - 3600, true);
        program(temp.path(), "net", NOW, true);

        let policy = ProgramBuildPolicy {
            only_recently_updated: true,
            force_rebuild: vec!["awm".to_string()],
            ..Default::default()
        };
        let units = select_programs(temp.path(), &denylist(), &policy, now()).unwrap();
        assert_eq!(names(&units), ["awm"]);
    }

    #[test]
    fn force_all_ignores_recency() {
        let temp = TempDir::new().unwrap();
        program(temp.path(), "awm", NOW - 3600, true);
        program(temp.path(), "net", NOW - 3600, true);

        let policy = ProgramBuildPolicy {
            only_recently_updated: true,
            force_rebuild_all: true,
            ..Default::default()
        };
        let units = select_programs(temp.path(), &denylist(), &policy, now()).unwrap();
        assert_eq!(names(&units), ["awm", "net"]);
    }

    #[test]
    fn unit_without_meson_build_is_fatal() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("scratch")).unwrap();
        let err = select_programs(
            temp.path(),
            &denylist(),
            &ProgramBuildPolicy::default(),
            now(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn cross_file_gets_constants_header() {
        let temp = TempDir::new().unwrap();
        let programs = temp.path().join("programs");
        fs::create_dir_all(&programs).unwrap();
        fs::write(
            programs.join("cross_axle_template.ini"),
            "[binaries]\nc = axle_repo_root / 'x86_64-toolchain/bin/x86_64-elf-axle-gcc'\n",
        )
        .unwrap();

        let ctx = BuildContext::new(temp.path().to_path_buf(), BuildConfig::default());
        let generated = generate_cross_file(&ctx).unwrap();
        let text = fs::read_to_string(&generated).unwrap();
        assert!(text.starts_with(&format!(
            "[constants]\naxle_repo_root = '{}'\n[binaries]",
            temp.path().display()
        )));
    }

    #[test]
    fn missing_cross_template_is_reported() {
        let temp = TempDir::new().unwrap();
        let ctx = BuildContext::new(temp.path().to_path_buf(), BuildConfig::default());
        assert!(generate_cross_file(&ctx).is_err());
    }

    #[test]
    fn parses_introspect_output() {
        let json = r#"{
            "/src/programs/awm/build/awm": "/src/axle-sysroot/usr/applications/awm",
            "/src/programs/awm/awm.h": "/src/axle-sysroot/usr/include/awm/awm.h"
        }"#;
        let mut installed = parse_installed(json).unwrap();
        installed.sort();
        assert_eq!(
            installed,
            [
                PathBuf::from("/src/axle-sysroot/usr/applications/awm"),
                PathBuf::from("/src/axle-sysroot/usr/include/awm/awm.h"),
            ]
        );
    }

    #[test]
    fn overlapping_installs_are_rejected() {
        let claims = vec![
            ("awm".to_string(), vec![PathBuf::from("/usr/applications/awm")]),
            ("net".to_string(), vec![PathBuf::from("/usr/applications/net")]),
            ("awm2".to_string(), vec![PathBuf::from("/usr/applications/awm")]),
        ];
        match check_disjoint_installs(&claims)
            .unwrap_err()
            .downcast_ref::<BuildError>()
        {
            Some(BuildError::OverlappingInstall { first, second, .. }) => {
                assert_eq!(first, "awm");
                assert_eq!(second, "awm2");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn disjoint_installs_pass() {
        let claims = vec![
            ("awm".to_string(), vec![PathBuf::from("/usr/applications/awm")]),
            ("net".to_string(), vec![PathBuf::from("/usr/applications/net")]),
        ];
        check_disjoint_installs(&claims).unwrap();
    }
}
