//! Cargo workspace of userspace components.
//!
//! The whole workspace is built in one `cargo build` against the custom
//! target spec; every member that produced a binary is then copied into the
//! staged root's applications directory.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::build::context::BuildContext;
use crate::build::kernel::file_name;
use crate::build::staleness::copy_if_stale;
use crate::config::target_dir_name;
use crate::process::Cmd;

/// `cargo build` for the components workspace.
pub fn cargo_build_command(ctx: &BuildContext) -> Cmd {
    let components = &ctx.config.components;
    Cmd::new("cargo")
        .args(["build", "--release"])
        .arg(format!(
            "--target={}",
            ctx.resolve(Path::new(&components.target_spec)).display()
        ))
        .args(&components.extra_cargo_args)
        .dir(&ctx.rust_programs_root())
        .env("RUSTFLAGS", &components.rustflags)
        .prepend_path(&ctx.toolchain_bin())
}

/// Format and build the workspace, then stage its binaries. Returns the
/// staged binary paths.
pub fn build_components(ctx: &BuildContext) -> Result<Vec<PathBuf>> {
    println!("=== Building Cargo components ===");
    let workspace = ctx.rust_programs_root();

    Cmd::new("cargo")
        .arg("fmt")
        .dir(&workspace)
        .error_msg("cargo fmt failed")
        .run()?;
    cargo_build_command(ctx)
        .error_msg("Component workspace build failed")
        .run()?;

    let release = workspace
        .join("target")
        .join(target_dir_name(&ctx.config.components.target_spec))
        .join("release");
    stage_binaries(&workspace, &release, &ctx.applications_dir())
}

/// Copy `<release>/<member>` into `applications` for every top-level
/// directory of `workspace` that has a matching binary.
pub fn stage_binaries(workspace: &Path, release: &Path, applications: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(applications)
        .with_context(|| format!("Failed to create {}", applications.display()))?;

    let mut members: Vec<PathBuf> = fs::read_dir(workspace)
        .with_context(|| format!("Failed to read {}", workspace.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    members.sort();

    let mut staged = Vec::new();
    for member in members {
        let name = file_name(&member);
        let binary = release.join(&name);
        if !binary.is_file() {
            continue;
        }
        let destination = applications.join(&name);
        if copy_if_stale(&binary, &destination)? {
            info!("Moving build result to sysroot: {}", binary.display());
        }
        staged.push(destination);
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use tempfile::TempDir;

    #[test]
    fn build_command_uses_target_spec_and_unstable_flags() {
        let ctx = BuildContext::new(PathBuf::from("/src/axle"), BuildConfig::default());
        let argv = cargo_build_command(&ctx).argv();
        assert_eq!(
            argv,
            [
                "cargo",
                "build",
                "--release",
                "--target=/src/axle/rust_programs/x86_64-unknown-axle.json",
                "-Z",
                "features=host_dep",
            ]
        );
    }

    #[test]
    fn only_members_with_binaries_are_staged() {
        let temp = TempDir::new().unwrap();
        let workspace = temp.path().join("rust_programs");
        let release = workspace.join("target/x86_64-unknown-axle/release");
        fs::create_dir_all(&release).unwrap();
        for member in ["initrd_fs", "libutils", "file_browser"] {
            fs::create_dir_all(workspace.join(member)).unwrap();
        }
        fs::write(release.join("initrd_fs"), b"\x7fELF").unwrap();
        fs::write(release.join("file_browser"), b"\x7fELF").unwrap();

        let apps = temp.path().join("sysroot/usr/applications");
        let staged = stage_binaries(&workspace, &release, &apps).unwrap();

        assert_eq!(staged, [apps.join("file_browser"), apps.join("initrd_fs")]);
        assert!(!apps.join("libutils").exists());
    }
}
