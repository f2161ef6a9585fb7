//! Kernel-side build steps: bootloader, Rust kernel libraries, the AP
//! bootstrap blob and the final kernel link.
//!
//! Each step shells out to the build system that owns the sources; this
//! module only decides the arguments and environment.
//!
//! ```rust,ignore
//! use axle_builder::build::kernel::{build_bootloader, build_kernel_libs};
//!
//! build_bootloader(&ctx)?;
//! build_kernel_libs(&ctx)?;
//! ```

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::build::arch::variant_path;
use crate::build::context::BuildContext;
use crate::build::staleness::copy_if_stale;
use crate::config::target_dir_name;
use crate::error::BuildError;
use crate::process::Cmd;

/// Build the UEFI bootloader with its own makefile.
pub fn build_bootloader(ctx: &BuildContext) -> Result<()> {
    let dir = ctx.bootloader_dir();
    if !dir.join("Makefile").exists() {
        bail!("No Makefile in bootloader directory {}", dir.display());
    }

    let mut make = Cmd::new("make").dir(&dir).error_msg("Bootloader build failed");
    if !ctx.host.is_macos() {
        // The clang UEFI flow only works on macOS hosts.
        make = make.env("USE_GCC", "1");
    }
    make.run()?;

    let binary = ctx.bootloader_binary();
    if !binary.exists() {
        return Err(BuildError::MissingArtifact {
            what: "bootloader binary".to_string(),
            path: binary,
        }
        .into());
    }
    Ok(())
}

/// Cargo invocation for one kernel library crate.
pub fn kernel_lib_command(ctx: &BuildContext, crate_dir: &Path) -> Cmd {
    let target = resolve_target(ctx, &ctx.config.kernel.libs_target);
    let cc = ctx
        .resolve(&ctx.config.paths.toolchain)
        .join(&ctx.config.kernel.cross_cc);
    Cmd::new("cargo")
        .args(["build", "--release", "--target"])
        .arg(&target)
        .args(["-Z", "build-std=core,alloc"])
        .dir(crate_dir)
        .env("CC", &cc)
        .prepend_path(&ctx.toolchain_bin())
}

/// Build every crate under the kernel libraries directory and stage its
/// static library where the kernel link expects it. Returns the staged
/// library paths.
pub fn build_kernel_libs(ctx: &BuildContext) -> Result<Vec<PathBuf>> {
    let root = ctx.kernel_libs_root();
    if !root.is_dir() {
        warn!("no kernel libraries at {}", root.display());
        return Ok(Vec::new());
    }

    let output_dir = ctx.resolve(&ctx.config.kernel.libs_output);
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let target_name = target_dir_name(&ctx.config.kernel.libs_target);

    let mut staged = Vec::new();
    for crate_dir in cargo_crates(&root)? {
        let name = file_name(&crate_dir);
        info!("Building kernel library {name}");
        kernel_lib_command(ctx, &crate_dir)
            .error_msg(&format!("Kernel library {name} failed to build"))
            .run()?;

        let lib_name = format!("lib{}.a", name.replace('-', "_"));
        let built = crate_dir
            .join("target")
            .join(&target_name)
            .join("release")
            .join(&lib_name);
        if !built.exists() {
            return Err(BuildError::MissingArtifact {
                what: format!("static library for {name}"),
                path: built,
            }
            .into());
        }
        let destination = output_dir.join(&lib_name);
        copy_if_stale(&built, &destination)?;
        staged.push(destination);
    }
    Ok(staged)
}

/// `nasm -f bin` the arch variant of the AP bootstrap.
pub fn build_ap_bootstrap(ctx: &BuildContext) -> Result<PathBuf> {
    let source = variant_path(
        &ctx.resolve(&ctx.config.kernel.ap_bootstrap_source),
        &ctx.config.arch,
    );
    if !source.exists() {
        return Err(BuildError::MissingArtifact {
            what: "AP bootstrap source".to_string(),
            path: source,
        }
        .into());
    }
    let output = ctx.ap_bootstrap_output();
    Cmd::new("nasm")
        .args(["-f", "bin"])
        .arg_path(&source)
        .arg("-o")
        .arg_path(&output)
        .error_msg("AP bootstrap assembly failed")
        .run()?;
    Ok(output)
}

/// Compile the C and assembly parts of the kernel and link them with the
/// Rust libraries.
pub fn link_kernel(ctx: &BuildContext) -> Result<PathBuf> {
    Cmd::new("make")
        .dir(&ctx.repo_root)
        .prepend_path(&ctx.toolchain_bin())
        .error_msg("Kernel build failed")
        .run()?;

    let kernel = ctx.kernel_binary();
    if !kernel.exists() {
        return Err(BuildError::MissingArtifact {
            what: "kernel binary".to_string(),
            path: kernel,
        }
        .into());
    }
    Ok(kernel)
}

/// A `.json` target spec is resolved against the repository root; a plain
/// triple is passed through.
fn resolve_target(ctx: &BuildContext, target: &str) -> PathBuf {
    if target.ends_with(".json") {
        ctx.resolve(Path::new(target))
    } else {
        PathBuf::from(target)
    }
}

/// Immediate subdirectories of `root` containing a `Cargo.toml`, sorted.
pub(crate) fn cargo_crates(root: &Path) -> Result<Vec<PathBuf>> {
    let mut crates = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("Failed to read {}", root.display()))? {
        let path = entry?.path();
        if path.is_dir() && path.join("Cargo.toml").is_file() {
            crates.push(path);
        }
    }
    crates.sort();
    Ok(crates)
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
