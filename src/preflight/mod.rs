//! Preflight checks for build validation.
//!
//! Validates that the host has every tool the selected stages will invoke
//! before the first one runs, so a missing `nasm` is reported up front
//! instead of after the bootloader has been rebuilt.
//!
//! # Example
//!
//! ```rust,ignore
//! use axle_builder::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("mcopy") {
//!     println!("mtools not installed");
//! }
//!
//! check_required_tools(&[("meson", "meson"), ("nasm", "nasm")])?;
//! ```

use anyhow::{bail, Result};

use crate::artifact::disk::DiskMountStrategy;
use crate::host;

/// Check if a command exists on the host system.
///
/// Also looks in the directories that child processes get prepended to
/// `PATH`, so tools from Homebrew on Apple silicon are found.
pub fn command_exists(cmd: &str) -> bool {
    if which::which(cmd).is_ok() {
        return true;
    }
    host::default_path_prefixes()
        .iter()
        .any(|dir| which::which_in(cmd, Some(dir), dir).is_ok())
}

/// Tools every build invokes. Each tuple is (command_name, package_name).
pub const BUILD_TOOLS: &[(&str, &str)] = &[
    ("make", "make"),
    ("nasm", "nasm"),
    ("meson", "meson"),
    ("ninja", "ninja"),
    ("cargo", "rustup"),
];

/// Package that provides a disk tool, for the error message.
fn package_for(tool: &str) -> &'static str {
    match tool {
        "mkfs.vfat" => "dosfstools",
        "mmd" | "mcopy" => "mtools",
        "mount" | "umount" => "util-linux",
        "hdiutil" | "newfs_msdos" => "macOS base system",
        _ => "unknown",
    }
}

/// Tools needed to build everything and write the image with `strategy`.
pub fn build_tools(strategy: &dyn DiskMountStrategy) -> Vec<(&'static str, &'static str)> {
    let mut tools = BUILD_TOOLS.to_vec();
    tools.extend(
        strategy
            .required_tools()
            .iter()
            .map(|tool| (*tool, package_for(tool))),
    );
    tools
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::disk::mount::{HdiutilAttach, LoopbackMount};

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure_lists_packages() {
        let err = check_required_tools(&[("sh", "dash"), ("nonexistent_command_xyz", "fake-package")])
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nonexistent_command_xyz (install: fake-package)"));
        assert!(!msg.contains("dash"));
    }

    #[test]
    fn strategy_tools_are_included() {
        let linux = build_tools(&LoopbackMount);
        assert!(linux.contains(&("mkfs.vfat", "dosfstools")));
        assert!(linux.contains(&("nasm", "nasm")));

        let mac = build_tools(&HdiutilAttach);
        assert!(mac.contains(&("mcopy", "mtools")));
        assert!(!mac.iter().any(|(tool, _)| *tool == "mkfs.vfat"));
    }
}
