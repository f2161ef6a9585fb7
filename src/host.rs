//! Host platform detection.
//!
//! The pipeline only distinguishes the facilities it actually needs: how disk
//! images get mounted, which accelerator the emulator can use, and where
//! package managers put tools on the search path.

use std::path::PathBuf;

use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    MacOs,
    Linux,
    Other,
}

impl HostPlatform {
    pub fn detect() -> Self {
        match std::env::consts::OS {
            "macos" => Self::MacOs,
            "linux" => Self::Linux,
            _ => Self::Other,
        }
    }

    pub fn is_macos(self) -> bool {
        self == Self::MacOs
    }
}

/// Are we running as a native arm64 process (e.g. Apple silicon without
/// Rosetta)?
pub fn is_arm64_process() -> bool {
    std::env::consts::ARCH == "aarch64"
}

/// Directories that are always put in front of `PATH` for child processes.
///
/// Homebrew on Apple silicon installs outside the default search path, and
/// the cross toolchains and mtools usually come from there.
pub fn default_path_prefixes() -> Vec<PathBuf> {
    if HostPlatform::detect().is_macos() && is_arm64_process() {
        vec![PathBuf::from("/opt/homebrew/bin")]
    } else {
        Vec::new()
    }
}

/// Whether privileged commands must be prefixed with `sudo`. An unknown
/// user id counts as unprivileged.
pub fn needs_sudo() -> bool {
    effective_uid() != Some(0)
}

/// Effective user id as reported by `id -u`.
pub fn effective_uid() -> Option<u32> {
    let output = Cmd::new("id")
        .arg("-u")
        .quiet()
        .allow_fail()
        .run_capturing()
        .ok()?;
    if !output.success() {
        return None;
    }
    output.text().trim().parse().ok()
}
