//! Host-specific ways of formatting a raw image and getting files onto it.
//!
//! A [`DiskMountStrategy`] formats the image and hands back a
//! [`MountedVolume`]. The volume must be released exactly once; wrap it in a
//! [`MountGuard`] so that happens on every exit path.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::mtools::{mtools_copy, mtools_mkdir};
use super::DiskGeometry;
use crate::error::BuildError;
use crate::host::{self, HostPlatform};
use crate::process::Cmd;

/// Formats an image and exposes it for writing.
pub trait DiskMountStrategy {
    fn name(&self) -> &'static str;

    /// Host tools the strategy shells out to.
    fn required_tools(&self) -> &'static [&'static str];

    /// Create a FAT filesystem on `image` and make it writable.
    fn format_and_mount(&self, image: &Path, geometry: &DiskGeometry) -> Result<Box<dyn MountedVolume>>;
}

/// A formatted image open for writing. Paths are relative to the volume
/// root, `/`-separated.
pub trait MountedVolume {
    fn create_dir(&mut self, path: &str) -> Result<()>;

    fn copy_file(&mut self, source: &Path, destination: &str) -> Result<()>;

    /// Unmount or detach. Called once.
    fn release(&mut self) -> Result<()>;
}

/// Releases the wrapped volume when dropped, including during unwinding.
/// [`MountGuard::finish`] releases explicitly and reports the error.
pub struct MountGuard {
    volume: Option<Box<dyn MountedVolume>>,
}

impl MountGuard {
    pub fn new(volume: Box<dyn MountedVolume>) -> Self {
        Self {
            volume: Some(volume),
        }
    }

    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        match self.volume.as_mut() {
            Some(volume) => volume.create_dir(path),
            None => bail!("volume already released"),
        }
    }

    pub fn copy_file(&mut self, source: &Path, destination: &str) -> Result<()> {
        match self.volume.as_mut() {
            Some(volume) => volume.copy_file(source, destination),
            None => bail!("volume already released"),
        }
    }

    pub fn finish(mut self) -> Result<()> {
        match self.volume.take() {
            Some(mut volume) => volume.release(),
            None => Ok(()),
        }
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Some(mut volume) = self.volume.take() {
            if let Err(e) = volume.release() {
                warn!("failed to release disk image: {e:#}");
            }
        }
    }
}

/// Pick a strategy by configured name; `auto` follows the host.
pub fn select_strategy(name: &str, host: HostPlatform) -> Result<Box<dyn DiskMountStrategy>> {
    let strategy: Box<dyn DiskMountStrategy> = match (name, host) {
        ("auto", HostPlatform::MacOs) | ("hdiutil", _) => Box::new(HdiutilAttach),
        ("auto", HostPlatform::Linux) | ("loopback", _) => Box::new(LoopbackMount),
        ("auto", HostPlatform::Other) | ("mtools", _) => Box::new(MtoolsOnly),
        (other, _) => bail!("unknown disk mount strategy '{other}' (expected auto, loopback, hdiutil or mtools)"),
    };
    Ok(strategy)
}

/// `sudo <program>` unless we are already root.
fn privileged(program: &str) -> Cmd {
    if host::needs_sudo() {
        Cmd::new("sudo").arg(program)
    } else {
        Cmd::new(program)
    }
}

fn mkfs_vfat(strategy: &'static str, image: &Path) -> Result<()> {
    Cmd::new("mkfs.vfat")
        .arg_path(image)
        .run()
        .map_err(|e| format_failure(strategy, e))?;
    Ok(())
}

fn format_failure(strategy: &'static str, e: anyhow::Error) -> BuildError {
    BuildError::MountFailure {
        strategy,
        reason: format!("formatting failed: {e:#}"),
    }
}

/// Linux: format with `mkfs.vfat`, then loop-mount with `mount -o loop`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackMount;

impl DiskMountStrategy for LoopbackMount {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["mkfs.vfat", "mount", "umount"]
    }

    fn format_and_mount(&self, image: &Path, _geometry: &DiskGeometry) -> Result<Box<dyn MountedVolume>> {
        mkfs_vfat(self.name(), image)?;

        let mount_point = std::env::temp_dir().join(format!("axle-image-{}", std::process::id()));
        fs::create_dir_all(&mount_point)
            .with_context(|| format!("Failed to create {}", mount_point.display()))?;
        let mounted = privileged("mount")
            .args(["-o", "loop"])
            .arg_path(image)
            .arg_path(&mount_point)
            .run();
        if let Err(e) = mounted {
            let _ = fs::remove_dir(&mount_point);
            return Err(BuildError::MountFailure {
                strategy: self.name(),
                reason: format!("{e:#}"),
            }
            .into());
        }
        info!("mounted {} at {}", image.display(), mount_point.display());
        Ok(Box::new(LoopbackVolume { mount_point }))
    }
}

struct LoopbackVolume {
    mount_point: PathBuf,
}

impl MountedVolume for LoopbackVolume {
    fn create_dir(&mut self, path: &str) -> Result<()> {
        privileged("mkdir")
            .arg("-p")
            .arg_path(&self.mount_point.join(path))
            .error_msg(&format!("Failed to create /{path} on the image"))
            .run()?;
        Ok(())
    }

    fn copy_file(&mut self, source: &Path, destination: &str) -> Result<()> {
        privileged("cp")
            .arg_path(source)
            .arg_path(&self.mount_point.join(destination))
            .error_msg(&format!("Failed to copy {} to the image", source.display()))
            .run()?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        privileged("umount")
            .arg_path(&self.mount_point)
            .run()
            .map_err(|e| BuildError::MountFailure {
                strategy: "loopback",
                reason: format!("{e:#}"),
            })?;
        let _ = fs::remove_dir(&self.mount_point);
        Ok(())
    }
}

/// macOS: attach the raw image as a device without mounting, format it with
/// `newfs_msdos`, write with mtools and detach afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct HdiutilAttach;

impl DiskMountStrategy for HdiutilAttach {
    fn name(&self) -> &'static str {
        "hdiutil"
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["hdiutil", "newfs_msdos", "mmd", "mcopy"]
    }

    fn format_and_mount(&self, image: &Path, geometry: &DiskGeometry) -> Result<Box<dyn MountedVolume>> {
        let attached = Cmd::new("hdiutil")
            .args([
                "attach",
                "-imagekey",
                "diskimage-class=CRawDiskImage",
                "-nomount",
            ])
            .arg_path(image)
            .run_capturing()
            .map_err(|e| BuildError::MountFailure {
                strategy: self.name(),
                reason: format!("{e:#}"),
            })?;
        let device = parse_attached_device(attached.text()).ok_or_else(|| {
            BuildError::MountFailure {
                strategy: self.name(),
                reason: format!("no device in hdiutil output: {:?}", attached.text()),
            }
        })?;
        info!("attached {} as {device}", image.display());

        let mut volume = HdiutilVolume {
            image: image.to_path_buf(),
            device,
        };
        let formatted = Cmd::new("newfs_msdos")
            .args(["-F", "32", "-S"])
            .arg(geometry.sector_size.to_string())
            .arg("-s")
            .arg(geometry.sector_count.to_string())
            .arg(&volume.device)
            .run();
        if let Err(e) = formatted {
            let _ = volume.release();
            return Err(format_failure(self.name(), e).into());
        }
        Ok(Box::new(volume))
    }
}

/// The device node `hdiutil attach` prints, e.g. `/dev/disk4`.
pub fn parse_attached_device(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find(|token| token.starts_with("/dev/"))
        .map(str::to_string)
}

struct HdiutilVolume {
    image: PathBuf,
    device: String,
}

impl MountedVolume for HdiutilVolume {
    fn create_dir(&mut self, path: &str) -> Result<()> {
        mtools_mkdir(&self.image, path)
    }

    fn copy_file(&mut self, source: &Path, destination: &str) -> Result<()> {
        mtools_copy(&self.image, source, destination)
    }

    fn release(&mut self) -> Result<()> {
        Cmd::new("hdiutil")
            .arg("detach")
            .arg(&self.device)
            .run()
            .map_err(|e| BuildError::MountFailure {
                strategy: "hdiutil",
                reason: format!("{e:#}"),
            })?;
        Ok(())
    }
}

/// Format with `mkfs.vfat` and write with mtools. Needs no privileges and
/// nothing to release.
#[derive(Debug, Clone, Copy, Default)]
pub struct MtoolsOnly;

impl DiskMountStrategy for MtoolsOnly {
    fn name(&self) -> &'static str {
        "mtools"
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["mkfs.vfat", "mmd", "mcopy"]
    }

    fn format_and_mount(&self, image: &Path, _geometry: &DiskGeometry) -> Result<Box<dyn MountedVolume>> {
        mkfs_vfat(self.name(), image)?;
        Ok(Box::new(MtoolsVolume {
            image: image.to_path_buf(),
        }))
    }
}

struct MtoolsVolume {
    image: PathBuf,
}

impl MountedVolume for MtoolsVolume {
    fn create_dir(&mut self, path: &str) -> Result<()> {
        mtools_mkdir(&self.image, path)
    }

    fn copy_file(&mut self, source: &Path, destination: &str) -> Result<()> {
        mtools_copy(&self.image, source, destination)
    }

    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingVolume {
        releases: Rc<Cell<usize>>,
    }

    impl MountedVolume for CountingVolume {
        fn create_dir(&mut self, _path: &str) -> Result<()> {
            Ok(())
        }

        fn copy_file(&mut self, _source: &Path, _destination: &str) -> Result<()> {
            bail!("disk full")
        }

        fn release(&mut self) -> Result<()> {
            self.releases.set(self.releases.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn guard_releases_on_drop() {
        let releases = Rc::new(Cell::new(0));
        {
            let mut guard = MountGuard::new(Box::new(CountingVolume {
                releases: releases.clone(),
            }));
            assert!(guard.copy_file(Path::new("/x"), "x").is_err());
        }
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn finish_releases_once() {
        let releases = Rc::new(Cell::new(0));
        let guard = MountGuard::new(Box::new(CountingVolume {
            releases: releases.clone(),
        }));
        guard.finish().unwrap();
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn failed_format_is_a_mount_failure() {
        let temp = tempfile::TempDir::new().unwrap();
        let image = temp.path().join("missing-dir/axle.iso");
        let geometry = DiskGeometry {
            sector_size: 512,
            sector_count: 2048,
        };
        let err = match MtoolsOnly.format_and_mount(&image, &geometry) {
            Ok(_) => panic!("formatting a nonexistent image succeeded"),
            Err(e) => e,
        };
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MountFailure {
                strategy: "mtools",
                ..
            })
        ));
    }

    #[test]
    fn parses_hdiutil_device() {
        let output = "/dev/disk4          \t\n";
        assert_eq!(parse_attached_device(output).as_deref(), Some("/dev/disk4"));
        assert_eq!(parse_attached_device("hdiutil: attach failed\n"), None);
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(select_strategy("auto", HostPlatform::Linux).unwrap().name(), "loopback");
        assert_eq!(select_strategy("auto", HostPlatform::MacOs).unwrap().name(), "hdiutil");
        assert_eq!(select_strategy("mtools", HostPlatform::MacOs).unwrap().name(), "mtools");
        assert!(select_strategy("floppy", HostPlatform::Linux).is_err());
    }
}
