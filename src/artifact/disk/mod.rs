//! Bootable FAT disk image assembly.
//!
//! The image is a single FAT filesystem laid out for UEFI:
//!
//! ```text
//! EFI/BOOT/BOOTX64.EFI
//! EFI/AXLE/KERNEL.ELF
//! EFI/AXLE/FS_SERVER.ELF
//! EFI/AXLE/INITRD.IMG
//! EFI/AXLE/AP_BOOTSTRAP.BIN
//! ```
//!
//! How the filesystem is created and written depends on the host; see
//! [`mount`].

pub mod mount;
pub mod mtools;

pub use mount::{select_strategy, DiskMountStrategy, MountGuard, MountedVolume};

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub sector_size: u64,
    pub sector_count: u64,
}

impl DiskGeometry {
    pub fn bytes(&self) -> u64 {
        self.sector_size * self.sector_count
    }
}

/// Files that go on the image.
#[derive(Debug, Clone)]
pub struct ImageInputs {
    pub bootloader: PathBuf,
    pub kernel: PathBuf,
    pub fs_server: PathBuf,
    pub ramdisk: PathBuf,
    pub ap_bootstrap: PathBuf,
}

impl ImageInputs {
    /// `(what, source, destination on the volume)` for each input.
    fn placements(&self, product_dir: &str) -> Vec<(&'static str, &Path, String)> {
        let bootloader_name = self
            .bootloader
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "BOOTX64.EFI".to_string());
        vec![
            ("bootloader", self.bootloader.as_path(), format!("EFI/BOOT/{bootloader_name}")),
            ("kernel", self.kernel.as_path(), format!("EFI/{product_dir}/KERNEL.ELF")),
            ("file server", self.fs_server.as_path(), format!("EFI/{product_dir}/FS_SERVER.ELF")),
            ("ramdisk", self.ramdisk.as_path(), format!("EFI/{product_dir}/INITRD.IMG")),
            ("AP bootstrap", self.ap_bootstrap.as_path(), format!("EFI/{product_dir}/AP_BOOTSTRAP.BIN")),
        ]
    }

    fn verify(&self) -> Result<()> {
        for (what, path, _) in self.placements("") {
            if !path.is_file() {
                return Err(BuildError::MissingArtifact {
                    what: what.to_string(),
                    path: path.to_path_buf(),
                }
                .into());
            }
        }
        Ok(())
    }
}

pub struct DiskImageAssembler {
    geometry: DiskGeometry,
    product_dir: String,
}

impl DiskImageAssembler {
    /// `product_dir` names the directory under `EFI/` holding the kernel
    /// payload, e.g. `AXLE`.
    pub fn new(geometry: DiskGeometry, product_dir: impl Into<String>) -> Self {
        Self {
            geometry,
            product_dir: product_dir.into(),
        }
    }

    /// Create `image` from scratch and copy `inputs` onto it.
    ///
    /// Every input is checked before anything is written. Once the strategy
    /// has mounted the image it is released on every path out of this
    /// function, including failures and panics.
    pub fn build(
        &self,
        image: &Path,
        inputs: &ImageInputs,
        strategy: &dyn DiskMountStrategy,
    ) -> Result<()> {
        println!("=== Building disk image ===");
        inputs.verify()?;

        if image.exists() {
            fs::remove_file(image)
                .with_context(|| format!("Failed to remove old image {}", image.display()))?;
        }
        if let Some(parent) = image.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(image)
            .with_context(|| format!("Failed to create {}", image.display()))?;
        file.set_len(self.geometry.bytes())?;
        drop(file);
        info!(
            "created {} ({} x {} byte sectors)",
            image.display(),
            self.geometry.sector_count,
            self.geometry.sector_size
        );

        println!("  Formatting with {}...", strategy.name());
        let mut volume = MountGuard::new(strategy.format_and_mount(image, &self.geometry)?);

        for dir in ["EFI".to_string(), "EFI/BOOT".to_string(), format!("EFI/{}", self.product_dir)] {
            volume.create_dir(&dir)?;
        }
        for (what, source, destination) in inputs.placements(&self.product_dir) {
            println!("  {what} -> /{destination}");
            volume
                .copy_file(source, &destination)
                .with_context(|| format!("Failed to copy {what} onto {}", image.display()))?;
        }

        volume.finish()?;
        println!("  Disk image: {}", image.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::collections::BTreeMap;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Writes into an in-memory map instead of a filesystem.
    #[derive(Clone, Default)]
    struct FakeStrategy {
        mounted: Arc<AtomicBool>,
        files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
        dirs: Arc<Mutex<Vec<String>>>,
        fail_on_copy: Option<usize>,
        panic_on_copy: Option<usize>,
    }

    struct FakeVolume {
        strategy: FakeStrategy,
        copies: usize,
    }

    impl DiskMountStrategy for FakeStrategy {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn required_tools(&self) -> &'static [&'static str] {
            &[]
        }

        fn format_and_mount(
            &self,
            _image: &Path,
            _geometry: &DiskGeometry,
        ) -> Result<Box<dyn MountedVolume>> {
            self.mounted.store(true, Ordering::SeqCst);
            Ok(Box::new(FakeVolume {
                strategy: self.clone(),
                copies: 0,
            }))
        }
    }

    impl MountedVolume for FakeVolume {
        fn create_dir(&mut self, path: &str) -> Result<()> {
            self.strategy.dirs.lock().unwrap().push(path.to_string());
            Ok(())
        }

        fn copy_file(&mut self, source: &Path, destination: &str) -> Result<()> {
            self.copies += 1;
            if self.strategy.fail_on_copy == Some(self.copies) {
                bail!("no space left on device");
            }
            if self.strategy.panic_on_copy == Some(self.copies) {
                panic!("copy exploded");
            }
            let data = fs::read(source)?;
            self.strategy
                .files
                .lock()
                .unwrap()
                .insert(destination.to_string(), data);
            Ok(())
        }

        fn release(&mut self) -> Result<()> {
            self.strategy.mounted.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn inputs(dir: &Path) -> ImageInputs {
        let make = |name: &str| {
            let path = dir.join(name);
            fs::write(&path, name).unwrap();
            path
        };
        ImageInputs {
            bootloader: make("BOOTX64.EFI"),
            kernel: make("axle.bin"),
            fs_server: make("initrd_fs"),
            ramdisk: make("initrd.img"),
            ap_bootstrap: make(".compiled_ap_bootstrap"),
        }
    }

    fn assembler() -> DiskImageAssembler {
        DiskImageAssembler::new(
            DiskGeometry {
                sector_size: 512,
                sector_count: 2048,
            },
            "AXLE",
        )
    }

    #[test]
    fn lays_out_the_efi_tree() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("axle.iso");
        let strategy = FakeStrategy::default();

        assembler()
            .build(&image, &inputs(temp.path()), &strategy)
            .unwrap();

        assert_eq!(fs::metadata(&image).unwrap().len(), 512 * 2048);
        assert!(!strategy.mounted.load(Ordering::SeqCst));
        assert_eq!(*strategy.dirs.lock().unwrap(), ["EFI", "EFI/BOOT", "EFI/AXLE"]);
        let files = strategy.files.lock().unwrap();
        let names: Vec<_> = files.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            [
                "EFI/AXLE/AP_BOOTSTRAP.BIN",
                "EFI/AXLE/FS_SERVER.ELF",
                "EFI/AXLE/INITRD.IMG",
                "EFI/AXLE/KERNEL.ELF",
                "EFI/BOOT/BOOTX64.EFI",
            ]
        );
        assert_eq!(files["EFI/AXLE/KERNEL.ELF"], b"axle.bin");
    }

    #[test]
    fn failed_copy_still_releases() {
        let temp = TempDir::new().unwrap();
        let strategy = FakeStrategy {
            fail_on_copy: Some(3),
            ..Default::default()
        };
        let err = assembler()
            .build(&temp.path().join("axle.iso"), &inputs(temp.path()), &strategy)
            .unwrap_err();
        assert!(format!("{err:#}").contains("no space left"));
        assert!(!strategy.mounted.load(Ordering::SeqCst));
    }

    #[test]
    fn panic_during_copy_still_releases() {
        let temp = TempDir::new().unwrap();
        let strategy = FakeStrategy {
            panic_on_copy: Some(2),
            ..Default::default()
        };
        let inputs = inputs(temp.path());
        let image = temp.path().join("axle.iso");
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            assembler().build(&image, &inputs, &strategy)
        }));
        assert!(result.is_err());
        assert!(!strategy.mounted.load(Ordering::SeqCst));
    }

    #[test]
    fn missing_input_creates_nothing() {
        let temp = TempDir::new().unwrap();
        let mut inputs = inputs(temp.path());
        inputs.ramdisk = temp.path().join("missing.img");
        let image = temp.path().join("axle.iso");
        let strategy = FakeStrategy::default();

        let err = assembler().build(&image, &inputs, &strategy).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingArtifact { what, .. }) if what == "ramdisk"
        ));
        assert!(!image.exists());
        assert!(strategy.dirs.lock().unwrap().is_empty());
    }
}
