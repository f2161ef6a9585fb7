//! Refresh a bootable USB stick that already carries an image.
//!
//! Only the payload that changes between builds is rewritten: kernel, file
//! server and ramdisk. The bootloader and AP bootstrap stay as they are.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub copied: Vec<PathBuf>,
    pub unchanged: usize,
}

/// Copy the payload onto `volume` if it looks like one of ours, i.e. it has
/// `EFI/<product_dir>/KERNEL.ELF` and `FS_SERVER.ELF`.
///
/// Returns `None` when the volume is absent or doesn't carry an image.
pub fn refresh_removable_media(
    volume: &Path,
    product_dir: &str,
    kernel: &Path,
    fs_server: &Path,
    ramdisk: &Path,
) -> Result<Option<RefreshReport>> {
    let payload_dir = volume.join("EFI").join(product_dir);
    let recognised = ["KERNEL.ELF", "FS_SERVER.ELF"]
        .iter()
        .all(|name| payload_dir.join(name).is_file());
    if !recognised {
        info!(
            "{} is not an {} boot volume, skipping",
            volume.display(),
            product_dir
        );
        return Ok(None);
    }

    println!("=== Updating {} ===", volume.display());
    let mut report = RefreshReport::default();
    for (source, name) in [
        (kernel, "KERNEL.ELF"),
        (fs_server, "FS_SERVER.ELF"),
        (ramdisk, "INITRD.IMG"),
    ] {
        let dest = payload_dir.join(name);
        if dest.is_file() && sha256_file(source)? == sha256_file(&dest)? {
            debug!("{} unchanged", dest.display());
            report.unchanged += 1;
            continue;
        }
        println!("  {} -> {}", source.display(), dest.display());
        fs::copy(source, &dest).with_context(|| {
            format!("Failed to copy {} to {}", source.display(), dest.display())
        })?;
        report.copied.push(dest);
    }
    Ok(Some(report))
}

fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
