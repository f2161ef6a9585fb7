//! Ramdisk generation.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::build::context::BuildContext;
use crate::error::BuildError;
use crate::process::Cmd;

/// Run the ramdisk generator and stage its image next to the kernel.
pub fn build_initrd(ctx: &BuildContext) -> Result<PathBuf> {
    println!("=== Building ramdisk ===");
    let generator = ctx.resolve(&ctx.config.initrd.generator);
    Cmd::new("cargo")
        .args(["run", "--release"])
        .dir(&generator)
        .error_msg("Ramdisk generator failed")
        .run()?;

    let generated = generator.join(&ctx.config.initrd.output);
    stage_initrd(&generated, &ctx.staged_ramdisk())
}

/// Copy a generated ramdisk image to `staged`.
pub fn stage_initrd(generated: &Path, staged: &Path) -> Result<PathBuf> {
    if !generated.is_file() {
        return Err(BuildError::MissingArtifact {
            what: "generated ramdisk".to_string(),
            path: generated.to_path_buf(),
        }
        .into());
    }
    if let Some(parent) = staged.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::copy(generated, staged)
        .with_context(|| format!("Failed to stage ramdisk at {}", staged.display()))?;
    Ok(staged.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn stages_generated_image() {
        let temp = TempDir::new().unwrap();
        let generated = temp.path().join("mkinitrd/output.img");
        fs::create_dir_all(generated.parent().unwrap()).unwrap();
        fs::write(&generated, [1u8, 2, 3]).unwrap();

        let staged = temp.path().join("isodir/boot/initrd.img");
        stage_initrd(&generated, &staged).unwrap();
        assert_eq!(fs::read(&staged).unwrap(), [1, 2, 3]);
    }

    #[test]
    fn missing_image_is_reported() {
        let temp = TempDir::new().unwrap();
        let err = stage_initrd(&temp.path().join("output.img"), &temp.path().join("initrd.img"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingArtifact { .. })
        ));
    }
}
