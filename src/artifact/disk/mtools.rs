//! mtools operations on an unmounted FAT image.

use anyhow::Result;
use std::path::Path;

use crate::process::Cmd;

/// `mmd -i <image> ::/<dir>`
pub fn mmd_command(image: &Path, dir: &str) -> Cmd {
    Cmd::new("mmd")
        .arg("-i")
        .arg_path(image)
        .arg(volume_path(dir))
}

/// `mcopy -o -i <image> <src> ::/<dest>`, overwriting an existing file.
pub fn mcopy_command(image: &Path, src: &Path, dest: &str) -> Cmd {
    Cmd::new("mcopy")
        .args(["-o", "-i"])
        .arg_path(image)
        .arg_path(src)
        .arg(volume_path(dest))
}

/// Create a directory in a FAT image.
pub fn mtools_mkdir(image: &Path, dir: &str) -> Result<()> {
    mmd_command(image, dir)
        .error_msg(&format!("mmd failed: {dir}"))
        .run()?;
    Ok(())
}

/// Copy a file into a FAT image.
pub fn mtools_copy(image: &Path, src: &Path, dest: &str) -> Result<()> {
    mcopy_command(image, src, dest)
        .error_msg(&format!("mcopy failed: {} -> {}", src.display(), dest))
        .run()?;
    Ok(())
}

fn volume_path(path: &str) -> String {
    format!("::/{}", path.trim_start_matches('/'))
}
