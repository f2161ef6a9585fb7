//! Final artifacts: the bootable disk image and the removable-media copy.
//!
//! - [`disk`] - FAT image assembly with host-specific mount strategies
//! - [`removable`] - refresh an already-imaged USB stick in place

pub mod disk;
pub mod removable;
