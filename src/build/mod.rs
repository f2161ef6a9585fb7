//! Build stages that produce the staged root and the boot payloads.
//!
//! - [`staleness`] and [`arch`] decide what to copy
//! - [`kernel`] drives the bootloader, kernel libraries and kernel link
//! - [`programs`] and [`pool`] build the Meson userspace programs
//! - [`components`] builds the Cargo component workspace
//! - [`filesystem`] and [`initrd`] assemble the staged root and ramdisk

pub mod arch;
pub mod components;
pub mod context;
pub mod filesystem;
pub mod initrd;
pub mod kernel;
pub mod pool;
pub mod programs;
pub mod staleness;
