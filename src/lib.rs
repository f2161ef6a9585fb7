//! Incremental build orchestration for the axle operating system image.
//!
//! axle is assembled from the output of several build systems that know
//! nothing about each other: `make` for the bootloader and kernel, Cargo for
//! the kernel libraries and userspace components, Meson for the C programs,
//! and a ramdisk generator. This crate decides what needs rebuilding using
//! file timestamps alone, drives each tool, stages everything into a sysroot
//! and writes a bootable FAT image.
//!
//! - **[`build`]** - per-toolchain stages, staleness checks, the worker pool
//! - **[`headers`]** - header install lists read out of `meson.build` files
//!   without running Meson
//! - **[`artifact`]** - disk image assembly and removable-media refresh
//! - **[`pipeline`]** - the end-to-end stage sequence
//! - **[`qemu`]** - emulator launch
//!
//! # Architecture
//!
//! ```text
//! axle-build (bin)
//!     │
//!     └── Pipeline
//!           ├── build::{filesystem, arch, kernel, components}
//!           ├── headers::sync ── RebuildCache
//!           ├── build::programs ── WorkerPool
//!           ├── build::initrd
//!           ├── artifact::disk ── DiskMountStrategy
//!           └── qemu
//! ```

pub mod artifact;
pub mod build;
pub mod config;
pub mod error;
pub mod headers;
pub mod host;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod qemu;

pub use build::context::BuildContext;
pub use config::BuildConfig;
pub use error::BuildError;
pub use pipeline::{Pipeline, PipelineOptions, RunMode};
