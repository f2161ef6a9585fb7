//! Build configuration.
//!
//! Everything the pipeline needs to know about the repository layout lives
//! here. The defaults describe the standard checkout; an `axle-build.toml` at
//! the repository root may override any subset of fields. Relative paths are
//! resolved against the repository root by [`crate::build::context::BuildContext`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// File name looked up at the repository root.
pub const CONFIG_FILENAME: &str = "axle-build.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Product name; upper-cased it names the `/EFI/<PRODUCT>` directory.
    pub product: String,
    /// Active target architecture.
    pub arch: String,
    pub paths: PathsConfig,
    pub headers: HeadersConfig,
    /// Canonical paths (relative to the kernel root) of files that have
    /// per-architecture variants.
    pub arch_specific: Vec<PathBuf>,
    pub kernel: KernelConfig,
    pub programs: ProgramsConfig,
    pub components: ComponentsConfig,
    pub initrd: InitrdConfig,
    pub disk: DiskConfig,
    pub emulator: EmulatorConfig,
    /// Mounted removable volume refreshed after a build, when present.
    pub removable_media: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub sysroot: PathBuf,
    pub kernel: PathBuf,
    pub bootloader: PathBuf,
    pub programs: PathBuf,
    pub rust_programs: PathBuf,
    pub kernel_libs: PathBuf,
    pub toolchain: PathBuf,
    pub dist: PathBuf,
    /// Staging directory for boot payloads (kernel, ramdisk).
    pub staged_boot: PathBuf,
    pub image: PathBuf,
    pub cache_dir: PathBuf,
}

/// A header copied verbatim into the staged root.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HeaderCopy {
    /// Relative to the repository root.
    pub source: PathBuf,
    /// Relative to the staged root.
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeadersConfig {
    pub static_headers: Vec<HeaderCopy>,
    /// File name of the rebuild cache inside `paths.cache_dir`.
    pub cache_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub bootloader_binary: PathBuf,
    /// Linked kernel, relative to the repository root.
    pub kernel_binary: PathBuf,
    /// Canonical name of the AP bootstrap source; the arch variant is assembled.
    pub ap_bootstrap_source: PathBuf,
    pub ap_bootstrap_output: PathBuf,
    /// Cargo target (triple or `.json` spec path) for the kernel libraries.
    pub libs_target: String,
    /// Where the kernel link expects the static libraries.
    pub libs_output: PathBuf,
    /// Cross compiler used for FFI shims, relative to the toolchain dir.
    pub cross_cc: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProgramsConfig {
    /// Programs built some other way, or intentionally disabled.
    pub denylist: Vec<String>,
    pub recent_window_secs: u64,
    pub workers: usize,
    pub fail_fast: bool,
    pub cross_file_template: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentsConfig {
    pub target_spec: String,
    pub rustflags: String,
    pub extra_cargo_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InitrdConfig {
    pub generator: PathBuf,
    /// Image produced inside the generator directory.
    pub output: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiskConfig {
    pub sector_size: u64,
    pub sector_count: u64,
    /// `auto`, `loopback`, `hdiutil` or `mtools`.
    pub mount_strategy: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulatorConfig {
    pub binary: String,
    /// UEFI firmware; discovered from the usual OVMF locations when unset.
    pub firmware: Option<PathBuf>,
    pub memory: String,
    pub serial_log: PathBuf,
    /// Attached over AHCI when the file exists.
    pub hard_disk: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            product: "axle".to_string(),
            arch: "x86_64".to_string(),
            paths: PathsConfig::default(),
            headers: HeadersConfig::default(),
            arch_specific: [
                "boot/boot.s",
                "kernel/util/walk_stack.s",
                "kernel/multitasking/tasks/process_small.s",
                "kernel/segmentation/gdt_activate.s",
                "kernel/interrupts/idt_activate.s",
                "kernel/interrupts/int_handler_stubs.s",
                "kernel/pmm/pmm_int.h",
                "kernel/vmm/vmm.h",
                "kernel/vmm/vmm.c",
            ]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
            kernel: KernelConfig::default(),
            programs: ProgramsConfig::default(),
            components: ComponentsConfig::default(),
            initrd: InitrdConfig::default(),
            disk: DiskConfig::default(),
            emulator: EmulatorConfig::default(),
            removable_media: Some(PathBuf::from("/Volumes/NO NAME")),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sysroot: "axle-sysroot".into(),
            kernel: "kernel".into(),
            bootloader: "bootloader".into(),
            programs: "programs".into(),
            rust_programs: "rust_programs".into(),
            kernel_libs: "rust_kernel_libs".into(),
            toolchain: "x86_64-toolchain".into(),
            dist: "os_dist".into(),
            staged_boot: "isodir/boot".into(),
            image: "axle.iso".into(),
            cache_dir: "scripts/caches".into(),
        }
    }
}

impl Default for HeadersConfig {
    fn default() -> Self {
        let header = |source: &str, destination: &str| HeaderCopy {
            source: source.into(),
            destination: destination.into(),
        };
        Self {
            static_headers: vec![
                header("kernel/kernel/util/amc/amc.h", "usr/include/kernel/amc.h"),
                header(
                    "kernel/kernel/util/amc/core_commands.h",
                    "usr/include/kernel/core_commands.h",
                ),
                header("kernel/kernel/util/adi/adi.h", "usr/include/kernel/adi.h"),
                header("kernel/kernel/interrupts/idt.h", "usr/include/kernel/idt.h"),
                header(
                    "bootloader/axle_boot_info.h",
                    "usr/include/bootloader/axle_boot_info.h",
                ),
            ],
            cache_file: "header_rebuild_cache.json".to_string(),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            bootloader_binary: "bootloader/BOOTX64.EFI".into(),
            kernel_binary: "isodir/boot/axle.bin".into(),
            ap_bootstrap_source: "ap_bootstrap.s".into(),
            ap_bootstrap_output: ".compiled_ap_bootstrap".into(),
            libs_target: "x86_64-unknown-none".to_string(),
            libs_output: ".compiled_rust_libs".into(),
            cross_cc: "bin/x86_64-elf-axle-gcc".into(),
        }
    }
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            denylist: ["cat", "tlsclient", "doomgeneric", "vim", "bash", "ncurses", "subprojects"]
                .into_iter()
                .map(String::from)
                .collect(),
            recent_window_secs: 180,
            workers: 8,
            fail_fast: false,
            cross_file_template: "cross_axle_template.ini".to_string(),
        }
    }
}

impl Default for ComponentsConfig {
    fn default() -> Self {
        Self {
            target_spec: "rust_programs/x86_64-unknown-axle.json".to_string(),
            rustflags: "-Cforce-frame-pointers=yes".to_string(),
            extra_cargo_args: vec!["-Z".to_string(), "features=host_dep".to_string()],
        }
    }
}

impl Default for InitrdConfig {
    fn default() -> Self {
        Self {
            generator: "scripts/mkinitrd".into(),
            output: "output.img".into(),
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            sector_size: 512,
            // 128 MiB
            sector_count: 262_144,
            mount_strategy: "auto".to_string(),
        }
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
            firmware: None,
            memory: "4G".to_string(),
            serial_log: "syslog.log".into(),
            hard_disk: Some("axle-hdd.img".into()),
        }
    }
}

impl BuildConfig {
    /// Load `explicit` if given, otherwise `<repo_root>/axle-build.toml` when
    /// present, otherwise the defaults.
    pub fn load(repo_root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let candidate = repo_root.join(CONFIG_FILENAME);
                if !candidate.is_file() {
                    return Ok(Self::default());
                }
                candidate
            }
        };
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading build config '{}'", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing build config '{}'", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// `/EFI/<PRODUCT>` directory name.
    pub fn product_dir(&self) -> String {
        self.product.to_ascii_uppercase()
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Output directory name Cargo uses for a `--target` value: the file stem
/// for a JSON target spec, the triple otherwise.
pub fn target_dir_name(target: &str) -> String {
    match target.strip_suffix(".json") {
        Some(_) => Path::new(target)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| target.to_string()),
        None => target.to_string(),
    }
}
