//! Emulator launch.
//!
//! `QemuBuilder` assembles the qemu command line for booting the disk image
//! the way real hardware sees it: UEFI firmware, the image as a USB stick
//! behind an xHCI controller and an optional SATA disk for persistent data.
//! `find_ovmf()` locates firmware when none is configured.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::host::HostPlatform;
use crate::process::Cmd;

/// CPU acceleration available on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accel {
    Hvf,
    Kvm,
    None,
}

impl Accel {
    pub fn detect(host: HostPlatform) -> Self {
        match host {
            HostPlatform::MacOs => Self::Hvf,
            HostPlatform::Linux if Path::new("/dev/kvm").exists() => Self::Kvm,
            _ => Self::None,
        }
    }
}

/// Builder for the qemu command line.
pub struct QemuBuilder {
    binary: String,
    firmware: PathBuf,
    usb_image: Option<PathBuf>,
    hard_disk: Option<PathBuf>,
    serial_log: Option<PathBuf>,
    memory: String,
    accel: Accel,
    wait_for_debugger: bool,
}

impl QemuBuilder {
    pub fn new(binary: &str, firmware: PathBuf) -> Self {
        Self {
            binary: binary.to_string(),
            firmware,
            usb_image: None,
            hard_disk: None,
            serial_log: None,
            memory: "4G".to_string(),
            accel: Accel::None,
            wait_for_debugger: false,
        }
    }

    pub fn usb_image(mut self, path: PathBuf) -> Self {
        self.usb_image = Some(path);
        self
    }

    pub fn hard_disk(mut self, path: PathBuf) -> Self {
        self.hard_disk = Some(path);
        self
    }

    pub fn serial_log(mut self, path: PathBuf) -> Self {
        self.serial_log = Some(path);
        self
    }

    pub fn memory(mut self, memory: &str) -> Self {
        self.memory = memory.to_string();
        self
    }

    pub fn accel(mut self, accel: Accel) -> Self {
        self.accel = accel;
        self
    }

    /// Start a gdb stub on :1234 and halt until a debugger connects.
    pub fn wait_for_debugger(mut self, enabled: bool) -> Self {
        self.wait_for_debugger = enabled;
        self
    }

    pub fn build(self) -> Cmd {
        let mut cmd = Cmd::new(&self.binary).arg("-pflash").arg_path(&self.firmware);

        if let Some(image) = &self.usb_image {
            cmd = cmd
                .arg("-drive")
                .arg(format!("if=none,id=usb,format=raw,file={}", image.display()))
                .args([
                    "-usb",
                    "-device",
                    "qemu-xhci,id=xhci",
                    "-device",
                    "usb-storage,bus=xhci.0,drive=usb",
                ]);
        }

        cmd = match self.accel {
            Accel::Hvf => cmd.args(["-accel", "hvf", "-cpu", "host"]),
            Accel::Kvm => cmd.args(["-enable-kvm", "-cpu", "host"]),
            Accel::None => cmd,
        };

        if let Some(log) = &self.serial_log {
            cmd = cmd.arg("-serial").arg(format!("file:{}", log.display()));
        }

        // SATA drive
        if let Some(disk) = &self.hard_disk {
            cmd = cmd
                .arg("-drive")
                .arg(format!("id=disk,file={},if=none", disk.display()))
                .args(["-device", "ahci,id=ahci", "-device", "ide-hd,drive=disk,bus=ahci.0"]);
        }

        cmd = cmd.args(["-monitor", "stdio", "-m"]).arg(&self.memory);
        if self.wait_for_debugger {
            cmd = cmd.args(["-s", "-S"]);
        }
        cmd
    }
}

/// Find OVMF firmware for UEFI boot.
pub fn find_ovmf() -> Option<PathBuf> {
    let candidates = [
        // Homebrew qemu
        "/opt/homebrew/share/qemu/edk2-x86_64-code.fd",
        "/usr/local/share/qemu/edk2-x86_64-code.fd",
        // Fedora/RHEL
        "/usr/share/edk2/ovmf/OVMF_CODE.fd",
        // Debian/Ubuntu
        "/usr/share/OVMF/OVMF_CODE.fd",
        "/usr/share/OVMF/OVMF_CODE_4M.fd",
        "/usr/share/qemu/OVMF.fd",
        // Arch
        "/usr/share/edk2-ovmf/x64/OVMF_CODE.fd",
    ];

    candidates
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Use the configured firmware if given, otherwise search for OVMF.
pub fn resolve_firmware(configured: Option<&Path>) -> Result<PathBuf> {
    match configured {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => anyhow::bail!("UEFI firmware not found at {}", path.display()),
        None => find_ovmf().context("OVMF not found; set emulator.firmware in axle-build.toml"),
    }
}
