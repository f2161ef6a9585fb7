//! End-to-end build sequencing.
//!
//! Stages run strictly in order; each one leaves the staged root in the
//! state the next expects. Parallelism only exists inside the Meson program
//! stage.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn};

use crate::artifact::disk::{select_strategy, DiskGeometry, DiskImageAssembler, DiskMountStrategy, ImageInputs};
use crate::artifact::removable::refresh_removable_media;
use crate::build::arch::{stage_arch_specific, ArchSpecificFile};
use crate::build::components::build_components;
use crate::build::context::BuildContext;
use crate::build::filesystem::{create_sysroot_dirs, overlay_dist_tree, stage_static_headers};
use crate::build::initrd::build_initrd;
use crate::build::kernel::{build_ap_bootstrap, build_bootloader, build_kernel_libs, link_kernel};
use crate::build::programs::{build_programs, ProgramBuildPolicy};
use crate::error::BuildError;
use crate::headers::{sync_subproject_headers, RebuildCache};
use crate::preflight::{build_tools, check_required_tools};
use crate::qemu::{resolve_firmware, Accel, QemuBuilder};

/// What a pipeline invocation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Build everything, then boot the image.
    #[default]
    Full,
    /// Build everything, don't boot.
    BuildOnly,
    /// Boot an existing image without building.
    RunOnly,
}

impl RunMode {
    pub fn builds(self) -> bool {
        self != Self::RunOnly
    }

    pub fn runs(self) -> bool {
        self != Self::BuildOnly
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub mode: RunMode,
    pub force_rebuild_programs: Vec<String>,
    pub force_rebuild_everything: bool,
    /// Halt the emulator at entry until a debugger attaches.
    pub debug: bool,
}

impl PipelineOptions {
    /// Program selection for this run. Only recently touched programs are
    /// rebuilt unless something is forced.
    pub fn program_policy(&self, recent_window: Duration) -> ProgramBuildPolicy {
        ProgramBuildPolicy {
            only_recently_updated: true,
            force_rebuild: self.force_rebuild_programs.clone(),
            force_rebuild_all: self.force_rebuild_everything,
            recent_window,
        }
    }
}

pub struct Pipeline {
    ctx: BuildContext,
    options: PipelineOptions,
    strategy: Box<dyn DiskMountStrategy>,
}

impl Pipeline {
    pub fn new(ctx: BuildContext, options: PipelineOptions) -> Result<Self> {
        let strategy = select_strategy(&ctx.config.disk.mount_strategy, ctx.host)?;
        info!("disk images are written with the {} strategy", strategy.name());
        Ok(Self {
            ctx,
            options,
            strategy,
        })
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    pub fn run(&self) -> Result<()> {
        self.preflight()?;
        if self.options.mode.builds() {
            self.build()?;
        }
        if self.options.mode.runs() {
            self.launch_emulator()?;
        }
        Ok(())
    }

    fn preflight(&self) -> Result<()> {
        let mut tools = Vec::new();
        if self.options.mode.builds() {
            tools.extend(build_tools(self.strategy.as_ref()));
        }
        if self.options.mode.runs() {
            tools.push((self.ctx.config.emulator.binary.as_str(), "qemu"));
        }
        check_required_tools(&tools)
    }

    /// Every build stage, in order.
    pub fn build(&self) -> Result<()> {
        let ctx = &self.ctx;
        let started = Instant::now();

        stage("headers", || {
            create_sysroot_dirs(&ctx.sysroot())?;
            let copied =
                stage_static_headers(&ctx.repo_root, &ctx.sysroot(), &ctx.config.headers.static_headers)?;
            info!("{copied} static header(s) updated");
            Ok(())
        })?;

        stage("arch-specific", || {
            let files: Vec<_> = ctx
                .config
                .arch_specific
                .iter()
                .map(ArchSpecificFile::new)
                .collect();
            stage_arch_specific(&ctx.kernel_root(), &files, &ctx.config.arch)?;
            Ok(())
        })?;

        stage("bootloader", || build_bootloader(ctx))?;
        stage("kernel-libs", || build_kernel_libs(ctx).map(drop))?;
        stage("ap-bootstrap", || build_ap_bootstrap(ctx).map(drop))?;
        stage("kernel", || link_kernel(ctx).map(drop))?;
        stage("components", || build_components(ctx).map(drop))?;
        stage("programs", || self.build_programs())?;

        stage("dist", || {
            let copied = overlay_dist_tree(&ctx.dist_root(), &ctx.sysroot())?;
            info!("{copied} distribution file(s) updated");
            Ok(())
        })?;

        stage("initrd", || build_initrd(ctx).map(drop))?;
        stage("image", || self.build_image())?;
        stage("removable-media", || self.refresh_removable_media())?;

        println!("=== Build finished in {:.1?} ===", started.elapsed());
        Ok(())
    }

    /// Sync subproject headers, then compile the Meson programs. The header
    /// cache is saved even when the sync fails partway, so subprojects that
    /// were extracted aren't redone.
    fn build_programs(&self) -> Result<()> {
        let ctx = &self.ctx;
        let mut cache = RebuildCache::load(&ctx.header_cache_path())?;
        let synced = sync_subproject_headers(&ctx.programs_root(), &ctx.sysroot(), &mut cache);
        cache.save()?;
        let report = synced?;
        info!(
            "headers: {} subproject(s) extracted, {} unchanged, {} file(s) copied",
            report.extracted, report.skipped, report.copied
        );

        let policy = self
            .options
            .program_policy(Duration::from_secs(ctx.config.programs.recent_window_secs));
        let report = build_programs(ctx, &policy)?;
        info!("{} program(s) built", report.completed.len());
        Ok(())
    }

    fn image_inputs(&self) -> ImageInputs {
        ImageInputs {
            bootloader: self.ctx.bootloader_binary(),
            kernel: self.ctx.kernel_binary(),
            fs_server: self.ctx.fs_server_binary(),
            ramdisk: self.ctx.staged_ramdisk(),
            ap_bootstrap: self.ctx.ap_bootstrap_output(),
        }
    }

    fn build_image(&self) -> Result<()> {
        let disk = &self.ctx.config.disk;
        let assembler = DiskImageAssembler::new(
            DiskGeometry {
                sector_size: disk.sector_size,
                sector_count: disk.sector_count,
            },
            self.ctx.config.product_dir(),
        );
        assembler.build(
            &self.ctx.image_path(),
            &self.image_inputs(),
            self.strategy.as_ref(),
        )
    }

    fn refresh_removable_media(&self) -> Result<()> {
        let Some(volume) = &self.ctx.config.removable_media else {
            return Ok(());
        };
        let volume = self.ctx.resolve(volume);
        if !volume.is_dir() {
            println!("  [SKIP] {} not mounted", volume.display());
            return Ok(());
        }
        let inputs = self.image_inputs();
        if let Some(report) = refresh_removable_media(
            &volume,
            &self.ctx.config.product_dir(),
            &inputs.kernel,
            &inputs.fs_server,
            &inputs.ramdisk,
        )? {
            info!(
                "{} file(s) copied to {}, {} unchanged",
                report.copied.len(),
                volume.display(),
                report.unchanged
            );
        }
        Ok(())
    }

    fn launch_emulator(&self) -> Result<()> {
        let ctx = &self.ctx;
        let emulator = &ctx.config.emulator;
        let image = ctx.image_path();
        if !image.is_file() {
            return Err(BuildError::MissingArtifact {
                what: "disk image".to_string(),
                path: image,
            }
            .into());
        }

        let firmware = emulator.firmware.as_deref().map(|p| ctx.resolve(p));
        let firmware = resolve_firmware(firmware.as_deref())?;
        let mut qemu = QemuBuilder::new(&emulator.binary, firmware)
            .usb_image(image)
            .serial_log(ctx.resolve(&emulator.serial_log))
            .memory(&emulator.memory)
            .accel(Accel::detect(ctx.host))
            .wait_for_debugger(self.options.debug);
        if let Some(disk) = &emulator.hard_disk {
            let disk = ctx.resolve(disk);
            if disk.is_file() {
                qemu = qemu.hard_disk(disk);
            } else {
                warn!("hard disk {} not found, booting without it", disk.display());
            }
        }

        println!("=== Running {} ===", emulator.binary);
        if self.options.debug {
            println!("  Waiting for a debugger on localhost:1234");
        }
        qemu.build()
            .error_msg("Emulator exited with an error")
            .run()?;
        Ok(())
    }
}

/// Run one stage inside its own span, logging how long it took.
fn stage(name: &'static str, body: impl FnOnce() -> Result<()>) -> Result<()> {
    let span = info_span!("stage", name);
    let _guard = span.enter();
    let started = Instant::now();
    body().with_context(|| format!("Stage '{name}' failed"))?;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "done");
    Ok(())
}
