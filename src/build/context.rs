//! Resolved repository layout shared by every stage.

use std::path::{Path, PathBuf};

use crate::config::{self, BuildConfig};
use crate::host::HostPlatform;

/// The repository root, its configuration and the detected host.
///
/// Every path accessor returns an absolute path (as absolute as the root),
/// so stages never have to think about the current directory.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub repo_root: PathBuf,
    pub config: BuildConfig,
    pub host: HostPlatform,
}

impl BuildContext {
    pub fn new(repo_root: PathBuf, config: BuildConfig) -> Self {
        Self {
            repo_root,
            config,
            host: HostPlatform::detect(),
        }
    }

    /// Resolve a configured path against the repository root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let path = config::expand_home(path);
        if path.is_absolute() {
            path
        } else {
            self.repo_root.join(path)
        }
    }

    pub fn sysroot(&self) -> PathBuf {
        self.resolve(&self.config.paths.sysroot)
    }

    pub fn kernel_root(&self) -> PathBuf {
        self.resolve(&self.config.paths.kernel)
    }

    pub fn bootloader_dir(&self) -> PathBuf {
        self.resolve(&self.config.paths.bootloader)
    }

    pub fn programs_root(&self) -> PathBuf {
        self.resolve(&self.config.paths.programs)
    }

    pub fn rust_programs_root(&self) -> PathBuf {
        self.resolve(&self.config.paths.rust_programs)
    }

    pub fn kernel_libs_root(&self) -> PathBuf {
        self.resolve(&self.config.paths.kernel_libs)
    }

    pub fn toolchain_bin(&self) -> PathBuf {
        self.resolve(&self.config.paths.toolchain).join("bin")
    }

    pub fn dist_root(&self) -> PathBuf {
        self.resolve(&self.config.paths.dist)
    }

    pub fn staged_boot(&self) -> PathBuf {
        self.resolve(&self.config.paths.staged_boot)
    }

    pub fn image_path(&self) -> PathBuf {
        self.resolve(&self.config.paths.image)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.resolve(&self.config.paths.cache_dir)
    }

    pub fn header_cache_path(&self) -> PathBuf {
        self.cache_dir().join(&self.config.headers.cache_file)
    }

    pub fn applications_dir(&self) -> PathBuf {
        self.sysroot().join("usr/applications")
    }

    pub fn staged_ramdisk(&self) -> PathBuf {
        self.staged_boot().join("initrd.img")
    }

    pub fn kernel_binary(&self) -> PathBuf {
        self.resolve(&self.config.kernel.kernel_binary)
    }

    pub fn bootloader_binary(&self) -> PathBuf {
        self.resolve(&self.config.kernel.bootloader_binary)
    }

    pub fn ap_bootstrap_output(&self) -> PathBuf {
        self.resolve(&self.config.kernel.ap_bootstrap_output)
    }

    /// The file server is built as a Cargo component and lives in the
    /// applications directory.
    pub fn fs_server_binary(&self) -> PathBuf {
        self.applications_dir().join("initrd_fs")
    }

    /// Meson cross file rendered for this checkout.
    pub fn generated_cross_file(&self) -> PathBuf {
        self.programs_root()
            .join(format!("cross_{}_generated.ini", self.config.product))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_under_repo_root() {
        let ctx = BuildContext::new(PathBuf::from("/src/axle"), BuildConfig::default());
        assert_eq!(ctx.sysroot(), PathBuf::from("/src/axle/axle-sysroot"));
        assert_eq!(
            ctx.applications_dir(),
            PathBuf::from("/src/axle/axle-sysroot/usr/applications")
        );
        assert_eq!(
            ctx.toolchain_bin(),
            PathBuf::from("/src/axle/x86_64-toolchain/bin")
        );
        assert_eq!(
            ctx.generated_cross_file(),
            PathBuf::from("/src/axle/programs/cross_axle_generated.ini")
        );
    }

    #[test]
    fn absolute_paths_are_kept() {
        let mut config = BuildConfig::default();
        config.paths.image = PathBuf::from("/tmp/out.img");
        let ctx = BuildContext::new(PathBuf::from("/src/axle"), config);
        assert_eq!(ctx.image_path(), PathBuf::from("/tmp/out.img"));
    }
}
