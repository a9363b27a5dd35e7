use crate::service::VmDefaults;
use clap::Args;
use skiff_image::Platform;
use std::path::PathBuf;

const MIB: u64 = 1024 * 1024;

/// Settings shared by every subcommand that touches images or VMs.
#[derive(Debug, Clone, Args)]
pub struct ShimConfig {
    /// Image cache directory [default: $XDG_CACHE_HOME/skiff/images]
    #[arg(long, env = "SKIFF_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Tool that copies an image reference into an OCI layout
    #[arg(long, env = "SKIFF_FETCH_TOOL", default_value = "skopeo")]
    pub fetch_tool: PathBuf,

    /// mkfs.ext4 binary used to build root filesystem images
    #[arg(long, env = "SKIFF_MKFS_EXT4", default_value = "mkfs.ext4")]
    pub mkfs_ext4: PathBuf,

    /// Guest memory in MiB when the bundle does not set one
    #[arg(long, env = "SKIFF_MEMORY_MIB", default_value_t = 64)]
    pub memory_mib: u64,

    /// Guest vCPUs when the bundle does not set them
    #[arg(long, env = "SKIFF_VCPUS", default_value_t = 1)]
    pub vcpus: u8,

    /// Platform of images without a platform annotation [default: linux/<host arch>]
    #[arg(long, env = "SKIFF_PLATFORM")]
    pub platform: Option<Platform>,

    /// Namespace stamped on forwarded events
    #[arg(long, env = "SKIFF_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Run guest processes on the host root instead of the VM rootfs
    #[arg(long, env = "SKIFF_NO_CHROOT")]
    pub no_chroot: bool,
}

impl ShimConfig {
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        let base = std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
            .unwrap_or_else(std::env::temp_dir);
        base.join("skiff").join("images")
    }

    pub fn vm_defaults(&self) -> VmDefaults {
        VmDefaults {
            memory_bytes: self.memory_mib * MIB,
            vcpus: self.vcpus,
            platform: self.platform.clone().unwrap_or_else(Platform::host_linux),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: ShimConfig,
    }

    #[test]
    fn test_defaults_and_overrides() {
        let cli = Cli::parse_from(["skiff-shim"]);
        let defaults = cli.config.vm_defaults();
        assert_eq!(defaults.memory_bytes, 64 * MIB);
        assert_eq!(defaults.vcpus, 1);
        assert_eq!(cli.config.fetch_tool, PathBuf::from("skopeo"));

        let cli = Cli::parse_from([
            "skiff-shim",
            "--cache-dir",
            "/var/cache/skiff",
            "--memory-mib",
            "256",
            "--vcpus",
            "2",
            "--platform",
            "linux/arm64",
        ]);
        assert_eq!(cli.config.cache_dir(), PathBuf::from("/var/cache/skiff"));
        let defaults = cli.config.vm_defaults();
        assert_eq!(defaults.memory_bytes, 256 * MIB);
        assert_eq!(defaults.vcpus, 2);
        assert_eq!(defaults.platform, Platform::linux_arm64());
    }

    #[test]
    fn test_rejects_bad_platform() {
        assert!(Cli::try_parse_from(["skiff-shim", "--platform", "linux"]).is_err());
    }
}
