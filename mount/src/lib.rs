//! Host-side mount plumbing for container root filesystems.

mod error;
mod mount;
mod unmount;

pub use error::MountError;
pub use mount::{mount_all, mount_spec, parse_options};
pub use unmount::{mounts_under, parse_mountinfo, unmount, unmount_recursive};

/// A rootfs mount descriptor as handed over by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

impl MountSpec {
    pub fn new(mount_type: &str, source: &str, options: Vec<String>) -> Self {
        Self {
            mount_type: mount_type.to_string(),
            source: source.to_string(),
            options,
        }
    }
}
