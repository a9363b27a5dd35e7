use crate::error::VmError;
use async_trait::async_trait;
use skiff_image::Platform;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Name of the block device carrying the converted image.
pub const ROOTFS_DEVICE: &str = "rootfs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl VmState {
    /// The machine will not run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Stopped | VmState::Error)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Starting => write!(f, "starting"),
            VmState::Running => write!(f, "running"),
            VmState::Stopping => write!(f, "stopping"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub path: PathBuf,
    pub read_only: bool,
}

impl BlockDevice {
    pub fn rootfs(ext4_path: &Path) -> Self {
        Self {
            name: ROOTFS_DEVICE.to_string(),
            path: ext4_path.to_path_buf(),
            read_only: true,
        }
    }
}

/// What a hypervisor needs to build one machine.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub id: String,
    pub platform: Platform,
    pub memory_bytes: u64,
    pub vcpus: u8,
    /// Host directory the ext4 image was built from.
    pub rootfs_path: PathBuf,
    pub block_devices: Vec<BlockDevice>,
    /// Unix socket the guest agent listens on.
    pub guest_socket: PathBuf,
}

impl VmConfig {
    pub fn rootfs_device(&self) -> Option<&BlockDevice> {
        self.block_devices.iter().find(|d| d.name == ROOTFS_DEVICE)
    }
}

/// A machine created by a [`Hypervisor`]. Not started until
/// [`VirtualMachine::start`] is called.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    fn id(&self) -> &str;

    async fn start(&self) -> Result<(), VmError>;

    /// Resolves once the machine has terminated.
    async fn wait(&self) -> Result<(), VmError>;

    /// Ungraceful halt. Succeeds if the machine already stopped.
    async fn hard_stop(&self) -> Result<(), VmError>;

    fn state(&self) -> VmState;

    fn subscribe(&self) -> watch::Receiver<VmState>;

    fn guest_socket(&self) -> &Path;
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn new_vm(&self, config: VmConfig) -> Result<Arc<dyn VirtualMachine>, VmError>;
}
