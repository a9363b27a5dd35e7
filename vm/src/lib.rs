//! VM adapter: a thin layer over a [`Hypervisor`] that boots a machine from a
//! converted image and hands out clients for its guest agent.

mod error;
mod guest;
mod hypervisor;
mod readiness;
mod running;

pub use error::VmError;
pub use guest::{GuestClient, connect_unix};
pub use hypervisor::{BlockDevice, Hypervisor, ROOTFS_DEVICE, VirtualMachine, VmConfig, VmState};
pub use readiness::{DialReadiness, Readiness};
pub use running::{DIAL_INTERVAL, DIAL_TIMEOUT, ImageVmConfig, RootfsVmConfig, RunningVm};
