use skiff_image::ImageError;
use skiff_mount::MountError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("vm {id} is {state}")]
    InvalidState { id: String, state: String },

    #[error("guest agent unavailable: {0}")]
    GuestUnavailable(String),

    #[error("guest rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("image error: {0}")]
    Image(#[from] ImageError),

    #[error("mount error: {0}")]
    Mount(#[from] MountError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
