use skiff_image::ImageError;
use skiff_mount::MountError;
use skiff_vm::VmError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShimError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("{id} is {state}")]
    InvalidState { id: String, state: String },

    #[error("process {id} already exited with code {code}")]
    ProcessExited { id: String, code: i32 },

    #[error("hypervisor failure: {0}")]
    Hypervisor(VmError),

    #[error("image fetch failed: {0}")]
    ImageFetch(#[from] ImageError),

    #[error("guest transport error: {0}")]
    Transport(String),

    #[error("mount error: {0}")]
    Mount(#[from] MountError),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<VmError> for ShimError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Image(e) => ShimError::ImageFetch(e),
            VmError::Mount(e) => ShimError::Mount(e),
            other => ShimError::Hypervisor(other),
        }
    }
}

impl From<oci_spec::OciSpecError> for ShimError {
    fn from(e: oci_spec::OciSpecError) -> Self {
        ShimError::InvalidSpec(e.to_string())
    }
}

impl From<ShimError> for tonic::Status {
    fn from(e: ShimError) -> Self {
        match e {
            ShimError::NotFound(_) => tonic::Status::not_found(e.to_string()),
            ShimError::AlreadyExists(_) => tonic::Status::already_exists(e.to_string()),
            ShimError::InvalidSpec(_) => tonic::Status::invalid_argument(e.to_string()),
            ShimError::Unavailable(_) => tonic::Status::unavailable(e.to_string()),
            ShimError::NotImplemented(_) => tonic::Status::unimplemented(e.to_string()),
            _ => tonic::Status::internal(e.to_string()),
        }
    }
}
