use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("unsupported rootfs mount type {0:?}")]
    UnsupportedType(String),

    #[error("bad {mount_type} mount: {reason}")]
    BadOptions { mount_type: String, reason: String },

    #[error("mount {kind} on {target}: {errno}")]
    Mount {
        kind: &'static str,
        target: PathBuf,
        errno: Errno,
    },

    #[error("unmount {target}: {errno}")]
    Unmount { target: PathBuf, errno: Errno },

    #[error("mount table: {0}")]
    Io(#[from] std::io::Error),
}
