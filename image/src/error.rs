use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image not found: {0}")]
    NotFound(String),

    #[error("platform {platform} not available in image (available: {available:?})")]
    PlatformUnavailable {
        platform: String,
        available: Vec<String>,
    },

    #[error("more than one manifest matches platform {platform}: {digests:?}")]
    AmbiguousPlatform {
        platform: String,
        digests: Vec<String>,
    },

    #[error("invalid platform: {0}")]
    InvalidPlatform(String),

    #[error("corrupt layer {digest}: {reason}")]
    CorruptLayer { digest: String, reason: String },

    #[error("invalid OCI layout: {0}")]
    InvalidLayout(String),

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("ext4 build failed: {0}")]
    Ext4Build(String),

    #[error("image too large: {size} bytes exceeds limit of {max} bytes")]
    ImageTooLarge { size: u64, max: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ImageError {
    pub fn corrupt_layer(digest: &str, reason: impl std::fmt::Display) -> Self {
        ImageError::CorruptLayer {
            digest: digest.to_string(),
            reason: reason.to_string(),
        }
    }
}
