use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid process spec: {0}")]
    InvalidSpec(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AgentError> for tonic::Status {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::InvalidSpec(_) | AgentError::Json(_) => {
                tonic::Status::invalid_argument(e.to_string())
            }
            AgentError::Spawn { .. } => tonic::Status::failed_precondition(e.to_string()),
            _ => tonic::Status::internal(e.to_string()),
        }
    }
}
