use async_trait::async_trait;
use std::path::Path;
use tokio::net::UnixStream;

/// Decides whether the guest agent can take a connection yet.
#[async_trait]
pub trait Readiness: Send + Sync {
    async fn is_ready(&self, guest_socket: &Path) -> bool;
}

/// Ready once a single connect to the agent socket succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct DialReadiness;

#[async_trait]
impl Readiness for DialReadiness {
    async fn is_ready(&self, guest_socket: &Path) -> bool {
        match UnixStream::connect(guest_socket).await {
            Ok(_) => true,
            Err(e) => {
                tracing::trace!(socket = %guest_socket.display(), error = %e, "Guest agent not reachable yet");
                false
            }
        }
    }
}
