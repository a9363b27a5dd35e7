use crate::agent::GuestAgent;
use crate::error::AgentError;
use skiff_core::guest::guest_service_server::GuestServiceServer;
use std::future::Future;
use std::path::Path;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

/// Serves `agent` on `listener` until `shutdown` resolves.
pub async fn serve_unix(
    listener: UnixListener,
    agent: GuestAgent,
    shutdown: impl Future<Output = ()>,
) -> Result<(), AgentError> {
    Server::builder()
        .add_service(GuestServiceServer::new(agent))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await?;
    Ok(())
}

/// Entry point of a standalone agent: binds `socket` and serves until
/// SIGTERM or SIGINT.
pub async fn run_agent(socket: &Path, root: Option<&Path>) -> Result<(), AgentError> {
    match std::fs::remove_file(socket) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(socket)?;
    let agent = match root {
        Some(root) => GuestAgent::with_root(root),
        None => GuestAgent::new(),
    };

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tracing::info!(socket = %socket.display(), "Guest agent listening");
    let killer = agent.clone();
    serve_unix(listener, agent, async move {
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        tracing::info!("Guest agent shutting down");
        killer.kill_all();
    })
    .await
}
