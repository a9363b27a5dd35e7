use crate::events::{Event, EventSender, event_channel};
use crate::harness::Reexec;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Process-wide state of one shim: the events channel, the re-exec table and
/// the shutdown signal. Owned by `main` and handed to the task service.
#[derive(Clone)]
pub struct Runtime {
    events: EventSender,
    reexec: Arc<Reexec>,
    shutdown: CancellationToken,
}

impl Runtime {
    /// Returns the runtime and the receiving end of its events channel.
    pub fn new(reexec: Reexec) -> (Self, mpsc::Receiver<Event>) {
        let (events, rx) = event_channel();
        let runtime = Self {
            events,
            reexec: Arc::new(reexec),
            shutdown: CancellationToken::new(),
        };
        (runtime, rx)
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn reexec(&self) -> &Reexec {
        &self.reexec
    }

    /// Token cancelled on shutdown; long-running work takes a child of it.
    pub fn cancellation(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn request_shutdown(&self) {
        tracing::info!("Shim shutdown requested");
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs `fut` on its own task. A panic is logged with its payload and
/// returned as `Err` instead of unwinding into the caller.
pub async fn guarded<F>(task: &'static str, fut: F) -> Result<F::Output, String>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(output) => Ok(output),
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            tracing::error!(task, panic = %message, "Background task panicked");
            Err(message)
        }
        Err(e) => Err(e.to_string()),
    }
}
