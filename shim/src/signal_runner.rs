//! Host side of one `RunSpecSignal` stream: starts a process in the guest,
//! forwards signals, stdin and resizes, and records how it exited.

use crate::error::ShimError;
use crate::events::{Event, EventSender, timestamp};
use crate::pio::{OutputWriter, ProcessIo, StdinReader};
use crate::runtime::guarded;
use chrono::{DateTime, Utc};
use oci_spec::runtime::Process;
use skiff_core::events::{TaskExit, TaskStart};
use skiff_core::guest::{RunSpecSignalRequest, WindowSize};
use skiff_vm::GuestClient;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Exit code recorded when the guest stream fails before reporting one.
pub const TRANSPORT_ERROR_EXIT: i32 = 18;
/// Exit code recorded when a background task for the process panicked.
pub const PANIC_EXIT: i32 = 1;
/// Exit code recorded when the shim had to tear the process down itself.
pub const KILLED_EXIT: i32 = 128 + 9;

const SIGKILL: i32 = 9;
const REQUEST_BUFFER: usize = 32;
const STDIN_CHUNK: usize = 32 * 1024;
const DESTROY_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerStatus::Created => write!(f, "created"),
            RunnerStatus::Running => write!(f, "running"),
            RunnerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why the guest stream failed, when it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitError {
    /// The stream broke or closed without an exit code.
    Transport(String),
    Panicked(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exit {
    pub code: i32,
    pub exited_at: DateTime<Utc>,
    pub error: Option<ExitError>,
}

impl Exit {
    pub fn status(&self) -> u32 {
        self.code as u32
    }
}

#[derive(Debug, Clone)]
pub struct RunnerState {
    pub status: RunnerStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit: Option<Exit>,
}

/// Everything `serve` consumes exactly once.
struct Pending {
    client: GuestClient,
    requests: mpsc::Receiver<RunSpecSignalRequest>,
    spec: Vec<u8>,
    window: Option<WindowSize>,
    io: ProcessIo,
}

pub struct SignalRunner {
    container_id: String,
    exec_id: String,
    requests: mpsc::Sender<RunSpecSignalRequest>,
    state: watch::Sender<RunnerState>,
    pending: Mutex<Option<Pending>>,
    stdin_pump: Mutex<Option<AbortHandle>>,
    cancel: CancellationToken,
    exiting: AtomicBool,
    events: EventSender,
}

pub struct RunnerParams {
    pub container_id: String,
    pub exec_id: String,
    pub client: GuestClient,
    pub process: Process,
    pub window: Option<WindowSize>,
    pub io: ProcessIo,
    pub events: EventSender,
    pub cancel: CancellationToken,
}

impl SignalRunner {
    /// A runner in `Created`: nothing is sent to the guest until
    /// [`SignalRunner::serve`].
    pub fn new(params: RunnerParams) -> Result<Arc<Self>, ShimError> {
        let spec = serde_json::to_vec(&params.process)?;
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        let (state, _) = watch::channel(RunnerState {
            status: RunnerStatus::Created,
            pid: None,
            started_at: None,
            exit: None,
        });
        Ok(Arc::new(Self {
            container_id: params.container_id,
            exec_id: params.exec_id,
            requests: tx,
            state,
            pending: Mutex::new(Some(Pending {
                client: params.client,
                requests: rx,
                spec,
                window: params.window,
                io: params.io,
            })),
            stdin_pump: Mutex::new(None),
            cancel: params.cancel,
            exiting: AtomicBool::new(false),
            events: params.events,
        }))
    }

    fn label(&self) -> &str {
        if self.exec_id.is_empty() {
            &self.container_id
        } else {
            &self.exec_id
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> RunnerStatus {
        self.state.borrow().status
    }

    /// Sends the process spec and drives the stream on a background task. Calling it
    /// again is a no-op.
    pub fn serve(self: &Arc<Self>) -> Result<(), ShimError> {
        let pending = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.take() {
                Some(p) => p,
                None => return Ok(()),
            }
        };

        self.state.send_modify(|s| {
            s.status = RunnerStatus::Running;
            s.started_at = Some(Utc::now());
        });
        // Queued before anything else can be, so the process spec is the first
        // message on the stream.
        self.requests
            .try_send(RunSpecSignalRequest {
                spec: Some(pending.spec.clone()),
                resize: pending.window,
                ..Default::default()
            })
            .map_err(|_| ShimError::Transport("request channel closed".to_string()))?;

        let runner = self.clone();
        tokio::spawn(async move {
            let driven = runner.clone();
            if let Err(panic) = guarded("signal-runner", async move { driven.drive(pending).await }).await {
                runner
                    .finish(PANIC_EXIT, Some(ExitError::Panicked(panic)))
                    .await;
            }
        });
        Ok(())
    }

    async fn drive(self: Arc<Self>, pending: Pending) {
        let Pending {
            mut client,
            requests,
            io,
            ..
        } = pending;
        let ProcessIo {
            stdin,
            mut stdout,
            mut stderr,
        } = io;

        if let Some(stdin) = stdin {
            let pump = tokio::spawn(pump_stdin(stdin, self.requests.clone()));
            *self.stdin_pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump.abort_handle());
        }

        let opened = tokio::select! {
            res = client.run_spec_signal(requests) => res,
            _ = self.cancel.cancelled() => {
                self.finish(KILLED_EXIT, Some(ExitError::Cancelled)).await;
                return;
            }
        };
        let mut responses = match opened {
            Ok(responses) => responses,
            Err(e) => {
                self.finish(TRANSPORT_ERROR_EXIT, Some(ExitError::Transport(e.to_string())))
                    .await;
                return;
            }
        };

        let (code, error) = loop {
            tokio::select! {
                msg = responses.message() => match msg {
                    Ok(Some(msg)) => {
                        if let Some(pid) = msg.pid {
                            tracing::debug!(container_id = %self.container_id, exec_id = %self.exec_id, pid, "Guest process started");
                            // Published before the pid is visible, so it
                            // precedes anything a caller of `wait_started`
                            // publishes and can never trail the exit.
                            if self.exec_id.is_empty() {
                                self.events
                                    .publish(Event::Start(TaskStart {
                                        container_id: self.container_id.clone(),
                                        pid,
                                    }))
                                    .await;
                            }
                            self.state.send_modify(|s| s.pid = Some(pid));
                        }
                        if let Some(data) = msg.stdout {
                            write_output(&mut stdout, &data, "stdout").await;
                        }
                        if let Some(data) = msg.stderr {
                            write_output(&mut stderr, &data, "stderr").await;
                        }
                        if let Some(code) = msg.exit_code {
                            break (code, None);
                        }
                    }
                    Ok(None) => {
                        break (
                            TRANSPORT_ERROR_EXIT,
                            Some(ExitError::Transport("stream closed without an exit code".to_string())),
                        );
                    }
                    Err(status) => {
                        break (TRANSPORT_ERROR_EXIT, Some(ExitError::Transport(status.to_string())));
                    }
                },
                _ = self.cancel.cancelled() => break (KILLED_EXIT, Some(ExitError::Cancelled)),
            }
        };

        // The host sees EOF on its FIFOs before it sees the exit.
        drop(stdout);
        drop(stderr);
        self.finish(code, error).await;
    }

    /// Records the exit and publishes `TaskExit` before waking waiters, so an
    /// exit is on the events channel by the time `wait` returns. Only the
    /// first call has any effect.
    async fn finish(&self, code: i32, error: Option<ExitError>) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_stdin_pump();

        let exited_at = Utc::now();
        match &error {
            Some(e) => tracing::warn!(
                container_id = %self.container_id,
                exec_id = %self.exec_id,
                exit_code = code,
                error = ?e,
                "Process exited abnormally"
            ),
            None => tracing::info!(
                container_id = %self.container_id,
                exec_id = %self.exec_id,
                exit_code = code,
                "Process exited"
            ),
        }

        let pid = self.state.borrow().pid.unwrap_or_default();
        self.events
            .publish(Event::Exit(TaskExit {
                container_id: self.container_id.clone(),
                id: self.label().to_string(),
                pid,
                exit_status: code as u32,
                exited_at: Some(timestamp(exited_at)),
            }))
            .await;

        self.state.send_modify(|s| {
            s.status = RunnerStatus::Stopped;
            s.exit = Some(Exit {
                code,
                exited_at,
                error,
            });
        });
    }

    fn stop_stdin_pump(&self) {
        if let Some(pump) = self
            .stdin_pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            pump.abort();
        }
    }

    /// Waits for the process to exit.
    pub async fn wait(&self) -> Exit {
        let mut rx = self.state.subscribe();
        loop {
            if let Some(exit) = rx.borrow_and_update().exit.clone() {
                return exit;
            }
            // The sender lives in `self`, so the channel outlives this call.
            if rx.changed().await.is_err() {
                return Exit {
                    code: TRANSPORT_ERROR_EXIT,
                    exited_at: Utc::now(),
                    error: Some(ExitError::Cancelled),
                };
            }
        }
    }

    /// Waits until the guest reported a pid or the process already ended.
    pub async fn wait_started(&self) -> RunnerState {
        let mut rx = self.state.subscribe();
        match rx
            .wait_for(|s| s.pid.is_some() || s.status == RunnerStatus::Stopped)
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Forwards `signal` to the guest process.
    pub async fn send_signal(&self, signal: i32) -> Result<(), ShimError> {
        let state = self.state();
        match state.status {
            RunnerStatus::Created => Err(ShimError::Unavailable(format!(
                "process {} has not been started",
                self.label()
            ))),
            RunnerStatus::Stopped => Err(ShimError::ProcessExited {
                id: self.label().to_string(),
                code: state.exit.map(|e| e.code).unwrap_or_default(),
            }),
            RunnerStatus::Running => {
                tracing::debug!(container_id = %self.container_id, exec_id = %self.exec_id, signal, "Forwarding signal");
                self.send(RunSpecSignalRequest {
                    signal: Some(signal),
                    ..Default::default()
                })
                .await
            }
        }
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), ShimError> {
        if self.status() != RunnerStatus::Running {
            return Ok(());
        }
        self.send(RunSpecSignalRequest {
            resize: Some(WindowSize { cols, rows }),
            ..Default::default()
        })
        .await
    }

    /// Stops forwarding host stdin and closes the guest side.
    pub async fn close_stdin(&self) -> Result<(), ShimError> {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(pending) = pending.as_mut() {
                pending.io.close_stdin();
                return Ok(());
            }
        }
        self.stop_stdin_pump();
        if self.status() != RunnerStatus::Running {
            return Ok(());
        }
        self.send(RunSpecSignalRequest {
            close_stdin: Some(true),
            ..Default::default()
        })
        .await
    }

    async fn send(&self, req: RunSpecSignalRequest) -> Result<(), ShimError> {
        self.requests
            .send(req)
            .await
            .map_err(|_| ShimError::Transport(format!("stream for {} is closed", self.label())))
    }

    /// Ends the process with `code` without hearing from the guest, e.g.
    /// once its VM is gone. An exit already recorded is kept.
    pub async fn abort(&self, code: i32, error: ExitError) -> Exit {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.finish(code, Some(error)).await;
        self.cancel.cancel();
        self.wait().await
    }

    /// SIGKILLs the process through the stream, gives it a moment to report
    /// its exit, then cancels the stream. Returns once the runner is
    /// stopped.
    pub async fn destroy(&self) -> Exit {
        let never_served = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if never_served {
            self.finish(KILLED_EXIT, Some(ExitError::Cancelled)).await;
            return self.wait().await;
        }

        if self.status() == RunnerStatus::Running {
            let _ = self.requests.try_send(RunSpecSignalRequest {
                signal: Some(SIGKILL),
                ..Default::default()
            });
            if let Ok(exit) = tokio::time::timeout(DESTROY_GRACE, self.wait()).await {
                return exit;
            }
            tracing::warn!(container_id = %self.container_id, exec_id = %self.exec_id, "Process ignored SIGKILL, cancelling stream");
        }

        self.cancel.cancel();
        match tokio::time::timeout(DESTROY_GRACE, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                self.finish(KILLED_EXIT, Some(ExitError::Cancelled)).await;
                self.wait().await
            }
        }
    }
}

async fn write_output(out: &mut Option<OutputWriter>, data: &[u8], stream: &'static str) {
    if let Some(writer) = out.as_mut() {
        let written = match writer.write_all(data).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(stream, error = %e, "Host output closed, dropping further output");
            *out = None;
        }
    }
}

async fn pump_stdin(mut stdin: StdinReader, requests: mpsc::Sender<RunSpecSignalRequest>) {
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let req = RunSpecSignalRequest {
                    stdin: Some(buf[..n].to_vec()),
                    ..Default::default()
                };
                if requests.send(req).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Stdin read failed");
                break;
            }
        }
    }
    let _ = requests
        .send(RunSpecSignalRequest {
            close_stdin: Some(true),
            ..Default::default()
        })
        .await;
}
