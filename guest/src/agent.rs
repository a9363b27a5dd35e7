use crate::error::AgentError;
use crate::process::{SpawnedProcess, exit_code, set_window_size, spawn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use oci_spec::runtime::Process;
use skiff_core::guest::guest_service_server::GuestService;
use skiff_core::guest::{RunSpecSignalRequest, RunSpecSignalResponse};
use std::os::fd::AsRawFd;
use std::collections::HashSet;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

const CHUNK_SIZE: usize = 32 * 1024;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

type ResponseStream = Pin<Box<dyn Stream<Item = Result<RunSpecSignalResponse, Status>> + Send>>;
type Responses = mpsc::Sender<Result<RunSpecSignalResponse, Status>>;

/// Runs one process per `RunSpecSignal` stream.
#[derive(Debug, Clone, Default)]
pub struct GuestAgent {
    root: Option<PathBuf>,
    live: Arc<Mutex<HashSet<u32>>>,
}

impl GuestAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confines every process to `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Default::default()
        }
    }

    /// SIGKILLs every process still attached to a stream.
    pub fn kill_all(&self) {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        for pid in live.iter() {
            tracing::debug!(pid, "Killing process on agent shutdown");
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
        }
    }

    fn track(&self, pid: u32, alive: bool) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if alive {
            live.insert(pid);
        } else {
            live.remove(&pid);
        }
    }
}

fn default_process() -> Process {
    let mut process = Process::default();
    process.set_args(Some(vec![crate::process::DEFAULT_SHELL.to_string()]));
    process
}

fn parse_process(spec: Option<&[u8]>) -> Result<Process, AgentError> {
    match spec {
        Some(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| AgentError::InvalidSpec(format!("process spec: {}", e))),
        None => Ok(default_process()),
    }
}

#[derive(Clone, Copy)]
enum OutputKind {
    Stdout,
    Stderr,
}

fn output_response(kind: OutputKind, data: Vec<u8>) -> RunSpecSignalResponse {
    match kind {
        OutputKind::Stdout => RunSpecSignalResponse {
            stdout: Some(data),
            ..Default::default()
        },
        OutputKind::Stderr => RunSpecSignalResponse {
            stderr: Some(data),
            ..Default::default()
        },
    }
}

fn pump_output(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    kind: OutputKind,
    tx: Responses,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Ok(output_response(kind, buf[..n].to_vec()))).await.is_err() {
                        break;
                    }
                }
                // A pty master reports EIO once the slave side is gone.
                Err(_) => break,
            }
        }
    })
}

struct Session {
    pid: Pid,
    stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pty_master: Option<std::os::fd::OwnedFd>,
}

impl Session {
    async fn apply(&mut self, req: RunSpecSignalRequest) {
        if let Some(data) = req.stdin {
            if let Some(stdin) = self.stdin.as_mut() {
                if let Err(e) = stdin.write_all(&data).await {
                    tracing::debug!(pid = %self.pid, error = %e, "Stdin write failed");
                    self.stdin = None;
                }
            }
        }
        if req.close_stdin == Some(true) {
            if let Some(mut stdin) = self.stdin.take() {
                let _ = stdin.shutdown().await;
            }
        }
        if let Some(size) = req.resize {
            if let Some(master) = &self.pty_master {
                if let Err(e) = set_window_size(master.as_raw_fd(), size.cols as u16, size.rows as u16)
                {
                    tracing::warn!(pid = %self.pid, error = %e, "Resize failed");
                }
            }
        }
        if let Some(signal) = req.signal {
            self.signal(signal);
        }
    }

    fn signal(&self, signal: i32) {
        match Signal::try_from(signal) {
            Ok(sig) => {
                tracing::debug!(pid = %self.pid, signal = %sig, "Delivering signal");
                if let Err(e) = kill(self.pid, sig) {
                    tracing::debug!(pid = %self.pid, error = %e, "Signal delivery failed");
                }
            }
            Err(_) => tracing::warn!(pid = %self.pid, signal, "Ignoring unknown signal"),
        }
    }
}

/// Feeds requests to the process until it exits, then reports the exit code
/// once every output chunk has been sent.
async fn drive(
    agent: GuestAgent,
    mut spawned: SpawnedProcess,
    first: RunSpecSignalRequest,
    mut inbound: Streaming<RunSpecSignalRequest>,
    tx: Responses,
) {
    let mut session = Session {
        pid: Pid::from_raw(spawned.pid as i32),
        stdin: spawned.stdin.take(),
        pty_master: spawned.pty_master.take(),
    };
    session.apply(first).await;

    let mut pumps = Vec::new();
    if let Some(stdout) = spawned.stdout.take() {
        pumps.push(pump_output(stdout, OutputKind::Stdout, tx.clone()));
    }
    if let Some(stderr) = spawned.stderr.take() {
        pumps.push(pump_output(stderr, OutputKind::Stderr, tx.clone()));
    }

    let mut inbound_open = true;
    let status = loop {
        tokio::select! {
            status = spawned.child.wait() => break status,
            msg = inbound.message(), if inbound_open => match msg {
                Ok(Some(req)) => session.apply(req).await,
                Ok(None) => inbound_open = false,
                Err(e) => {
                    tracing::warn!(pid = %session.pid, error = %e, "Client stream failed, killing process");
                    session.signal(Signal::SIGKILL as i32);
                    inbound_open = false;
                }
            },
        }
    };

    // Closing our pty end lets the output pump finish.
    drop(session);

    for pump in pumps {
        let abort = pump.abort_handle();
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await.is_err() {
            abort.abort();
        }
    }

    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::error!(pid = spawned.pid, error = %e, "Failed to wait for process");
            1
        }
    };
    tracing::info!(pid = spawned.pid, exit_code = code, "Process exited");
    agent.track(spawned.pid, false);

    let _ = tx
        .send(Ok(RunSpecSignalResponse {
            exit_code: Some(code),
            ..Default::default()
        }))
        .await;
}

#[tonic::async_trait]
impl GuestService for GuestAgent {
    type RunSpecSignalStream = ResponseStream;

    async fn run_spec_signal(
        &self,
        request: Request<Streaming<RunSpecSignalRequest>>,
    ) -> Result<Response<Self::RunSpecSignalStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty request stream"))?;

        let process = parse_process(first.spec.as_deref())?;
        let spawned = spawn(&process, self.root.as_deref())?;

        let (tx, rx) = mpsc::channel(64);
        tx.send(Ok(RunSpecSignalResponse {
            pid: Some(spawned.pid),
            ..Default::default()
        }))
        .await
        .map_err(|_| Status::cancelled("client went away"))?;
        self.track(spawned.pid, true);

        // The first message may carry more than the process spec.
        let first = RunSpecSignalRequest {
            spec: None,
            ..first
        };
        tokio::spawn(drive(self.clone(), spawned, first, inbound, tx));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
