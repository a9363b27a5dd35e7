//! Process bootstrap: re-exec dispatch on `argv[0]` and log plumbing.

use crate::error::ShimError;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::backtrace::Backtrace;
use std::sync::{Arc, Mutex, Once};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing_subscriber::EnvFilter;

pub type ReexecHandler = fn() -> ExitCode;

/// Entry points the binary can be re-executed into, keyed by `argv[0]`.
#[derive(Debug, Default)]
pub struct Reexec {
    self_exe: Option<PathBuf>,
    handlers: HashMap<String, ReexecHandler>,
}

impl Reexec {
    pub fn new() -> Self {
        Self {
            self_exe: std::env::current_exe().ok(),
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, handler: ReexecHandler) {
        self.handlers.insert(name.to_string(), handler);
    }

    /// Path used to re-execute this binary.
    pub fn self_exe(&self) -> Result<&Path, ShimError> {
        self.self_exe
            .as_deref()
            .ok_or_else(|| ShimError::Unavailable("path of the running binary is unknown".to_string()))
    }

    fn handler(&self, argv0: &OsStr) -> Option<ReexecHandler> {
        let name = Path::new(argv0).file_name()?.to_str()?;
        self.handlers.get(name).copied()
    }

    pub fn matches(&self, argv0: &OsStr) -> bool {
        self.handler(argv0).is_some()
    }

    /// Runs the registered handler when this process was started under one
    /// of the registered names. `None` means the normal entry point should
    /// run.
    pub fn init(&self) -> Option<ExitCode> {
        let argv0 = std::env::args_os().next()?;
        let handler = self.handler(&argv0)?;
        Some(handler())
    }
}

/// `io::Write` over a shared Unix stream, so every log line of every thread
/// lands on one connection.
#[derive(Clone)]
struct SocketWriter {
    stream: Arc<Mutex<UnixStream>>,
}

impl Write for SocketWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        stream.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }
}

/// Installs the global subscriber: `RUST_LOG` filtering (default `info`),
/// written to `log_socket` when given and to stderr otherwise.
pub fn init_logging(log_socket: Option<&Path>) -> Result<(), ShimError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match log_socket {
        Some(path) => {
            let stream = UnixStream::connect(path).map_err(|e| {
                ShimError::Logging(format!("connect {}: {}", path.display(), e))
            })?;
            let writer = SocketWriter {
                stream: Arc::new(Mutex::new(stream)),
            };
            builder
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| ShimError::Logging(e.to_string()))
}

/// Logs every panic with its location and a backtrace before the previous
/// hook runs. Background tasks only see the payload once the panic reaches
/// their join handle. Installing it more than once has no effect.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let payload = info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_default();
            tracing::error!(
                panic = %payload,
                location = %location,
                backtrace = %Backtrace::force_capture(),
                "Panic"
            );
            previous(info);
        }));
    });
}

/// Collects the log lines of child processes that log to a socket.
pub struct LogProxy {
    listener: UnixListener,
    path: PathBuf,
}

impl LogProxy {
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, ShimError> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copies every line from every connection to `out` until the listener
    /// fails.
    pub async fn run<W>(self, out: W) -> Result<(), ShimError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let out = Arc::new(tokio::sync::Mutex::new(out));
        loop {
            let (stream, _) = self.listener.accept().await?;
            let out = out.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let mut out = out.lock().await;
                            let written = async {
                                out.write_all(line.as_bytes()).await?;
                                out.write_all(b"\n").await?;
                                out.flush().await
                            };
                            if written.await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(e) => {
                            tracing::debug!(error = %e, "Log connection failed");
                            return;
                        }
                    }
                }
            });
        }
    }
}
