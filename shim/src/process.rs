use crate::console::Console;
use crate::error::ShimError;
use crate::events::{Event, EventSender, timestamp};
use crate::pio::{ProcessIo, StdioPaths};
use crate::runtime::Runtime;
use crate::signal_runner::{Exit, ExitError, KILLED_EXIT, RunnerParams, RunnerStatus, SignalRunner};
use chrono::{DateTime, Utc};
use oci_spec::runtime::Process;
use skiff_core::events::TaskExit;
use skiff_vm::GuestClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Id reported for the container's own process.
pub const PRIMARY_ID: &str = "primary";

const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone)]
pub struct ProcessState {
    pub status: RunnerStatus,
    pub pid: u32,
    pub exit: Option<Exit>,
}

impl ProcessState {
    pub fn exit_status(&self) -> u32 {
        self.exit.as_ref().map(Exit::status).unwrap_or_default()
    }

    pub fn exited_at(&self) -> Option<DateTime<Utc>> {
        self.exit.as_ref().map(|e| e.exited_at)
    }
}

#[derive(Default)]
struct ProcessInner {
    io: Option<ProcessIo>,
    console: Option<Console>,
    runner: Option<Arc<SignalRunner>>,
    /// Exit recorded without a runner, e.g. destroyed before start.
    exit: Option<Exit>,
}

/// One process of a container: the primary or an exec'd one.
pub struct ManagedProcess {
    container_id: String,
    exec_id: String,
    process: Process,
    stdio: StdioPaths,
    terminal: bool,
    inner: Mutex<ProcessInner>,
}

impl ManagedProcess {
    pub fn new(
        container_id: &str,
        exec_id: &str,
        mut process: Process,
        stdio: StdioPaths,
        terminal: bool,
    ) -> Self {
        if process.args().as_ref().is_none_or(|a| a.is_empty()) {
            process.set_args(Some(vec![DEFAULT_SHELL.to_string()]));
        }
        process.set_terminal(Some(terminal));
        let console = terminal.then(|| Console::for_process(&process));
        Self {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
            process,
            stdio,
            terminal,
            inner: Mutex::new(ProcessInner {
                console,
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> &str {
        if self.exec_id.is_empty() {
            PRIMARY_ID
        } else {
            &self.exec_id
        }
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    pub fn is_primary(&self) -> bool {
        self.exec_id.is_empty()
    }

    pub fn stdio(&self) -> &StdioPaths {
        &self.stdio
    }

    pub fn terminal(&self) -> bool {
        self.terminal
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    /// Opens the host stdio. Calling it again keeps the open handles.
    pub async fn setup(&self) -> Result<(), ShimError> {
        let mut inner = self.inner.lock().await;
        if inner.io.is_none() && inner.runner.is_none() {
            inner.io = Some(ProcessIo::open(&self.stdio)?);
        }
        Ok(())
    }

    /// Creates the process's runner against `client`. The runner starts in
    /// `Created`; nothing reaches the guest until it is served.
    pub async fn start_signal_runner(
        &self,
        client: GuestClient,
        runtime: &Runtime,
    ) -> Result<Arc<SignalRunner>, ShimError> {
        let mut inner = self.inner.lock().await;
        if inner.runner.is_some() || inner.exit.is_some() {
            return Err(ShimError::InvalidState {
                id: self.id().to_string(),
                state: "already started".to_string(),
            });
        }
        let io = match inner.io.take() {
            Some(io) => io,
            None => ProcessIo::open(&self.stdio)?,
        };
        let runner = SignalRunner::new(RunnerParams {
            container_id: self.container_id.clone(),
            exec_id: self.exec_id.clone(),
            client,
            process: self.process.clone(),
            window: inner.console.as_ref().map(Console::window_size),
            io,
            events: runtime.events().clone(),
            cancel: runtime.cancellation(),
        })?;
        inner.runner = Some(runner.clone());
        Ok(runner)
    }

    pub async fn runner(&self) -> Option<Arc<SignalRunner>> {
        self.inner.lock().await.runner.clone()
    }

    pub async fn send_signal_to_running_cmd(&self, signal: i32) -> Result<(), ShimError> {
        let inner = self.inner.lock().await;
        match &inner.runner {
            Some(runner) => runner.send_signal(signal).await,
            None => Err(ShimError::Unavailable(format!(
                "process {} has not been started",
                self.id()
            ))),
        }
    }

    /// Forwards `signal` if the process is running, then tears it down.
    /// Stopped processes are left alone.
    pub async fn kill(&self, signal: i32) -> Result<Exit, ShimError> {
        let mut inner = self.inner.lock().await;
        if let Some(exit) = Self::recorded_exit(&inner) {
            tracing::debug!(container_id = %self.container_id, exec_id = %self.exec_id, "Kill on stopped process");
            return Ok(exit);
        }
        if let Some(runner) = &inner.runner
            && runner.status() == RunnerStatus::Running
            && let Err(e) = runner.send_signal(signal).await
        {
            tracing::debug!(container_id = %self.container_id, exec_id = %self.exec_id, error = %e, "Signal not delivered");
        }
        Ok(self.destroy_locked(&mut inner).await)
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), ShimError> {
        let mut inner = self.inner.lock().await;
        let Some(console) = inner.console.as_mut() else {
            tracing::debug!(container_id = %self.container_id, exec_id = %self.exec_id, "Resize on process without a pty");
            return Ok(());
        };
        console.resize(cols, rows);
        match &inner.runner {
            Some(runner) => runner.resize(cols, rows).await,
            None => Ok(()),
        }
    }

    pub async fn close_io(&self) -> Result<(), ShimError> {
        let mut inner = self.inner.lock().await;
        if let Some(io) = inner.io.as_mut() {
            io.close_stdin();
        }
        match &inner.runner {
            Some(runner) => runner.close_stdin().await,
            None => Ok(()),
        }
    }

    /// Stops the process, closes its stdio and console. Idempotent.
    pub async fn destroy(&self) -> Exit {
        let mut inner = self.inner.lock().await;
        self.destroy_locked(&mut inner).await
    }

    async fn destroy_locked(&self, inner: &mut ProcessInner) -> Exit {
        inner.io = None;
        inner.console = None;
        if let Some(runner) = &inner.runner {
            return runner.destroy().await;
        }
        inner
            .exit
            .get_or_insert_with(|| {
                tracing::info!(container_id = %self.container_id, exec_id = %self.exec_id, "Process destroyed before start");
                Exit {
                    code: KILLED_EXIT,
                    exited_at: Utc::now(),
                    error: Some(ExitError::Cancelled),
                }
            })
            .clone()
    }

    /// Records `code` as the exit of a process that has not exited yet, for
    /// when its VM went away. A live stream gets `grace` to report the real
    /// exit first.
    pub async fn abort(
        &self,
        code: i32,
        error: ExitError,
        grace: Duration,
        events: &EventSender,
    ) -> Exit {
        let mut inner = self.inner.lock().await;
        if let Some(exit) = Self::recorded_exit(&inner) {
            return exit;
        }
        inner.io = None;
        inner.console = None;

        if let Some(runner) = inner.runner.clone() {
            if runner.status() == RunnerStatus::Running
                && let Ok(exit) = tokio::time::timeout(grace, runner.wait()).await
            {
                return exit;
            }
            return runner.abort(code, error).await;
        }

        let exit = Exit {
            code,
            exited_at: Utc::now(),
            error: Some(error),
        };
        tracing::warn!(
            container_id = %self.container_id,
            exec_id = %self.exec_id,
            exit_code = code,
            error = ?exit.error,
            "Process ended before it was started"
        );
        let label = if self.exec_id.is_empty() {
            &self.container_id
        } else {
            &self.exec_id
        };
        events
            .publish(Event::Exit(TaskExit {
                container_id: self.container_id.clone(),
                id: label.clone(),
                pid: 0,
                exit_status: exit.status(),
                exited_at: Some(timestamp(exit.exited_at)),
            }))
            .await;
        inner.exit = Some(exit.clone());
        exit
    }

    fn recorded_exit(inner: &ProcessInner) -> Option<Exit> {
        match &inner.runner {
            Some(runner) => runner.state().exit,
            None => inner.exit.clone(),
        }
    }

    /// Waits for the process to exit. A process that was never started has
    /// nothing to wait on.
    pub async fn wait(&self) -> Result<Exit, ShimError> {
        let runner = {
            let inner = self.inner.lock().await;
            match (&inner.runner, &inner.exit) {
                (Some(runner), _) => runner.clone(),
                (None, Some(exit)) => return Ok(exit.clone()),
                (None, None) => {
                    return Err(ShimError::Unavailable(format!(
                        "process {} has not been started",
                        self.id()
                    )));
                }
            }
        };
        runner.serve()?;
        Ok(runner.wait().await)
    }

    pub async fn state(&self) -> ProcessState {
        let inner = self.inner.lock().await;
        match &inner.runner {
            Some(runner) => {
                let state = runner.state();
                ProcessState {
                    status: state.status,
                    pid: state.pid.unwrap_or_default(),
                    exit: state.exit,
                }
            }
            None => ProcessState {
                status: if inner.exit.is_some() {
                    RunnerStatus::Stopped
                } else {
                    RunnerStatus::Created
                },
                pid: 0,
                exit: inner.exit.clone(),
            },
        }
    }
}
