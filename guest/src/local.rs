//! A [`Hypervisor`] without hardware virtualisation: each machine is a guest
//! agent bound to the VM's socket, either inside this process or in a
//! re-executed child.

use crate::agent::GuestAgent;
use crate::server::serve_unix;
use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use skiff_vm::{Hypervisor, VirtualMachine, VmConfig, VmError, VmState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot, watch};

/// `argv[0]` that routes a re-executed binary to the agent entry point.
pub const AGENT_REEXEC_NAME: &str = "skiff-agent";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum AgentMode {
    InProcess,
    Reexec { program: PathBuf },
}

#[derive(Debug, Clone)]
pub struct LocalHypervisor {
    mode: AgentMode,
    chroot: bool,
}

impl LocalHypervisor {
    pub fn in_process() -> Self {
        Self {
            mode: AgentMode::InProcess,
            chroot: false,
        }
    }

    /// Machines run `program` re-executed as [`AGENT_REEXEC_NAME`].
    pub fn reexec(program: impl Into<PathBuf>) -> Self {
        Self {
            mode: AgentMode::Reexec {
                program: program.into(),
            },
            chroot: false,
        }
    }

    /// Confines guest processes to the VM's rootfs directory.
    pub fn with_chroot(mut self, chroot: bool) -> Self {
        self.chroot = chroot;
        self
    }
}

#[async_trait]
impl Hypervisor for LocalHypervisor {
    async fn new_vm(&self, config: VmConfig) -> Result<Arc<dyn VirtualMachine>, VmError> {
        if config.rootfs_device().is_none() {
            return Err(VmError::Hypervisor(format!(
                "vm {} has no rootfs block device",
                config.id
            )));
        }
        for device in &config.block_devices {
            if !device.path.is_file() {
                return Err(VmError::Hypervisor(format!(
                    "block device {} missing: {}",
                    device.name,
                    device.path.display()
                )));
            }
        }

        let (state, _) = watch::channel(VmState::Starting);
        Ok(Arc::new(LocalVm {
            config,
            mode: self.mode.clone(),
            chroot: self.chroot,
            state: Arc::new(state),
            stop: Mutex::new(None),
        }))
    }
}

struct LocalVm {
    config: VmConfig,
    mode: AgentMode,
    chroot: bool,
    state: Arc<watch::Sender<VmState>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl LocalVm {
    fn agent_root(&self) -> Option<&Path> {
        self.chroot.then_some(self.config.rootfs_path.as_path())
    }

    fn start_in_process(&self, stop_rx: oneshot::Receiver<()>) -> Result<(), VmError> {
        let listener = UnixListener::bind(&self.config.guest_socket)?;
        let agent = match self.agent_root() {
            Some(root) => GuestAgent::with_root(root),
            None => GuestAgent::new(),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let served = agent.clone();
        let mut server = tokio::spawn(async move {
            serve_unix(listener, served, async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        let state = self.state.clone();
        let id = self.config.id.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                res = &mut server => Some(res),
                _ = stop_rx => None,
            };
            let outcome = match outcome {
                Some(res) => res,
                None => {
                    agent.kill_all();
                    let _ = shutdown_tx.send(());
                    match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                        Ok(res) => res,
                        Err(_) => {
                            server.abort();
                            Ok(Ok(()))
                        }
                    }
                }
            };
            let final_state = match outcome {
                Ok(Ok(())) => VmState::Stopped,
                Ok(Err(e)) => {
                    tracing::error!(vm_id = %id, error = %e, "Guest agent failed");
                    VmState::Error
                }
                Err(e) => {
                    tracing::error!(vm_id = %id, error = %e, "Guest agent task failed");
                    VmState::Error
                }
            };
            state.send_replace(final_state);
        });
        Ok(())
    }

    fn start_reexec(&self, program: &Path, stop_rx: oneshot::Receiver<()>) -> Result<(), VmError> {
        let mut cmd = Command::new(program);
        cmd.arg0(AGENT_REEXEC_NAME)
            .arg("--socket")
            .arg(&self.config.guest_socket)
            .process_group(0)
            .kill_on_drop(true);
        if let Some(root) = self.agent_root() {
            cmd.arg("--root").arg(root);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        tracing::debug!(vm_id = %self.config.id, pid, "Spawned guest agent");

        let state = self.state.clone();
        let id = self.config.id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = stop_rx => {
                    if let Some(pid) = pid {
                        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    }
                    child.wait().await
                }
            };
            let final_state = match status {
                Ok(status) if status.success() => VmState::Stopped,
                Ok(status) => {
                    tracing::info!(vm_id = %id, %status, "Guest agent exited");
                    VmState::Stopped
                }
                Err(e) => {
                    tracing::error!(vm_id = %id, error = %e, "Failed to wait for guest agent");
                    VmState::Error
                }
            };
            state.send_replace(final_state);
        });
        Ok(())
    }
}

#[async_trait]
impl VirtualMachine for LocalVm {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn start(&self) -> Result<(), VmError> {
        let mut stop = self.stop.lock().await;
        if *self.state.borrow() != VmState::Starting {
            return Err(VmError::InvalidState {
                id: self.config.id.clone(),
                state: self.state.borrow().to_string(),
            });
        }

        match std::fs::remove_file(&self.config.guest_socket) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let started = match &self.mode {
            AgentMode::InProcess => self.start_in_process(stop_rx),
            AgentMode::Reexec { program } => self.start_reexec(program, stop_rx),
        };
        if let Err(e) = started {
            self.state.send_replace(VmState::Error);
            return Err(e);
        }

        *stop = Some(stop_tx);
        self.state.send_replace(VmState::Running);
        tracing::info!(vm_id = %self.config.id, "Local VM running");
        Ok(())
    }

    async fn wait(&self) -> Result<(), VmError> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| VmError::Hypervisor("vm state channel closed".to_string()))?;
        match state {
            VmState::Error => Err(VmError::Hypervisor(format!(
                "vm {} terminated with an error",
                self.config.id
            ))),
            _ => Ok(()),
        }
    }

    async fn hard_stop(&self) -> Result<(), VmError> {
        let mut stop = self.stop.lock().await;
        let current = *self.state.borrow();
        match current {
            VmState::Stopped | VmState::Error => Ok(()),
            VmState::Starting => {
                self.state.send_replace(VmState::Stopped);
                Ok(())
            }
            VmState::Running | VmState::Stopping => {
                if let Some(tx) = stop.take() {
                    self.state.send_replace(VmState::Stopping);
                    let _ = tx.send(());
                }
                Ok(())
            }
        }
    }

    fn state(&self) -> VmState {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<VmState> {
        self.state.subscribe()
    }

    fn guest_socket(&self) -> &Path {
        &self.config.guest_socket
    }
}
