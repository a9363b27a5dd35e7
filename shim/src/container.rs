use crate::error::ShimError;
use crate::events::Event;
use crate::pio::StdioPaths;
use crate::process::ManagedProcess;
use crate::runtime::{Runtime, guarded};
use crate::signal_runner::{Exit, ExitError, PANIC_EXIT, TRANSPORT_ERROR_EXIT};
use oci_spec::runtime::{Process, Spec};
use skiff_core::events::TaskExecAdded;
use skiff_vm::{RunningVm, VmError, VmState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// How long processes get to report their own exit once the VM halted.
const VM_EXIT_GRACE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct ContainerInner {
    auxiliary: HashMap<String, Arc<ManagedProcess>>,
    vm_started: bool,
    vm_waiter: Option<JoinHandle<()>>,
    destroyed: bool,
}

/// A container: one VM, its primary process and any exec'd processes.
pub struct Container {
    id: String,
    bundle: PathBuf,
    spec: Spec,
    vm: Arc<RunningVm>,
    primary: Arc<ManagedProcess>,
    runtime: Runtime,
    inner: Mutex<ContainerInner>,
}

impl Container {
    pub fn new(
        id: &str,
        bundle: &Path,
        spec: Spec,
        vm: RunningVm,
        primary: ManagedProcess,
        runtime: Runtime,
    ) -> Self {
        Self {
            id: id.to_string(),
            bundle: bundle.to_path_buf(),
            spec,
            vm: Arc::new(vm),
            primary: Arc::new(primary),
            runtime,
            inner: Mutex::new(ContainerInner::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn vm(&self) -> &RunningVm {
        &self.vm
    }

    pub fn primary(&self) -> &Arc<ManagedProcess> {
        &self.primary
    }

    /// The primary for an empty `exec_id`, otherwise the exec'd process.
    pub async fn process(&self, exec_id: &str) -> Result<Arc<ManagedProcess>, ShimError> {
        if exec_id.is_empty() {
            return Ok(self.primary.clone());
        }
        self.inner
            .lock()
            .await
            .auxiliary
            .get(exec_id)
            .cloned()
            .ok_or_else(|| ShimError::NotFound(format!("exec {} in container {}", exec_id, self.id)))
    }

    /// Publishes `event` while holding the container lock, so events of one
    /// container go out in the order their transitions happened.
    pub async fn publish(&self, event: Event) {
        let _inner = self.inner.lock().await;
        self.runtime.events().publish(event).await;
    }

    /// Registers an exec'd process with its stdio opened. Nothing is kept if
    /// any step fails.
    pub async fn add_exec(
        &self,
        exec_id: &str,
        process: Process,
        stdio: StdioPaths,
        terminal: bool,
    ) -> Result<Arc<ManagedProcess>, ShimError> {
        if exec_id.is_empty() {
            return Err(ShimError::InvalidSpec("exec id must not be empty".to_string()));
        }
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return Err(ShimError::InvalidState {
                id: self.id.clone(),
                state: "destroyed".to_string(),
            });
        }
        if inner.auxiliary.contains_key(exec_id) {
            return Err(ShimError::AlreadyExists(format!(
                "exec {} in container {}",
                exec_id, self.id
            )));
        }

        let exec = Arc::new(ManagedProcess::new(&self.id, exec_id, process, stdio, terminal));
        if let Err(e) = exec.setup().await {
            exec.destroy().await;
            return Err(e);
        }
        inner.auxiliary.insert(exec_id.to_string(), exec.clone());
        self.runtime
            .events()
            .publish(Event::ExecAdded(TaskExecAdded {
                container_id: self.id.clone(),
                exec_id: exec_id.to_string(),
            }))
            .await;
        tracing::info!(container_id = %self.id, exec_id = %exec_id, "Exec process added");
        Ok(exec)
    }

    pub async fn remove_exec(&self, exec_id: &str) -> Option<Arc<ManagedProcess>> {
        self.inner.lock().await.auxiliary.remove(exec_id)
    }

    /// Boots the VM on first call and tracks it until it halts. The tracker
    /// hard-stops the VM when the shim shuts down, and ends every process
    /// still running once the VM is gone.
    pub async fn start_vm(self: &Arc<Self>) -> Result<(), ShimError> {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return Err(ShimError::InvalidState {
                id: self.id.clone(),
                state: "destroyed".to_string(),
            });
        }
        if inner.vm_started {
            return Ok(());
        }
        self.vm.start().await?;
        inner.vm_started = true;

        let vm = self.vm.clone();
        let container = Arc::downgrade(self);
        let cancel = self.runtime.cancellation();
        inner.vm_waiter = Some(tokio::spawn(async move {
            let waited = guarded("vm-wait", async move {
                tokio::select! {
                    res = vm.wait() => res,
                    _ = cancel.cancelled() => {
                        tracing::info!(vm_id = %vm.id(), "Shutdown requested, stopping VM");
                        vm.hard_stop().await
                    }
                }
            })
            .await;
            track_vm_exit(container, waited).await;
        }));
        Ok(())
    }

    /// Ends every process that has not exited yet with `code`.
    async fn end_processes(&self, code: i32, error: ExitError, grace: Duration) {
        let auxiliary: Vec<_> = self.inner.lock().await.auxiliary.values().cloned().collect();
        for process in auxiliary.iter().chain(std::iter::once(&self.primary)) {
            process
                .abort(code, error.clone(), grace, self.runtime.events())
                .await;
        }
    }

    pub async fn vm_started(&self) -> bool {
        self.inner.lock().await.vm_started
    }

    /// Runs the process behind `exec_id` in the guest and returns its pid.
    pub async fn start_process(self: &Arc<Self>, exec_id: &str) -> Result<u32, ShimError> {
        let process = self.process(exec_id).await?;
        if process.is_primary() {
            self.start_vm().await?;
        } else if !self.vm_started().await || self.vm.state() != VmState::Running {
            return Err(ShimError::InvalidState {
                id: self.id.clone(),
                state: format!("vm {}", self.vm.state()),
            });
        }

        let client = self.vm.guest_service().await?;
        let runner = process.start_signal_runner(client, &self.runtime).await?;
        runner.serve()?;

        let started = runner.wait_started().await;
        match (started.pid, started.exit) {
            (Some(pid), _) => {
                tracing::info!(container_id = %self.id, exec_id = %exec_id, pid, "Process started");
                Ok(pid)
            }
            (None, Some(Exit { error: Some(e), .. })) => Err(ShimError::Transport(format!(
                "process {} failed to start: {:?}",
                process.id(),
                e
            ))),
            (None, _) => Ok(0),
        }
    }

    /// Destroys every process, then the VM. Safe to call more than once.
    pub async fn destroy(&self) -> Result<(), ShimError> {
        let (auxiliary, waiter) = {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return Ok(());
            }
            inner.destroyed = true;
            (
                inner.auxiliary.values().cloned().collect::<Vec<_>>(),
                inner.vm_waiter.take(),
            )
        };

        for exec in auxiliary {
            exec.destroy().await;
        }
        self.primary.destroy().await;

        let destroyed = self.vm.destroy().await;
        if let Some(waiter) = waiter {
            waiter.abort();
        }
        tracing::info!(container_id = %self.id, "Container destroyed");
        destroyed.map_err(ShimError::from)
    }
}

async fn track_vm_exit(container: Weak<Container>, waited: Result<Result<(), VmError>, String>) {
    let Some(container) = container.upgrade() else {
        return;
    };
    let id = container.id();
    let (code, error, grace) = match waited {
        Ok(Ok(())) => {
            tracing::info!(container_id = %id, "VM halted");
            (
                TRANSPORT_ERROR_EXIT,
                ExitError::Transport("vm halted".to_string()),
                VM_EXIT_GRACE,
            )
        }
        Ok(Err(e)) => {
            tracing::warn!(container_id = %id, error = %e, "VM failed");
            (
                TRANSPORT_ERROR_EXIT,
                ExitError::Transport(format!("vm failed: {}", e)),
                VM_EXIT_GRACE,
            )
        }
        Err(panic) => {
            tracing::error!(container_id = %id, panic = %panic, "VM tracker panicked, ending container processes");
            (PANIC_EXIT, ExitError::Panicked(panic), Duration::ZERO)
        }
    };
    container.end_processes(code, error, grace).await;
}
