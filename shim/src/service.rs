//! The task service: containers, their processes and the lifecycle events
//! the host observes.

use crate::container::Container;
use crate::error::ShimError;
use crate::events::{Event, timestamp};
use crate::pio::StdioPaths;
use crate::process::ManagedProcess;
use crate::registry::Registry;
use crate::runtime::Runtime;
use crate::signal_runner::RunnerStatus;
use chrono::{DateTime, Utc};
use oci_spec::runtime::{Process, Spec};
use skiff_core::TASK_API_VERSION;
use skiff_core::events::{RootfsMount, TaskCreate, TaskDelete, TaskIo};
use skiff_image::{Ext4Builder, ImageCache, Platform};
use skiff_mount::MountSpec;
use skiff_vm::{Hypervisor, ImageVmConfig, Readiness, RootfsVmConfig, RunningVm};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CONFIG_FILE: &str = "config.json";
pub const GUEST_SOCKET_FILE: &str = "agent.sock";

pub const ANNOTATION_IMAGE_REF: &str = "skiff.image.ref";
pub const ANNOTATION_PLATFORM: &str = "skiff.image.platform";
pub const ANNOTATION_MEMORY_MIB: &str = "skiff.vm.memory-mib";
pub const ANNOTATION_VCPUS: &str = "skiff.vm.vcpus";

/// `sun_path` limit on the platforms we run on.
const MAX_SOCKET_PATH: usize = 104;
const MIB: u64 = 1024 * 1024;

/// VM sizing used when the bundle does not ask for anything else.
#[derive(Debug, Clone)]
pub struct VmDefaults {
    pub memory_bytes: u64,
    pub vcpus: u8,
    pub platform: Platform,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            memory_bytes: 64 * MIB,
            vcpus: 1,
            platform: Platform::host_linux(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub id: String,
    pub bundle: PathBuf,
    pub rootfs: Vec<MountSpec>,
    pub terminal: bool,
    pub stdio: StdioPaths,
}

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub id: String,
    pub exec_id: String,
    pub terminal: bool,
    pub stdio: StdioPaths,
    pub process: Process,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitInfo {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StateInfo {
    pub id: String,
    pub exec_id: String,
    pub bundle: PathBuf,
    pub pid: u32,
    pub status: RunnerStatus,
    pub stdio: StdioPaths,
    pub terminal: bool,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub shim_pid: u32,
    pub task_pid: u32,
    pub version: &'static str,
}

pub struct TaskService {
    runtime: Runtime,
    hypervisor: Arc<dyn Hypervisor>,
    images: Arc<ImageCache>,
    ext4: Arc<dyn Ext4Builder>,
    defaults: VmDefaults,
    readiness: Option<Arc<dyn Readiness>>,
    containers: Registry<Container>,
}

impl TaskService {
    pub fn new(
        runtime: Runtime,
        hypervisor: Arc<dyn Hypervisor>,
        images: Arc<ImageCache>,
        ext4: Arc<dyn Ext4Builder>,
        defaults: VmDefaults,
    ) -> Self {
        Self {
            runtime,
            hypervisor,
            images,
            ext4,
            defaults,
            readiness: None,
            containers: Registry::new(),
        }
    }

    /// Overrides how VMs decide their guest agent is reachable.
    pub fn with_readiness(mut self, readiness: Arc<dyn Readiness>) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.containers.ids()
    }

    /// Reads the bundle's spec, creates the container's VM without booting
    /// it, and registers the container. Returns the primary's pid, which is
    /// 0 until it is started.
    pub async fn create(&self, params: CreateParams) -> Result<u32, ShimError> {
        let id = params.id.as_str();
        if id.is_empty() {
            return Err(ShimError::InvalidSpec("container id must not be empty".to_string()));
        }
        // Held until the container is registered; any early return frees it.
        let reservation = self.containers.reserve(id)?;

        let spec = Spec::load(params.bundle.join(CONFIG_FILE))?;
        let process = spec
            .process()
            .clone()
            .ok_or_else(|| ShimError::InvalidSpec(format!("{} has no process", CONFIG_FILE)))?;
        let annotations = spec.annotations().clone().unwrap_or_default();

        tracing::info!(
            container_id = %id,
            bundle = %params.bundle.display(),
            image = annotations.get(ANNOTATION_IMAGE_REF).map(String::as_str).unwrap_or("-"),
            "Creating container"
        );

        let vm = self
            .create_vm(id, &params.bundle, &spec, &params.rootfs, &annotations)
            .await?;
        let vm = match &self.readiness {
            Some(readiness) => vm.with_readiness(readiness.clone()),
            None => vm,
        };

        let primary = ManagedProcess::new(id, "", process, params.stdio.clone(), params.terminal);
        if let Err(e) = primary.setup().await {
            if let Err(destroy) = vm.destroy().await {
                tracing::warn!(container_id = %id, error = %destroy, "Failed to destroy VM after setup error");
            }
            return Err(e);
        }

        let container = Arc::new(Container::new(
            id,
            &params.bundle,
            spec,
            vm,
            primary,
            self.runtime.clone(),
        ));
        reservation.fill(container.clone());

        container
            .publish(Event::Create(TaskCreate {
                container_id: id.to_string(),
                bundle: params.bundle.display().to_string(),
                rootfs: params
                    .rootfs
                    .iter()
                    .map(|m| RootfsMount {
                        r#type: m.mount_type.clone(),
                        source: m.source.clone(),
                        target: String::new(),
                        options: m.options.clone(),
                    })
                    .collect(),
                io: Some(TaskIo {
                    stdin: params.stdio.stdin.clone(),
                    stdout: params.stdio.stdout.clone(),
                    stderr: params.stdio.stderr.clone(),
                    terminal: params.terminal,
                }),
                checkpoint: String::new(),
                pid: 0,
            }))
            .await;
        Ok(0)
    }

    async fn create_vm(
        &self,
        id: &str,
        bundle: &Path,
        spec: &Spec,
        mounts: &[MountSpec],
        annotations: &HashMap<String, String>,
    ) -> Result<RunningVm, ShimError> {
        let memory_bytes = match annotations.get(ANNOTATION_MEMORY_MIB) {
            Some(mib) => parse_annotation::<u64>(ANNOTATION_MEMORY_MIB, mib)? * MIB,
            None => self.defaults.memory_bytes,
        };
        let vcpus = match annotations.get(ANNOTATION_VCPUS) {
            Some(n) => parse_annotation::<u8>(ANNOTATION_VCPUS, n)?,
            None => self.defaults.vcpus,
        };
        let platform = match annotations.get(ANNOTATION_PLATFORM) {
            Some(p) => parse_annotation::<Platform>(ANNOTATION_PLATFORM, p)?,
            None => self.defaults.platform.clone(),
        };
        let guest_socket = guest_socket_path(bundle);

        if let Some(image_ref) = annotations.get(ANNOTATION_IMAGE_REF) {
            let vm = RunningVm::create(
                self.hypervisor.as_ref(),
                &self.images,
                ImageVmConfig {
                    id: id.to_string(),
                    image_ref: image_ref.clone(),
                    platform,
                    memory_bytes,
                    vcpus,
                    guest_socket,
                },
            )
            .await?;
            return Ok(vm);
        }

        let rootfs = bundle_rootfs(bundle, spec)?;
        if !mounts.is_empty() {
            let specs = mounts.to_vec();
            let target = rootfs.clone();
            tokio::task::spawn_blocking(move || skiff_mount::mount_all(&specs, &target))
                .await
                .map_err(|e| ShimError::Io(std::io::Error::other(e)))??;
        }

        let created = RunningVm::from_rootfs(
            self.hypervisor.as_ref(),
            self.ext4.as_ref(),
            RootfsVmConfig {
                id: id.to_string(),
                rootfs: rootfs.clone(),
                platform,
                memory_bytes,
                vcpus,
                guest_socket,
            },
        )
        .await;
        match created {
            Ok(vm) => Ok(vm),
            Err(e) => {
                if !mounts.is_empty()
                    && let Err(unmount) = skiff_mount::unmount_recursive(&rootfs)
                {
                    tracing::warn!(container_id = %id, error = %unmount, "Failed to unmount rootfs after create error");
                }
                Err(e.into())
            }
        }
    }

    fn container(&self, id: &str) -> Result<Arc<Container>, ShimError> {
        self.containers.get(id)
    }

    /// Boots the VM on the primary's start and runs the process in the
    /// guest.
    pub async fn start(&self, id: &str, exec_id: &str) -> Result<u32, ShimError> {
        let container = self.container(id)?;
        let pid = container.start_process(exec_id).await?;
        Ok(pid)
    }

    /// Adds an exec'd process in `Created`. `TaskExecAdded` is published
    /// once it is registered.
    pub async fn exec(&self, params: ExecParams) -> Result<(), ShimError> {
        let container = self.container(&params.id)?;
        container
            .add_exec(&params.exec_id, params.process, params.stdio, params.terminal)
            .await?;
        Ok(())
    }

    pub async fn wait(&self, id: &str, exec_id: &str) -> Result<ExitInfo, ShimError> {
        let process = self.container(id)?.process(exec_id).await?;
        let exit = process.wait().await?;
        Ok(ExitInfo {
            pid: process.state().await.pid,
            exit_status: exit.status(),
            exited_at: Some(exit.exited_at),
        })
    }

    /// Signals the process if it runs and tears it down. Killing the primary
    /// also stops the VM; the container stays registered until deleted.
    pub async fn kill(&self, id: &str, exec_id: &str, signal: u32, all: bool) -> Result<(), ShimError> {
        let container = self.container(id)?;
        let process = container.process(exec_id).await?;
        tracing::info!(container_id = %id, exec_id = %exec_id, signal, all, "Killing process");

        process.kill(signal as i32).await?;
        if process.is_primary() {
            container.destroy().await?;
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str, exec_id: &str) -> Result<ExitInfo, ShimError> {
        let container = self.container(id)?;

        if !exec_id.is_empty() {
            let process = container.process(exec_id).await?;
            process.destroy().await;
            container.remove_exec(exec_id).await;
            let state = process.state().await;
            tracing::info!(container_id = %id, exec_id = %exec_id, "Exec process deleted");
            return Ok(ExitInfo {
                pid: state.pid,
                exit_status: state.exit_status(),
                exited_at: state.exited_at(),
            });
        }

        if let Err(e) = container.destroy().await {
            tracing::warn!(container_id = %id, error = %e, "Container teardown incomplete");
        }
        self.containers.remove(id);

        let state = container.primary().state().await;
        container
            .publish(Event::Delete(TaskDelete {
                container_id: id.to_string(),
                pid: state.pid,
                exit_status: state.exit_status(),
                exited_at: state.exited_at().map(timestamp),
                id: id.to_string(),
            }))
            .await;
        tracing::info!(container_id = %id, "Container deleted");
        Ok(ExitInfo {
            pid: state.pid,
            exit_status: state.exit_status(),
            exited_at: state.exited_at(),
        })
    }

    pub async fn state(&self, id: &str, exec_id: &str) -> Result<StateInfo, ShimError> {
        let container = self.container(id)?;
        let process = container.process(exec_id).await?;
        let state = process.state().await;
        Ok(StateInfo {
            id: id.to_string(),
            exec_id: exec_id.to_string(),
            bundle: container.bundle().to_path_buf(),
            pid: state.pid,
            status: state.status,
            stdio: process.stdio().clone(),
            terminal: process.terminal(),
            exit_status: state.exit_status(),
            exited_at: state.exited_at(),
        })
    }

    /// Resizes the process's pty. Processes without one accept and ignore
    /// the call.
    pub async fn resize_pty(&self, id: &str, exec_id: &str, width: u32, height: u32) -> Result<(), ShimError> {
        let process = self.container(id)?.process(exec_id).await?;
        process.resize(width, height).await
    }

    pub async fn close_io(&self, id: &str, exec_id: &str, stdin: bool) -> Result<(), ShimError> {
        let process = self.container(id)?.process(exec_id).await?;
        if stdin {
            process.close_io().await?;
        }
        Ok(())
    }

    pub async fn pids(&self, _id: &str) -> Result<Vec<u32>, ShimError> {
        Err(ShimError::NotImplemented("pids"))
    }

    pub async fn pause(&self, _id: &str) -> Result<(), ShimError> {
        Err(ShimError::NotImplemented("pause"))
    }

    pub async fn resume(&self, _id: &str) -> Result<(), ShimError> {
        Err(ShimError::NotImplemented("resume"))
    }

    pub async fn checkpoint(&self, _id: &str) -> Result<(), ShimError> {
        Err(ShimError::NotImplemented("checkpoint"))
    }

    pub async fn update(&self, _id: &str) -> Result<(), ShimError> {
        Err(ShimError::NotImplemented("update"))
    }

    pub async fn stats(&self, _id: &str) -> Result<(), ShimError> {
        Err(ShimError::NotImplemented("stats"))
    }

    /// Shuts the shim down once no container is left; otherwise a no-op.
    pub async fn shutdown(&self, now: bool) -> Result<(), ShimError> {
        if !self.containers.is_empty() {
            tracing::debug!(containers = self.containers.len(), now, "Shutdown ignored, containers remain");
            return Ok(());
        }
        self.runtime.request_shutdown();
        Ok(())
    }

    pub async fn connect(&self, id: &str) -> Result<ConnectInfo, ShimError> {
        let container = self.container(id)?;
        let task_pid = container.primary().state().await.pid;
        Ok(ConnectInfo {
            shim_pid: std::process::id(),
            task_pid,
            version: TASK_API_VERSION,
        })
    }
}

fn parse_annotation<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ShimError> {
    value
        .parse()
        .map_err(|_| ShimError::InvalidSpec(format!("annotation {}: invalid value {:?}", key, value)))
}

/// The spec's root path resolved against the bundle.
fn bundle_rootfs(bundle: &Path, spec: &Spec) -> Result<PathBuf, ShimError> {
    let root = spec
        .root()
        .as_ref()
        .ok_or_else(|| ShimError::InvalidSpec(format!("{} has no root", CONFIG_FILE)))?;
    let path = root.path();
    let rootfs = if path.is_absolute() {
        path.clone()
    } else {
        bundle.join(path)
    };
    if !rootfs.is_dir() {
        return Err(ShimError::InvalidSpec(format!(
            "rootfs {} is not a directory",
            rootfs.display()
        )));
    }
    Ok(rootfs)
}

/// `<bundle>/agent.sock`, or a temp path when that would not fit in a
/// socket address.
fn guest_socket_path(bundle: &Path) -> PathBuf {
    let path = bundle.join(GUEST_SOCKET_FILE);
    if path.as_os_str().len() < MAX_SOCKET_PATH {
        return path;
    }
    std::env::temp_dir().join(format!("skiff-{}.sock", uuid::Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::RecordingPublisher;
    use crate::events::{
        TOPIC_TASK_CREATE, TOPIC_TASK_DELETE, TOPIC_TASK_EXEC_ADDED, TOPIC_TASK_EXIT,
        TOPIC_TASK_START, forward_events,
    };
    use crate::harness::Reexec;
    use crate::pio::tests::{host_reader, make_fifo, read_exactly};
    use async_trait::async_trait;
    use oci_spec::runtime::{ProcessBuilder, RootBuilder};
    use skiff_guest::LocalHypervisor;
    use skiff_image::builder::{LayerEntry, OciLayoutBuilder};
    use skiff_image::layout::{INDEX_FILE, read_index};
    use skiff_image::{ImageError, LocalLayoutFetcher, OciFilesystemConverter};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const ALPINE: &str = "docker.io/library/alpine:latest";

    struct TouchExt4;

    #[async_trait]
    impl Ext4Builder for TouchExt4 {
        async fn build(&self, _rootfs: &Path, output: &Path) -> Result<(), ImageError> {
            tokio::fs::write(output, b"ext4").await?;
            Ok(())
        }
    }

    struct Harness {
        tmp: TempDir,
        layout: PathBuf,
        service: TaskService,
        publisher: Arc<RecordingPublisher>,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let layout = tmp.path().join("alpine");
            let mut builder = OciLayoutBuilder::new(&layout);
            builder
                .add_image(
                    &Platform::linux_arm64(),
                    &[vec![
                        LayerEntry::dir("bin", 0o755),
                        LayerEntry::file("etc/hostname", "skiff\n", 0o644),
                    ]],
                    &["/bin/sh"],
                )
                .unwrap();
            builder.finish().unwrap();

            let ext4: Arc<dyn Ext4Builder> = Arc::new(TouchExt4);
            let fetcher = LocalLayoutFetcher::new().with_layout(ALPINE, &layout);
            let images = ImageCache::new(
                tmp.path().join("cache"),
                Arc::new(fetcher),
                Arc::new(OciFilesystemConverter::new(ext4.clone())),
            );

            let (runtime, rx) = Runtime::new(Reexec::new());
            let publisher = Arc::new(RecordingPublisher::default());
            tokio::spawn(forward_events(rx, publisher.clone()));

            let service = TaskService::new(
                runtime,
                Arc::new(LocalHypervisor::in_process()),
                Arc::new(images),
                ext4,
                VmDefaults::default(),
            );
            Self {
                tmp,
                layout,
                service,
                publisher,
            }
        }

        /// Writes `<tmp>/<id>/config.json` and returns the bundle.
        fn bundle(&self, id: &str, args: &[&str], image_ref: Option<&str>) -> PathBuf {
            let bundle = self.tmp.path().join(id);
            std::fs::create_dir_all(bundle.join("rootfs")).unwrap();

            let mut spec = Spec::default();
            spec.set_process(Some(process(args)));
            spec.set_root(Some(RootBuilder::default().path("rootfs").build().unwrap()));
            let mut annotations = HashMap::new();
            if let Some(image_ref) = image_ref {
                annotations.insert(ANNOTATION_IMAGE_REF.to_string(), image_ref.to_string());
                annotations.insert(ANNOTATION_PLATFORM.to_string(), "linux/arm64".to_string());
            }
            spec.set_annotations(Some(annotations));
            spec.save(bundle.join(CONFIG_FILE)).unwrap();
            bundle
        }

        async fn create(&self, id: &str, args: &[&str], stdio: StdioPaths) -> Result<u32, ShimError> {
            let bundle = self.bundle(id, args, Some(ALPINE));
            self.service
                .create(CreateParams {
                    id: id.to_string(),
                    bundle,
                    stdio,
                    ..Default::default()
                })
                .await
        }
    }

    fn process(args: &[&str]) -> Process {
        ProcessBuilder::default()
            .args(args.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .env(vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()])
            .cwd("/")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_echo_lifecycle() {
        let h = Harness::new();
        let stdout = make_fifo(h.tmp.path(), "c1-stdout");
        let mut host_out = host_reader(&stdout);

        let pid = h
            .create(
                "c1",
                &["echo", "hello"],
                StdioPaths {
                    stdout: stdout.display().to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(pid, 0);
        assert_eq!(h.service.state("c1", "").await.unwrap().status, RunnerStatus::Created);

        let pid = h.service.start("c1", "").await.unwrap();
        assert!(pid > 0);
        let exit = h.service.wait("c1", "").await.unwrap();
        assert_eq!(exit.exit_status, 0);
        assert_eq!(exit.pid, pid);
        assert_eq!(read_exactly(&mut host_out, 6).await, b"hello\n");

        let state = h.service.state("c1", "").await.unwrap();
        assert_eq!(state.status, RunnerStatus::Stopped);
        assert_eq!(state.stdio.stdout, stdout.display().to_string());

        let deleted = h.service.delete("c1", "").await.unwrap();
        assert_eq!(deleted.exit_status, 0);
        assert!(h.service.container_ids().is_empty());
        assert!(matches!(h.service.state("c1", "").await, Err(ShimError::NotFound(_))));

        let events = h.publisher.wait_for(4).await;
        assert_eq!(
            events.iter().map(Event::topic).collect::<Vec<_>>(),
            vec![TOPIC_TASK_CREATE, TOPIC_TASK_START, TOPIC_TASK_EXIT, TOPIC_TASK_DELETE]
        );
        match &events[2] {
            Event::Exit(e) => {
                assert_eq!(e.container_id, "c1");
                assert_eq!(e.pid, pid);
                assert_eq!(e.exit_status, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kill_sleeping_process() {
        let h = Harness::new();
        h.create("c1", &["sleep", "30"], StdioPaths::default())
            .await
            .unwrap();
        h.service.start("c1", "").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        h.service.kill("c1", "", 9, false).await.unwrap();
        let exit = h.service.wait("c1", "").await.unwrap();
        assert_ne!(exit.exit_status, 0);
        assert!(started.elapsed() < Duration::from_secs(5));

        let topics = h.publisher.wait_for(3).await;
        assert!(topics.iter().any(|e| e.topic() == TOPIC_TASK_EXIT));
        assert_eq!(h.service.state("c1", "").await.unwrap().status, RunnerStatus::Stopped);

        // Killing again is a no-op.
        h.service.kill("c1", "", 9, false).await.unwrap();
        h.service.delete("c1", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_sidecar() {
        let h = Harness::new();
        h.create("c1", &["sh", "-c", "sleep 10"], StdioPaths::default())
            .await
            .unwrap();
        h.service.start("c1", "").await.unwrap();

        let stdout = make_fifo(h.tmp.path(), "sidecar-stdout");
        let mut host_out = host_reader(&stdout);
        h.service
            .exec(ExecParams {
                id: "c1".to_string(),
                exec_id: "sidecar".to_string(),
                terminal: false,
                stdio: StdioPaths {
                    stdout: stdout.display().to_string(),
                    ..Default::default()
                },
                process: process(&["echo", "sidecar"]),
            })
            .await
            .unwrap();
        assert_eq!(
            h.service.state("c1", "sidecar").await.unwrap().status,
            RunnerStatus::Created
        );

        h.service.start("c1", "sidecar").await.unwrap();
        let exit = h.service.wait("c1", "sidecar").await.unwrap();
        assert_eq!(exit.exit_status, 0);
        assert_eq!(read_exactly(&mut host_out, 8).await, b"sidecar\n");
        assert_eq!(h.service.state("c1", "").await.unwrap().status, RunnerStatus::Running);

        let deleted = h.service.delete("c1", "sidecar").await.unwrap();
        assert_eq!(deleted.exit_status, 0);
        assert!(matches!(h.service.state("c1", "sidecar").await, Err(ShimError::NotFound(_))));

        let topics = h.publisher.wait_for(4).await;
        let topics: Vec<_> = topics.iter().map(Event::topic).collect();
        assert_eq!(
            &topics[..4],
            &[TOPIC_TASK_CREATE, TOPIC_TASK_START, TOPIC_TASK_EXEC_ADDED, TOPIC_TASK_EXIT]
        );

        h.service.delete("c1", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_dedups_manifest_index() {
        let h = Harness::new();
        let mut index = read_index(&h.layout).unwrap();
        let dup = index.manifests[0].clone();
        index.manifests.push(dup);
        std::fs::write(h.layout.join(INDEX_FILE), serde_json::to_vec(&index).unwrap()).unwrap();
        assert_eq!(read_index(&h.layout).unwrap().manifests.len(), 2);

        h.create("c1", &["true"], StdioPaths::default()).await.unwrap();
        assert_eq!(read_index(&h.layout).unwrap().manifests.len(), 1);
        h.service.delete("c1", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_image() {
        let h = Harness::new();
        let bundle = h.bundle("c1", &["true"], Some("nonexistent:1"));
        let err = h
            .service
            .create(CreateParams {
                id: "c1".to_string(),
                bundle,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::ImageFetch(ImageError::NotFound(_))));
        assert!(h.service.container_ids().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_resize_without_pty_is_noop() {
        let h = Harness::new();
        h.create("c1", &["true"], StdioPaths::default()).await.unwrap();
        h.service.resize_pty("c1", "", 120, 40).await.unwrap();
        assert!(matches!(
            h.service.resize_pty("c1", "nope", 120, 40).await,
            Err(ShimError::NotFound(_))
        ));
        h.service.delete("c1", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_before_start_is_unavailable() {
        let h = Harness::new();
        h.create("c1", &["true"], StdioPaths::default()).await.unwrap();
        assert!(matches!(
            h.service.wait("c1", "").await,
            Err(ShimError::Unavailable(_))
        ));
        assert!(matches!(
            h.service.wait("missing", "").await,
            Err(ShimError::NotFound(_))
        ));
        h.service.delete("c1", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_creates_of_one_id() {
        let h = Harness::new();
        let bundle = h.bundle("c1", &["true"], Some(ALPINE));
        let params = CreateParams {
            id: "c1".to_string(),
            bundle,
            ..Default::default()
        };

        let (first, second) = tokio::join!(
            h.service.create(params.clone()),
            h.service.create(params)
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(ShimError::AlreadyExists(_))))
        );
        assert_eq!(h.service.container_ids(), vec!["c1"]);

        // The losing create left the winner's VM alone.
        h.service.start("c1", "").await.unwrap();
        let exit = h.service.wait("c1", "").await.unwrap();
        assert_eq!(exit.exit_status, 0);

        h.service.delete("c1", "").await.unwrap();
        let events = h.publisher.wait_for(4).await;
        assert_eq!(
            events
                .iter()
                .filter(|e| e.topic() == TOPIC_TASK_CREATE)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicates_are_rejected() {
        let h = Harness::new();
        h.create("c1", &["sleep", "10"], StdioPaths::default())
            .await
            .unwrap();
        assert!(matches!(
            h.create("c1", &["true"], StdioPaths::default()).await,
            Err(ShimError::AlreadyExists(_))
        ));

        let exec = ExecParams {
            id: "c1".to_string(),
            exec_id: "sidecar".to_string(),
            terminal: false,
            stdio: StdioPaths::default(),
            process: process(&["true"]),
        };
        h.service.exec(exec.clone()).await.unwrap();
        assert!(matches!(
            h.service.exec(exec).await,
            Err(ShimError::AlreadyExists(_))
        ));
        assert_eq!(
            h.service.state("c1", "sidecar").await.unwrap().status,
            RunnerStatus::Created
        );
        // Exec processes need a booted VM.
        assert!(matches!(
            h.service.start("c1", "sidecar").await,
            Err(ShimError::InvalidState { .. })
        ));

        let topics = h.publisher.wait_for(2).await;
        assert_eq!(
            topics.iter().map(Event::topic).collect::<Vec<_>>(),
            vec![TOPIC_TASK_CREATE, TOPIC_TASK_EXEC_ADDED]
        );
        h.service.delete("c1", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_with_missing_stdio_rolls_back() {
        let h = Harness::new();
        h.create("c1", &["sleep", "10"], StdioPaths::default())
            .await
            .unwrap();
        let err = h
            .service
            .exec(ExecParams {
                id: "c1".to_string(),
                exec_id: "sidecar".to_string(),
                terminal: false,
                stdio: StdioPaths {
                    stdout: h.tmp.path().join("missing").display().to_string(),
                    ..Default::default()
                },
                process: process(&["true"]),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::Io(_)));
        assert!(matches!(h.service.state("c1", "sidecar").await, Err(ShimError::NotFound(_))));
        h.service.delete("c1", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_containers() {
        let h = Harness::new();
        h.create("c1", &["true"], StdioPaths::default()).await.unwrap();
        h.service.shutdown(false).await.unwrap();
        assert!(!h.service.runtime().is_shutting_down());

        let info = h.service.connect("c1").await.unwrap();
        assert_eq!(info.shim_pid, std::process::id());
        assert_eq!(info.version, TASK_API_VERSION);

        h.service.delete("c1", "").await.unwrap();
        h.service.shutdown(false).await.unwrap();
        assert!(h.service.runtime().is_shutting_down());
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let h = Harness::new();
        assert!(matches!(h.service.pids("c1").await, Err(ShimError::NotImplemented("pids"))));
        assert!(matches!(h.service.pause("c1").await, Err(ShimError::NotImplemented(_))));
        assert!(matches!(h.service.resume("c1").await, Err(ShimError::NotImplemented(_))));
        assert!(matches!(h.service.checkpoint("c1").await, Err(ShimError::NotImplemented(_))));
        assert!(matches!(h.service.update("c1").await, Err(ShimError::NotImplemented(_))));
        assert!(matches!(h.service.stats("c1").await, Err(ShimError::NotImplemented(_))));
    }

    #[tokio::test]
    async fn test_create_from_bundle_rootfs() {
        let h = Harness::new();
        let bundle = h.bundle("c2", &["sh", "-c", "exit 7"], None);
        h.service
            .create(CreateParams {
                id: "c2".to_string(),
                bundle: bundle.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(bundle.join(skiff_image::paths::CACHE_EXT4_FILE).is_file());

        h.service.start("c2", "").await.unwrap();
        assert_eq!(h.service.wait("c2", "").await.unwrap().exit_status, 7);
        h.service.delete("c2", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_bundle() {
        let h = Harness::new();
        let bundle = h.tmp.path().join("empty");
        std::fs::create_dir_all(&bundle).unwrap();
        let err = h
            .service
            .create(CreateParams {
                id: "c1".to_string(),
                bundle,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::InvalidSpec(_)));
    }

    #[test]
    fn test_long_bundle_paths_use_temp_socket() {
        let short = guest_socket_path(Path::new("/run/skiff/c1"));
        assert_eq!(short, Path::new("/run/skiff/c1/agent.sock"));

        let long = PathBuf::from(format!("/run/{}", "b".repeat(120)));
        let socket = guest_socket_path(&long);
        assert!(socket.starts_with(std::env::temp_dir()));
        assert!(socket.as_os_str().len() < MAX_SOCKET_PATH);
    }
}
