use crate::error::VmError;
use crate::guest::GuestClient;
use crate::hypervisor::{BlockDevice, Hypervisor, VirtualMachine, VmConfig, VmState};
use crate::readiness::{DialReadiness, Readiness};
use skiff_image::{ConvertedImage, Ext4Builder, ImageCache, Platform};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const DIAL_INTERVAL: Duration = Duration::from_millis(100);
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// A VM backed by an image from the cache.
#[derive(Debug, Clone)]
pub struct ImageVmConfig {
    pub id: String,
    pub image_ref: String,
    pub platform: Platform,
    pub memory_bytes: u64,
    pub vcpus: u8,
    pub guest_socket: PathBuf,
}

/// A VM backed by a rootfs directory the host prepared, e.g. a bundle
/// rootfs with mounts applied.
#[derive(Debug, Clone)]
pub struct RootfsVmConfig {
    pub id: String,
    pub rootfs: PathBuf,
    pub platform: Platform,
    pub memory_bytes: u64,
    pub vcpus: u8,
    pub guest_socket: PathBuf,
}

/// A created machine plus everything needed to reach its guest agent and to
/// tear down host-side state.
pub struct RunningVm {
    vm: Arc<dyn VirtualMachine>,
    config: VmConfig,
    image: Option<ConvertedImage>,
    host_rootfs: Option<PathBuf>,
    readiness: Arc<dyn Readiness>,
    dial_timeout: Duration,
}

impl RunningVm {
    /// Resolves the image through the cache and creates, but does not
    /// start, the machine.
    pub async fn create(
        hypervisor: &dyn Hypervisor,
        cache: &ImageCache,
        config: ImageVmConfig,
    ) -> Result<Self, VmError> {
        let image = cache
            .fetch_and_convert(&config.image_ref, &config.platform)
            .await?;

        let vm_config = VmConfig {
            id: config.id,
            platform: config.platform,
            memory_bytes: config.memory_bytes,
            vcpus: config.vcpus,
            rootfs_path: image.rootfs_path.clone(),
            block_devices: vec![BlockDevice::rootfs(&image.ext4_path)],
            guest_socket: config.guest_socket,
        };

        let mut vm = Self::new(hypervisor, vm_config).await?;
        vm.image = Some(image);
        Ok(vm)
    }

    /// Builds `rootfs.ext4` next to `config.rootfs` and creates the machine.
    /// The rootfs is unmounted recursively on [`RunningVm::destroy`].
    pub async fn from_rootfs(
        hypervisor: &dyn Hypervisor,
        ext4: &dyn Ext4Builder,
        config: RootfsVmConfig,
    ) -> Result<Self, VmError> {
        let ext4_path = config
            .rootfs
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(skiff_image::paths::CACHE_EXT4_FILE);
        ext4.build(&config.rootfs, &ext4_path).await?;

        let vm_config = VmConfig {
            id: config.id,
            platform: config.platform,
            memory_bytes: config.memory_bytes,
            vcpus: config.vcpus,
            rootfs_path: config.rootfs.clone(),
            block_devices: vec![BlockDevice::rootfs(&ext4_path)],
            guest_socket: config.guest_socket,
        };

        let mut vm = Self::new(hypervisor, vm_config).await?;
        vm.host_rootfs = Some(config.rootfs);
        Ok(vm)
    }

    async fn new(hypervisor: &dyn Hypervisor, config: VmConfig) -> Result<Self, VmError> {
        tracing::info!(
            vm_id = %config.id,
            platform = %config.platform,
            memory_bytes = config.memory_bytes,
            vcpus = config.vcpus,
            "Creating VM"
        );
        let vm = hypervisor.new_vm(config.clone()).await?;
        Ok(Self {
            vm,
            config,
            image: None,
            host_rootfs: None,
            readiness: Arc::new(DialReadiness),
            dial_timeout: DIAL_TIMEOUT,
        })
    }

    pub fn with_readiness(mut self, readiness: Arc<dyn Readiness>) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn image(&self) -> Option<&ConvertedImage> {
        self.image.as_ref()
    }

    /// Boots the machine and returns once the guest agent is reachable.
    pub async fn start(&self) -> Result<(), VmError> {
        if self.vm.state() != VmState::Starting {
            return Err(VmError::InvalidState {
                id: self.config.id.clone(),
                state: self.vm.state().to_string(),
            });
        }
        let booted = match self.vm.start().await {
            Ok(()) => self.wait_ready().await,
            Err(e) => Err(e),
        };
        if let Err(e) = booted {
            tracing::error!(vm_id = %self.config.id, error = %e, "VM failed to start");
            if let Err(stop_err) = self.vm.hard_stop().await {
                tracing::warn!(vm_id = %self.config.id, error = %stop_err, "Hard stop after failed start");
            }
            return Err(e);
        }
        tracing::info!(vm_id = %self.config.id, "VM started");
        Ok(())
    }

    pub async fn wait(&self) -> Result<(), VmError> {
        self.vm.wait().await
    }

    pub async fn hard_stop(&self) -> Result<(), VmError> {
        self.vm.hard_stop().await
    }

    pub fn state(&self) -> VmState {
        self.vm.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<VmState> {
        self.vm.subscribe()
    }

    /// Resolves with the first observed state matching `pred`.
    pub async fn wait_for_state(
        &self,
        pred: impl FnMut(&VmState) -> bool,
    ) -> Result<VmState, VmError> {
        let mut rx = self.vm.subscribe();
        let state = rx
            .wait_for(pred)
            .await
            .map_err(|_| VmError::Hypervisor("vm state channel closed".to_string()))?;
        Ok(*state)
    }

    async fn wait_ready(&self) -> Result<(), VmError> {
        let socket = self.vm.guest_socket();
        let deadline = tokio::time::Instant::now() + self.dial_timeout;
        loop {
            if self.readiness.is_ready(socket).await {
                return Ok(());
            }
            if self.vm.state().is_terminal() {
                return Err(VmError::GuestUnavailable(format!(
                    "vm {} is {}",
                    self.config.id,
                    self.vm.state()
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmError::GuestUnavailable(format!(
                    "agent socket {} not ready after {:?}",
                    socket.display(),
                    self.dial_timeout
                )));
            }
            tokio::time::sleep(DIAL_INTERVAL).await;
        }
    }

    /// Client for the guest agent, retrying until it is reachable.
    pub async fn guest_service(&self) -> Result<GuestClient, VmError> {
        if self.vm.state() != VmState::Running {
            return Err(VmError::InvalidState {
                id: self.config.id.clone(),
                state: self.vm.state().to_string(),
            });
        }
        self.wait_ready().await?;
        GuestClient::connect(self.vm.guest_socket()).await
    }

    /// Stops the machine if needed, then removes the agent socket and
    /// force-unmounts the host rootfs.
    pub async fn destroy(&self) -> Result<(), VmError> {
        let id = &self.config.id;
        if !self.vm.state().is_terminal() {
            if let Err(e) = self.vm.hard_stop().await {
                tracing::warn!(vm_id = %id, error = %e, "Hard stop failed during destroy");
            }
            self.wait_for_state(|s| s.is_terminal()).await?;
        }

        match tokio::fs::remove_file(self.vm.guest_socket()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(vm_id = %id, error = %e, "Failed to remove guest socket");
            }
        }

        if let Some(rootfs) = &self.host_rootfs {
            let rootfs = rootfs.clone();
            tokio::task::spawn_blocking(move || skiff_mount::unmount_recursive(&rootfs))
                .await
                .map_err(|e| VmError::Hypervisor(e.to_string()))??;
        }

        tracing::info!(vm_id = %id, "VM destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skiff_image::builder::{LayerEntry, OciLayoutBuilder};
    use skiff_image::{ImageError, LocalLayoutFetcher, OciFilesystemConverter};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    struct FakeVm {
        id: String,
        socket: PathBuf,
        state: watch::Sender<VmState>,
        listener: Mutex<Option<UnixListener>>,
        fail_start: bool,
    }

    #[async_trait]
    impl VirtualMachine for FakeVm {
        fn id(&self) -> &str {
            &self.id
        }

        async fn start(&self) -> Result<(), VmError> {
            if self.fail_start {
                self.state.send_replace(VmState::Error);
                return Err(VmError::Hypervisor("boot failed".to_string()));
            }
            let listener = UnixListener::bind(&self.socket)?;
            *self.listener.lock().unwrap() = Some(listener);
            self.state.send_replace(VmState::Running);
            Ok(())
        }

        async fn wait(&self) -> Result<(), VmError> {
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|s| s.is_terminal()).await;
            Ok(())
        }

        async fn hard_stop(&self) -> Result<(), VmError> {
            self.listener.lock().unwrap().take();
            self.state.send_replace(VmState::Stopped);
            Ok(())
        }

        fn state(&self) -> VmState {
            *self.state.borrow()
        }

        fn subscribe(&self) -> watch::Receiver<VmState> {
            self.state.subscribe()
        }

        fn guest_socket(&self) -> &Path {
            &self.socket
        }
    }

    #[derive(Default)]
    struct FakeHypervisor {
        fail_start: bool,
        configs: Mutex<Vec<VmConfig>>,
    }

    #[async_trait]
    impl Hypervisor for FakeHypervisor {
        async fn new_vm(&self, config: VmConfig) -> Result<Arc<dyn VirtualMachine>, VmError> {
            self.configs.lock().unwrap().push(config.clone());
            let (state, _) = watch::channel(VmState::Starting);
            Ok(Arc::new(FakeVm {
                id: config.id,
                socket: config.guest_socket,
                state,
                listener: Mutex::new(None),
                fail_start: self.fail_start,
            }))
        }
    }

    struct TouchExt4;

    #[async_trait]
    impl Ext4Builder for TouchExt4 {
        async fn build(&self, _rootfs: &Path, output: &Path) -> Result<(), ImageError> {
            std::fs::write(output, b"ext4")?;
            Ok(())
        }
    }

    struct NeverReady;

    #[async_trait]
    impl Readiness for NeverReady {
        async fn is_ready(&self, _guest_socket: &Path) -> bool {
            false
        }
    }

    fn rootfs_config(tmp: &Path) -> RootfsVmConfig {
        let rootfs = tmp.join("bundle/rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        RootfsVmConfig {
            id: "c1".to_string(),
            rootfs,
            platform: Platform::linux_arm64(),
            memory_bytes: 64 << 20,
            vcpus: 1,
            guest_socket: tmp.join("agent.sock"),
        }
    }

    #[tokio::test]
    async fn test_from_rootfs_attaches_readonly_block_device() {
        let tmp = TempDir::new().unwrap();
        let hypervisor = FakeHypervisor::default();
        let vm = RunningVm::from_rootfs(&hypervisor, &TouchExt4, rootfs_config(tmp.path()))
            .await
            .unwrap();

        let device = vm.config().rootfs_device().unwrap();
        assert_eq!(device.path, tmp.path().join("bundle/rootfs.ext4"));
        assert!(device.read_only);
        assert!(device.path.is_file());
        assert_eq!(vm.state(), VmState::Starting);
    }

    #[tokio::test]
    async fn test_create_from_image_cache() {
        let tmp = TempDir::new().unwrap();
        let layout = tmp.path().join("layout");
        let mut builder = OciLayoutBuilder::new(&layout);
        builder
            .add_image(
                &Platform::linux_arm64(),
                &[vec![LayerEntry::file("bin/true", "", 0o755)]],
                &["/bin/true"],
            )
            .unwrap();
        builder.finish().unwrap();

        let cache = ImageCache::new(
            tmp.path().join("cache"),
            Arc::new(LocalLayoutFetcher::new().with_layout("alpine:latest", &layout)),
            Arc::new(OciFilesystemConverter::new(Arc::new(TouchExt4))),
        );
        let hypervisor = FakeHypervisor::default();
        let vm = RunningVm::create(
            &hypervisor,
            &cache,
            ImageVmConfig {
                id: "c1".to_string(),
                image_ref: "alpine:latest".to_string(),
                platform: Platform::linux_arm64(),
                memory_bytes: 64 << 20,
                vcpus: 1,
                guest_socket: tmp.path().join("agent.sock"),
            },
        )
        .await
        .unwrap();

        let image = vm.image().unwrap();
        let configs = hypervisor.configs.lock().unwrap();
        assert_eq!(configs[0].block_devices, vec![BlockDevice::rootfs(&image.ext4_path)]);
        assert_eq!(configs[0].rootfs_path, image.rootfs_path);
    }

    #[tokio::test]
    async fn test_start_waits_for_agent_and_destroy_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let hypervisor = FakeHypervisor::default();
        let config = rootfs_config(tmp.path());
        let socket = config.guest_socket.clone();
        let vm = RunningVm::from_rootfs(&hypervisor, &TouchExt4, config)
            .await
            .unwrap();

        vm.start().await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
        assert!(socket.exists());

        let waiter = {
            let mut rx = vm.subscribe();
            tokio::spawn(async move {
                let _ = rx.wait_for(|s| s.is_terminal()).await;
            })
        };

        vm.destroy().await.unwrap();
        assert_eq!(vm.state(), VmState::Stopped);
        assert!(!socket.exists());
        waiter.await.unwrap();

        // Stopping twice is harmless.
        vm.hard_stop().await.unwrap();
        vm.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_hard_stops() {
        let tmp = TempDir::new().unwrap();
        let hypervisor = FakeHypervisor {
            fail_start: true,
            ..Default::default()
        };
        let vm = RunningVm::from_rootfs(&hypervisor, &TouchExt4, rootfs_config(tmp.path()))
            .await
            .unwrap();

        assert!(matches!(vm.start().await, Err(VmError::Hypervisor(_))));
        assert_eq!(vm.state(), VmState::Stopped);
        assert!(vm.start().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_agent_hard_stops() {
        let tmp = TempDir::new().unwrap();
        let hypervisor = FakeHypervisor::default();
        let vm = RunningVm::from_rootfs(&hypervisor, &TouchExt4, rootfs_config(tmp.path()))
            .await
            .unwrap()
            .with_readiness(Arc::new(NeverReady))
            .with_dial_timeout(Duration::from_millis(100));

        assert!(matches!(
            vm.start().await,
            Err(VmError::GuestUnavailable(_))
        ));
        assert!(vm.state().is_terminal());
        assert!(matches!(vm.start().await, Err(VmError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_guest_service_gives_up_when_never_ready() {
        let tmp = TempDir::new().unwrap();
        let hypervisor = FakeHypervisor::default();
        let vm = RunningVm::from_rootfs(&hypervisor, &TouchExt4, rootfs_config(tmp.path()))
            .await
            .unwrap();

        // Readiness is only consulted after the VM reports running.
        assert!(matches!(
            vm.guest_service().await,
            Err(VmError::InvalidState { .. })
        ));

        vm.start().await.unwrap();
        let vm = vm
            .with_readiness(Arc::new(NeverReady))
            .with_dial_timeout(Duration::from_millis(250));
        let started = tokio::time::Instant::now();
        assert!(matches!(
            vm.guest_service().await,
            Err(VmError::GuestUnavailable(_))
        ));
        assert!(started.elapsed() >= Duration::from_millis(250));
        vm.destroy().await.unwrap();
    }
}
