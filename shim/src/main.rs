use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use skiff_core::task::task_server::TaskServer;
use skiff_guest::{AGENT_REEXEC_NAME, LocalHypervisor, run_agent};
use skiff_image::{Ext4Builder, ImageCache, MkfsExt4Builder};
use skiff_shim::{
    GrpcPublisher, KILLED_EXIT, LogProxy, LogPublisher, Publisher, Reexec, Runtime, ShimConfig,
    TaskService, TaskServiceGrpc, forward_events, init_logging, install_panic_hook,
};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

const SOCKET_WAIT: Duration = Duration::from_secs(5);
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "skiff-shim")]
#[command(about = "Task shim running each container in its own microVM")]
struct Cli {
    /// Send logs to this Unix socket instead of stderr
    #[arg(long, global = true, env = "SKIFF_LOG_SOCKET")]
    log_socket: Option<PathBuf>,

    #[command(flatten)]
    config: ShimConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a detached shim and print its task API address
    Start {
        /// Socket to serve the task API on
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Unix socket of the host's events service
        #[arg(long, env = "SKIFF_EVENTS_ADDRESS")]
        address: Option<PathBuf>,
    },
    /// Serve the task API until it is shut down
    Serve {
        /// Socket to serve the task API on
        #[arg(long)]
        socket: PathBuf,

        /// Unix socket of the host's events service
        #[arg(long, env = "SKIFF_EVENTS_ADDRESS")]
        address: Option<PathBuf>,
    },
    /// Clean up a bundle whose shim is gone
    Delete {
        /// Bundle directory of the container
        #[arg(long)]
        bundle: PathBuf,
    },
    /// Print every log line sent to a socket
    LogProxy {
        /// Socket to listen on
        #[arg(long)]
        socket: PathBuf,
    },
    /// Manage the image cache
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached images
    List,
    /// Remove expired images
    Clean,
    /// Remove every cached image
    Clear,
}

/// Arguments of the re-executed guest agent.
#[derive(Parser)]
#[command(name = "skiff-agent")]
struct AgentArgs {
    /// Socket to serve the guest API on
    #[arg(long)]
    socket: PathBuf,

    /// Root directory guest processes are confined to
    #[arg(long)]
    root: Option<PathBuf>,

    /// Send logs to this Unix socket instead of stderr
    #[arg(long, env = "SKIFF_LOG_SOCKET")]
    log_socket: Option<PathBuf>,
}

#[derive(Serialize)]
struct DeleteOutput {
    pid: u32,
    exit_status: u32,
    exited_at: DateTime<Utc>,
}

fn main() -> ExitCode {
    let mut reexec = Reexec::new();
    reexec.register(AGENT_REEXEC_NAME, agent_main);
    if let Some(code) = reexec.init() {
        return code;
    }

    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.log_socket.as_deref()) {
        eprintln!("skiff-shim: {}", e);
        return ExitCode::FAILURE;
    }
    install_panic_hook();

    match run(cli, reexec) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "skiff-shim failed");
            ExitCode::FAILURE
        }
    }
}

fn agent_main() -> ExitCode {
    let args = AgentArgs::parse();
    if let Err(e) = init_logging(args.log_socket.as_deref()) {
        eprintln!("skiff-agent: {}", e);
        return ExitCode::FAILURE;
    }
    install_panic_hook();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start agent runtime");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run_agent(&args.socket, args.root.as_deref())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Guest agent failed");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cli: Cli, reexec: Reexec) -> Result<(), BoxError> {
    match cli.command {
        Commands::Start { socket, address } => {
            let socket = socket.unwrap_or_else(|| {
                std::env::temp_dir().join(format!("skiff-shim-{}.sock", uuid::Uuid::new_v4().simple()))
            });
            start_detached(&reexec, &cli.config, cli.log_socket.as_deref(), &socket, address.as_deref())
                .await?;
            println!("unix://{}", socket.display());
        }
        Commands::Serve { socket, address } => {
            serve(cli.config, reexec, &socket, address.as_deref()).await?;
        }
        Commands::Delete { bundle } => {
            delete_bundle(&bundle)?;
        }
        Commands::LogProxy { socket } => {
            let proxy = LogProxy::bind(&socket)?;
            tracing::info!(socket = %socket.display(), "Log proxy listening");
            proxy.run(tokio::io::stdout()).await?;
        }
        Commands::Cache(cmd) => {
            let ext4: Arc<dyn Ext4Builder> = Arc::new(MkfsExt4Builder::new(&cli.config.mkfs_ext4));
            let cache = ImageCache::with_fetch_tool(cli.config.cache_dir(), &cli.config.fetch_tool, ext4);
            handle_cache_command(&cache, cmd).await?;
        }
    }
    Ok(())
}

/// Re-executes this binary as `serve` in its own process group and waits
/// for the task socket to appear.
async fn start_detached(
    reexec: &Reexec,
    config: &ShimConfig,
    log_socket: Option<&Path>,
    socket: &Path,
    address: Option<&Path>,
) -> Result<(), BoxError> {
    let mut cmd = std::process::Command::new(reexec.self_exe()?);
    cmd.envs(config_env(config));
    if let Some(log_socket) = log_socket {
        cmd.arg("--log-socket").arg(log_socket);
    }
    cmd.arg("serve").arg("--socket").arg(socket);
    if let Some(address) = address {
        cmd.arg("--address").arg(address);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .process_group(0);

    let child = cmd.spawn()?;
    tracing::info!(pid = child.id(), socket = %socket.display(), "Started shim");

    let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
    while !socket.exists() {
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("shim socket {} did not appear", socket.display()).into());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

/// The configuration a detached shim inherits through its environment.
fn config_env(config: &ShimConfig) -> Vec<(&'static str, String)> {
    let mut env = vec![
        ("SKIFF_CACHE_DIR", config.cache_dir().display().to_string()),
        ("SKIFF_FETCH_TOOL", config.fetch_tool.display().to_string()),
        ("SKIFF_MKFS_EXT4", config.mkfs_ext4.display().to_string()),
        ("SKIFF_MEMORY_MIB", config.memory_mib.to_string()),
        ("SKIFF_VCPUS", config.vcpus.to_string()),
        ("SKIFF_NAMESPACE", config.namespace.clone()),
    ];
    if let Some(platform) = &config.platform {
        env.push(("SKIFF_PLATFORM", platform.to_string()));
    }
    if config.no_chroot {
        env.push(("SKIFF_NO_CHROOT", "true".to_string()));
    }
    env
}

async fn serve(
    config: ShimConfig,
    reexec: Reexec,
    socket: &Path,
    address: Option<&Path>,
) -> Result<(), BoxError> {
    let ext4: Arc<dyn Ext4Builder> = Arc::new(MkfsExt4Builder::new(&config.mkfs_ext4));
    let images = Arc::new(ImageCache::with_fetch_tool(
        config.cache_dir(),
        &config.fetch_tool,
        ext4.clone(),
    ));
    let (runtime, events) = Runtime::new(reexec);
    let hypervisor =
        LocalHypervisor::reexec(runtime.reexec().self_exe()?).with_chroot(!config.no_chroot);
    let publisher: Arc<dyn Publisher> = match address {
        Some(address) => Arc::new(GrpcPublisher::connect(address, &config.namespace).await?),
        None => Arc::new(LogPublisher),
    };
    let forwarder = tokio::spawn(forward_events(events, publisher));

    let service = Arc::new(TaskService::new(
        runtime.clone(),
        Arc::new(hypervisor),
        images,
        ext4,
        config.vm_defaults(),
    ));

    match std::fs::remove_file(socket) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(socket)?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tracing::info!(socket = %socket.display(), pid = std::process::id(), "Shim serving task API");

    let stop = runtime.clone();
    Server::builder()
        .add_service(TaskServer::new(TaskServiceGrpc::new(service)))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
            tokio::select! {
                _ = stop.shutdown_requested() => {}
                _ = term.recv() => stop.request_shutdown(),
                _ = int.recv() => stop.request_shutdown(),
            }
        })
        .await?;

    drop(runtime);
    if tokio::time::timeout(EVENT_DRAIN_TIMEOUT, forwarder).await.is_err() {
        tracing::warn!("Events still pending at exit");
    }
    let _ = std::fs::remove_file(socket);
    tracing::info!("Shim stopped");
    Ok(())
}

/// Best-effort cleanup of a bundle left behind by a shim that died.
fn delete_bundle(bundle: &Path) -> Result<(), BoxError> {
    let rootfs = bundle.join("rootfs");
    if rootfs.is_dir()
        && let Err(e) = skiff_mount::unmount_recursive(&rootfs)
    {
        tracing::warn!(rootfs = %rootfs.display(), error = %e, "Failed to unmount rootfs");
    }
    match std::fs::remove_file(bundle.join(skiff_shim::service::GUEST_SOCKET_FILE)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(error = %e, "Failed to remove guest socket"),
    }

    let output = DeleteOutput {
        pid: 0,
        exit_status: KILLED_EXIT as u32,
        exited_at: Utc::now(),
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

async fn handle_cache_command(cache: &ImageCache, cmd: CacheCommands) -> Result<(), BoxError> {
    match cmd {
        CacheCommands::List => {
            let records = cache.list_cached_images().await?;
            if records.is_empty() {
                println!("No cached images in {}", cache.root().display());
                return Ok(());
            }
            println!("{:<50} {:<20} {:<25} {:>12}", "IMAGE", "PLATFORMS", "EXPIRES", "SIZE");
            for record in records {
                let platforms: Vec<&str> = record.platforms.keys().map(String::as_str).collect();
                println!(
                    "{:<50} {:<20} {:<25} {:>12}",
                    record.image_ref,
                    platforms.join(","),
                    record.expires_at.format("%Y-%m-%d %H:%M:%S"),
                    record.size()
                );
            }
        }
        CacheCommands::Clean => {
            let report = cache.clean_expired_cache(Utc::now()).await?;
            for image in &report.removed {
                println!("Removed {}", image);
            }
            println!("Reclaimed {} bytes", report.reclaimed_bytes);
        }
        CacheCommands::Clear => {
            let report = cache.clear_cache().await?;
            for image in &report.removed {
                println!("Removed {}", image);
            }
            println!("Reclaimed {} bytes", report.reclaimed_bytes);
        }
    }
    Ok(())
}
