use crate::error::AgentError;
use nix::pty::openpty;
use oci_spec::runtime::Process;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

pub const DEFAULT_SHELL: &str = "/bin/sh";

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A started process with its stdio ends. Terminal processes share one pty
/// for all three streams and report no separate stderr.
pub struct SpawnedProcess {
    pub child: Child,
    pub pid: u32,
    pub stdin: Option<Writer>,
    pub stdout: Option<Reader>,
    pub stderr: Option<Reader>,
    pub pty_master: Option<OwnedFd>,
}

/// Status code on normal exit, `128 + signal` when killed.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

pub fn set_window_size(fd: RawFd, cols: u16, rows: u16) -> std::io::Result<()> {
    let size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &size) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn file_from(fd: OwnedFd) -> tokio::fs::File {
    tokio::fs::File::from_std(std::fs::File::from(fd))
}

fn working_dir(process: &Process, root: Option<&Path>) -> Option<PathBuf> {
    let cwd = process.cwd();
    let host_cwd = match root {
        Some(root) => root.join(cwd.strip_prefix("/").unwrap_or(cwd.as_path())),
        None => cwd.clone(),
    };
    host_cwd.is_dir().then_some(host_cwd)
}

/// Spawns `process`, optionally confined to `root` with chroot.
pub fn spawn(process: &Process, root: Option<&Path>) -> Result<SpawnedProcess, AgentError> {
    let args: Vec<String> = match process.args() {
        Some(args) if !args.is_empty() => args.clone(),
        _ => vec![DEFAULT_SHELL.to_string()],
    };
    let program = args[0].clone();

    let mut cmd = Command::new(&program);
    cmd.args(&args[1..]).env_clear().kill_on_drop(true);
    for entry in process.env().iter().flatten() {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    if let Some(dir) = working_dir(process, root) {
        cmd.current_dir(dir);
    }

    if nix::unistd::geteuid().is_root() {
        let user = process.user();
        cmd.uid(user.uid()).gid(user.gid());
    }

    if let Some(root) = root {
        let root = root.to_path_buf();
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::chroot(&root)?;
                Ok(())
            });
        }
    }

    let terminal = process.terminal().unwrap_or(false);
    let mut pty_master = None;
    if terminal {
        let pty = openpty(None, None)?;
        if let Some(size) = process.console_size() {
            set_window_size(
                pty.master.as_raw_fd(),
                size.width() as u16,
                size.height() as u16,
            )?;
        }
        cmd.stdin(Stdio::from(pty.slave.try_clone()?))
            .stdout(Stdio::from(pty.slave.try_clone()?))
            .stderr(Stdio::from(pty.slave));
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()?;
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        pty_master = Some(pty.master);
    } else {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
    }

    let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
        program: program.clone(),
        source,
    })?;
    // Drop the slave ends held by the command so the master sees EOF.
    drop(cmd);

    let pid = child
        .id()
        .ok_or_else(|| AgentError::InvalidSpec(format!("{} exited before it started", program)))?;

    tracing::info!(pid, program = %program, terminal, "Spawned process");

    let spawned = match pty_master {
        Some(master) => SpawnedProcess {
            stdin: Some(Box::new(file_from(master.try_clone()?))),
            stdout: Some(Box::new(file_from(master.try_clone()?))),
            stderr: None,
            pty_master: Some(master),
            child,
            pid,
        },
        None => SpawnedProcess {
            stdin: child.stdin.take().map(|s| Box::new(s) as Writer),
            stdout: child.stdout.take().map(|s| Box::new(s) as Reader),
            stderr: child.stderr.take().map(|s| Box::new(s) as Reader),
            pty_master: None,
            child,
            pid,
        },
    };
    Ok(spawned)
}
