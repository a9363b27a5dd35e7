//! Host-side stdio of a process: the FIFOs (or plain files) named by the
//! host, opened once and handed to the signal runner.

use crate::error::ShimError;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe;

pub type StdinReader = Box<dyn AsyncRead + Send + Unpin>;
pub type OutputWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Paths the host gave for a process. An empty path means the stream is not
/// attached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdioPaths {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<StdinReader>,
    pub stdout: Option<OutputWriter>,
    pub stderr: Option<OutputWriter>,
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

impl ProcessIo {
    /// Opens stdin read-only and non-blocking, stdout and stderr write-only.
    /// The host must already hold the read ends of the output FIFOs.
    pub fn open(paths: &StdioPaths) -> Result<Self, ShimError> {
        let mut io = ProcessIo::default();
        if !paths.stdin.is_empty() {
            io.stdin = Some(open_reader(Path::new(&paths.stdin))?);
        }
        if !paths.stdout.is_empty() {
            io.stdout = Some(open_writer(Path::new(&paths.stdout))?);
        }
        if !paths.stderr.is_empty() {
            io.stderr = Some(open_writer(Path::new(&paths.stderr))?);
        }
        Ok(io)
    }

    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }
}

fn is_fifo(path: &Path) -> Result<bool, ShimError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        ShimError::Io(std::io::Error::new(
            e.kind(),
            format!("stat {}: {}", path.display(), e),
        ))
    })?;
    Ok(metadata.file_type().is_fifo())
}

fn open_reader(path: &Path) -> Result<StdinReader, ShimError> {
    if is_fifo(path)? {
        let rx = pipe::OpenOptions::new().open_receiver(path)?;
        tracing::debug!(path = %path.display(), "Opened stdin fifo");
        return Ok(Box::new(rx));
    }
    let file = std::fs::File::open(path)?;
    Ok(Box::new(tokio::fs::File::from_std(file)))
}

fn open_writer(path: &Path) -> Result<OutputWriter, ShimError> {
    if is_fifo(path)? {
        let tx = pipe::OpenOptions::new().open_sender(path).map_err(|e| {
            ShimError::Io(std::io::Error::new(
                e.kind(),
                format!("open {} for writing: {}", path.display(), e),
            ))
        })?;
        tracing::debug!(path = %path.display(), "Opened output fifo");
        return Ok(Box::new(tx));
    }
    let file = std::fs::OpenOptions::new().append(true).open(path)?;
    Ok(Box::new(tokio::fs::File::from_std(file)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    pub(crate) fn make_fifo(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
        path
    }

    /// Host-side read end that stays open without a writer.
    pub(crate) fn host_reader(path: &Path) -> pipe::Receiver {
        pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(path)
            .unwrap()
    }

    /// Reads until `expected.len()` bytes arrived or the deadline passes.
    pub(crate) async fn read_exactly(rx: &mut pipe::Receiver, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.read_exact(&mut buf))
            .await
            .expect("timed out reading fifo")
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_empty_paths_are_detached() {
        let io = ProcessIo::open(&StdioPaths::default()).unwrap();
        assert!(io.stdin.is_none() && io.stdout.is_none() && io.stderr.is_none());
    }

    #[tokio::test]
    async fn test_opens_fifos() {
        let tmp = TempDir::new().unwrap();
        let stdin = make_fifo(tmp.path(), "stdin");
        let stdout = make_fifo(tmp.path(), "stdout");
        let mut host_out = host_reader(&stdout);

        let mut io = ProcessIo::open(&StdioPaths {
            stdin: stdin.display().to_string(),
            stdout: stdout.display().to_string(),
            stderr: String::new(),
        })
        .unwrap();
        assert!(io.stdin.is_some());
        assert!(io.stderr.is_none());

        io.stdout.as_mut().unwrap().write_all(b"ok").await.unwrap();
        assert_eq!(read_exactly(&mut host_out, 2).await, b"ok");

        io.close_stdin();
        assert!(io.stdin.is_none());
    }

    #[tokio::test]
    async fn test_regular_file_output() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("stdout.log");
        std::fs::write(&log, b"").unwrap();
        let mut io = ProcessIo::open(&StdioPaths {
            stdout: log.display().to_string(),
            ..Default::default()
        })
        .unwrap();
        let out = io.stdout.as_mut().unwrap();
        out.write_all(b"line\n").await.unwrap();
        out.flush().await.unwrap();
        drop(io);
        assert_eq!(std::fs::read(&log).unwrap(), b"line\n");
    }

    #[tokio::test]
    async fn test_missing_path_fails() {
        let tmp = TempDir::new().unwrap();
        let err = ProcessIo::open(&StdioPaths {
            stdout: tmp.path().join("missing").display().to_string(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ShimError::Io(_)));
    }
}
