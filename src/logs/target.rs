use crate::error::{PipelogError, Result};
use std::fs::{File, OpenOptions};
use std::future;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tokio::net::unix::pipe::Receiver;
use tracing::{debug, info};

/// Bytes moved per read, one `PIPE_BUF`
pub const CHUNK_SIZE: usize = 4096;

/// Mode for newly created log files
const LOG_FILE_MODE: u32 = 0o644;

/// Which child stream a target captures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Destination file handle of a target
#[derive(Debug)]
enum LogFile {
    /// Never opened, or the last reopen failed
    Unopened,
    Open(File),
    /// Released for good
    Closed,
}

/// One captured child stream paired with its log file
///
/// Bytes arrive on the read end of an internal pipe whose write end becomes
/// the child's stdout or stderr. The file can be reopened any number of times
/// while the pipe stays intact; `close` is terminal.
#[derive(Debug)]
pub struct LogTarget {
    stream: LogStream,
    path: PathBuf,
    file: LogFile,
    /// Read end, present from the first successful open until close
    reader: Option<Receiver>,
    /// Write end, held until handed to the child
    writer: Option<OwnedFd>,
    done: bool,
}

impl LogTarget {
    pub fn new<P: AsRef<Path>>(stream: LogStream, path: P) -> Self {
        Self {
            stream,
            path: path.as_ref().to_path_buf(),
            file: LogFile::Unopened,
            reader: None,
            writer: None,
            done: false,
        }
    }

    pub fn stream(&self) -> LogStream {
        self.stream
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Whether a log file handle is currently held
    pub fn is_open(&self) -> bool {
        matches!(self.file, LogFile::Open(_))
    }

    /// (Re)open the log file for append and create the pipe on first use.
    ///
    /// Any previous handle is closed first. A failed open leaves the target
    /// without a handle; calling `open` again later is safe. A done target
    /// stays closed.
    ///
    /// Must be called from within a tokio runtime, the pipe read end is
    /// registered with its reactor.
    pub fn open(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }

        // Drop the old handle before opening so a failure leaves nothing behind
        self.file = LogFile::Unopened;

        if self.reader.is_none() {
            self.create_pipe()?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(LOG_FILE_MODE)
            .open(&self.path)
            .map_err(|e| {
                PipelogError::LogFileError(format!(
                    "open({}) for {}: {}",
                    self.path.display(),
                    self.stream,
                    e
                ))
            })?;
        self.file = LogFile::Open(file);

        debug!("Opened {} log {}", self.stream, self.path.display());
        Ok(())
    }

    fn create_pipe(&mut self) -> Result<()> {
        let (read_end, write_end) = cloexec_pipe()
            .map_err(|e| PipelogError::PipeError(format!("pipe() for {}: {}", self.stream, e)))?;

        let reader = Receiver::from_file(File::from(read_end)).map_err(|e| {
            PipelogError::PipeError(format!("register {} pipe: {}", self.stream, e))
        })?;

        self.reader = Some(reader);
        self.writer = Some(write_end);
        Ok(())
    }

    /// Hand over the pipe write end, to become the child's stream
    pub fn take_writer(&mut self) -> Result<OwnedFd> {
        self.writer.take().ok_or_else(|| {
            PipelogError::PipeError(format!("no {} pipe write end available", self.stream))
        })
    }

    /// Release the file handle and the pipe read end, and mark the target done
    pub fn close(&mut self) {
        if let LogFile::Open(_) = self.file {
            debug!("Closing {} log {}", self.stream, self.path.display());
        }
        self.file = LogFile::Closed;
        self.reader = None;
        self.writer = None;
        self.done = true;
    }

    /// Wait until the pipe read end is readable (data, EOF or error).
    ///
    /// Never resolves for a target without a pipe.
    pub async fn readable(&self) -> io::Result<()> {
        match self.reader.as_ref() {
            Some(reader) => reader.readable().await,
            None => future::pending().await,
        }
    }

    /// Move at most one chunk from the pipe to the log file.
    ///
    /// End of stream closes the target. A read error, a write error or a
    /// short write closes the target and is returned. Bytes read while no
    /// file is open are discarded and reported, the target stays active.
    pub fn drain_once(&mut self) -> Result<()> {
        let Some(reader) = self.reader.as_ref() else {
            return Ok(());
        };

        let mut buf = [0u8; CHUNK_SIZE];
        let read = match reader.try_read(&mut buf) {
            Ok(n) => n,
            // Readiness was stale
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                self.close();
                return Err(PipelogError::PipeError(format!(
                    "read({} pipe): {}",
                    self.stream, e
                )));
            }
        };

        if read == 0 {
            info!("End of {} stream", self.stream);
            self.close();
            return Ok(());
        }

        let written = match &mut self.file {
            LogFile::Open(file) => file.write(&buf[..read]),
            LogFile::Unopened | LogFile::Closed => {
                return Err(PipelogError::LogWriteError(format!(
                    "no open {} log at {}, discarded {} bytes",
                    self.stream,
                    self.path.display(),
                    read
                )));
            }
        };

        match written {
            Ok(n) if n == read => Ok(()),
            Ok(n) => {
                self.close();
                Err(PipelogError::LogWriteError(format!(
                    "write({}): short write of {} of {} bytes",
                    self.path.display(),
                    n,
                    read
                )))
            }
            Err(e) => {
                self.close();
                Err(PipelogError::LogWriteError(format!(
                    "write({}): {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }
}

/// Pipe whose ends are not inherited across exec
///
/// Only the child's redirected stdout/stderr may hold a write end, otherwise
/// end-of-stream never arrives.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::OFlag;

    nix::unistd::pipe2(OFlag::O_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use std::os::fd::AsRawFd;

    let (read_end, write_end) = nix::unistd::pipe()?;
    for fd in [&read_end, &write_end] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read_end, write_end))
}

impl Drop for LogTarget {
    fn drop(&mut self) {
        self.close();
    }
}
