// Capture module - The loop draining both child streams into their log files

use crate::error::PipelogError;
use crate::logs::{LogStream, LogTarget};
use crate::signal::SignalBridge;
use std::io;
use tracing::{debug, error, info, warn};

/// Exit code of a loop that hit at least one I/O failure
pub const CAPTURE_FAILURE: i32 = 1;

/// What woke the loop up
enum Wakeup {
    Signal,
    Readable(LogStream, io::Result<()>),
}

/// Single-threaded loop copying both pipes into their log files
///
/// The loop never gives up on the first error: a failing target is closed
/// and the other keeps draining. It returns once both targets are done,
/// whether by end-of-stream or by error, even if the child is still running.
pub struct CaptureLoop {
    stdout: LogTarget,
    stderr: LogTarget,
    bridge: SignalBridge,
    exit_code: i32,
}

impl CaptureLoop {
    pub fn new(stdout: LogTarget, stderr: LogTarget, bridge: SignalBridge) -> Self {
        Self {
            stdout,
            stderr,
            bridge,
            exit_code: 0,
        }
    }

    /// Run until both targets are done and return the loop's exit code
    ///
    /// The signal handlers stay installed until the loop is dropped.
    pub async fn run(&mut self) -> i32 {
        loop {
            if self.bridge.take_rotation_request() {
                self.rotate();
            }

            if self.stdout.is_done() && self.stderr.is_done() {
                break;
            }

            let wakeup = {
                let Self {
                    stdout,
                    stderr,
                    bridge,
                    ..
                } = &mut *self;

                // Random branch order keeps a busy stream from starving the other
                tokio::select! {
                    _ = bridge.notified() => Wakeup::Signal,
                    ready = stdout.readable(), if !stdout.is_done() => {
                        Wakeup::Readable(LogStream::Stdout, ready)
                    }
                    ready = stderr.readable(), if !stderr.is_done() => {
                        Wakeup::Readable(LogStream::Stderr, ready)
                    }
                }
            };

            match wakeup {
                Wakeup::Signal => debug!("Woken by {}", self.bridge.state().signal()),
                Wakeup::Readable(stream, ready) => self.drain(stream, ready),
            }
        }

        info!("Both streams closed, capture finished");
        self.exit_code
    }

    fn target_mut(&mut self, stream: LogStream) -> &mut LogTarget {
        match stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        }
    }

    fn drain(&mut self, stream: LogStream, ready: io::Result<()>) {
        let target = self.target_mut(stream);
        let result = match ready {
            Ok(()) => target.drain_once(),
            Err(e) => {
                target.close();
                Err(PipelogError::PipeError(format!(
                    "wait for {} pipe: {}",
                    stream, e
                )))
            }
        };

        if let Err(e) = result {
            error!("{}", e);
            self.exit_code = CAPTURE_FAILURE;
        }
    }

    /// Reopen every target that is still active
    fn rotate(&mut self) {
        if let Some(errno) = self.bridge.take_relay_failure() {
            warn!(
                "kill({}) on child failed: {}",
                self.bridge.state().signal(),
                errno
            );
        }

        info!("Rotation requested, reopening log files");

        for stream in [LogStream::Stdout, LogStream::Stderr] {
            let target = self.target_mut(stream);
            if target.is_done() {
                continue;
            }
            let result = target.open();
            if let Err(e) = result {
                error!("{}", e);
                self.exit_code = CAPTURE_FAILURE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SupervisorState;
    use nix::sys::signal::{raise, Signal};
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        stdout: LogTarget,
        stderr: LogTarget,
        out_writer: File,
        err_writer: File,
        state: Arc<SupervisorState>,
        bridge: SignalBridge,
    }

    fn harness(dir: &TempDir, signal: Signal) -> Harness {
        let mut stdout = LogTarget::new(LogStream::Stdout, dir.path().join("out.log"));
        let mut stderr = LogTarget::new(LogStream::Stderr, dir.path().join("err.log"));
        stdout.open().unwrap();
        stderr.open().unwrap();
        let out_writer = File::from(stdout.take_writer().unwrap());
        let err_writer = File::from(stderr.take_writer().unwrap());

        let state = Arc::new(SupervisorState::new(signal, false));
        let bridge = SignalBridge::install(Arc::clone(&state)).unwrap();

        Harness {
            stdout,
            stderr,
            out_writer,
            err_writer,
            state,
            bridge,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn contents(path: &Path) -> String {
        fs::read_to_string(path).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_loop_copies_both_streams_until_eof() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(&temp_dir, Signal::SIGWINCH);
        let mut capture = CaptureLoop::new(h.stdout, h.stderr, h.bridge);
        let handle = tokio::spawn(async move { capture.run().await });

        let (mut out, mut err) = (h.out_writer, h.err_writer);
        let mut expected_out = Vec::new();
        let mut expected_err = Vec::new();
        for i in 0..2000 {
            let line = format!("out line {}\n", i);
            out.write_all(line.as_bytes()).unwrap();
            expected_out.extend_from_slice(line.as_bytes());
            if i % 3 == 0 {
                let line = format!("err line {}\n", i);
                err.write_all(line.as_bytes()).unwrap();
                expected_err.extend_from_slice(line.as_bytes());
            }
            if i % 100 == 0 {
                tokio::task::yield_now().await;
            }
        }
        drop(out);
        drop(err);

        let code = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(fs::read(temp_dir.path().join("out.log")).unwrap(), expected_out);
        assert_eq!(fs::read(temp_dir.path().join("err.log")).unwrap(), expected_err);
    }

    #[tokio::test]
    async fn test_one_stream_closing_does_not_stop_the_other() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(&temp_dir, Signal::SIGWINCH);
        let mut capture = CaptureLoop::new(h.stdout, h.stderr, h.bridge);
        let handle = tokio::spawn(async move { capture.run().await });

        drop(h.err_writer);
        let mut out = h.out_writer;
        out.write_all(b"first\n").unwrap();
        let out_path = temp_dir.path().join("out.log");
        wait_for(|| contents(&out_path) == "first\n").await;

        out.write_all(b"second\n").unwrap();
        drop(out);

        let code = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(contents(&out_path), "first\nsecond\n");
        assert_eq!(contents(&temp_dir.path().join("err.log")), "");
    }

    #[tokio::test]
    async fn test_rotation_reopens_active_targets_only() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(&temp_dir, Signal::SIGUSR1);
        let state = Arc::clone(&h.state);
        let mut capture = CaptureLoop::new(h.stdout, h.stderr, h.bridge);
        let handle = tokio::spawn(async move { capture.run().await });

        let out_path = temp_dir.path().join("out.log");
        let err_path = temp_dir.path().join("err.log");
        let out_rotated = temp_dir.path().join("out.log.1");
        let err_rotated = temp_dir.path().join("err.log.1");

        let mut out = h.out_writer;
        out.write_all(b"before\n").unwrap();
        wait_for(|| contents(&out_path) == "before\n").await;

        // stderr finishes before the rotation arrives
        drop(h.err_writer);
        tokio::time::sleep(Duration::from_millis(100)).await;

        fs::rename(&out_path, &out_rotated).unwrap();
        fs::rename(&err_path, &err_rotated).unwrap();
        raise(Signal::SIGUSR1).unwrap();

        wait_for(|| out_path.exists()).await;
        assert!(!state.rotation_pending());

        out.write_all(b"after\n").unwrap();
        drop(out);

        let code = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(contents(&out_rotated), "before\n");
        assert_eq!(contents(&out_path), "after\n");
        assert!(err_rotated.exists());
        assert!(!err_path.exists(), "a finished target must not reopen");
    }

    #[tokio::test]
    async fn test_failed_reopen_is_reported_and_capture_continues() {
        let temp_dir = TempDir::new().unwrap();
        let log_dir = temp_dir.path().join("logs");
        fs::create_dir(&log_dir).unwrap();

        let mut stdout = LogTarget::new(LogStream::Stdout, log_dir.join("out.log"));
        let mut stderr = LogTarget::new(LogStream::Stderr, temp_dir.path().join("err.log"));
        stdout.open().unwrap();
        stderr.open().unwrap();
        let out = File::from(stdout.take_writer().unwrap());
        let mut err = File::from(stderr.take_writer().unwrap());

        let state = Arc::new(SupervisorState::new(Signal::SIGWINCH, false));
        let bridge = SignalBridge::install(Arc::clone(&state)).unwrap();

        // The stdout reopen fails, stderr keeps its file
        fs::remove_file(log_dir.join("out.log")).unwrap();
        fs::remove_dir(&log_dir).unwrap();
        state.request_rotation();

        let mut capture = CaptureLoop::new(stdout, stderr, bridge);
        let handle = tokio::spawn(async move { capture.run().await });

        err.write_all(b"still here\n").unwrap();
        drop(err);
        drop(out);

        let code = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(code, CAPTURE_FAILURE);
        assert_eq!(contents(&temp_dir.path().join("err.log")), "still here\n");
    }

    #[tokio::test]
    async fn test_rotation_sends_queued_bytes_to_new_file() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(&temp_dir, Signal::SIGWINCH);
        let out_path = temp_dir.path().join("out.log");
        let out_rotated = temp_dir.path().join("out.log.1");

        let mut out = h.out_writer;
        out.write_all(b"queued\n").unwrap();
        fs::rename(&out_path, &out_rotated).unwrap();
        h.state.request_rotation();

        let mut capture = CaptureLoop::new(h.stdout, h.stderr, h.bridge);
        let handle = tokio::spawn(async move { capture.run().await });

        drop(out);
        drop(h.err_writer);

        let code = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(code, 0);
        assert!(!h.state.rotation_pending());
        assert_eq!(contents(&out_path), "queued\n");
        assert_eq!(contents(&out_rotated), "");
    }

    #[tokio::test]
    async fn test_write_failure_on_one_target_keeps_the_other() {
        let temp_dir = TempDir::new().unwrap();
        let err_path = temp_dir.path().join("err.log");

        let mut stdout = LogTarget::new(LogStream::Stdout, "/dev/full");
        let mut stderr = LogTarget::new(LogStream::Stderr, &err_path);
        stdout.open().unwrap();
        stderr.open().unwrap();
        let mut out = File::from(stdout.take_writer().unwrap());
        let mut err = File::from(stderr.take_writer().unwrap());

        let state = Arc::new(SupervisorState::new(Signal::SIGWINCH, false));
        let bridge = SignalBridge::install(Arc::clone(&state)).unwrap();
        let mut capture = CaptureLoop::new(stdout, stderr, bridge);
        let handle = tokio::spawn(async move { capture.run().await });

        out.write_all(b"dropped\n").unwrap();
        let mut expected = String::new();
        for i in 0..3000 {
            let line = format!("err line {}\n", i);
            err.write_all(line.as_bytes()).unwrap();
            expected.push_str(&line);
            if i % 100 == 0 {
                tokio::task::yield_now().await;
            }
        }
        drop(err);
        drop(out);

        let code = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(code, CAPTURE_FAILURE);
        assert_eq!(contents(&err_path), expected);
    }
}
