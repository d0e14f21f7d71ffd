use crate::capture::{CaptureLoop, CAPTURE_FAILURE};
use crate::config::Config;
use crate::error::{PipelogError, Result};
use crate::logs::{LogStream, LogTarget};
use crate::process::ChildSupervisor;
use crate::signal::SignalBridge;
use crate::state::SupervisorState;
use std::process::ExitStatus;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs one supervised child from setup to exit-code composition
///
/// Setup failures (signal registration, initial log open, spawn) are
/// returned as errors before the child exists. Once the child runs, every
/// failure is folded into the returned exit code instead.
pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    /// Create a supervisor for a validated configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Launch the child, capture until both streams close, then reap it
    ///
    /// # Returns
    /// * `Ok(code)` - Capture loop code ORed with the child's exit status
    /// * `Err(PipelogError)` - Setup failed, the child was not started
    pub async fn run(self) -> Result<i32> {
        let signal = self.config.rotation_signal()?;
        let state = Arc::new(SupervisorState::new(signal, self.config.forward_signal));

        let bridge = SignalBridge::install(Arc::clone(&state))
            .map_err(|e| PipelogError::SetupError(format!("signal: {}", e)))?;

        let mut stdout = LogTarget::new(LogStream::Stdout, self.config.stdout_path()?);
        let mut stderr = LogTarget::new(LogStream::Stderr, self.config.stderr_path()?);
        for target in [&mut stdout, &mut stderr] {
            target.open().map_err(|e| {
                PipelogError::SetupError(format!("failed to init {} log: {}", target.stream(), e))
            })?;
        }

        let mut child = ChildSupervisor::launch(
            self.config.command()?,
            &self.config.args,
            &mut stdout,
            &mut stderr,
            &state,
        )
        .map_err(|e| PipelogError::SetupError(e.to_string()))?;

        // Kept alive until the child is reaped so forwarding keeps working
        let mut capture = CaptureLoop::new(stdout, stderr, bridge);
        let loop_code = capture.run().await;

        let exit = child.await_exit().await;
        state.clear_child_pid();

        let code = match exit {
            Ok(status) => compose_exit_code(loop_code, status),
            Err(e) => {
                error!("{}", e);
                loop_code | CAPTURE_FAILURE
            }
        };

        drop(capture);
        info!("Exiting with code {}", code);
        Ok(code)
    }
}

/// Bitwise OR of the loop code and the child's exit status.
///
/// A child killed by a signal contributes 0.
pub fn compose_exit_code(loop_code: i32, status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => loop_code | code,
        None => {
            warn!("Child terminated by a signal ({}), not reflected in exit code", status);
            loop_code
        }
    }
}
