use crate::error::{PipelogError, Result};
use crate::logs::LogTarget;
use crate::state::SupervisorState;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Handle on the single supervised child process
#[derive(Debug)]
pub struct ChildSupervisor {
    /// The child process handle
    child: Child,

    /// Process ID assigned by the OS
    pid: u32,
}

impl ChildSupervisor {
    /// Launch `command` with its stdout and stderr wired to the targets' pipes
    ///
    /// The command is looked up on `PATH`. The child inherits stdin. Both pipe
    /// write ends are consumed: after this returns the parent holds neither,
    /// so each target sees end-of-stream once the child (and anything it
    /// forked) closes its copy. The pid is recorded in `state`.
    ///
    /// # Arguments
    /// * `command` - Program to execute
    /// * `args` - Arguments passed to the program
    /// * `stdout` - Target receiving the child's standard output
    /// * `stderr` - Target receiving the child's standard error
    /// * `state` - Run state where the child pid is published
    ///
    /// # Returns
    /// * `Ok(ChildSupervisor)` - The child is running
    /// * `Err(PipelogError)` - No pipe was available or the process could not be created
    pub fn launch(
        command: &str,
        args: &[String],
        stdout: &mut LogTarget,
        stderr: &mut LogTarget,
        state: &SupervisorState,
    ) -> Result<Self> {
        let stdout_pipe = stdout.take_writer()?;
        let stderr_pipe = stderr.take_writer()?;

        // The Command, and with it the parent's copy of both write ends, is
        // dropped when this function returns
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::from(stdout_pipe))
            .stderr(Stdio::from(stderr_pipe));

        let child = cmd.spawn().map_err(|e| {
            PipelogError::SpawnError(format!("Failed to spawn process '{}': {}", command, e))
        })?;

        let pid = child.id().ok_or_else(|| {
            PipelogError::SpawnError(format!("Failed to get PID for process '{}'", command))
        })?;

        if !state.set_child_pid(pid as i32) {
            warn!("Child pid already recorded, keeping the first one");
        }

        info!("Launched '{}' (PID: {})", command, pid);

        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the child to terminate and return its status
    pub async fn await_exit(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await.map_err(|e| {
            PipelogError::WaitError(format!("waitpid({}): {}", self.pid, e))
        })?;

        info!("Child {} exited with {}", self.pid, status);
        Ok(status)
    }
}
