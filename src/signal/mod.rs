// Signal module - Rotation signal handling and relay to the child

use crate::error::{PipelogError, Result};
use crate::state::SupervisorState;
use nix::errno::Errno;
use signal_hook::consts::FORBIDDEN;
use signal_hook::SigId;
use std::future;
use std::sync::Arc;
use tokio::signal::unix::{signal as signal_stream, Signal as SignalStream, SignalKind};
use tracing::debug;

/// Bridges asynchronous deliveries of the rotation signal into the capture loop
///
/// The installed handler only latches the rotation flag and, when forwarding
/// is enabled, relays the signal to the child with `kill(2)`. Rotation itself
/// happens when the loop polls [`SignalBridge::take_rotation_request`]. A
/// tokio signal stream on the same signal wakes the loop out of its readiness
/// wait.
pub struct SignalBridge {
    state: Arc<SupervisorState>,
    flag_id: SigId,
    relay_id: SigId,
    /// `None` once the stream has shut down
    wake: Option<SignalStream>,
}

impl SignalBridge {
    /// Install the handlers for `state.signal()`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn install(state: Arc<SupervisorState>) -> Result<Self> {
        let signal = state.signal();
        let signo = signal as i32;

        if FORBIDDEN.contains(&signo) {
            return Err(PipelogError::SignalError(format!(
                "{} cannot be caught",
                signal
            )));
        }

        let flag_id = signal_hook::flag::register(signo, state.rotation_flag()).map_err(|e| {
            PipelogError::SignalError(format!("failed to register handler for {}: {}", signal, e))
        })?;

        let relay_state = Arc::clone(&state);
        // SAFETY: the action only loads atomics and calls kill(2), both
        // async-signal-safe; it neither allocates nor locks.
        let relay_id = match unsafe {
            signal_hook::low_level::register(signo, move || relay_state.relay_to_child())
        } {
            Ok(id) => id,
            Err(e) => {
                signal_hook::low_level::unregister(flag_id);
                return Err(PipelogError::SignalError(format!(
                    "failed to register relay for {}: {}",
                    signal, e
                )));
            }
        };

        let wake = match signal_stream(SignalKind::from_raw(signo)) {
            Ok(stream) => stream,
            Err(e) => {
                signal_hook::low_level::unregister(flag_id);
                signal_hook::low_level::unregister(relay_id);
                return Err(PipelogError::SignalError(format!(
                    "failed to listen for {}: {}",
                    signal, e
                )));
            }
        };

        debug!(
            "Installed {} handler (forward to child: {})",
            signal,
            state.forward()
        );

        Ok(Self {
            state,
            flag_id,
            relay_id,
            wake: Some(wake),
        })
    }

    pub fn state(&self) -> &Arc<SupervisorState> {
        &self.state
    }

    /// Clear the pending rotation, returning whether one was pending
    pub fn take_rotation_request(&self) -> bool {
        self.state.take_rotation_request()
    }

    /// Error of the last failed relay to the child, if any
    pub fn take_relay_failure(&self) -> Option<Errno> {
        self.state.take_relay_failure()
    }

    /// Resolve once the signal has been delivered since the last call.
    ///
    /// Deliveries coalesce; the rotation flag carries the actual request.
    pub async fn notified(&mut self) {
        let closed = match self.wake.as_mut() {
            Some(wake) => wake.recv().await.is_none(),
            None => future::pending().await,
        };
        if closed {
            self.wake = None;
        }
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.flag_id);
        signal_hook::low_level::unregister(self.relay_id);
    }
}
