// State module - Run-wide state shared between the signal handler and the capture loop

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// State for one supervised run
///
/// Built once at startup and shared by `Arc` between the supervisor, the
/// capture loop and the signal handler. Everything the handler touches is an
/// atomic; the handler sets `rotation_requested` and `relay_errno`, the loop
/// clears them.
#[derive(Debug)]
pub struct SupervisorState {
    /// Signal that triggers log rotation
    signal: Signal,
    /// Whether the rotation signal is relayed to the child
    forward: bool,
    /// Child pid, 0 until the child is launched
    child_pid: AtomicI32,
    /// Latched by the signal handler, cleared by the capture loop
    rotation_requested: Arc<AtomicBool>,
    /// errno of the last failed relay, 0 if none is pending
    relay_errno: AtomicI32,
}

impl SupervisorState {
    pub fn new(signal: Signal, forward: bool) -> Self {
        Self {
            signal,
            forward,
            child_pid: AtomicI32::new(0),
            rotation_requested: Arc::new(AtomicBool::new(false)),
            relay_errno: AtomicI32::new(0),
        }
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub fn forward(&self) -> bool {
        self.forward
    }

    /// Record the child pid. Only the first call takes effect.
    pub fn set_child_pid(&self, pid: i32) -> bool {
        self.child_pid
            .compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Child pid, if the child has been launched
    pub fn child_pid(&self) -> Option<i32> {
        match self.child_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Forget the pid once the child is reaped, its pid may be reused
    pub fn clear_child_pid(&self) {
        self.child_pid.store(0, Ordering::SeqCst);
    }

    /// Flag handed to the signal handler registration
    pub(crate) fn rotation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.rotation_requested)
    }

    /// Mark a rotation as pending without a signal delivery
    pub fn request_rotation(&self) {
        self.rotation_requested.store(true, Ordering::SeqCst);
    }

    pub fn rotation_pending(&self) -> bool {
        self.rotation_requested.load(Ordering::SeqCst)
    }

    /// Clear the pending rotation, returning whether one was pending
    pub fn take_rotation_request(&self) -> bool {
        self.rotation_requested.swap(false, Ordering::SeqCst)
    }

    /// Relay the rotation signal to the child.
    ///
    /// Runs inside the signal handler: atomics and `kill(2)` only.
    pub(crate) fn relay_to_child(&self) {
        if !self.forward {
            return;
        }
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        if let Err(errno) = kill(Pid::from_raw(pid), self.signal) {
            self.relay_errno.store(errno as i32, Ordering::SeqCst);
        }
    }

    /// Take the error of the last failed relay, if any
    pub fn take_relay_failure(&self) -> Option<Errno> {
        match self.relay_errno.swap(0, Ordering::SeqCst) {
            0 => None,
            raw => Some(Errno::from_raw(raw)),
        }
    }
}
