//! Background actors.
//!
//! Each actor is an independent tokio task that talks to the session hub by
//! message passing and stops when its [`ActorHandle`] is shut down.

pub mod watchdog;

use tokio_util::sync::CancellationToken;

pub use watchdog::WatchdogActor;

/// Handle to a running actor, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
}

impl ActorHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Signal the actor to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ActorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
