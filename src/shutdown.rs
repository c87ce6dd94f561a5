//! Shutdown orchestration for loghive.
//!
//! The [`ShutdownCoordinator`] owns the termination sequence:
//!
//! 1. **Running**: block on [`wait_for_signal`](ShutdownCoordinator::wait_for_signal)
//!    until SIGINT or SIGTERM arrives.
//! 2. **Shutting down**: [`drain`](ShutdownCoordinator::drain) cancels the
//!    subscription and closes the queue. Both are attempted even if the
//!    first fails; failures are logged, not swallowed.
//! 3. **Terminal**: the consumer loop's completion signal is raced against
//!    a deadline. [`DrainOutcome::Drained`] if completion wins,
//!    [`DrainOutcome::TimedOut`] if the deadline does; either way the
//!    process proceeds to exit.
//!
//! The deadline is armed before cancellation begins, so the bound window
//! covers the entire sequence (cancel + drain), and a cancellation that
//! blocks cannot stall shutdown past the window.

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::queue::QueueControl;

/// Default bound on the drain window.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal outcome of the shutdown sequence.
///
/// Exactly one of the two is reached; both converge to process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The consumer loop finished inside the bound window.
    Drained,
    /// The window elapsed first; the last in-flight delivery may have been
    /// abandoned mid-processing.
    TimedOut,
}

/// Coordinates the termination sequence across the consumer loop and the
/// queue client.
pub struct ShutdownCoordinator {
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator with the default drain window.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    /// Coordinator with a custom drain window.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The bound on the drain window.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until a termination signal (SIGINT or SIGTERM) is received.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }
    }

    /// Cancel the subscription, close the queue, and wait out the drain.
    ///
    /// `done` is the consumer loop's one-shot completion signal. Teardown
    /// is idempotent: the queue's cancel/close are no-ops when repeated.
    pub async fn drain(&self, queue: &dyn QueueControl, done: oneshot::Receiver<()>) -> DrainOutcome {
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        // Both teardown steps are attempted regardless of earlier failures.
        if let Err(e) = queue.cancel_subscription() {
            error!(error = %e, "Failed to cancel subscription");
        }
        if let Err(e) = queue.close() {
            error!(error = %e, "Failed to close queue connection");
        }

        tokio::select! {
            _ = done => {
                info!("Finished processing in-flight deliveries");
                DrainOutcome::Drained
            }
            _ = &mut deadline => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Timed out waiting for in-flight deliveries"
                );
                DrainOutcome::TimedOut
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
