//! Controller configuration.

use std::time::Duration;

/// Tunable timings of a [`crate::LockController`].
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Idle time after which the transport drops the link, conserving the
    /// lock's battery. The connection is re-established lazily on the
    /// next operation.
    pub auto_disconnect: Duration,

    /// Idle time without a status report after which the controller polls
    /// the lock on its own, or `None` to disable background polling. Every
    /// processed status report restarts the timer.
    pub status_poll_interval: Option<Duration>,

    /// Upper bound for waiting on any single lock response, or `None` to
    /// wait indefinitely.
    pub operation_timeout: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            auto_disconnect: Duration::from_secs(15),
            status_poll_interval: Some(Duration::from_secs(600)),
            operation_timeout: Some(Duration::from_secs(30)),
        }
    }
}
