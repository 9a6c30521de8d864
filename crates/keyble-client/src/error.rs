//! Controller error type.

use keyble_core::{SecurityError, SessionError, TransportError};
use keyble_proto::ProtocolError;
use thiserror::Error;

/// Failures surfaced by [`crate::LockController`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Byte-level encode/decode failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Secure-path failure (replay, bad authentication, missing nonces).
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// The BLE transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The lock did not produce the expected response in time.
    #[error("timed out waiting for {waiting_for}")]
    Timeout {
        /// What the operation was blocked on.
        waiting_for: &'static str,
    },

    /// `toggle` needs a known lock status to pick a direction.
    #[error("current lock status is unknown")]
    StatusUnknown,

    /// The lock answered with a negative acknowledgement.
    #[error("the lock rejected the request")]
    Rejected,

    /// The controller's background task is gone.
    #[error("controller is shut down")]
    Shutdown,
}

impl From<SessionError> for ClientError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Protocol(e) => Self::Protocol(e),
            SessionError::Security(e) => Self::Security(e),
        }
    }
}
