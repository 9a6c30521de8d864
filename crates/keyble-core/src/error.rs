//! Error types of the session layer.

use keyble_proto::ProtocolError;
use thiserror::Error;

/// Violations of the secure-message rules.
///
/// A security error aborts processing of the offending message. It does
/// not automatically tear down the connection, but repeated occurrences
/// are cause for the caller to disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    /// A secured message arrived with a counter at or below the last
    /// accepted one (replay, or a duplicated delivery).
    #[error("security counter did not increase: received {received}, last accepted {current}")]
    CounterReplayed {
        /// Counter carried by the rejected message.
        received: u16,
        /// Last accepted remote counter.
        current: u16,
    },

    /// The recomputed authentication value did not match the received one.
    #[error("authentication value mismatch")]
    AuthenticationMismatch,

    /// A secure message was sealed or opened before the nonce exchange.
    #[error("session nonces have not been exchanged")]
    NoncesNotExchanged,

    /// The local security counter reached its ceiling; reusing a counter
    /// value would reuse a nonce under the same key, so further secure
    /// sends are refused until a new nonce exchange re-keys the session.
    #[error("local security counter exhausted; reconnect to re-key")]
    CounterExhausted,
}

/// Errors surfaced when turning messages into payload bytes and back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Byte-level encode/decode failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Secure-path failure.
    #[error(transparent)]
    Security(#[from] SecurityError),
}
