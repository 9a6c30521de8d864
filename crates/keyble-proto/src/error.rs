//! Error types for wire format parsing and encoding.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced by the message codec and the fragmentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The first fragment carried a message type id that is not in the
    /// registry. The fragment stream is desynchronized; callers should tear
    /// down the connection.
    #[error("unknown message type id 0x{0:02X}")]
    UnknownMessageType(u8),

    /// A message payload was too short for the fields of its type.
    #[error("truncated {label} message: need {needed} bytes, got {got}")]
    Truncated {
        /// Label of the message type being decoded.
        label: &'static str,
        /// Minimum number of payload bytes the type requires.
        needed: usize,
        /// Number of bytes actually provided.
        got: usize,
    },

    /// A user name did not fit the fixed-width name field.
    #[error("user name exceeds {limit} bytes when UTF-8 encoded")]
    NameTooLong {
        /// Size of the name field in bytes.
        limit: usize,
    },

    /// A user name field contained invalid UTF-8.
    #[error("user name field is not valid UTF-8")]
    NameNotUtf8,

    /// A `COMMAND` message carried a command code outside 0-2.
    #[error("invalid command code {0}")]
    InvalidCommand(u8),

    /// The encoded message does not fit the 7-bit remaining-fragments
    /// counter.
    #[error("message of {0} bytes cannot be fragmented")]
    MessageTooLarge(usize),

    /// A fragment marked "first" arrived while a message was still being
    /// reassembled. The in-flight message is lost and the buffer is reset.
    #[error("first fragment received while reassembly was in progress")]
    UnexpectedFirstFragment,

    /// A continuation fragment arrived with no message in progress.
    #[error("continuation fragment received with no message in progress")]
    UnexpectedContinuation,
}
