//! Session layer and external seams for the eqiva smart lock protocol.
//!
//! This crate sits between the pure wire format (`keyble-proto`) and the
//! async orchestration (`keyble-client`):
//!
//! - [`SessionState`]: pure connection/session state machine. Owns the
//!   trust phase, session nonces and the two security counters, and decides
//!   how an outbound message becomes payload bytes (plain or
//!   encrypted + authenticated) and how inbound payload bytes become a
//!   verified message. No I/O, no time, no stored randomness.
//! - [`Transport`]: the abstract BLE capability the protocol engine
//!   consumes. Production backs it with a real BLE stack; tests use the
//!   simulated lock from `keyble-harness`.
//! - [`LockEvent`]: notifications emitted by the controller.
//! - [`keycard`]: parser for the key-card QR code text format.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod event;
pub mod keycard;
pub mod session;
pub mod transport;

pub use error::{SecurityError, SessionError};
pub use event::LockEvent;
pub use keycard::{KeyCard, KeyCardError};
pub use session::{ConnectionPhase, SessionState};
pub use transport::{Transport, TransportError, TransportEvent};
