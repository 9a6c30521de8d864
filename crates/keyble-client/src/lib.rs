//! Async controller for eqiva eQ-3 Bluetooth smart locks.
//!
//! [`LockController`] drives a lock through an abstract BLE transport:
//! it owns the session state machine, performs the nonce exchange lazily,
//! fragments and acknowledges messages, and exposes high-level operations
//! (`lock`, `unlock`, `open`, `toggle`, status queries, pairing, user
//! naming) that resolve when the lock confirms the result.
//!
//! A background task consumes transport notifications and publishes
//! [`keyble_core::LockEvent`]s on a broadcast channel; operations and
//! external subscribers observe the same stream.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;

pub use config::LockConfig;
pub use controller::{LockController, Pairing};
pub use error::ClientError;
