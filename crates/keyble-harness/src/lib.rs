//! Deterministic simulation harness for lock protocol testing.
//!
//! [`SimLock`] implements the `Transport` trait with a scripted lock
//! firmware behind it, so the full controller stack (fragmentation,
//! acknowledgements, encryption, counters) can be exercised in-process
//! with reproducible randomness and injectable faults.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_lock;

pub use sim_lock::SimLock;
