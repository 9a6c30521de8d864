//! Wire format for the eqiva Bluetooth smart lock protocol.
//!
//! Messages are flat byte sequences identified by a one-byte type id. Because
//! the lock's GATT characteristic only transfers 16 bytes at a time, an
//! encoded message is split into fixed-size fragments: a status byte followed
//! by up to 15 payload bytes. The first fragment additionally carries the
//! message type id as its first payload byte.
//!
//! Everything in this crate is pure: no I/O, no time, no randomness. The
//! security layer (counter handling, encryption, authentication) lives in
//! `keyble-core`; this crate only deals with the byte-level shape of
//! messages and fragments.
//!
//! # Security
//!
//! Decoding is total over well-formed input and never indexes past the
//! provided byte sequence; undersized input is a [`ProtocolError`], not a
//! silent zero-fill. An unknown message type id is a decode error because it
//! means the fragment stream is desynchronized.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bytes;
pub mod error;
pub mod fragment;
pub mod message;

pub use error::{ProtocolError, Result};
pub use fragment::{AssembledMessage, Fragment, Reassembler, ReassemblyStep};
pub use message::{
    Answer, CommandId, DeviceTime, LockStatus, Message, MessageKind, MountOptions, StatusInfo,
};
