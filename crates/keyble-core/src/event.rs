//! Notifications emitted by the lock controller.

use keyble_proto::message::{LockStatus, Message, StatusInfo};

/// One observable step in the life of a lock connection.
///
/// Subscribers interested in a single condition (say, the bolt reaching
/// `Locked`) filter on the matching variant; the controller itself uses
/// the same stream to resolve its internal waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// The BLE link came up.
    Connected,
    /// The BLE link went down; session state was discarded.
    Disconnected,
    /// The nonce exchange completed; secure messages may now flow.
    NoncesExchanged,
    /// A raw fragment arrived (before reassembly).
    FragmentReceived([u8; keyble_proto::fragment::FRAGMENT_LEN]),
    /// A full message was reassembled, verified and decoded.
    MessageReceived(Message),
    /// A fresh status report arrived, whether or not anything changed.
    StatusUpdate(StatusInfo),
    /// The lock status differs from the previously known one.
    StatusChange(LockStatus),
}
