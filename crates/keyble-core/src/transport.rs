//! Transport abstraction over the BLE link.
//!
//! The protocol engine needs exactly one outbound write channel and one
//! inbound notify channel; everything else about BLE (scanning, GATT
//! discovery, characteristic handles) stays behind this trait. Production
//! implementations wrap a platform BLE stack; tests use the simulated lock
//! from `keyble-harness`.

use std::time::Duration;

use async_trait::async_trait;
use keyble_proto::fragment::FRAGMENT_LEN;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failures reported by the transport collaborator.
///
/// Propagated unchanged to the caller of the operation that triggered
/// them; the core performs no retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The device could not be found during scanning.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Establishing the connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// A fragment write was attempted without a connection.
    #[error("transport is not connected")]
    NotConnected,

    /// A characteristic write failed.
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Notifications pushed by the transport into the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link is up.
    Connected,
    /// The link went down; all session state is stale.
    Disconnected,
    /// One 16-byte notification arrived on the receive characteristic.
    Fragment([u8; FRAGMENT_LEN]),
}

/// Abstract BLE transport consumed by the lock controller.
///
/// Implementations must deliver [`TransportEvent`]s in order into the sink
/// registered via [`Transport::subscribe`], including a `Connected` /
/// `Disconnected` event for every link state change.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish the link (scan + connect + characteristic discovery).
    ///
    /// Idempotent: connecting an already-connected transport is a no-op.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear the link down.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Write one 16-byte fragment to the send characteristic.
    async fn write_fragment(&self, fragment: [u8; FRAGMENT_LEN]) -> Result<(), TransportError>;

    /// Register the single event sink. Called once, before `connect`.
    fn subscribe(&self, sink: mpsc::UnboundedSender<TransportEvent>);

    /// Ask the transport to drop the link after `idle` without traffic,
    /// conserving the lock's battery. The controller configures this once
    /// at startup.
    fn set_auto_disconnect(&self, idle: Duration);
}
