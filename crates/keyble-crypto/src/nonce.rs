//! Per-message nonce construction.

use keyble_proto::bytes::be16;

use crate::SessionNonce;

/// Length of a computed nonce in bytes.
pub const NONCE_LEN: usize = 13;

/// Build the 13-byte per-message nonce.
///
/// Layout: `[type_id] ++ session_nonce(8) ++ [0, 0] ++ be16(counter)`.
///
/// The session nonce is the peer's for outbound messages and our own for
/// inbound messages, so the two directions never share a nonce even at
/// equal counter values.
pub fn compute_nonce(
    type_id: u8,
    session_nonce: &SessionNonce,
    counter: u16,
) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0] = type_id;
    nonce[1..9].copy_from_slice(session_nonce);
    // bytes 9..11 stay zero
    nonce[11..13].copy_from_slice(&be16(counter));
    nonce
}
