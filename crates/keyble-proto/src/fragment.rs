//! Message fragmentation and reassembly.
//!
//! One fragment is exactly 16 bytes: a status byte followed by 15 payload
//! bytes (zero-padded). The status byte packs two fields:
//!
//! ```text
//! bit 7      : set on the first fragment of a message
//! bits 0-6   : number of fragments remaining AFTER this one (0 = last)
//! ```
//!
//! The byte sequence being fragmented is `[message_type_id] ++ payload`, so
//! only the first fragment carries the type id (as its first payload byte).
//! Every fragment except the last must be acknowledged by the peer with a
//! `FRAGMENT_ACK` message echoing the fragment's status byte; the sender
//! blocks on that acknowledgement before transmitting the next fragment.

use crate::error::ProtocolError;

/// Size of one transport unit in bytes.
pub const FRAGMENT_LEN: usize = 16;

/// Payload bytes carried per fragment (everything after the status byte).
pub const FRAGMENT_DATA_LEN: usize = 15;

/// Maximum number of fragments per message (7-bit remaining counter).
pub const MAX_FRAGMENTS: usize = 0x80;

const FIRST_FLAG: u8 = 0x80;

/// One fixed-size transport unit of a fragmented message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment([u8; FRAGMENT_LEN]);

impl Fragment {
    /// Wrap raw bytes received from the transport.
    pub fn from_bytes(bytes: [u8; FRAGMENT_LEN]) -> Self {
        Self(bytes)
    }

    /// The packed status byte.
    pub fn status_byte(&self) -> u8 {
        self.0[0]
    }

    /// Number of fragments remaining after this one.
    pub fn remaining(&self) -> u8 {
        self.status_byte() & 0x7F
    }

    /// Whether this is the first fragment of a message.
    pub fn is_first(&self) -> bool {
        self.status_byte() & FIRST_FLAG != 0
    }

    /// Whether this is the last fragment of a message.
    pub fn is_last(&self) -> bool {
        self.remaining() == 0
    }

    /// Whether the whole message fit in this single fragment.
    pub fn is_complete_message(&self) -> bool {
        self.is_first() && self.is_last()
    }

    /// The message type id, carried only by first fragments.
    pub fn message_type_id(&self) -> Option<u8> {
        self.is_first().then(|| self.0[1])
    }

    /// The data bytes this fragment contributes to the reassembled message.
    ///
    /// First fragments skip the status and type id bytes; continuation
    /// fragments skip only the status byte. Trailing zero padding of the
    /// last fragment is included; decoders ignore it.
    pub fn data(&self) -> &[u8] {
        if self.is_first() { &self.0[2..] } else { &self.0[1..] }
    }

    /// The raw 16 wire bytes.
    pub fn as_bytes(&self) -> &[u8; FRAGMENT_LEN] {
        &self.0
    }
}

/// Split `[message_id] ++ payload` into wire fragments.
///
/// Fragments must be sent strictly in order, awaiting a `FRAGMENT_ACK`
/// after every fragment except the last.
pub fn split_message(message_id: u8, payload: &[u8]) -> Result<Vec<Fragment>, ProtocolError> {
    let mut combined = Vec::with_capacity(1 + payload.len());
    combined.push(message_id);
    combined.extend_from_slice(payload);

    let chunks: Vec<&[u8]> = combined.chunks(FRAGMENT_DATA_LEN).collect();
    if chunks.len() > MAX_FRAGMENTS {
        return Err(ProtocolError::MessageTooLarge(combined.len()));
    }

    let total = chunks.len();
    let fragments = chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut bytes = [0u8; FRAGMENT_LEN];
            bytes[0] = (total - 1 - index) as u8;
            if index == 0 {
                bytes[0] |= FIRST_FLAG;
            }
            bytes[1..1 + chunk.len()].copy_from_slice(chunk);
            Fragment(bytes)
        })
        .collect();
    Ok(fragments)
}

/// A message reassembled from its fragments, before decryption/decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    /// Type id from the first fragment.
    pub message_type_id: u8,
    /// Concatenated data bytes of all fragments.
    pub payload: Vec<u8>,
}

/// What the receiver must do after accepting a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyStep {
    /// Not the last fragment: acknowledge it with a `FRAGMENT_ACK`
    /// carrying the echoed status byte, then wait for more.
    AckRequired {
        /// Status byte to echo back.
        fragment_id: u8,
    },
    /// Last fragment: the message is complete and the buffer was cleared.
    Complete(AssembledMessage),
}

/// Buffer for the (single) message currently being reassembled.
///
/// One instance exists per logical lock connection; the transport delivers
/// one fragment exchange at a time, so at most one message is in flight.
#[derive(Debug, Default)]
pub struct Reassembler {
    fragments: Vec<Fragment>,
}

impl Reassembler {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a message is partially reassembled.
    pub fn in_progress(&self) -> bool {
        !self.fragments.is_empty()
    }

    /// Drop any partially reassembled message.
    pub fn reset(&mut self) {
        self.fragments.clear();
    }

    /// Accept the next fragment from the transport.
    ///
    /// A first-marked fragment while a message is in progress means the
    /// stream desynchronized (or the peer retransmitted); the buffer is
    /// reset and the error surfaced, losing both messages. A continuation
    /// fragment with an empty buffer is likewise an error.
    pub fn push(&mut self, fragment: Fragment) -> Result<ReassemblyStep, ProtocolError> {
        if fragment.is_first() && self.in_progress() {
            self.reset();
            return Err(ProtocolError::UnexpectedFirstFragment);
        }
        if !fragment.is_first() && !self.in_progress() {
            return Err(ProtocolError::UnexpectedContinuation);
        }

        self.fragments.push(fragment);
        if !fragment.is_last() {
            return Ok(ReassemblyStep::AckRequired { fragment_id: fragment.status_byte() });
        }

        // message_type_id is present: the first buffered fragment is
        // guaranteed first-marked by the checks above
        let message_type_id = self.fragments[0].message_type_id().unwrap_or_default();
        let payload = self.fragments.iter().flat_map(|f| f.data().iter().copied()).collect();
        self.reset();
        Ok(ReassemblyStep::Complete(AssembledMessage { message_type_id, payload }))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn reassemble(fragments: &[Fragment]) -> AssembledMessage {
        let mut reassembler = Reassembler::new();
        for (i, fragment) in fragments.iter().enumerate() {
            match reassembler.push(*fragment).unwrap() {
                ReassemblyStep::AckRequired { fragment_id } => {
                    assert_eq!(fragment_id, fragment.status_byte());
                    assert!(i < fragments.len() - 1);
                },
                ReassemblyStep::Complete(message) => {
                    assert_eq!(i, fragments.len() - 1);
                    return message;
                },
            }
        }
        unreachable!("last fragment must complete the message")
    }

    #[test]
    fn single_fragment_message() {
        let fragments = split_message(0x82, &[1, 2, 3]).unwrap();
        assert_eq!(fragments.len(), 1);
        let f = fragments[0];
        assert_eq!(f.status_byte(), 0x80);
        assert!(f.is_complete_message());
        assert_eq!(f.message_type_id(), Some(0x82));
        assert_eq!(f.as_bytes(), &[0x80, 0x82, 1, 2, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn multi_fragment_status_bytes_count_down() {
        // 1 + 30 bytes -> 3 fragments of 15/15/1
        let payload = [0xAAu8; 30];
        let fragments = split_message(0x90, &payload).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].status_byte(), 0x82);
        assert_eq!(fragments[1].status_byte(), 0x01);
        assert_eq!(fragments[2].status_byte(), 0x00);
        assert!(fragments[0].is_first());
        assert!(!fragments[1].is_first());
        assert!(fragments[2].is_last());
        assert_eq!(fragments[1].message_type_id(), None);
    }

    #[test]
    fn reassembly_includes_padding_of_last_fragment() {
        // 3 payload bytes: data portion of the single fragment is 14 bytes
        let fragments = split_message(0x00, &[9, 8, 7]).unwrap();
        let message = reassemble(&fragments);
        assert_eq!(message.message_type_id, 0x00);
        assert_eq!(message.payload.len(), FRAGMENT_DATA_LEN - 1);
        assert_eq!(&message.payload[..3], &[9, 8, 7]);
        assert!(message.payload[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_message_rejected() {
        // 128 fragments carry at most 128 * 15 - 1 payload bytes
        let payload = vec![0u8; MAX_FRAGMENTS * FRAGMENT_DATA_LEN];
        assert!(matches!(
            split_message(0x00, &payload),
            Err(ProtocolError::MessageTooLarge(_))
        ));
        let payload = vec![0u8; MAX_FRAGMENTS * FRAGMENT_DATA_LEN - 1];
        assert_eq!(split_message(0x00, &payload).unwrap().len(), MAX_FRAGMENTS);
    }

    #[test]
    fn first_fragment_mid_message_resets_buffer() {
        let fragments = split_message(0x90, &[0u8; 30]).unwrap();
        let mut reassembler = Reassembler::new();
        reassembler.push(fragments[0]).unwrap();
        assert!(reassembler.in_progress());

        let restart = split_message(0x82, &[1, 2, 3]).unwrap();
        assert_eq!(
            reassembler.push(restart[0]).unwrap_err(),
            ProtocolError::UnexpectedFirstFragment
        );
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn continuation_without_start_rejected() {
        let mut reassembler = Reassembler::new();
        let orphan = Fragment::from_bytes([0x01; FRAGMENT_LEN]);
        assert_eq!(
            reassembler.push(orphan).unwrap_err(),
            ProtocolError::UnexpectedContinuation
        );
    }

    proptest! {
        #[test]
        fn round_trip_any_message(message_id: u8, payload in proptest::collection::vec(any::<u8>(), 0..1800)) {
            let fragments = split_message(message_id, &payload).unwrap();
            prop_assert_eq!(fragments.len(), (1 + payload.len()).div_ceil(FRAGMENT_DATA_LEN));

            let message = reassemble(&fragments);
            prop_assert_eq!(message.message_type_id, message_id);
            // Reassembled payload is the original plus the zero padding of
            // the last fragment.
            prop_assert!(message.payload.len() >= payload.len());
            prop_assert_eq!(&message.payload[..payload.len()], &payload[..]);
            prop_assert!(message.payload[payload.len()..].iter().all(|&b| b == 0));
        }

        #[test]
        fn fragment_data_portions_never_exceed_limits(message_id: u8, payload in proptest::collection::vec(any::<u8>(), 0..600)) {
            for fragment in split_message(message_id, &payload).unwrap() {
                prop_assert_eq!(fragment.as_bytes().len(), FRAGMENT_LEN);
                prop_assert!(fragment.data().len() <= FRAGMENT_DATA_LEN);
            }
        }
    }
}
