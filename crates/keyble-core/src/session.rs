//! Connection/session state machine.
//!
//! # State machine
//!
//! ```text
//! ┌──────────────┐ transport  ┌───────────┐ CONNECTION_REQUEST /  ┌─────────────────┐
//! │ Disconnected │───────────>│ Connected │──────────────────────>│ NoncesExchanged │
//! └──────────────┘  connect   └───────────┘   CONNECTION_INFO     └─────────────────┘
//!         ▲                         │                                      │
//!         └─────────────────────────┴───────── transport disconnect ───────┘
//! ```
//!
//! `NoncesExchanged` is the terminal trust level: once nonces are exchanged
//! secure messages can flow. The nonce exchange is triggered lazily, the
//! first time an operation needs security.
//!
//! This is a pure state machine: methods take and return values, the
//! driver (`keyble-client`) performs I/O. Randomness for the session nonce
//! is passed in explicitly so tests stay deterministic.

use keyble_crypto::{Key, SessionNonce, authentication_value, crypt_data};
use keyble_proto::bytes::{be16, generic_ceil, pad_end, read_be16};
use keyble_proto::{LockStatus, Message, MessageKind};
use rand::RngCore;
use tracing::{debug, warn};

use crate::error::{SecurityError, SessionError};

/// Length of the `be16(counter) ++ auth(4)` trailer on secure payloads.
const SECURITY_TRAILER_LEN: usize = 6;

/// Connection trust phases, in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionPhase {
    /// No transport connection.
    Disconnected,
    /// Transport connected; only plain messages may be sent.
    Connected,
    /// Session nonces exchanged; secure messages may be sent.
    NoncesExchanged,
}

/// Per-connection mutable session state.
///
/// One instance per logical lock connection, exclusively owned by the
/// controller. All fields become stale on transport disconnect and are
/// renegotiated lazily on next use.
#[derive(Debug, Clone)]
pub struct SessionState {
    user_id: u8,
    user_key: Key,
    local_session_nonce: Option<SessionNonce>,
    remote_session_nonce: Option<SessionNonce>,
    local_security_counter: u16,
    remote_security_counter: u16,
    phase: ConnectionPhase,
    lock_status: Option<LockStatus>,
}

impl SessionState {
    /// Create a fresh session for `user_id` authenticated by `user_key`.
    pub fn new(user_id: u8, user_key: Key) -> Self {
        Self {
            user_id,
            user_key,
            local_session_nonce: None,
            remote_session_nonce: None,
            local_security_counter: 1,
            remote_security_counter: 0,
            phase: ConnectionPhase::Disconnected,
            lock_status: None,
        }
    }

    /// Current trust phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// User id this session authenticates as.
    pub fn user_id(&self) -> u8 {
        self.user_id
    }

    /// The user key currently in use.
    pub fn user_key(&self) -> &Key {
        &self.user_key
    }

    /// Replace the user key (pairing installs a freshly generated key).
    pub fn set_user_key(&mut self, key: Key) {
        self.user_key = key;
    }

    /// Last known lock status, if any.
    pub fn lock_status(&self) -> Option<LockStatus> {
        self.lock_status
    }

    /// Counter that the next secured outbound message will carry.
    pub fn local_security_counter(&self) -> u16 {
        self.local_security_counter
    }

    /// Highest counter accepted from the lock so far.
    pub fn remote_security_counter(&self) -> u16 {
        self.remote_security_counter
    }

    /// The lock's session nonce, once `CONNECTION_INFO` was received.
    pub fn remote_session_nonce(&self) -> Option<SessionNonce> {
        self.remote_session_nonce
    }

    /// Transport-level connect succeeded.
    pub fn transport_connected(&mut self) {
        if self.phase == ConnectionPhase::Disconnected {
            self.phase = ConnectionPhase::Connected;
        }
    }

    /// Transport-level disconnect: all session material is now stale.
    pub fn transport_disconnected(&mut self) {
        self.phase = ConnectionPhase::Disconnected;
        self.local_session_nonce = None;
        self.remote_session_nonce = None;
    }

    /// Start the nonce exchange: generate a fresh local session nonce and
    /// return the `CONNECTION_REQUEST` to send (as a plain message).
    ///
    /// The exchange completes when the lock's `CONNECTION_INFO` reply is
    /// fed to [`SessionState::apply_connection_info`].
    pub fn begin_nonce_exchange(&mut self, rng: &mut dyn RngCore) -> Message {
        let mut nonce: SessionNonce = [0; 8];
        rng.fill_bytes(&mut nonce);
        self.local_session_nonce = Some(nonce);
        Message::ConnectionRequest { user_id: self.user_id, session_nonce: nonce }
    }

    /// Apply a received `CONNECTION_INFO`: the re-keying point.
    ///
    /// Adopts the lock-assigned user id and remote nonce, resets both
    /// security counters, and promotes the phase to `NoncesExchanged`.
    pub fn apply_connection_info(&mut self, user_id: u8, remote_session_nonce: SessionNonce) {
        self.user_id = user_id;
        self.remote_session_nonce = Some(remote_session_nonce);
        self.local_security_counter = 1;
        self.remote_security_counter = 0;
        if self.phase == ConnectionPhase::Connected {
            self.phase = ConnectionPhase::NoncesExchanged;
        }
        debug!(user_id, "session nonces exchanged");
    }

    /// Record a reported lock status; returns `true` if it differs from
    /// the previously known value.
    pub fn apply_lock_status(&mut self, status: LockStatus) -> bool {
        let changed = self.lock_status != Some(status);
        self.lock_status = Some(status);
        changed
    }

    /// Turn an outbound message into the payload bytes to fragment.
    ///
    /// Secure types are padded (`len = 8 mod 15`), stream-encrypted and
    /// authenticated, and consume one local security counter value; the
    /// trailer is `be16(counter) ++ auth`. Plain types pass through
    /// unchanged. Counters stay advanced even if the send later times out.
    /// A counter value is never reused: at the ceiling sends fail with
    /// [`SecurityError::CounterExhausted`] until the next nonce exchange.
    pub fn outbound_payload(&mut self, message: &Message) -> Result<Vec<u8>, SessionError> {
        let kind = message.kind();
        let data = message.encode()?;
        if !kind.is_secure() {
            return Ok(data);
        }

        let remote_nonce =
            self.remote_session_nonce.ok_or(SecurityError::NoncesNotExchanged)?;
        let counter = self.local_security_counter;
        let next = counter.checked_add(1).ok_or(SecurityError::CounterExhausted)?;
        let padded = pad_end(&data, generic_ceil(data.len(), 15, 8));
        let ciphertext =
            crypt_data(&padded, kind.id(), &remote_nonce, counter, &self.user_key);
        let auth =
            authentication_value(&padded, kind.id(), &remote_nonce, counter, &self.user_key);

        let mut payload = ciphertext;
        payload.extend_from_slice(&be16(counter));
        payload.extend_from_slice(&auth);
        self.local_security_counter = next;
        Ok(payload)
    }

    /// Verify and decode an inbound reassembled payload.
    ///
    /// For secure types the trailer is checked first: the counter must
    /// strictly increase (anti-replay) and the authentication value must
    /// match over the decrypted body. Only verified plaintext reaches the
    /// codec; a failed check aborts the message. The remote counter is
    /// adopted before authentication, mirroring the lock firmware, so a
    /// forged counter cannot be retried at the same value.
    pub fn open_message(
        &mut self,
        kind: MessageKind,
        payload: &[u8],
    ) -> Result<Message, SessionError> {
        if !kind.is_secure() {
            return Ok(Message::decode(kind, payload)?);
        }

        let local_nonce = self.local_session_nonce.ok_or(SecurityError::NoncesNotExchanged)?;
        if payload.len() < SECURITY_TRAILER_LEN {
            return Err(keyble_proto::ProtocolError::Truncated {
                label: kind.label(),
                needed: SECURITY_TRAILER_LEN,
                got: payload.len(),
            }
            .into());
        }

        let (body, trailer) = payload.split_at(payload.len() - SECURITY_TRAILER_LEN);
        // trailer = be16(counter) ++ auth(4); read_be16 cannot fail here
        let counter = read_be16(trailer).unwrap_or_default();
        let received_auth = &trailer[2..6];

        if counter <= self.remote_security_counter {
            warn!(
                message = kind.label(),
                received = counter,
                current = self.remote_security_counter,
                "rejecting replayed security counter"
            );
            return Err(SecurityError::CounterReplayed {
                received: counter,
                current: self.remote_security_counter,
            }
            .into());
        }
        self.remote_security_counter = counter;

        let plaintext = crypt_data(body, kind.id(), &local_nonce, counter, &self.user_key);
        let expected =
            authentication_value(&plaintext, kind.id(), &local_nonce, counter, &self.user_key);
        if expected != received_auth {
            warn!(message = kind.label(), "authentication value mismatch");
            return Err(SecurityError::AuthenticationMismatch.into());
        }

        Ok(Message::decode(kind, &plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use keyble_proto::{CommandId, DeviceTime, StatusInfo};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    const USER_KEY: Key = hex!("000102030405060708090a0b0c0d0e0f");
    const REMOTE_NONCE: SessionNonce = hex!("6ec35b3d2ff4ce1c");
    const LOCAL_NONCE: SessionNonce = hex!("f0f1f2f3f4f5f6f7");

    fn exchanged_session() -> SessionState {
        let mut session = SessionState::new(1, USER_KEY);
        session.transport_connected();
        session.local_session_nonce = Some(LOCAL_NONCE);
        session.apply_connection_info(1, REMOTE_NONCE);
        session
    }

    #[test]
    fn phases_are_ordered() {
        assert!(ConnectionPhase::Disconnected < ConnectionPhase::Connected);
        assert!(ConnectionPhase::Connected < ConnectionPhase::NoncesExchanged);
    }

    #[test]
    fn nonce_exchange_promotes_phase_and_resets_counters() {
        let mut session = SessionState::new(255, USER_KEY);
        session.transport_connected();
        assert_eq!(session.phase(), ConnectionPhase::Connected);

        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let request = session.begin_nonce_exchange(&mut rng);
        let Message::ConnectionRequest { user_id, session_nonce } = request else {
            panic!("expected CONNECTION_REQUEST");
        };
        assert_eq!(user_id, 255);
        assert_eq!(Some(session_nonce), session.local_session_nonce);

        session.apply_connection_info(1, REMOTE_NONCE);
        assert_eq!(session.phase(), ConnectionPhase::NoncesExchanged);
        assert_eq!(session.user_id(), 1);
        assert_eq!(session.local_security_counter(), 1);
        assert_eq!(session.remote_security_counter(), 0);
    }

    #[test]
    fn fresh_nonces_each_exchange() {
        let mut session = SessionState::new(1, USER_KEY);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let first = session.begin_nonce_exchange(&mut rng);
        let second = session.begin_nonce_exchange(&mut rng);
        assert_ne!(first, second);
    }

    #[test]
    fn disconnect_invalidates_session_material() {
        let mut session = exchanged_session();
        session.transport_disconnected();
        assert_eq!(session.phase(), ConnectionPhase::Disconnected);
        assert_eq!(session.remote_session_nonce(), None);
        let err = session
            .outbound_payload(&Message::Command { command: CommandId::Lock })
            .unwrap_err();
        assert_eq!(err, SessionError::Security(SecurityError::NoncesNotExchanged));
    }

    #[test]
    fn plain_messages_pass_through() {
        let mut session = SessionState::new(1, USER_KEY);
        session.transport_connected();
        let payload = session
            .outbound_payload(&Message::FragmentAck { fragment_id: 0x42 })
            .unwrap();
        assert_eq!(payload, vec![0x42]);
        assert_eq!(session.local_security_counter(), 1); // not consumed
    }

    #[test]
    fn status_request_reference_vector() {
        // End-to-end vector: user_key 00..0f, counter 1, known remote nonce,
        // STATUS_REQUEST at 2023-01-02 03:04:05.
        let mut session = exchanged_session();
        let message = Message::StatusRequest {
            date: DeviceTime { year: 23, month: 1, day: 2, hour: 3, minute: 4, second: 5 },
        };
        let payload = session.outbound_payload(&message).unwrap();
        assert_eq!(payload, hex!("54503af92dcbb8a7 0001 11b037e4"));
        assert_eq!(session.local_security_counter(), 2);
    }

    #[test]
    fn secure_sends_use_strictly_increasing_counters() {
        let mut session = exchanged_session();
        let message = Message::Command { command: CommandId::Lock };
        for expected in 1..=3u16 {
            let payload = session.outbound_payload(&message).unwrap();
            let counter_offset = payload.len() - 6;
            assert_eq!(
                read_be16(&payload[counter_offset..]).unwrap(),
                expected,
                "counter must advance by exactly one per secured send"
            );
        }
    }

    #[test]
    fn counter_ceiling_refuses_further_sends() {
        let mut session = exchanged_session();
        session.local_security_counter = u16::MAX;
        let err = session
            .outbound_payload(&Message::Command { command: CommandId::Lock })
            .unwrap_err();
        assert_eq!(err, SessionError::Security(SecurityError::CounterExhausted));
        assert_eq!(session.local_security_counter(), u16::MAX);

        // A nonce exchange re-keys the session and restores sending.
        session.apply_connection_info(1, REMOTE_NONCE);
        session.outbound_payload(&Message::Command { command: CommandId::Lock }).unwrap();
        assert_eq!(session.local_security_counter(), 2);
    }

    #[test]
    fn command_payload_reference_vector() {
        let mut session = exchanged_session();
        let payload =
            session.outbound_payload(&Message::Command { command: CommandId::Lock }).unwrap();
        assert_eq!(payload, hex!("fcae593d8db89462 0001 6fbf6a6c"));
    }

    #[test]
    fn open_verifies_and_decodes_secure_message() {
        // STATUS_INFO {battery_low, pairing_allowed, LOCKED} sealed by the
        // lock at counter 1 under LOCAL_NONCE.
        let mut session = exchanged_session();
        let message = session
            .open_message(MessageKind::StatusInfo, &hex!("18e8bda9db6a3f82 0001 546c8306"))
            .unwrap();
        assert_eq!(
            message,
            Message::StatusInfo(StatusInfo {
                user_right_type: 0,
                battery_low: true,
                pairing_allowed: true,
                lock_status: LockStatus::Locked,
            })
        );
        assert_eq!(session.remote_security_counter(), 1);
    }

    #[test]
    fn replayed_counter_rejected_without_advancing() {
        let mut session = exchanged_session();
        let payload = hex!("18e8bda9db6a3f82 0001 546c8306");
        session.open_message(MessageKind::StatusInfo, &payload).unwrap();

        let err = session.open_message(MessageKind::StatusInfo, &payload).unwrap_err();
        assert_eq!(
            err,
            SessionError::Security(SecurityError::CounterReplayed { received: 1, current: 1 })
        );
        assert_eq!(session.remote_security_counter(), 1);

        // A later counter is still accepted afterwards.
        let next = hex!("1605596060c8cb52 0002 373ed463");
        session.open_message(MessageKind::StatusInfo, &next).unwrap();
        assert_eq!(session.remote_security_counter(), 2);
    }

    #[test]
    fn any_bit_flip_causes_rejection() {
        let payload = hex!("18e8bda9db6a3f82 0001 546c8306");
        for byte in 0..payload.len() {
            for bit in 0..8 {
                // counter flips land in the replay check, the rest in the
                // authentication check; either way it must not decode
                let mut session = exchanged_session();
                let mut tampered = payload;
                tampered[byte] ^= 1 << bit;
                let result = session.open_message(MessageKind::StatusInfo, &tampered);
                assert!(
                    matches!(result, Err(SessionError::Security(_))),
                    "tampered byte {byte} bit {bit} was not rejected"
                );
            }
        }
    }

    #[test]
    fn undersized_secure_payload_is_a_format_error() {
        let mut session = exchanged_session();
        let err = session.open_message(MessageKind::StatusInfo, &[0; 5]).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn status_tracking_reports_changes_only() {
        let mut session = exchanged_session();
        assert!(session.apply_lock_status(LockStatus::Locked));
        assert!(!session.apply_lock_status(LockStatus::Locked));
        assert!(session.apply_lock_status(LockStatus::Unlocked));
        assert_eq!(session.lock_status(), Some(LockStatus::Unlocked));
    }
}
