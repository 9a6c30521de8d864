//! In-process simulated lock.
//!
//! The lock side of the protocol is symmetric to the client side: it opens
//! inbound secure messages with its own session nonce and seals outbound
//! ones with the client's nonce, so the simulation reuses `SessionState`
//! with the roles swapped instead of reimplementing the crypto.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use keyble_core::{SessionState, Transport, TransportError, TransportEvent};
use keyble_crypto::{Key, SessionNonce, authentication_value, crypt_data};
use keyble_proto::bytes::{generic_ceil, pad_end};
use keyble_proto::fragment::{FRAGMENT_LEN, Fragment, ReassemblyStep, split_message};
use keyble_proto::message::{
    Answer, CommandId, DeviceTime, LockStatus, Message, MessageKind, MountOptions, StatusInfo,
};
use keyble_proto::{AssembledMessage, Reassembler};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A scripted lock reachable through the `Transport` trait.
///
/// All interaction is synchronous inside the transport calls; replies are
/// pushed into the subscribed event sink before the call returns, which
/// keeps test runs fully deterministic.
pub struct SimLock {
    state: Mutex<LockSide>,
    sink: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

struct LockSide {
    connected: bool,
    silent: bool,
    key: Key,
    card_key: Option<Key>,
    pairing_allowed: bool,
    battery_low: bool,
    lock_status: LockStatus,
    session: SessionState,
    lock_nonce: Option<SessionNonce>,
    reassembler: Reassembler,
    pending_out: VecDeque<Fragment>,
    rng: ChaCha8Rng,
    user_names: HashMap<u8, String>,
    mount_options: Option<MountOptions>,
    device_time: Option<DeviceTime>,
    connection_requests: usize,
    commands_received: usize,
    status_requests: usize,
    auto_disconnect: Option<Duration>,
    tamper_next_auth: bool,
    last_message: Option<(MessageKind, Vec<u8>)>,
}

fn lock_state<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimLock {
    /// Create a lock already paired with `user_key`, starting unlocked.
    pub fn new(user_key: Key) -> Self {
        Self::with_seed(user_key, 0)
    }

    /// Create a lock with an explicit RNG seed for its session nonces.
    pub fn with_seed(user_key: Key, seed: u64) -> Self {
        Self {
            state: Mutex::new(LockSide {
                connected: false,
                silent: false,
                key: user_key,
                card_key: None,
                pairing_allowed: false,
                battery_low: false,
                lock_status: LockStatus::Unlocked,
                session: SessionState::new(0, user_key),
                lock_nonce: None,
                reassembler: Reassembler::new(),
                pending_out: VecDeque::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
                user_names: HashMap::new(),
                mount_options: None,
                device_time: None,
                connection_requests: 0,
                commands_received: 0,
                status_requests: 0,
                auto_disconnect: None,
                tamper_next_auth: false,
                last_message: None,
            }),
            sink: Mutex::new(None),
        }
    }

    /// Enable pairing mode with the given key-card key.
    pub fn allow_pairing(&self, card_key: Key) {
        let mut state = lock_state(&self.state);
        state.card_key = Some(card_key);
        state.pairing_allowed = true;
    }

    /// Force the physical lock state without notifying the client.
    pub fn set_status(&self, status: LockStatus) {
        lock_state(&self.state).lock_status = status;
    }

    /// Current physical lock state.
    pub fn status(&self) -> LockStatus {
        lock_state(&self.state).lock_status
    }

    /// Set the battery warning flag reported in status messages.
    pub fn set_battery_low(&self, low: bool) {
        lock_state(&self.state).battery_low = low;
    }

    /// Stop responding to anything the client sends.
    pub fn set_silent(&self, silent: bool) {
        lock_state(&self.state).silent = silent;
    }

    /// Corrupt the authentication value of the next secured reply.
    pub fn tamper_next_auth(&self) {
        lock_state(&self.state).tamper_next_auth = true;
    }

    /// Whether the link is currently up.
    pub fn is_connected(&self) -> bool {
        lock_state(&self.state).connected
    }

    /// User key the lock currently verifies with.
    pub fn current_key(&self) -> Key {
        lock_state(&self.state).key
    }

    /// Name stored for a user slot, if any.
    pub fn user_name(&self, user_id: u8) -> Option<String> {
        lock_state(&self.state).user_names.get(&user_id).cloned()
    }

    /// Mounting parameters last configured by the client.
    pub fn mount_options(&self) -> Option<MountOptions> {
        lock_state(&self.state).mount_options
    }

    /// Clock value last set by a status request.
    pub fn device_time(&self) -> Option<DeviceTime> {
        lock_state(&self.state).device_time
    }

    /// Number of `CONNECTION_REQUEST` messages received so far.
    pub fn connection_requests(&self) -> usize {
        lock_state(&self.state).connection_requests
    }

    /// Number of `COMMAND` messages received so far.
    pub fn commands_received(&self) -> usize {
        lock_state(&self.state).commands_received
    }

    /// Number of `STATUS_REQUEST` messages received so far.
    pub fn status_requests(&self) -> usize {
        lock_state(&self.state).status_requests
    }

    /// Idle timeout the client configured, if any.
    pub fn auto_disconnect(&self) -> Option<Duration> {
        lock_state(&self.state).auto_disconnect
    }

    /// Send an unsolicited `STATUS_CHANGED_NOTIFICATION` to the client.
    pub fn send_status_changed(&self) {
        self.with_state(|state, out| {
            state.reply(&Message::StatusChangedNotification, out);
        });
    }

    /// Replay the last message verbatim, duplicating its security counter.
    pub fn resend_last_message(&self) {
        self.with_state(|state, out| {
            if let Some((kind, payload)) = state.last_message.clone() {
                state.dispatch(kind.id(), &payload, out);
            }
        });
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LockSide, &mut Vec<TransportEvent>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut state = lock_state(&self.state);
            f(&mut state, &mut events)
        };
        self.emit(events);
        result
    }

    fn emit(&self, events: Vec<TransportEvent>) {
        let sink = lock_state(&self.sink).clone();
        if let Some(sink) = sink {
            for event in events {
                let _ = sink.send(event);
            }
        }
    }
}

#[async_trait]
impl Transport for SimLock {
    async fn connect(&self) -> Result<(), TransportError> {
        self.with_state(|state, out| {
            if !state.connected {
                state.connected = true;
                state.session.transport_connected();
                out.push(TransportEvent::Connected);
            }
            Ok(())
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.with_state(|state, out| {
            if state.connected {
                state.drop_link(out);
            }
            Ok(())
        })
    }

    async fn write_fragment(&self, fragment: [u8; FRAGMENT_LEN]) -> Result<(), TransportError> {
        self.with_state(|state, out| {
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            if state.silent {
                return Ok(());
            }
            match state.reassembler.push(Fragment::from_bytes(fragment)) {
                Ok(ReassemblyStep::AckRequired { fragment_id }) => {
                    state.reply(&Message::FragmentAck { fragment_id }, out);
                },
                Ok(ReassemblyStep::Complete(assembled)) => {
                    state.handle_message(&assembled, out);
                },
                Err(error) => warn!(%error, "sim lock dropping fragment"),
            }
            Ok(())
        })
    }

    fn subscribe(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
        *lock_state(&self.sink) = Some(sink);
    }

    fn set_auto_disconnect(&self, idle: Duration) {
        lock_state(&self.state).auto_disconnect = Some(idle);
    }
}

impl LockSide {
    fn handle_message(&mut self, assembled: &AssembledMessage, out: &mut Vec<TransportEvent>) {
        let kind = match MessageKind::from_id(assembled.message_type_id) {
            Ok(kind) => kind,
            Err(error) => {
                warn!(%error, "sim lock received unknown message type");
                return;
            },
        };
        if kind == MessageKind::FragmentAck {
            if let Some(next) = self.pending_out.pop_front() {
                out.push(TransportEvent::Fragment(*next.as_bytes()));
            }
            return;
        }
        let message = match self.session.open_message(kind, &assembled.payload) {
            Ok(message) => message,
            Err(error) => {
                warn!(message = kind.label(), %error, "sim lock rejecting message");
                return;
            },
        };
        debug!(message = kind.label(), "sim lock handling message");

        match message {
            Message::ConnectionRequest { user_id, session_nonce } => {
                self.connection_requests += 1;
                self.session = SessionState::new(user_id, self.key);
                self.session.transport_connected();
                let request = self.session.begin_nonce_exchange(&mut self.rng);
                let Message::ConnectionRequest { session_nonce: lock_nonce, .. } = request else {
                    return;
                };
                self.lock_nonce = Some(lock_nonce);
                self.session.apply_connection_info(user_id, session_nonce);
                self.reply(
                    &Message::ConnectionInfo {
                        user_id,
                        remote_session_nonce: lock_nonce,
                        bootloader_version: 1,
                        application_version: 2,
                    },
                    out,
                );
            },
            Message::Command { command } => {
                self.commands_received += 1;
                self.lock_status = match command {
                    CommandId::Lock => LockStatus::Locked,
                    CommandId::Unlock => LockStatus::Unlocked,
                    CommandId::Open => LockStatus::Opened,
                };
                let info = self.status_info();
                self.reply(&Message::StatusInfo(info), out);
            },
            Message::StatusRequest { date } => {
                self.status_requests += 1;
                self.device_time = Some(date);
                let info = self.status_info();
                self.reply(&Message::StatusInfo(info), out);
            },
            Message::UserNameSet { user_id, user_name } => {
                self.user_names.insert(user_id, user_name);
                self.reply(&Message::UserInfo, out);
            },
            Message::MountOptionsSet(options) => {
                self.mount_options = Some(options);
                self.reply(
                    &Message::AnswerWithSecurity(Answer { ok: true, accepted: true }),
                    out,
                );
            },
            Message::PairingRequest {
                user_id,
                encrypted_pair_key,
                security_counter,
                authentication_value: received,
            } => {
                self.handle_pairing(user_id, &encrypted_pair_key, security_counter, received, out);
            },
            Message::CloseConnection => self.drop_link(out),
            other => {
                warn!(message = other.kind().label(), "sim lock ignoring message");
            },
        }
    }

    fn handle_pairing(
        &mut self,
        user_id: u8,
        encrypted_pair_key: &[u8],
        security_counter: u16,
        received: [u8; 4],
        out: &mut Vec<TransportEvent>,
    ) {
        let accepted = self.verify_pairing(user_id, encrypted_pair_key, security_counter, received);
        match accepted {
            Some(new_key) => {
                self.key = new_key;
                self.session.set_user_key(new_key);
                self.reply(
                    &Message::AnswerWithSecurity(Answer { ok: true, accepted: true }),
                    out,
                );
            },
            None => {
                warn!(user_id, "sim lock rejecting pairing request");
                self.reply(
                    &Message::AnswerWithoutSecurity(Answer { ok: false, accepted: false }),
                    out,
                );
            },
        }
    }

    fn verify_pairing(
        &mut self,
        user_id: u8,
        encrypted_pair_key: &[u8],
        security_counter: u16,
        received: [u8; 4],
    ) -> Option<Key> {
        if !self.pairing_allowed || encrypted_pair_key.len() < 16 {
            return None;
        }
        let card_key = self.card_key?;
        let lock_nonce = self.lock_nonce?;
        let kind_id = MessageKind::PairingRequest.id();

        let decrypted = crypt_data(
            &encrypted_pair_key[..16],
            kind_id,
            &lock_nonce,
            security_counter,
            &card_key,
        );
        let mut new_key: Key = [0; 16];
        new_key.copy_from_slice(&decrypted);

        let mut plain = Vec::with_capacity(1 + new_key.len());
        plain.push(user_id);
        plain.extend_from_slice(&new_key);
        let padded = pad_end(&plain, generic_ceil(plain.len(), 15, 8));
        let expected =
            authentication_value(&padded, kind_id, &lock_nonce, security_counter, &card_key);
        (expected == received).then_some(new_key)
    }

    fn status_info(&self) -> StatusInfo {
        StatusInfo {
            user_right_type: 2,
            battery_low: self.battery_low,
            pairing_allowed: self.pairing_allowed,
            lock_status: self.lock_status,
        }
    }

    fn reply(&mut self, message: &Message, out: &mut Vec<TransportEvent>) {
        let mut payload = match self.session.outbound_payload(message) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(message = message.kind().label(), %error, "sim lock cannot seal reply");
                return;
            },
        };
        if message.kind().is_secure() && self.tamper_next_auth {
            self.tamper_next_auth = false;
            if let Some(last) = payload.last_mut() {
                *last ^= 0x01;
            }
        }
        self.last_message = Some((message.kind(), payload.clone()));
        self.dispatch(message.kind().id(), &payload, out);
    }

    fn dispatch(&mut self, message_id: u8, payload: &[u8], out: &mut Vec<TransportEvent>) {
        let fragments = match split_message(message_id, payload) {
            Ok(fragments) => fragments,
            Err(error) => {
                warn!(%error, "sim lock cannot fragment reply");
                return;
            },
        };
        let mut fragments = fragments.into_iter();
        if let Some(first) = fragments.next() {
            out.push(TransportEvent::Fragment(*first.as_bytes()));
        }
        // remaining fragments wait for the client's FRAGMENT_ACK
        self.pending_out.extend(fragments);
    }

    fn drop_link(&mut self, out: &mut Vec<TransportEvent>) {
        self.connected = false;
        self.session.transport_disconnected();
        self.reassembler.reset();
        self.pending_out.clear();
        out.push(TransportEvent::Disconnected);
    }
}
