//! The lock controller and its background tasks.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};

use chrono::{Datelike, Local, Timelike};
use keyble_core::{
    ConnectionPhase, LockEvent, SecurityError, SessionState, Transport, TransportEvent,
};
use keyble_crypto::{Key, authentication_value, crypt_data};
use keyble_proto::bytes::{generic_ceil, pad_end};
use keyble_proto::fragment::{FRAGMENT_LEN, Fragment, ReassemblyStep, split_message};
use keyble_proto::{
    AssembledMessage, CommandId, DeviceTime, LockStatus, Message, MessageKind, MountOptions,
    Reassembler, StatusInfo,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::LockConfig;
use crate::error::ClientError;

/// Broadcast backlog per subscriber; a lagging subscriber skips events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Credentials produced by a successful pairing.
///
/// Persist both values: they replace the key-card data for all future
/// connections to this lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pairing {
    /// User slot the lock assigned.
    pub user_id: u8,
    /// Freshly generated user key now registered with the lock.
    pub user_key: Key,
}

/// Async controller for one lock.
///
/// Cheap to clone; all clones share the session, the transport and the
/// event stream. Operations are serialized internally, so concurrent
/// callers queue rather than interleave their fragment exchanges.
#[derive(Clone)]
pub struct LockController {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: LockConfig,
    session: StdMutex<SessionState>,
    reassembler: StdMutex<Reassembler>,
    events: broadcast::Sender<LockEvent>,
    /// Serializes public operations; one fragment exchange at a time.
    op_lock: AsyncMutex<()>,
    rng: StdMutex<Box<dyn RngCore + Send>>,
    recv_task: StdMutex<Option<JoinHandle<()>>>,
    poll_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in [&self.recv_task, &self.poll_task] {
            if let Some(task) = lock(task).take() {
                task.abort();
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn emit(inner: &Inner, event: LockEvent) {
    let _ = inner.events.send(event);
}

impl LockController {
    /// Create a controller for the lock behind `transport`, authenticating
    /// as `user_id` with `user_key` (both obtained from pairing).
    pub fn new(transport: Arc<dyn Transport>, user_id: u8, user_key: Key, config: LockConfig) -> Self {
        Self::with_rng(transport, user_id, user_key, config, StdRng::from_entropy())
    }

    /// Like [`LockController::new`] with an explicit RNG for session
    /// nonces and pairing keys.
    pub fn with_rng(
        transport: Arc<dyn Transport>,
        user_id: u8,
        user_key: Key,
        config: LockConfig,
        rng: impl RngCore + Send + 'static,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (sink, source) = mpsc::unbounded_channel();
        transport.subscribe(sink);
        transport.set_auto_disconnect(config.auto_disconnect);

        let inner = Arc::new(Inner {
            transport,
            config,
            session: StdMutex::new(SessionState::new(user_id, user_key)),
            reassembler: StdMutex::new(Reassembler::new()),
            events,
            op_lock: AsyncMutex::new(()),
            rng: StdMutex::new(Box::new(rng)),
            recv_task: StdMutex::new(None),
            poll_task: StdMutex::new(None),
        });

        *lock(&inner.recv_task) =
            Some(tokio::spawn(receive_loop(Arc::downgrade(&inner), source)));
        arm_status_poll(&inner);

        Self { inner }
    }

    /// Subscribe to the controller's event stream.
    pub fn events(&self) -> broadcast::Receiver<LockEvent> {
        self.inner.events.subscribe()
    }

    /// Last known lock status, if any was reported this session.
    pub fn status(&self) -> Option<LockStatus> {
        lock(&self.inner.session).lock_status()
    }

    /// Extend the bolt. Resolves with the confirmed status; a no-op if the
    /// lock is already locked.
    pub async fn lock(&self) -> Result<LockStatus, ClientError> {
        let _op = self.inner.op_lock.lock().await;
        self.run_command(CommandId::Lock, LockStatus::Locked).await
    }

    /// Retract the bolt.
    pub async fn unlock(&self) -> Result<LockStatus, ClientError> {
        let _op = self.inner.op_lock.lock().await;
        self.run_command(CommandId::Unlock, LockStatus::Unlocked).await
    }

    /// Retract the bolt and pull the latch so the door can be pushed open.
    pub async fn open(&self) -> Result<LockStatus, ClientError> {
        let _op = self.inner.op_lock.lock().await;
        self.run_command(CommandId::Open, LockStatus::Opened).await
    }

    /// Lock when unlocked or opened, unlock when locked. Requests a fresh
    /// status report first when none is known yet.
    ///
    /// # Errors
    ///
    /// [`ClientError::StatusUnknown`] when the lock reports itself as
    /// moving or in an unknown state.
    pub async fn toggle(&self) -> Result<LockStatus, ClientError> {
        let _op = self.inner.op_lock.lock().await;
        let cached = lock(&self.inner.session).lock_status();
        let status = match cached {
            Some(status) => status,
            None => self.fetch_status().await?.lock_status,
        };
        match status {
            LockStatus::Locked => {
                self.run_command(CommandId::Unlock, LockStatus::Unlocked).await
            },
            LockStatus::Unlocked | LockStatus::Opened => {
                self.run_command(CommandId::Lock, LockStatus::Locked).await
            },
            LockStatus::Unknown | LockStatus::Moving => Err(ClientError::StatusUnknown),
        }
    }

    /// Set the lock's clock to the local time and fetch a status report.
    pub async fn request_status(&self) -> Result<StatusInfo, ClientError> {
        let _op = self.inner.op_lock.lock().await;
        self.fetch_status().await
    }

    /// [`LockController::request_status`] minus the operation lock, for
    /// callers already holding it.
    async fn fetch_status(&self) -> Result<StatusInfo, ClientError> {
        self.ensure_nonces_exchanged().await?;
        let rx = self.inner.events.subscribe();
        self.transmit(&Message::StatusRequest { date: device_time_now() }).await?;
        self.await_event(rx, "status report", |event| match event {
            LockEvent::StatusUpdate(info) => Some(*info),
            _ => None,
        })
        .await
    }

    /// Configure the lock's mounting parameters.
    pub async fn set_mount_options(&self, options: MountOptions) -> Result<(), ClientError> {
        let _op = self.inner.op_lock.lock().await;
        self.ensure_nonces_exchanged().await?;
        let rx = self.inner.events.subscribe();
        self.transmit(&Message::MountOptionsSet(options)).await?;
        let answer = self
            .await_event(rx, "mount options answer", |event| match event {
                LockEvent::MessageReceived(Message::AnswerWithSecurity(answer)) => Some(*answer),
                _ => None,
            })
            .await?;
        if answer.ok { Ok(()) } else { Err(ClientError::Rejected) }
    }

    /// Rename a user slot on the lock. `user_id` defaults to this session's
    /// own slot; naming another slot needs administrator rights on the lock.
    pub async fn set_user_name(
        &self,
        user_name: &str,
        user_id: Option<u8>,
    ) -> Result<(), ClientError> {
        let _op = self.inner.op_lock.lock().await;
        self.ensure_nonces_exchanged().await?;
        let user_id = user_id.unwrap_or_else(|| lock(&self.inner.session).user_id());
        let rx = self.inner.events.subscribe();
        self.transmit(&Message::UserNameSet { user_id, user_name: user_name.to_owned() })
            .await?;
        self.await_event(rx, "user info", |event| {
            matches!(event, LockEvent::MessageReceived(Message::UserInfo)).then_some(())
        })
        .await?;
        Ok(())
    }

    /// Register as a new user on a lock in pairing mode.
    ///
    /// Generates a fresh user key, encrypts it with the key-card key and
    /// submits it. The lock's confirmation is already sealed under the new
    /// key, which this controller adopts immediately.
    pub async fn pair(&self, card_key: Key) -> Result<Pairing, ClientError> {
        let _op = self.inner.op_lock.lock().await;
        self.ensure_nonces_exchanged().await?;

        let (message, pairing) = {
            let mut session = lock(&self.inner.session);
            let remote_nonce = session
                .remote_session_nonce()
                .ok_or(SecurityError::NoncesNotExchanged)?;
            // PAIRING_REQUEST is a plain message; it borrows the current
            // counter value without consuming it.
            let counter = session.local_security_counter();
            let user_id = session.user_id();
            let kind_id = MessageKind::PairingRequest.id();

            let mut user_key: Key = [0; 16];
            lock(&self.inner.rng).fill_bytes(&mut user_key);

            let encrypted_pair_key =
                crypt_data(&user_key, kind_id, &remote_nonce, counter, &card_key);
            let mut plain = Vec::with_capacity(1 + user_key.len());
            plain.push(user_id);
            plain.extend_from_slice(&user_key);
            let padded = pad_end(&plain, generic_ceil(plain.len(), 15, 8));
            let auth = authentication_value(&padded, kind_id, &remote_nonce, counter, &card_key);

            // The lock answers under the new key.
            session.set_user_key(user_key);

            (
                Message::PairingRequest {
                    user_id,
                    encrypted_pair_key,
                    security_counter: counter,
                    authentication_value: auth,
                },
                Pairing { user_id, user_key },
            )
        };

        let rx = self.inner.events.subscribe();
        self.transmit(&message).await?;
        let answer = self
            .await_event(rx, "pairing answer", |event| match event {
                LockEvent::MessageReceived(Message::AnswerWithSecurity(answer)) => Some(*answer),
                LockEvent::MessageReceived(Message::AnswerWithoutSecurity(answer))
                    if !answer.ok =>
                {
                    Some(*answer)
                },
                _ => None,
            })
            .await?;
        if !answer.ok {
            return Err(ClientError::Rejected);
        }
        debug!(user_id = pairing.user_id, "pairing complete");
        Ok(pairing)
    }

    /// Announce the teardown to the lock and drop the link.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let _op = self.inner.op_lock.lock().await;
        if lock(&self.inner.session).phase() == ConnectionPhase::Disconnected {
            return Ok(());
        }
        let rx = self.inner.events.subscribe();
        if let Err(error) = self.transmit(&Message::CloseConnection).await {
            warn!(%error, "close notification failed; dropping the link anyway");
        }
        self.inner.transport.disconnect().await?;
        self.await_event(rx, "disconnect", |event| {
            matches!(event, LockEvent::Disconnected).then_some(())
        })
        .await?;
        Ok(())
    }

    async fn run_command(
        &self,
        command: CommandId,
        target: LockStatus,
    ) -> Result<LockStatus, ClientError> {
        self.ensure_nonces_exchanged().await?;
        if lock(&self.inner.session).lock_status() == Some(target) {
            debug!(target = target.label(), "lock already in target state");
            return Ok(target);
        }
        let rx = self.inner.events.subscribe();
        self.transmit(&Message::Command { command }).await?;
        self.await_event(rx, "status change", move |event| match event {
            LockEvent::StatusUpdate(info) if info.lock_status == target => Some(target),
            _ => None,
        })
        .await
    }

    /// Bring the transport up if it is down.
    async fn ensure_connected(&self) -> Result<(), ClientError> {
        let rx = self.inner.events.subscribe();
        if lock(&self.inner.session).phase() >= ConnectionPhase::Connected {
            return Ok(());
        }
        self.inner.transport.connect().await?;
        self.await_event(rx, "connection", |event| {
            matches!(event, LockEvent::Connected).then_some(())
        })
        .await?;
        Ok(())
    }

    /// Run the nonce exchange if this connection has not done it yet.
    async fn ensure_nonces_exchanged(&self) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let rx = self.inner.events.subscribe();
        if lock(&self.inner.session).phase() >= ConnectionPhase::NoncesExchanged {
            return Ok(());
        }
        let request = {
            let mut session = lock(&self.inner.session);
            let mut rng = lock(&self.inner.rng);
            session.begin_nonce_exchange(rng.as_mut())
        };
        self.transmit(&request).await?;
        self.await_event(rx, "nonce exchange", |event| {
            matches!(event, LockEvent::NoncesExchanged).then_some(())
        })
        .await?;
        Ok(())
    }

    /// Seal, fragment and write one message, pausing for the lock's
    /// `FRAGMENT_ACK` after every fragment but the last.
    async fn transmit(&self, message: &Message) -> Result<(), ClientError> {
        let payload = lock(&self.inner.session).outbound_payload(message)?;
        let fragments = split_message(message.kind().id(), &payload)?;
        debug!(message = message.kind().label(), fragments = fragments.len(), "sending message");

        let last = fragments.len() - 1;
        for (index, fragment) in fragments.iter().enumerate() {
            // subscribe before the write so the ack cannot slip past
            let ack = (index < last).then(|| self.inner.events.subscribe());
            self.inner.transport.write_fragment(*fragment.as_bytes()).await?;
            if let Some(rx) = ack {
                self.await_event(rx, "fragment acknowledgement", |event| {
                    matches!(event, LockEvent::MessageReceived(Message::FragmentAck { .. }))
                        .then_some(())
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Wait on the event stream for the first event `extract` accepts,
    /// bounded by the configured operation timeout.
    async fn await_event<T, F>(
        &self,
        mut rx: broadcast::Receiver<LockEvent>,
        waiting_for: &'static str,
        extract: F,
    ) -> Result<T, ClientError>
    where
        F: Fn(&LockEvent) -> Option<T>,
    {
        let wait = async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(value) = extract(&event) {
                            return Ok(value);
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Shutdown),
                }
            }
        };
        match self.inner.config.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ClientError::Timeout { waiting_for })?,
            None => wait.await,
        }
    }
}

/// Consume transport notifications until the transport closes its channel
/// or the controller is dropped.
async fn receive_loop(inner: Weak<Inner>, mut source: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = source.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        match event {
            TransportEvent::Connected => {
                lock(&inner.session).transport_connected();
                emit(&inner, LockEvent::Connected);
            },
            TransportEvent::Disconnected => {
                lock(&inner.session).transport_disconnected();
                lock(&inner.reassembler).reset();
                emit(&inner, LockEvent::Disconnected);
            },
            TransportEvent::Fragment(bytes) => handle_fragment(&inner, bytes).await,
        }
    }
}

/// (Re)start the idle status-poll timer. One-shot: the timer fires after a
/// full poll interval with no status report, and every processed report
/// rearms it, so manual requests push the next background poll out.
fn arm_status_poll(inner: &Arc<Inner>) {
    let Some(every) = inner.config.status_poll_interval else { return };
    let weak = Arc::downgrade(inner);
    let task = tokio::spawn(async move {
        tokio::time::sleep(every).await;
        let Some(inner) = weak.upgrade() else { return };
        let controller = LockController { inner };
        // a successful poll rearms the timer when its status report lands
        if let Err(error) = controller.request_status().await {
            warn!(%error, "periodic status poll failed");
            arm_status_poll(&controller.inner);
        }
    });
    if let Some(previous) = lock(&inner.poll_task).replace(task) {
        previous.abort();
    }
}

async fn handle_fragment(inner: &Arc<Inner>, bytes: [u8; FRAGMENT_LEN]) {
    trace!(fragment = %hex::encode(bytes), "fragment received");
    emit(inner, LockEvent::FragmentReceived(bytes));

    let step = lock(&inner.reassembler).push(Fragment::from_bytes(bytes));
    match step {
        Ok(ReassemblyStep::AckRequired { fragment_id }) => {
            if let Err(error) = write_plain(inner, &Message::FragmentAck { fragment_id }).await {
                warn!(%error, "failed to acknowledge fragment");
            }
        },
        Ok(ReassemblyStep::Complete(assembled)) => handle_message(inner, &assembled),
        Err(error) => warn!(%error, "dropping fragment"),
    }
}

fn handle_message(inner: &Arc<Inner>, assembled: &AssembledMessage) {
    let kind = match MessageKind::from_id(assembled.message_type_id) {
        Ok(kind) => kind,
        Err(error) => {
            warn!(%error, "dropping message of unknown type");
            return;
        },
    };
    let message = match lock(&inner.session).open_message(kind, &assembled.payload) {
        Ok(message) => message,
        Err(error) => {
            warn!(message = kind.label(), %error, "rejecting inbound message");
            return;
        },
    };
    debug!(message = kind.label(), "message received");

    match &message {
        Message::ConnectionInfo { user_id, remote_session_nonce, .. } => {
            lock(&inner.session).apply_connection_info(*user_id, *remote_session_nonce);
            emit(inner, LockEvent::NoncesExchanged);
        },
        Message::StatusInfo(info) => {
            let changed = lock(&inner.session).apply_lock_status(info.lock_status);
            arm_status_poll(inner);
            emit(inner, LockEvent::StatusUpdate(*info));
            if changed {
                emit(inner, LockEvent::StatusChange(info.lock_status));
            }
        },
        Message::StatusChangedNotification => {
            // the notification carries no state; fetch the actual status
            let controller = LockController { inner: Arc::clone(inner) };
            tokio::spawn(async move {
                if let Err(error) = controller.request_status().await {
                    warn!(%error, "status refresh after change notification failed");
                }
            });
        },
        _ => {},
    }
    emit(inner, LockEvent::MessageReceived(message));
}

/// Write a plain message without touching the security counters.
async fn write_plain(inner: &Arc<Inner>, message: &Message) -> Result<(), ClientError> {
    let payload = message.encode()?;
    for fragment in split_message(message.kind().id(), &payload)? {
        inner.transport.write_fragment(*fragment.as_bytes()).await?;
    }
    Ok(())
}

fn device_time_now() -> DeviceTime {
    let now = Local::now();
    DeviceTime {
        year: u8::try_from(now.year() - 2000).unwrap_or(0),
        month: u8::try_from(now.month()).unwrap_or(1),
        day: u8::try_from(now.day()).unwrap_or(1),
        hour: u8::try_from(now.hour()).unwrap_or(0),
        minute: u8::try_from(now.minute()).unwrap_or(0),
        second: u8::try_from(now.second()).unwrap_or(0),
    }
}
