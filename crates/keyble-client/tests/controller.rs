//! End-to-end controller exercises against the simulated lock.

use std::sync::Arc;
use std::time::Duration;

use keyble_client::{ClientError, LockConfig, LockController};
use keyble_core::{LockEvent, Transport};
use keyble_harness::SimLock;
use keyble_proto::{LockStatus, MountOptions};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const USER_ID: u8 = 1;
const USER_KEY: [u8; 16] = [7; 16];
const CARD_KEY: [u8; 16] = [0xC4; 16];

fn test_config() -> LockConfig {
    LockConfig {
        auto_disconnect: Duration::from_secs(15),
        // no background traffic unless a test asks for it
        status_poll_interval: None,
        operation_timeout: Some(Duration::from_secs(5)),
    }
}

fn controller_for(lock: &Arc<SimLock>, config: LockConfig) -> LockController {
    let transport: Arc<dyn Transport> = lock.clone();
    LockController::with_rng(transport, USER_ID, USER_KEY, config, ChaCha8Rng::seed_from_u64(42))
}

async fn wait_for(
    rx: &mut tokio::sync::broadcast::Receiver<LockEvent>,
    matches: impl Fn(&LockEvent) -> bool,
) {
    let found = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return true,
                Ok(_) => {},
                Err(_) => return false,
            }
        }
    })
    .await;
    assert!(matches!(found, Ok(true)), "expected event never arrived");
}

#[tokio::test]
async fn lock_and_unlock_round_trip() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    assert_eq!(controller.lock().await.unwrap(), LockStatus::Locked);
    assert_eq!(sim.status(), LockStatus::Locked);
    assert_eq!(controller.status(), Some(LockStatus::Locked));

    assert_eq!(controller.unlock().await.unwrap(), LockStatus::Unlocked);
    assert_eq!(sim.status(), LockStatus::Unlocked);

    // the controller propagated its idle timeout to the transport
    assert_eq!(sim.auto_disconnect(), Some(Duration::from_secs(15)));
}

#[tokio::test]
async fn command_is_skipped_when_state_already_matches() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    controller.lock().await.unwrap();
    assert_eq!(sim.commands_received(), 1);

    // already locked: resolves without another fragment exchange
    assert_eq!(controller.lock().await.unwrap(), LockStatus::Locked);
    assert_eq!(sim.commands_received(), 1);
}

#[tokio::test]
async fn nonce_exchange_happens_once_per_connection() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    controller.lock().await.unwrap();
    controller.request_status().await.unwrap();
    controller.unlock().await.unwrap();
    assert_eq!(sim.connection_requests(), 1);
}

#[tokio::test]
async fn status_request_sets_clock_and_reports_flags() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    sim.set_battery_low(true);
    let controller = controller_for(&sim, test_config());

    let info = controller.request_status().await.unwrap();
    assert!(info.battery_low);
    assert_eq!(info.lock_status, LockStatus::Unlocked);

    let time = sim.device_time().expect("status request must carry the clock");
    assert!((20..100).contains(&time.year));
    assert!((1..=12).contains(&time.month));
}

#[tokio::test]
async fn toggle_fetches_status_when_unknown() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    // no cached status yet: toggle requests one on its own, then locks
    assert_eq!(controller.toggle().await.unwrap(), LockStatus::Locked);
    assert_eq!(sim.status_requests(), 1);

    // with a cached status no extra request is needed
    assert_eq!(controller.toggle().await.unwrap(), LockStatus::Unlocked);
    assert_eq!(sim.status_requests(), 1);
}

#[tokio::test]
async fn toggle_refuses_a_moving_lock() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    sim.set_status(LockStatus::Moving);
    let controller = controller_for(&sim, test_config());

    assert_eq!(controller.toggle().await.unwrap_err(), ClientError::StatusUnknown);
    assert_eq!(sim.commands_received(), 0);
}

#[tokio::test]
async fn long_messages_are_sent_fragment_by_fragment() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    // 20-byte name: two fragments, the first of which needs an ack
    controller.set_user_name("twenty-letter-name!!", None).await.unwrap();
    assert_eq!(sim.user_name(USER_ID).as_deref(), Some("twenty-letter-name!!"));
}

#[tokio::test]
async fn renames_a_foreign_user_slot() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    controller.set_user_name("spare key", Some(3)).await.unwrap();
    assert_eq!(sim.user_name(3).as_deref(), Some("spare key"));
    assert_eq!(sim.user_name(USER_ID), None);
}

#[tokio::test]
async fn mount_options_are_acknowledged() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    let options = MountOptions {
        turn_direction_is_left: true,
        neutral_position_is_horizontal: false,
        lock_turns: 2,
    };
    controller.set_mount_options(options).await.unwrap();
    assert_eq!(sim.mount_options(), Some(options));
}

#[tokio::test]
async fn pairing_installs_a_fresh_key_on_both_sides() {
    // the lock's factory state: some unrelated user key, pairing enabled
    let sim = Arc::new(SimLock::new([0xAA; 16]));
    sim.allow_pairing(CARD_KEY);
    let controller = controller_for(&sim, test_config());

    let pairing = controller.pair(CARD_KEY).await.unwrap();
    assert_eq!(pairing.user_id, USER_ID);
    assert_eq!(pairing.user_key, sim.current_key());

    // secure traffic now runs under the freshly exchanged key
    let info = controller.request_status().await.unwrap();
    assert_eq!(info.lock_status, LockStatus::Unlocked);
}

#[tokio::test]
async fn pairing_is_rejected_when_not_allowed() {
    let sim = Arc::new(SimLock::new([0xAA; 16]));
    let controller = controller_for(&sim, test_config());

    assert_eq!(controller.pair(CARD_KEY).await.unwrap_err(), ClientError::Rejected);
}

#[tokio::test(start_paused = true)]
async fn replayed_reply_is_dropped() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    controller.request_status().await.unwrap();

    let mut rx = controller.events();
    sim.resend_last_message();
    let mut saw_update = false;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        if matches!(event, LockEvent::StatusUpdate(_)) {
            saw_update = true;
        }
    }
    assert!(!saw_update, "a replayed status report must not surface");

    // the session is still healthy afterwards
    controller.request_status().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn tampered_reply_is_dropped_then_recovers() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    sim.tamper_next_auth();
    assert!(matches!(
        controller.request_status().await.unwrap_err(),
        ClientError::Timeout { .. }
    ));

    controller.request_status().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_lock_times_out() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    controller.request_status().await.unwrap();
    sim.set_silent(true);
    assert!(matches!(
        controller.request_status().await.unwrap_err(),
        ClientError::Timeout { .. }
    ));
}

#[tokio::test]
async fn disconnect_announces_teardown_and_reconnects_lazily() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    controller.lock().await.unwrap();
    controller.disconnect().await.unwrap();
    assert!(!sim.is_connected());
    // cached status survives the disconnect
    assert_eq!(controller.status(), Some(LockStatus::Locked));

    controller.request_status().await.unwrap();
    assert!(sim.is_connected());
    assert_eq!(sim.connection_requests(), 2);
}

#[tokio::test]
async fn events_report_status_changes() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());
    let mut rx = controller.events();

    controller.lock().await.unwrap();
    wait_for(&mut rx, |event| matches!(event, LockEvent::NoncesExchanged)).await;
    wait_for(&mut rx, |event| {
        matches!(event, LockEvent::StatusChange(LockStatus::Locked))
    })
    .await;
}

#[tokio::test]
async fn change_notification_triggers_a_status_refresh() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let controller = controller_for(&sim, test_config());

    controller.request_status().await.unwrap();
    assert_eq!(controller.status(), Some(LockStatus::Unlocked));

    let mut rx = controller.events();
    sim.set_status(LockStatus::Locked);
    sim.send_status_changed();
    wait_for(&mut rx, |event| {
        matches!(event, LockEvent::StatusChange(LockStatus::Locked))
    })
    .await;
    assert_eq!(controller.status(), Some(LockStatus::Locked));
}

#[tokio::test(start_paused = true)]
async fn background_poll_keeps_status_fresh() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let config = LockConfig {
        status_poll_interval: Some(Duration::from_secs(1)),
        ..test_config()
    };
    let controller = controller_for(&sim, config);
    let mut rx = controller.events();

    // no operation issued; the poller connects and fetches on its own
    wait_for(&mut rx, |event| matches!(event, LockEvent::StatusUpdate(_))).await;
    assert_eq!(controller.status(), Some(LockStatus::Unlocked));
}

#[tokio::test(start_paused = true)]
async fn manual_request_defers_the_next_poll() {
    let sim = Arc::new(SimLock::new(USER_KEY));
    let config = LockConfig {
        status_poll_interval: Some(Duration::from_secs(5)),
        ..test_config()
    };
    let controller = controller_for(&sim, config);

    controller.request_status().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    controller.request_status().await.unwrap();
    assert_eq!(sim.status_requests(), 2);

    // the poll timer was rearmed by the second request, so the next
    // background poll comes a full interval after it
    let start = tokio::time::Instant::now();
    let mut rx = controller.events();
    wait_for(&mut rx, |event| matches!(event, LockEvent::StatusUpdate(_))).await;
    assert_eq!(sim.status_requests(), 3);
    assert!(start.elapsed() >= Duration::from_secs(4));
}
