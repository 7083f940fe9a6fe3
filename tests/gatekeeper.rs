//! The assembled service: config, dispatch workers and background sweep.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use subgate::{
    AdminCommand, AdminConfig, Clock, GateError, Gatekeeper, GatekeeperConfig, InboundEvent,
    ManualClock, PaymentConfirmed, RecordingTransport, Store, StoreConfig, SubscriptionStatus,
    Timestamp, Transport, UserId,
};
use tempfile::TempDir;

const SUPPORT: UserId = UserId(1000);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn config(dir: &TempDir) -> GatekeeperConfig {
    let mut config = GatekeeperConfig::default();
    config.store = StoreConfig {
        path: dir.path().join("store"),
        create_if_missing: true,
        sync_every_write: false,
    };
    config.sweep.transport_timeout_ms = 1_000;
    config.admin = AdminConfig {
        admin_ids: vec![UserId(1001)],
        support_user_id: Some(SUPPORT),
    };
    config.dispatch_workers = 2;
    config
}

fn confirmed(user: i64) -> PaymentConfirmed {
    PaymentConfirmed {
        user_id: UserId(user),
        display_name: Some("hana".into()),
        months: 1,
        full_access: false,
        amount: 30_000,
        currency: "RUB".into(),
    }
}

fn payment(user: i64) -> InboundEvent {
    InboundEvent::PaymentConfirmed(confirmed(user))
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_events_are_applied_and_persisted() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(RecordingTransport::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Timestamp::from_secs(1_765_000_000)));

    let gatekeeper = Gatekeeper::start(
        config(&dir),
        transport.clone() as Arc<dyn Transport>,
        clock,
    )
    .unwrap();

    for user in 1..=5 {
        gatekeeper.submit(payment(user)).unwrap();
    }
    gatekeeper
        .submit(InboundEvent::Admin {
            user_id: UserId(1001),
            command: AdminCommand::Stats,
        })
        .unwrap();
    gatekeeper.shutdown().unwrap();

    for user in 1..=5 {
        assert!(transport.messages_to(UserId(user))[0].contains("https://t.me/+invite"));
    }

    let store = Store::open(config(&dir).store).unwrap();
    assert_eq!(store.stats().payment_count, 5);
}

#[test]
fn test_background_sweep_runs_on_start() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(RecordingTransport::new());
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_765_000_000)));

    // Subscription bought while the service was down
    {
        let gatekeeper = Gatekeeper::start(
            config(&dir),
            transport.clone() as Arc<dyn Transport>,
            clock.clone() as Arc<dyn Clock>,
        )
        .unwrap();
        gatekeeper.payments().confirm(&confirmed(1)).unwrap();
        gatekeeper.shutdown().unwrap();
    }
    clock.advance_days(31);

    let gatekeeper = Gatekeeper::start(
        config(&dir),
        transport.clone() as Arc<dyn Transport>,
        clock.clone() as Arc<dyn Clock>,
    )
    .unwrap();
    wait_for("expiry", || {
        gatekeeper.store().get_subscriber(UserId(1)).unwrap().status == SubscriptionStatus::Expired
    });
    assert_eq!(transport.revocations_of(UserId(1)), 1);

    // Nothing left to do on an on-demand pass
    assert_eq!(gatekeeper.sweeper().run_pass().expired, 0);
    gatekeeper.shutdown().unwrap();
}

#[test]
fn test_shutdown_interrupts_sleeping_sweep() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let transport: Arc<dyn Transport> = Arc::new(RecordingTransport::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Timestamp::from_secs(1_765_000_000)));

    let gatekeeper = Gatekeeper::start(config(&dir), transport, clock).unwrap();
    let started = Instant::now();
    gatekeeper.shutdown().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_start_rejects_bad_config_and_locked_store() {
    let dir = TempDir::new().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Timestamp::from_secs(1_765_000_000)));
    let transport: Arc<dyn Transport> = Arc::new(RecordingTransport::new());

    let mut bad = config(&dir);
    bad.dispatch_workers = 0;
    assert!(matches!(
        Gatekeeper::start(bad, Arc::clone(&transport), Arc::clone(&clock)),
        Err(GateError::Config(_))
    ));

    let running = Gatekeeper::start(config(&dir), Arc::clone(&transport), Arc::clone(&clock)).unwrap();
    assert!(matches!(
        Gatekeeper::start(config(&dir), transport, clock),
        Err(GateError::Locked)
    ));
    running.shutdown().unwrap();
}

#[test]
fn test_support_requests_reach_support_user() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(RecordingTransport::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Timestamp::from_secs(1_765_000_000)));

    let gatekeeper = Gatekeeper::start(
        config(&dir),
        transport.clone() as Arc<dyn Transport>,
        clock,
    )
    .unwrap();
    gatekeeper
        .submit(InboundEvent::SupportRequest {
            user_id: UserId(5),
            display_name: None,
            text: "Where is my link?".into(),
        })
        .unwrap();

    wait_for("forwarded request", || !transport.messages_to(SUPPORT).is_empty());
    assert!(transport.messages_to(SUPPORT)[0].contains("unknown (ID 5)"));
    gatekeeper.shutdown().unwrap();
}
