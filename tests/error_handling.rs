//! Error handling and edge case tests.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use subgate::{
    Clock, GateError, ManualClock, PaymentConfirmed, PaymentHandler, RenewalPolicy, Store,
    StoreConfig, SubscriberFilter, Timestamp, UserId,
};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        create_if_missing: true,
        sync_every_write: false,
    }
}

fn handler(store: Arc<Store>) -> PaymentHandler {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Timestamp::from_secs(1_765_000_000)));
    PaymentHandler::new(store, clock, RenewalPolicy::default())
}

fn payment(user: i64, months: u32) -> PaymentConfirmed {
    PaymentConfirmed {
        user_id: UserId(user),
        display_name: None,
        months,
        full_access: false,
        amount: 30_000,
        currency: "RUB".into(),
    }
}

// --- Store Lifecycle Errors ---

#[test]
fn test_open_missing_store() {
    let dir = TempDir::new().unwrap();
    let result = Store::open(test_config(&dir));
    assert!(matches!(result, Err(GateError::NotInitialized)));

    let result = Store::open_or_create(StoreConfig {
        create_if_missing: false,
        ..test_config(&dir)
    });
    assert!(matches!(result, Err(GateError::NotInitialized)));
}

#[test]
fn test_lock_released_on_drop() {
    let dir = TempDir::new().unwrap();
    drop(Store::create(test_config(&dir)).unwrap());
    assert!(Store::open(test_config(&dir)).is_ok());
}

#[test]
fn test_foreign_manifest_is_rejected() {
    let dir = TempDir::new().unwrap();
    drop(Store::create(test_config(&dir)).unwrap());
    fs::write(dir.path().join("store/manifest"), b"NOPE\x01").unwrap();

    let result = Store::open(test_config(&dir));
    assert!(matches!(result, Err(GateError::InvalidFormat(_))));
}

// --- Journal Damage ---

#[test]
fn test_torn_tail_is_dropped_on_open() {
    let dir = TempDir::new().unwrap();
    {
        let store = Arc::new(Store::create(test_config(&dir)).unwrap());
        handler(store).confirm(&payment(1, 1)).unwrap();
    }

    // Half-written frame from a crash
    let mut journal = OpenOptions::new()
        .append(true)
        .open(dir.path().join("store/journal.log"))
        .unwrap();
    journal.write_all(&[0x2a, 0x00]).unwrap();
    drop(journal);

    {
        let store = Arc::new(Store::open(test_config(&dir)).unwrap());
        assert_eq!(store.stats().payment_count, 1);
        handler(store).confirm(&payment(2, 1)).unwrap();
    }

    let store = Store::open(test_config(&dir)).unwrap();
    assert_eq!(store.list_subscribers(SubscriberFilter::All).len(), 2);
}

#[test]
fn test_damaged_entry_before_valid_ones_is_an_error() {
    let dir = TempDir::new().unwrap();
    {
        let store = Arc::new(Store::create(test_config(&dir)).unwrap());
        let payments = handler(store);
        payments.confirm(&payment(1, 1)).unwrap();
        payments.confirm(&payment(2, 1)).unwrap();
    }

    // Flip a byte inside the first frame's body (5-byte header, 4-byte length)
    let path = dir.path().join("store/journal.log");
    let mut bytes = fs::read(&path).unwrap();
    bytes[12] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    let result = Store::open(test_config(&dir));
    assert!(matches!(result, Err(GateError::ChecksumMismatch { .. })));
}

// --- Payment Validation ---

#[test]
fn test_full_access_needs_no_months() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::create(test_config(&dir)).unwrap());

    let grant = handler(store)
        .confirm(&PaymentConfirmed {
            full_access: true,
            ..payment(1, 0)
        })
        .unwrap();
    assert_eq!(grant.expiry(), None);
}

// --- Store Edge Cases ---

#[test]
fn test_marks_on_unknown_subscriber() {
    let dir = TempDir::new().unwrap();
    let store = Store::create(test_config(&dir)).unwrap();
    let ts = Timestamp::from_secs(1_765_000_000);

    assert!(!store.mark_notified(UserId(9), ts).unwrap());
    assert!(!store.mark_expired(UserId(9), ts).unwrap());
    assert_eq!(store.record_reminder_failure(UserId(9), ts).unwrap(), None);
    assert!(!store.delete_subscriber(UserId(9)).unwrap());
    assert!(store.last_payment(UserId(9)).is_none());
}
