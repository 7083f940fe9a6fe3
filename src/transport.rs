//! Outbound calls to the chat transport.
//!
//! The transport itself (bot API client, invoice flow) lives outside this
//! crate. The lifecycle engine only needs to send a message, remove a user
//! from the channel, and mint a one-time invite link.

use crate::error::TransportError;
use crate::types::UserId;
use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Chat transport consumed by the sweep and the event dispatcher.
pub trait Transport: Send + Sync {
    /// Send a text message to a user.
    fn send_notification(&self, user_id: UserId, text: &str) -> Result<(), TransportError>;

    /// Remove the user from the paid channel.
    fn revoke_access(&self, user_id: UserId) -> Result<(), TransportError>;

    /// Create a single-use invite link for the paid channel.
    fn grant_access_link(&self, user_id: UserId) -> Result<String, TransportError>;
}

/// Timed-out calls allowed to keep running before new calls are refused.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Runs transport calls on helper threads and gives up after a timeout.
///
/// A call that times out keeps its thread until the transport returns; its
/// result is discarded. Each such thread counts against `max_in_flight`, so a
/// hung chat API costs at most that many threads per caller. Once the limit is
/// reached, calls fail fast with [`TransportError::Failed`] until stalled
/// ones finish. Clones share the limit.
#[derive(Clone, Debug)]
pub struct TransportCaller {
    timeout: Duration,
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
}

/// Releases an in-flight slot when the helper thread is done, even on panic.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TransportCaller {
    pub fn new(timeout: Duration) -> Self {
        Self::with_limit(timeout, DEFAULT_MAX_IN_FLIGHT)
    }

    pub fn with_limit(timeout: Duration, max_in_flight: usize) -> Self {
        Self {
            timeout,
            max_in_flight: max_in_flight.max(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Calls started and not yet returned by the transport.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `call`, waiting at most the configured timeout.
    pub fn call<T, F>(&self, call: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) >= self.max_in_flight {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!(limit = self.max_in_flight, "transport call refused; too many calls stalled");
            return Err(TransportError::Failed(
                "too many transport calls still running".into(),
            ));
        }
        let slot = Slot(Arc::clone(&self.in_flight));

        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name("transport-call".into())
            .spawn(move || {
                let result = call();
                drop(slot);
                let _ = tx.send(result);
            })
            .map_err(|e| TransportError::Failed(format!("spawn failed: {}", e)))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TransportError::Failed("transport call panicked".into()))
            }
        }
    }
}

/// One call observed by [`RecordingTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    Notify { user_id: UserId, text: String },
    Revoke { user_id: UserId },
    Grant { user_id: UserId },
}

#[derive(Default)]
struct Script {
    notify_failures: HashMap<UserId, TransportError>,
    revoke_failures: HashSet<UserId>,
    grant_failures: HashSet<UserId>,
    delay: Option<Duration>,
}

/// In-memory transport that records every call and fails on request.
///
/// Useful for tests and for dry runs where nothing should reach real users.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
    script: Mutex<Script>,
    next_link: Mutex<u64>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make messages to `user_id` fail with `error` until cleared.
    pub fn fail_notifications(&self, user_id: UserId, error: TransportError) {
        self.script.lock().notify_failures.insert(user_id, error);
    }

    /// Make revocations of `user_id` fail.
    pub fn fail_revocations(&self, user_id: UserId) {
        self.script.lock().revoke_failures.insert(user_id);
    }

    /// Make invite links for `user_id` fail.
    pub fn fail_grants(&self, user_id: UserId) {
        self.script.lock().grant_failures.insert(user_id);
    }

    /// Make every call sleep first.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.script.lock().delay = delay;
    }

    /// Remove all scripted failures and delays.
    pub fn clear_failures(&self) {
        *self.script.lock() = Script::default();
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Texts sent to `user_id`, including failed attempts.
    pub fn messages_to(&self, user_id: UserId) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TransportCall::Notify { user_id: u, text } if *u == user_id => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of revocation attempts for `user_id`.
    pub fn revocations_of(&self, user_id: UserId) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, TransportCall::Revoke { user_id: u } if *u == user_id))
            .count()
    }

    fn pause(&self) {
        let delay = self.script.lock().delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
    }
}

impl Transport for RecordingTransport {
    fn send_notification(&self, user_id: UserId, text: &str) -> Result<(), TransportError> {
        self.pause();
        self.calls.lock().push(TransportCall::Notify {
            user_id,
            text: text.to_string(),
        });
        match self.script.lock().notify_failures.get(&user_id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn revoke_access(&self, user_id: UserId) -> Result<(), TransportError> {
        self.pause();
        self.calls.lock().push(TransportCall::Revoke { user_id });
        if self.script.lock().revoke_failures.contains(&user_id) {
            return Err(TransportError::Failed("not enough rights to ban".into()));
        }
        Ok(())
    }

    fn grant_access_link(&self, user_id: UserId) -> Result<String, TransportError> {
        self.pause();
        self.calls.lock().push(TransportCall::Grant { user_id });
        if self.script.lock().grant_failures.contains(&user_id) {
            return Err(TransportError::Failed("invite link quota exceeded".into()));
        }
        let mut next = self.next_link.lock();
        *next += 1;
        Ok(format!("https://t.me/+invite{}", *next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_returns_result() {
        let caller = TransportCaller::new(Duration::from_secs(1));
        assert_eq!(caller.call(|| Ok(42)), Ok(42));

        let result: Result<(), _> = caller.call(|| {
            Err(TransportError::Unreachable("bot was blocked by the user".into()))
        });
        assert!(result.unwrap_err().is_permanent());
    }

    #[test]
    fn test_call_gives_up_after_timeout() {
        let transport = Arc::new(RecordingTransport::new());
        transport.set_delay(Some(Duration::from_millis(500)));
        let caller = TransportCaller::new(Duration::from_millis(20));

        let t = Arc::clone(&transport);
        let result = caller.call(move || t.send_notification(UserId(1), "hello"));
        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[test]
    fn test_call_survives_panic() {
        let caller = TransportCaller::new(Duration::from_secs(1));
        let result: Result<(), _> = caller.call(|| panic!("transport bug"));
        assert!(matches!(result, Err(TransportError::Failed(_))));

        // The panicked call gave its slot back
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while caller.in_flight() != 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(caller.in_flight(), 0);
    }

    #[test]
    fn test_stalled_calls_are_capped() {
        let transport = Arc::new(RecordingTransport::new());
        transport.set_delay(Some(Duration::from_millis(300)));
        let caller = TransportCaller::with_limit(Duration::from_millis(20), 2);

        for _ in 0..2 {
            let t = Arc::clone(&transport);
            assert_eq!(
                caller.call(move || t.revoke_access(UserId(1))),
                Err(TransportError::Timeout)
            );
        }

        // No new thread while two are stuck
        let t = Arc::clone(&transport);
        let result = caller.call(move || t.revoke_access(UserId(2)));
        assert!(matches!(result, Err(TransportError::Failed(_))));
        assert_eq!(caller.in_flight(), 2);

        // Once the transport recovers, calls go through again
        transport.set_delay(None);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while caller.in_flight() != 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let t = Arc::clone(&transport);
        assert_eq!(caller.call(move || t.revoke_access(UserId(2))), Ok(()));
        assert_eq!(transport.revocations_of(UserId(2)), 1);
    }

    #[test]
    fn test_recording_transport_scripts_failures() {
        let transport = RecordingTransport::new();
        transport.fail_revocations(UserId(2));
        transport.fail_notifications(UserId(3), TransportError::Unreachable("blocked".into()));

        assert!(transport.revoke_access(UserId(1)).is_ok());
        assert!(transport.revoke_access(UserId(2)).is_err());
        assert!(transport.send_notification(UserId(3), "hi").is_err());
        assert_ne!(
            transport.grant_access_link(UserId(1)).unwrap(),
            transport.grant_access_link(UserId(1)).unwrap()
        );

        assert_eq!(transport.revocations_of(UserId(2)), 1);
        assert_eq!(transport.messages_to(UserId(3)), vec!["hi".to_string()]);
        assert_eq!(transport.calls().len(), 5);

        transport.clear_failures();
        assert!(transport.revoke_access(UserId(2)).is_ok());
    }
}
