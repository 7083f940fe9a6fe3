//! Periodic expiry sweep.
//!
//! Each pass walks every subscriber and moves time-limited ones through
//! `Active` → `Active (notified)` → `Expired`:
//!
//! - expiry in the past and still active: revoke channel access, tell the
//!   user, then mark `Expired`. The state write is always last and happens
//!   even if revocation failed, so a broken revoke is logged once per user
//!   instead of retried forever.
//! - expiry within the reminder window and not yet notified: send a reminder
//!   and mark `notified`.
//!
//! Permanent subscribers are never touched. Each subscriber is re-read right
//! before deciding, and every write is conditional on the expiry that was
//! read, so a renewal that lands mid-pass is never overwritten.

use crate::clock::Clock;
use crate::error::{Result, TransportError};
use crate::store::Store;
use crate::transport::{Transport, TransportCaller};
use crate::types::{AccessKind, Subscriber, SubscriberFilter, SubscriptionStatus, Timestamp, UserId};
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Sweep configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Pause between passes.
    /// Default: 24h
    pub interval_secs: u64,

    /// Pause after a pass that hit errors.
    /// Default: 60s
    pub retry_delay_secs: u64,

    /// Remind when this many whole days (or fewer) remain.
    /// Default: 3
    pub reminder_window_days: i64,

    /// Failed reminder attempts before giving up for the period.
    /// Default: 3
    pub max_reminder_attempts: u32,

    /// Upper bound on a single transport call.
    /// Default: 10s
    pub transport_timeout_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 24 * 60 * 60,
            retry_delay_secs: 60,
            reminder_window_days: 3,
            max_reminder_attempts: 3,
            transport_timeout_ms: 10_000,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }
}

/// What one pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub reminded: usize,
    pub reminder_failures: usize,
    pub expired: usize,
    pub revoke_failures: usize,
    pub skipped_permanent: usize,
    pub skipped_integrity: usize,
    /// Overdue subscribers that renewed or were deleted mid-expiry.
    pub superseded: usize,
    /// Store errors; the affected subscribers are retried next pass.
    pub errors: usize,
    /// Stopped early because of shutdown.
    pub abandoned: bool,
}

/// Outcome for a single subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Unchanged,
    Permanent,
    Integrity,
    Reminded,
    ReminderFailed,
    Expired { revoked: bool },
    /// Renewed or removed while being expired; no state was written.
    Superseded,
}

/// Runs sweep passes against the store.
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    caller: TransportCaller,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            caller: TransportCaller::new(config.transport_timeout()),
            config,
        }
    }

    /// Run one complete pass.
    pub fn run_pass(&self) -> SweepReport {
        let (_keep, never) = bounded::<()>(0);
        self.run_pass_until(&never)
    }

    /// Run one pass, stopping between subscribers once `shutdown` fires.
    pub fn run_pass_until(&self, shutdown: &Receiver<()>) -> SweepReport {
        let mut report = SweepReport::default();
        let ids: Vec<UserId> = self
            .store
            .list_subscribers(SubscriberFilter::All)
            .into_iter()
            .map(|s| s.user_id)
            .collect();

        for user_id in ids {
            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                info!(examined = report.examined, "sweep pass abandoned for shutdown");
                report.abandoned = true;
                break;
            }

            report.examined += 1;
            match self.process(user_id) {
                Ok(Step::Unchanged) => {}
                Ok(Step::Permanent) => report.skipped_permanent += 1,
                Ok(Step::Integrity) => report.skipped_integrity += 1,
                Ok(Step::Reminded) => report.reminded += 1,
                Ok(Step::ReminderFailed) => report.reminder_failures += 1,
                Ok(Step::Superseded) => report.superseded += 1,
                Ok(Step::Expired { revoked }) => {
                    report.expired += 1;
                    if !revoked {
                        report.revoke_failures += 1;
                    }
                }
                Err(e) => {
                    error!(user_id = %user_id, error = %e, "sweep step failed");
                    report.errors += 1;
                }
            }
        }

        report
    }

    /// Decide and apply the transition for one subscriber.
    fn process(&self, user_id: UserId) -> Result<Step> {
        // Fresh read; the list that started the pass may be stale.
        let subscriber = match self.store.get_subscriber(user_id) {
            Some(s) => s,
            None => return Ok(Step::Unchanged),
        };

        let expiry = match subscriber.access {
            AccessKind::Permanent => return Ok(Step::Permanent),
            AccessKind::TimeLimited { expiry } => expiry,
        };

        if !expiry.is_plausible() {
            warn!(
                user_id = %user_id,
                raw_expiry = expiry.0,
                "implausible expiry; treating as non-expiring until corrected"
            );
            return Ok(Step::Integrity);
        }

        if subscriber.status == SubscriptionStatus::Expired {
            return Ok(Step::Unchanged);
        }

        let now = self.clock.now();
        if expiry < now {
            return self.expire(&subscriber, expiry);
        }

        let days_left = expiry.days_from(now);
        if !subscriber.notified && days_left <= self.config.reminder_window_days {
            return self.remind(&subscriber, expiry, days_left);
        }

        Ok(Step::Unchanged)
    }

    fn remind(&self, subscriber: &Subscriber, expiry: Timestamp, days_left: i64) -> Result<Step> {
        let user_id = subscriber.user_id;
        let text = reminder_text(expiry, days_left);

        match self.notify(user_id, text) {
            Ok(()) => {
                self.store.mark_notified(user_id, expiry)?;
                info!(user_id = %user_id, days_left, "expiry reminder sent");
                Ok(Step::Reminded)
            }
            Err(e) if e.is_permanent() => {
                // Retrying cannot help; close out this period's reminder.
                warn!(user_id = %user_id, error = %e, "reminder undeliverable; not retrying");
                self.store.mark_notified(user_id, expiry)?;
                Ok(Step::ReminderFailed)
            }
            Err(e) => {
                let attempts = self
                    .store
                    .record_reminder_failure(user_id, expiry)?
                    .unwrap_or(0);
                if attempts >= self.config.max_reminder_attempts {
                    warn!(
                        user_id = %user_id,
                        attempts,
                        error = %e,
                        "reminder failed too often; giving up for this period"
                    );
                    self.store.mark_notified(user_id, expiry)?;
                } else {
                    warn!(user_id = %user_id, attempts, error = %e, "reminder failed; will retry");
                }
                Ok(Step::ReminderFailed)
            }
        }
    }

    fn expire(&self, subscriber: &Subscriber, expiry: Timestamp) -> Result<Step> {
        let user_id = subscriber.user_id;

        let transport = Arc::clone(&self.transport);
        let revoked = match self.caller.call(move || transport.revoke_access(user_id)) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    user_id = %user_id,
                    error = %e,
                    "revocation failed; user may retain access without paying"
                );
                false
            }
        };

        if let Err(e) = self.notify(user_id, expired_text(expiry)) {
            debug!(user_id = %user_id, error = %e, "expiry notice not delivered");
        }

        // Committing write; last step for this subscriber.
        if self.store.mark_expired(user_id, expiry)? {
            info!(user_id = %user_id, expiry = %expiry, revoked, "subscription expired");
            return Ok(Step::Expired { revoked });
        }

        if self.renewed_since(user_id, expiry) {
            self.restore_after_race(user_id);
        } else {
            debug!(user_id = %user_id, "subscriber changed during expiry; nothing committed");
        }
        Ok(Step::Superseded)
    }

    /// Whether the subscriber now holds access other than the `observed` expiry.
    fn renewed_since(&self, user_id: UserId, observed: Timestamp) -> bool {
        self.store.get_subscriber(user_id).map_or(false, |s| {
            s.status == SubscriptionStatus::Active
                && s.access != AccessKind::TimeLimited { expiry: observed }
        })
    }

    /// The subscriber renewed while being revoked; hand them a fresh link.
    fn restore_after_race(&self, user_id: UserId) {
        warn!(user_id = %user_id, "subscriber renewed during revocation; re-granting access");

        let transport = Arc::clone(&self.transport);
        let link = self.caller.call(move || transport.grant_access_link(user_id));
        let result = link.and_then(|link| {
            self.notify(
                user_id,
                format!("Your renewal went through. Rejoin the channel here:\n{}", link),
            )
        });
        if let Err(e) = result {
            error!(user_id = %user_id, error = %e, "could not re-grant access after renewal race");
        }
    }

    fn notify(&self, user_id: UserId, text: String) -> std::result::Result<(), TransportError> {
        let transport = Arc::clone(&self.transport);
        self.caller
            .call(move || transport.send_notification(user_id, &text))
    }

    /// Start the sweep loop on a background thread.
    pub fn spawn(self) -> Result<SweepHandle> {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let thread = thread::Builder::new()
            .name("expiry-sweep".into())
            .spawn(move || self.run_loop(shutdown_rx))?;

        Ok(SweepHandle {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Pass, sleep, repeat until shutdown. A failing pass never ends the loop.
    fn run_loop(&self, shutdown: Receiver<()>) {
        info!(interval_secs = self.config.interval_secs, "expiry sweep started");

        loop {
            let delay = match panic::catch_unwind(AssertUnwindSafe(|| self.run_pass_until(&shutdown))) {
                Ok(report) if report.abandoned => break,
                Ok(report) => {
                    info!(
                        examined = report.examined,
                        reminded = report.reminded,
                        expired = report.expired,
                        revoke_failures = report.revoke_failures,
                        superseded = report.superseded,
                        errors = report.errors,
                        "sweep pass finished"
                    );
                    if report.errors > 0 {
                        self.config.retry_delay()
                    } else {
                        self.config.interval()
                    }
                }
                Err(_) => {
                    error!("sweep pass panicked; backing off");
                    self.config.retry_delay()
                }
            };

            select! {
                recv(shutdown) -> _ => break,
                default(delay) => {}
            }
        }

        info!("expiry sweep stopped");
    }
}

/// Handle to the background sweep thread.
pub struct SweepHandle {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Stop the loop and wait for it. A pass in progress stops at the next
    /// subscriber boundary.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("expiry sweep thread panicked");
            }
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reminder_text(expiry: Timestamp, days_left: i64) -> String {
    let when = match days_left {
        0 => "today".to_string(),
        1 => "in 1 day".to_string(),
        n => format!("in {} days", n),
    };
    format!(
        "Your subscription ends {} ({} UTC). Renew now to keep your access.",
        when, expiry
    )
}

fn expired_text(expiry: Timestamp) -> String {
    format!(
        "Your subscription ended on {} UTC and channel access was removed. \
         Buy a new subscription any time to come back.",
        expiry
    )
}
