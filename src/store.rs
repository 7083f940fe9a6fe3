//! Subscription store: subscribers and payments, backed by the journal.

use crate::error::{GateError, Result};
use crate::journal::{Journal, JournalOp};
use crate::types::{
    AccessKind, Page, PaymentId, PaymentRecord, StoreStats, Subscriber, SubscriberFilter,
    SubscriptionStatus, Timestamp, UserId,
};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the store files.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync the journal after every write.
    pub sync_every_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./subscriptions"),
            create_if_missing: true,
            sync_every_write: true,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"SGS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// What a payment handler wants written, computed from the current row.
#[derive(Clone, Debug)]
pub struct PaymentDraft {
    pub display_name: Option<String>,
    pub access: AccessKind,
    pub amount: i64,
    pub currency: String,
    pub months: u32,
    pub paid_at: Timestamp,
}

/// In-memory tables rebuilt from the journal.
#[derive(Default)]
struct Tables {
    subscribers: HashMap<UserId, Subscriber>,
    payments: Vec<PaymentRecord>,
    next_payment_id: u64,
}

impl Tables {
    fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::PaymentApplied {
                subscriber,
                payment,
            } => {
                self.next_payment_id = self.next_payment_id.max(payment.id.0 + 1);
                self.subscribers.insert(subscriber.user_id, subscriber);
                self.payments.push(payment);
            }
            JournalOp::Notified { user_id } => {
                if let Some(sub) = self.subscribers.get_mut(&user_id) {
                    sub.notified = true;
                }
            }
            JournalOp::ReminderFailed { user_id, attempts } => {
                if let Some(sub) = self.subscribers.get_mut(&user_id) {
                    sub.reminder_failures = attempts;
                }
            }
            JournalOp::Expired { user_id } => {
                if let Some(sub) = self.subscribers.get_mut(&user_id) {
                    sub.status = SubscriptionStatus::Expired;
                }
            }
            JournalOp::SubscriberDeleted { user_id } => {
                self.subscribers.remove(&user_id);
            }
            JournalOp::Snapshot {
                subscribers,
                payments,
            } => {
                self.next_payment_id = payments.iter().map(|p| p.id.0 + 1).max().unwrap_or(1);
                self.subscribers = subscribers.into_iter().map(|s| (s.user_id, s)).collect();
                self.payments = payments;
            }
        }
    }

    /// The subscriber, if it still holds exactly the access the caller saw.
    fn observed_mut(&mut self, user_id: UserId, observed: Timestamp) -> Option<&mut Subscriber> {
        self.subscribers
            .get_mut(&user_id)
            .filter(|s| s.access == AccessKind::TimeLimited { expiry: observed })
    }
}

/// The subscription store.
///
/// Every mutation goes through `write_lock`, is appended to the journal, and
/// only then applied to the in-memory tables. A failed journal write leaves
/// the tables untouched.
pub struct Store {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Durable log of mutations.
    journal: Journal,

    /// Subscribers and payments.
    tables: RwLock<Tables>,

    /// Serializes read-compute-write sequences.
    write_lock: Mutex<()>,
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("manifest").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(GateError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        Self::open(config)
    }

    /// Open an existing store and replay its journal.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let (journal, entries) =
            Journal::open(config.path.join("journal.log"), config.sync_every_write)?;

        let mut tables = Tables {
            next_payment_id: 1,
            ..Default::default()
        };
        let replayed = entries.len();
        for entry in entries {
            tables.apply(entry.op);
        }

        info!(
            path = %config.path.display(),
            entries = replayed,
            subscribers = tables.subscribers.len(),
            payments = tables.payments.len(),
            "store opened"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            journal,
            tables: RwLock::new(tables),
            write_lock: Mutex::new(()),
        })
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- Payments ---

    /// Upsert the subscriber and append a payment record as one operation.
    ///
    /// `plan` sees the subscriber's current row (if any) and decides the new
    /// access. It runs under the store's write lock, so two payments for the
    /// same user cannot both compute from the same old expiry. If `plan` fails
    /// or the journal write fails, nothing is changed.
    pub fn record_payment<F>(&self, user_id: UserId, plan: F) -> Result<(Subscriber, PaymentRecord)>
    where
        F: FnOnce(Option<&Subscriber>) -> Result<PaymentDraft>,
    {
        let _lock = self.write_lock.lock();

        let (subscriber, payment) = {
            let tables = self.tables.read();
            let current = tables.subscribers.get(&user_id);
            let draft = plan(current)?;

            let subscriber = Subscriber {
                user_id,
                display_name: draft
                    .display_name
                    .clone()
                    .or_else(|| current.and_then(|s| s.display_name.clone())),
                access: draft.access,
                status: SubscriptionStatus::Active,
                notified: false,
                reminder_failures: 0,
                last_payment_at: draft.paid_at,
                created_at: current.map(|s| s.created_at).unwrap_or(draft.paid_at),
            };

            let payment = PaymentRecord {
                id: PaymentId(tables.next_payment_id),
                user_id,
                display_name: draft.display_name,
                amount: draft.amount,
                currency: draft.currency,
                months: draft.months,
                paid_at: draft.paid_at,
                resulting_expiry: draft.access.expiry(),
                granted_permanent: draft.access.is_permanent(),
            };

            (subscriber, payment)
        };

        self.journal.append(JournalOp::PaymentApplied {
            subscriber: subscriber.clone(),
            payment: payment.clone(),
        })?;

        self.tables.write().apply(JournalOp::PaymentApplied {
            subscriber: subscriber.clone(),
            payment: payment.clone(),
        });

        Ok((subscriber, payment))
    }

    /// Payments newest-first.
    pub fn list_payments(&self, page: Page) -> Vec<PaymentRecord> {
        let tables = self.tables.read();
        let mut payments: Vec<&PaymentRecord> = tables.payments.iter().collect();
        payments.sort_by(|a, b| b.paid_at.cmp(&a.paid_at).then(b.id.cmp(&a.id)));
        payments
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect()
    }

    /// One user's payments, newest-first.
    pub fn list_user_payments(&self, user_id: UserId) -> Vec<PaymentRecord> {
        let tables = self.tables.read();
        let mut payments: Vec<PaymentRecord> = tables
            .payments
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.paid_at.cmp(&a.paid_at).then(b.id.cmp(&a.id)));
        payments
    }

    /// Most recent payment by a user.
    pub fn last_payment(&self, user_id: UserId) -> Option<PaymentRecord> {
        self.list_user_payments(user_id).into_iter().next()
    }

    // --- Subscribers ---

    /// Get a subscriber by user ID.
    pub fn get_subscriber(&self, user_id: UserId) -> Option<Subscriber> {
        self.tables.read().subscribers.get(&user_id).cloned()
    }

    /// Subscribers matching `filter`, ordered by user ID.
    pub fn list_subscribers(&self, filter: SubscriberFilter) -> Vec<Subscriber> {
        let tables = self.tables.read();
        let mut subscribers: Vec<Subscriber> = tables
            .subscribers
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        subscribers.sort_by_key(|s| s.user_id);
        subscribers
    }

    /// Mark the reminder for the current period as done.
    ///
    /// Only applies while the subscriber still has the `observed` expiry and
    /// has not been notified; returns whether anything changed. A renewal in
    /// between starts a new period, and that period keeps its own flag.
    pub fn mark_notified(&self, user_id: UserId, observed: Timestamp) -> Result<bool> {
        let _lock = self.write_lock.lock();

        let applies = self
            .tables
            .write()
            .observed_mut(user_id, observed)
            .map_or(false, |s| !s.notified);
        if !applies {
            debug!(user_id = %user_id, "mark_notified skipped; subscriber changed");
            return Ok(false);
        }

        self.journal.append(JournalOp::Notified { user_id })?;
        self.tables.write().apply(JournalOp::Notified { user_id });
        Ok(true)
    }

    /// Count a failed reminder attempt for the current period.
    ///
    /// Returns the new attempt count, or None if the subscriber no longer has
    /// the `observed` expiry.
    pub fn record_reminder_failure(&self, user_id: UserId, observed: Timestamp) -> Result<Option<u32>> {
        let _lock = self.write_lock.lock();

        let attempts = match self.tables.write().observed_mut(user_id, observed) {
            Some(s) => s.reminder_failures.saturating_add(1),
            None => return Ok(None),
        };

        let op = JournalOp::ReminderFailed { user_id, attempts };
        self.journal.append(op.clone())?;
        self.tables.write().apply(op);
        Ok(Some(attempts))
    }

    /// Move an active subscriber to `Expired`.
    ///
    /// Only applies while the subscriber is still active with the `observed`
    /// expiry; returns whether anything changed.
    pub fn mark_expired(&self, user_id: UserId, observed: Timestamp) -> Result<bool> {
        let _lock = self.write_lock.lock();

        let applies = self
            .tables
            .write()
            .observed_mut(user_id, observed)
            .map_or(false, |s| s.status == SubscriptionStatus::Active);
        if !applies {
            debug!(user_id = %user_id, "mark_expired skipped; subscriber changed");
            return Ok(false);
        }

        self.journal.append(JournalOp::Expired { user_id })?;
        self.tables.write().apply(JournalOp::Expired { user_id });
        Ok(true)
    }

    /// Remove a subscriber row. Their payment history is kept.
    pub fn delete_subscriber(&self, user_id: UserId) -> Result<bool> {
        let _lock = self.write_lock.lock();

        if !self.tables.read().subscribers.contains_key(&user_id) {
            return Ok(false);
        }

        self.journal.append(JournalOp::SubscriberDeleted { user_id })?;
        self.tables.write().apply(JournalOp::SubscriberDeleted { user_id });
        info!(user_id = %user_id, "subscriber deleted");
        Ok(true)
    }

    // --- Maintenance ---

    /// Rewrite the journal as a single snapshot of the current tables.
    pub fn compact(&self) -> Result<()> {
        let _lock = self.write_lock.lock();

        let (subscribers, payments) = {
            let tables = self.tables.read();
            let mut subscribers: Vec<Subscriber> = tables.subscribers.values().cloned().collect();
            subscribers.sort_by_key(|s| s.user_id);
            (subscribers, tables.payments.clone())
        };

        let before = self.journal.size();
        self.journal.rewrite(vec![JournalOp::Snapshot {
            subscribers,
            payments,
        }])?;
        info!(before, after = self.journal.size(), "journal compacted");
        Ok(())
    }

    /// Force the journal to disk.
    pub fn sync(&self) -> Result<()> {
        self.journal.sync()
    }

    /// Counts and totals.
    pub fn stats(&self) -> StoreStats {
        let tables = self.tables.read();
        let mut stats = StoreStats {
            subscriber_count: tables.subscribers.len() as u64,
            payment_count: tables.payments.len() as u64,
            journal_size_bytes: self.journal.size(),
            ..Default::default()
        };

        for sub in tables.subscribers.values() {
            if SubscriberFilter::Active.matches(sub) {
                stats.active_count += 1;
            } else if SubscriberFilter::Permanent.matches(sub) {
                stats.permanent_count += 1;
            } else if SubscriberFilter::Expired.matches(sub) {
                stats.expired_count += 1;
            }
        }
        for payment in &tables.payments {
            let total = stats.revenue.entry(payment.currency.clone()).or_insert(0);
            *total = match total.checked_add(payment.amount) {
                Some(sum) => sum,
                None => {
                    warn!(currency = %payment.currency, "revenue total overflowed; capping");
                    total.saturating_add(payment.amount)
                }
            };
        }

        stats
    }

    // --- Helpers ---

    #[cfg(test)]
    pub(crate) fn journal_for_tests(&self) -> &Journal {
        &self.journal
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let manifest_path = path.join("manifest");
        let mut file = File::create(manifest_path)?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let manifest_path = path.join("manifest");
        if !manifest_path.exists() {
            return Err(GateError::NotInitialized);
        }

        let mut file = File::open(manifest_path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;

        if &magic != STORE_MAGIC {
            return Err(GateError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;

        if version[0] != STORE_VERSION {
            return Err(GateError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("lock");
        let file = File::create(lock_path)?;
        file.try_lock_exclusive().map_err(|_| GateError::Locked)?;
        Ok(file)
    }
}
