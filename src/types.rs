//! Core types for subscribers and payments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Microseconds in one day.
pub const MICROS_PER_DAY: i64 = 86_400 * 1_000_000;

/// Length of a billing month. Calendar months are deliberately not used.
pub const DAYS_PER_MONTH: i64 = 30;

/// External identity of a user (chat user id).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a payment record (assigned by the store).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PaymentId(pub u64);

impl fmt::Debug for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentId({})", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_micros())
    }

    /// Build from whole seconds since the epoch.
    pub fn from_secs(secs: i64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    /// This timestamp shifted by a (possibly negative) number of days.
    pub fn plus_days(self, days: i64) -> Self {
        Timestamp(self.0.saturating_add(days.saturating_mul(MICROS_PER_DAY)))
    }

    /// Whole days from `now` until `self`, rounded toward negative infinity.
    ///
    /// Something due in 3 days and 23 hours is 3 days away; something that
    /// passed an hour ago is -1 days away.
    pub fn days_from(self, now: Timestamp) -> i64 {
        (self.0 - now.0).div_euclid(MICROS_PER_DAY)
    }

    /// Convert to a chrono datetime, if representable.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.0)
    }

    /// Whether this looks like a real point in time rather than damaged data.
    pub fn is_plausible(self) -> bool {
        self.0 > 0 && self.to_datetime().is_some()
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M")),
            None => write!(f, "<invalid {}>", self.0),
        }
    }
}

/// How long a subscriber's access lasts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    /// Access ends at `expiry`.
    TimeLimited { expiry: Timestamp },
    /// Access never ends.
    Permanent,
}

impl AccessKind {
    /// The expiry, or None for permanent access.
    pub fn expiry(&self) -> Option<Timestamp> {
        match self {
            AccessKind::TimeLimited { expiry } => Some(*expiry),
            AccessKind::Permanent => None,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, AccessKind::Permanent)
    }
}

/// Whether a subscriber currently holds access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Active,
    Expired,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionStatus::Active => write!(f, "active"),
            SubscriptionStatus::Expired => write!(f, "expired"),
        }
    }
}

/// One row of the subscribers table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// External identity.
    pub user_id: UserId,

    /// Name for reports only.
    pub display_name: Option<String>,

    /// Time-limited or permanent access.
    pub access: AccessKind,

    /// Active until the sweep expires it.
    pub status: SubscriptionStatus,

    /// Reminder already delivered for the current expiry period.
    pub notified: bool,

    /// Failed reminder attempts for the current expiry period.
    pub reminder_failures: u32,

    /// When the most recent payment was applied.
    pub last_payment_at: Timestamp,

    /// When the first payment was applied.
    pub created_at: Timestamp,
}

impl Subscriber {
    /// Time-limited and still active.
    pub fn is_active(&self) -> bool {
        !self.access.is_permanent() && self.status == SubscriptionStatus::Active
    }
}

/// One row of the payments table. Never changed after insertion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Assigned by the store, increasing in insertion order.
    pub id: PaymentId,

    /// Who paid. Does not own the subscriber row.
    pub user_id: UserId,

    /// Name at payment time.
    pub display_name: Option<String>,

    /// Amount in minor currency units (cents, kopecks).
    pub amount: i64,

    /// ISO currency code.
    pub currency: String,

    /// Number of months bought (ignored for permanent grants).
    pub months: u32,

    pub paid_at: Timestamp,

    /// Expiry after this payment; None means permanent.
    pub resulting_expiry: Option<Timestamp>,

    pub granted_permanent: bool,
}

/// Which subscribers a listing returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SubscriberFilter {
    #[default]
    All,
    /// Time-limited subscribers whose status is still active.
    Active,
    /// Subscribers with permanent access.
    Permanent,
    /// Time-limited subscribers the sweep has expired.
    Expired,
}

impl SubscriberFilter {
    pub fn matches(&self, subscriber: &Subscriber) -> bool {
        match self {
            SubscriberFilter::All => true,
            SubscriberFilter::Active => subscriber.is_active(),
            SubscriberFilter::Permanent => subscriber.access.is_permanent(),
            SubscriberFilter::Expired => {
                !subscriber.access.is_permanent()
                    && subscriber.status == SubscriptionStatus::Expired
            }
        }
    }
}

/// Offset/limit pagination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Everything in one page.
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
        }
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub subscriber_count: u64,
    pub active_count: u64,
    pub permanent_count: u64,
    pub expired_count: u64,
    pub payment_count: u64,
    /// Sum of payments per currency, in minor units.
    pub revenue: BTreeMap<String, i64>,
    pub journal_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plus_days() {
        let t = Timestamp::from_secs(1_700_000_000);
        assert_eq!(t.plus_days(30).0 - t.0, 30 * MICROS_PER_DAY);
        assert_eq!(t.plus_days(-1).0 - t.0, -MICROS_PER_DAY);
    }

    #[test]
    fn test_days_from_floors() {
        let now = Timestamp::from_secs(1_700_000_000);
        let almost_four = Timestamp(now.plus_days(4).0 - 1);
        assert_eq!(almost_four.days_from(now), 3);
        assert_eq!(now.plus_days(3).days_from(now), 3);
        assert_eq!(Timestamp(now.0 - 1).days_from(now), -1);
        assert_eq!(now.days_from(now), 0);
    }

    #[test]
    fn test_plausibility() {
        assert!(Timestamp::from_secs(1_700_000_000).is_plausible());
        assert!(!Timestamp(0).is_plausible());
        assert!(!Timestamp(-5).is_plausible());
        assert!(!Timestamp(i64::MAX).is_plausible());
    }

    #[test]
    fn test_display() {
        let t = Timestamp::from_secs(1_762_128_000); // 2025-11-03 00:00 UTC
        assert_eq!(t.to_string(), "2025-11-03 00:00");
        assert!(Timestamp(i64::MAX).to_string().starts_with("<invalid"));
    }

    #[test]
    fn test_filters() {
        let mut sub = Subscriber {
            user_id: UserId(1),
            display_name: None,
            access: AccessKind::TimeLimited {
                expiry: Timestamp::from_secs(1_700_000_000),
            },
            status: SubscriptionStatus::Active,
            notified: false,
            reminder_failures: 0,
            last_payment_at: Timestamp::from_secs(1_690_000_000),
            created_at: Timestamp::from_secs(1_690_000_000),
        };
        assert!(SubscriberFilter::Active.matches(&sub));
        assert!(!SubscriberFilter::Expired.matches(&sub));

        sub.status = SubscriptionStatus::Expired;
        assert!(SubscriberFilter::Expired.matches(&sub));
        assert!(!SubscriberFilter::Active.matches(&sub));

        sub.access = AccessKind::Permanent;
        sub.status = SubscriptionStatus::Active;
        assert!(SubscriberFilter::Permanent.matches(&sub));
        assert!(!SubscriberFilter::Active.matches(&sub));
        assert!(SubscriberFilter::All.matches(&sub));
    }
}
