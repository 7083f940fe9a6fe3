//! Renewal math. The only place expiry dates are computed.

use crate::types::{AccessKind, Timestamp, DAYS_PER_MONTH};
use serde::{Deserialize, Serialize};

/// Policy knobs for renewals.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalPolicy {
    /// Channel launch date. Fresh subscriptions bought before it start
    /// counting from the launch rather than from the purchase.
    pub launch_at: Option<Timestamp>,
}

impl RenewalPolicy {
    /// Access after a payment of `months` (or a permanent grant).
    ///
    /// Time still left on an active subscription is kept: the new period is
    /// added to the current expiry. Otherwise the period starts now (or at
    /// launch, if that is still ahead).
    pub fn next_access(
        &self,
        current_expiry: Option<Timestamp>,
        is_permanent_grant: bool,
        months: u32,
        now: Timestamp,
    ) -> AccessKind {
        if is_permanent_grant {
            return AccessKind::Permanent;
        }

        let start = match current_expiry {
            Some(expiry) if expiry > now => expiry,
            _ => self.fresh_start(now),
        };

        AccessKind::TimeLimited {
            expiry: start.plus_days(i64::from(months) * DAYS_PER_MONTH),
        }
    }

    fn fresh_start(&self, now: Timestamp) -> Timestamp {
        match self.launch_at {
            Some(launch) if launch > now => launch,
            _ => now,
        }
    }
}

/// [`RenewalPolicy::next_access`] with the default policy.
pub fn next_access(
    current_expiry: Option<Timestamp>,
    is_permanent_grant: bool,
    months: u32,
    now: Timestamp,
) -> AccessKind {
    RenewalPolicy::default().next_access(current_expiry, is_permanent_grant, months, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn now() -> Timestamp {
        Timestamp::from_secs(1_765_000_000)
    }

    fn expiry_of(access: AccessKind) -> Timestamp {
        access.expiry().expect("time-limited")
    }

    #[test]
    fn test_early_renewal_keeps_remaining_time() {
        let access = next_access(Some(now().plus_days(10)), false, 1, now());
        assert_eq!(expiry_of(access), now().plus_days(40));
    }

    #[test]
    fn test_lapsed_renewal_starts_now() {
        let access = next_access(Some(now().plus_days(-5)), false, 2, now());
        assert_eq!(expiry_of(access), now().plus_days(60));

        let access = next_access(None, false, 1, now());
        assert_eq!(expiry_of(access), now().plus_days(30));
    }

    #[test]
    fn test_expiry_exactly_now_is_not_stacked() {
        let access = next_access(Some(now()), false, 1, now());
        assert_eq!(expiry_of(access), now().plus_days(30));
    }

    #[test]
    fn test_permanent_grant_overrides_everything() {
        assert_eq!(
            next_access(Some(now().plus_days(10)), true, 1, now()),
            AccessKind::Permanent
        );
        assert_eq!(next_access(None, true, 0, now()), AccessKind::Permanent);
    }

    #[test]
    fn test_launch_date_delays_fresh_start() {
        let policy = RenewalPolicy {
            launch_at: Some(now().plus_days(7)),
        };

        let access = policy.next_access(None, false, 1, now());
        assert_eq!(expiry_of(access), now().plus_days(37));

        // Stacking still wins over the launch date
        let access = policy.next_access(Some(now().plus_days(20)), false, 1, now());
        assert_eq!(expiry_of(access), now().plus_days(50));

        // After launch the policy has no effect
        let later = now().plus_days(8);
        let access = policy.next_access(None, false, 1, later);
        assert_eq!(expiry_of(access), later.plus_days(30));
    }

    proptest! {
        #[test]
        fn prop_active_renewal_stacks(remaining_secs in 1i64..(400 * 86_400), months in 1u32..36) {
            let current = Timestamp(now().0 + remaining_secs * 1_000_000);
            let access = next_access(Some(current), false, months, now());
            prop_assert_eq!(expiry_of(access), current.plus_days(30 * i64::from(months)));
        }

        #[test]
        fn prop_lapsed_renewal_counts_from_now(overdue_secs in 0i64..(400 * 86_400), months in 1u32..36) {
            let current = Timestamp(now().0 - overdue_secs * 1_000_000);
            let access = next_access(Some(current), false, months, now());
            prop_assert_eq!(expiry_of(access), now().plus_days(30 * i64::from(months)));
        }

        #[test]
        fn prop_permanent_ignores_prior_state(prior in proptest::option::of(-1000i64..1000), months in 0u32..36) {
            let current = prior.map(|d| now().plus_days(d));
            prop_assert_eq!(next_access(current, true, months, now()), AccessKind::Permanent);
        }

        #[test]
        fn prop_renewal_never_shortens_access(remaining_days in -100i64..100, months in 1u32..36) {
            let current = now().plus_days(remaining_days);
            let new_expiry = expiry_of(next_access(Some(current), false, months, now()));
            prop_assert!(new_expiry > current);
            prop_assert!(new_expiry > now());
        }
    }
}
