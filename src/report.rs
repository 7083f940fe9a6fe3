//! Plain-text admin reports.

use crate::store::Store;
use crate::types::{AccessKind, Page, PaymentRecord, Subscriber, SubscriberFilter, Timestamp};

/// Payments rendered per message.
pub const PAYMENTS_PER_MESSAGE: usize = 20;

/// Subscribers rendered per message.
pub const USERS_PER_MESSAGE: usize = 50;

const SEPARATOR: &str = "— — — — —";

/// Format minor units as `major.minor CUR` without going through floats.
pub fn format_amount(amount: i64, currency: &str) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02} {}", sign, abs / 100, abs % 100, currency)
}

fn format_expiry(expiry: Option<Timestamp>) -> String {
    match expiry {
        Some(ts) => ts.to_string(),
        None => "forever".to_string(),
    }
}

fn format_name(name: Option<&str>) -> String {
    match name {
        Some(n) if !n.is_empty() => format!("@{}", n),
        _ => "—".to_string(),
    }
}

fn render_payment(payment: &PaymentRecord) -> String {
    let kind = if payment.granted_permanent {
        "full access".to_string()
    } else if payment.months == 1 {
        "1 month".to_string()
    } else {
        format!("{} months", payment.months)
    };

    format!(
        "ID {} | {}\n{}\nPaid: {}\nUntil: {}\n{}\n{}\n",
        payment.user_id,
        format_name(payment.display_name.as_deref()),
        format_amount(payment.amount, &payment.currency),
        payment.paid_at,
        format_expiry(payment.resulting_expiry),
        kind,
        SEPARATOR,
    )
}

fn render_subscriber(subscriber: &Subscriber) -> String {
    let kind = match subscriber.access {
        AccessKind::Permanent => "full access",
        AccessKind::TimeLimited { .. } => "monthly",
    };
    format!(
        "• ID {} | {}\n  {}, until: {}, {}\n",
        subscriber.user_id,
        format_name(subscriber.display_name.as_deref()),
        kind,
        format_expiry(subscriber.access.expiry()),
        subscriber.status,
    )
}

/// Every payment, newest first, split into messages.
pub fn payments_report(store: &Store) -> Vec<String> {
    let payments = store.list_payments(Page::all());
    if payments.is_empty() {
        return vec!["No payments yet.".to_string()];
    }

    payments
        .chunks(PAYMENTS_PER_MESSAGE)
        .map(|chunk| chunk.iter().map(render_payment).collect::<String>())
        .collect()
}

/// Every subscriber, split into messages.
pub fn users_report(store: &Store) -> Vec<String> {
    let subscribers = store.list_subscribers(SubscriberFilter::All);
    if subscribers.is_empty() {
        return vec!["No subscribers yet.".to_string()];
    }

    subscribers
        .chunks(USERS_PER_MESSAGE)
        .enumerate()
        .map(|(i, chunk)| {
            let mut text = if i == 0 {
                format!("All subscribers ({}):\n\n", subscribers.len())
            } else {
                String::new()
            };
            text.extend(chunk.iter().map(render_subscriber));
            text
        })
        .collect()
}

/// One-message summary of store statistics.
pub fn stats_report(store: &Store) -> String {
    let stats = store.stats();
    let mut text = format!(
        "Subscribers: {} (active {}, full access {}, expired {})\nPayments: {}\n",
        stats.subscriber_count,
        stats.active_count,
        stats.permanent_count,
        stats.expired_count,
        stats.payment_count,
    );
    for (currency, total) in &stats.revenue {
        text.push_str(&format!("Revenue: {}\n", format_amount(*total, currency)));
    }
    text
}
