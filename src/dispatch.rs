//! Inbound event dispatch.
//!
//! The transport delivers events (confirmed payments, support requests,
//! admin commands) into a channel. A small pool of worker threads takes them
//! off the channel and handles each one independently.

use crate::config::AdminConfig;
use crate::error::{GateError, Result, TransportError};
use crate::lifecycle::{Grant, PaymentConfirmed, PaymentHandler};
use crate::report;
use crate::store::Store;
use crate::transport::{Transport, TransportCaller};
use crate::types::UserId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Report an admin can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminCommand {
    Payments,
    Users,
    Stats,
}

/// Events delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundEvent {
    PaymentConfirmed(PaymentConfirmed),
    SupportRequest {
        user_id: UserId,
        display_name: Option<String>,
        text: String,
    },
    Admin {
        user_id: UserId,
        command: AdminCommand,
    },
}

/// Everything an event handler needs.
#[derive(Clone)]
pub struct EventContext {
    store: Arc<Store>,
    payments: PaymentHandler,
    transport: Arc<dyn Transport>,
    admin: AdminConfig,
    caller: TransportCaller,
}

impl EventContext {
    pub fn new(
        store: Arc<Store>,
        payments: PaymentHandler,
        transport: Arc<dyn Transport>,
        admin: AdminConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            payments,
            transport,
            admin,
            caller: TransportCaller::new(timeout),
        }
    }

    /// Handle one event to completion.
    pub fn handle(&self, event: InboundEvent) {
        match event {
            InboundEvent::PaymentConfirmed(payment) => self.handle_payment(&payment),
            InboundEvent::SupportRequest {
                user_id,
                display_name,
                text,
            } => self.handle_support(user_id, display_name.as_deref(), &text),
            InboundEvent::Admin { user_id, command } => self.handle_admin(user_id, command),
        }
    }

    /// Like `handle`, but a panic is logged and alerted instead of
    /// taking the worker down with it.
    pub fn handle_isolated(&self, event: InboundEvent) {
        let summary = describe(&event);
        if panic::catch_unwind(AssertUnwindSafe(|| self.handle(event))).is_err() {
            error!(event = %summary, "event handler panicked");
            self.alert(format!("Handling {} panicked; the event was dropped", summary));
        }
    }

    fn handle_payment(&self, payment: &PaymentConfirmed) {
        let user_id = payment.user_id;

        let grant = match self.payments.confirm(payment) {
            Ok(grant) => grant,
            Err(e) => {
                self.reply(
                    user_id,
                    "Sorry, something went wrong while activating your subscription. \
                     Your payment is safe and an administrator has been notified.",
                );
                self.alert(format!(
                    "Payment from user {} ({}) was NOT recorded: {}",
                    user_id,
                    report::format_amount(payment.amount, &payment.currency),
                    e
                ));
                return;
            }
        };

        let transport = Arc::clone(&self.transport);
        match self.caller.call(move || transport.grant_access_link(user_id)) {
            Ok(link) => {
                self.reply(user_id, &confirmation_text(&grant, &link));
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "invite link not issued after payment");
                self.reply(
                    user_id,
                    "Payment received! Your invite link is delayed; an administrator will send it shortly.",
                );
                self.alert(format!(
                    "User {} paid (payment {}) but the invite link failed: {}",
                    user_id, grant.payment_id.0, e
                ));
            }
        }
    }

    fn handle_support(&self, user_id: UserId, display_name: Option<&str>, text: &str) {
        let support = match self.admin.support_user_id {
            Some(id) => id,
            None => {
                warn!(user_id = %user_id, "support request dropped; no support user configured");
                self.reply(user_id, "Support is not available right now. Please try again later.");
                return;
            }
        };

        let from = display_name
            .map(|n| format!("@{}", n))
            .unwrap_or_else(|| "unknown".to_string());
        let forwarded = format!("New request from {} (ID {}):\n\n{}", from, user_id, text);

        match self.send(support, forwarded) {
            Ok(()) => {
                info!(user_id = %user_id, "support request forwarded");
                self.reply(user_id, "Your request was sent to the administrator, thank you!");
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "support request not forwarded");
                self.reply(user_id, "Could not reach the administrator. Please try again later.");
            }
        }
    }

    fn handle_admin(&self, user_id: UserId, command: AdminCommand) {
        if !self.admin.is_admin(user_id) {
            warn!(user_id = %user_id, ?command, "admin command refused");
            self.reply(user_id, "You are not allowed to use this command.");
            return;
        }

        let messages = match command {
            AdminCommand::Payments => report::payments_report(&self.store),
            AdminCommand::Users => report::users_report(&self.store),
            AdminCommand::Stats => vec![report::stats_report(&self.store)],
        };
        for message in messages {
            if let Err(e) = self.send(user_id, message) {
                warn!(user_id = %user_id, error = %e, "admin report not delivered");
                break;
            }
        }
    }

    fn send(&self, user_id: UserId, text: String) -> std::result::Result<(), TransportError> {
        let transport = Arc::clone(&self.transport);
        self.caller.call(move || transport.send_notification(user_id, &text))
    }

    /// Message a user; failures are only logged.
    fn reply(&self, user_id: UserId, text: &str) {
        if let Err(e) = self.send(user_id, text.to_string()) {
            debug!(user_id = %user_id, error = %e, "reply not delivered");
        }
    }

    /// Tell the operator something needs a human.
    fn alert(&self, text: String) {
        error!(alert = %text, "operator alert");
        if let Some(support) = self.admin.support_user_id {
            if let Err(e) = self.send(support, text) {
                error!(error = %e, "operator alert not delivered");
            }
        }
    }
}

fn describe(event: &InboundEvent) -> String {
    match event {
        InboundEvent::PaymentConfirmed(p) => format!(
            "payment from user {} ({})",
            p.user_id,
            report::format_amount(p.amount, &p.currency)
        ),
        InboundEvent::SupportRequest { user_id, .. } => format!("support request from user {}", user_id),
        InboundEvent::Admin { user_id, command } => format!("{:?} command from user {}", command, user_id),
    }
}

fn confirmation_text(grant: &Grant, link: &str) -> String {
    let until = match grant.expiry() {
        Some(expiry) => format!("until {} UTC", expiry),
        None => "forever".to_string(),
    };
    format!(
        "Payment received! Your access is active {}.\n\nJoin the channel here:\n{}",
        until, link
    )
}

/// Worker pool fed by a channel of inbound events.
pub struct Dispatcher {
    sender: Option<Sender<InboundEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start `workers` threads handling events with `context`.
    pub fn spawn(context: EventContext, workers: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<InboundEvent>();

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers.max(1) {
            let context = context.clone();
            let receiver: Receiver<InboundEvent> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("dispatch-{}", i))
                .spawn(move || {
                    // Ends once every sender is gone and the queue is drained.
                    for event in receiver.iter() {
                        context.handle_isolated(event);
                    }
                })?;
            handles.push(handle);
        }

        info!(workers = handles.len(), "dispatcher started");
        Ok(Self {
            sender: Some(sender),
            workers: handles,
        })
    }

    /// Queue an event for handling.
    pub fn submit(&self, event: InboundEvent) -> Result<()> {
        match &self.sender {
            Some(sender) => sender.send(event).map_err(|_| GateError::Closed),
            None => Err(GateError::Closed),
        }
    }

    /// Number of queued, not yet started events.
    pub fn pending(&self) -> usize {
        self.sender.as_ref().map_or(0, |s| s.len())
    }

    /// Stop accepting events, finish the queued ones, and join the workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("dispatch worker panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
