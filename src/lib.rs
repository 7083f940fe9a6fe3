//! # Subscription Gatekeeper
//!
//! Controls who may stay in a paid channel. Confirmed payments extend (or
//! make permanent) a subscriber's access; a periodic sweep reminds users
//! shortly before their access runs out and revokes it once it has.
//!
//! ## Core Concepts
//!
//! - **Store**: Journal-backed subscribers and payments, every write durable
//!   and atomic
//! - **Renewal**: Remaining time is kept; permanent access overrides
//!   everything
//! - **Sweep**: `Active` → `Active (notified)` → `Expired`, never touching
//!   permanent subscribers
//! - **Transport**: The chat API, reached only through a bounded-time call
//!
//! ## Example
//!
//! ```ignore
//! use subgate::{Gatekeeper, GatekeeperConfig, InboundEvent, PaymentConfirmed, SystemClock};
//!
//! let config = GatekeeperConfig::from_json_file("subgate.json")?;
//! let gatekeeper = Gatekeeper::start(config, transport, Arc::new(SystemClock))?;
//!
//! gatekeeper.submit(InboundEvent::PaymentConfirmed(PaymentConfirmed {
//!     user_id: UserId(42),
//!     display_name: Some("alice".into()),
//!     months: 3,
//!     full_access: false,
//!     amount: 90_000,
//!     currency: "RUB".into(),
//! }))?;
//!
//! gatekeeper.shutdown()?;
//! ```

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gatekeeper;
pub mod journal;
pub mod lifecycle;
pub mod report;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdminConfig, GatekeeperConfig};
pub use dispatch::{AdminCommand, Dispatcher, EventContext, InboundEvent};
pub use error::{GateError, Result, TransportError};
pub use gatekeeper::Gatekeeper;
pub use lifecycle::{
    next_access, Grant, PaymentConfirmed, PaymentHandler, RenewalPolicy, SweepConfig, SweepHandle,
    SweepReport, Sweeper, MAX_AMOUNT, MAX_MONTHS,
};
pub use store::{PaymentDraft, Store, StoreConfig};
pub use transport::{
    RecordingTransport, Transport, TransportCall, TransportCaller, DEFAULT_MAX_IN_FLIGHT,
};
pub use types::{
    AccessKind, Page, PaymentId, PaymentRecord, StoreStats, Subscriber, SubscriberFilter,
    SubscriptionStatus, Timestamp, UserId,
};
