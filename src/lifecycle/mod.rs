//! Subscription lifecycle: renewal math, payment confirmation and the
//! expiry sweep.
//!
//! # Example
//!
//! ```ignore
//! let payments = PaymentHandler::new(store.clone(), clock.clone(), RenewalPolicy::default());
//! let grant = payments.confirm(&event)?;
//!
//! let sweep = Sweeper::new(store, transport, clock, SweepConfig::default()).spawn()?;
//! // ...
//! sweep.shutdown();
//! ```

mod expiry;
mod payment;
mod sweep;

pub use expiry::{next_access, RenewalPolicy};
pub use payment::{Grant, PaymentConfirmed, PaymentHandler, MAX_AMOUNT, MAX_MONTHS};
pub use sweep::{SweepConfig, SweepHandle, SweepReport, Sweeper};
