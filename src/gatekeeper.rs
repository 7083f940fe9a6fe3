//! Wiring of the store, payment handler, expiry sweep and dispatcher into
//! one running service.

use crate::clock::Clock;
use crate::config::GatekeeperConfig;
use crate::dispatch::{Dispatcher, EventContext, InboundEvent};
use crate::error::Result;
use crate::lifecycle::{PaymentHandler, SweepHandle, Sweeper};
use crate::store::Store;
use crate::transport::Transport;
use std::sync::Arc;
use tracing::info;

/// A running gatekeeper.
pub struct Gatekeeper {
    store: Arc<Store>,
    payments: PaymentHandler,
    sweeper: Sweeper,
    dispatcher: Dispatcher,
    sweep: SweepHandle,
}

impl Gatekeeper {
    /// Open the store and start the sweep loop and dispatch workers.
    pub fn start(
        config: GatekeeperConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(Store::open_or_create(config.store.clone())?);
        let payments = PaymentHandler::new(Arc::clone(&store), Arc::clone(&clock), config.renewal);
        let sweeper = Sweeper::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            clock,
            config.sweep.clone(),
        );

        let context = EventContext::new(
            Arc::clone(&store),
            payments.clone(),
            transport,
            config.admin.clone(),
            config.sweep.transport_timeout(),
        );
        let dispatcher = Dispatcher::spawn(context, config.dispatch_workers)?;
        let sweep = sweeper.clone().spawn()?;

        info!(path = %config.store.path.display(), "gatekeeper started");
        Ok(Self {
            store,
            payments,
            sweeper,
            dispatcher,
            sweep,
        })
    }

    /// Queue an inbound event.
    pub fn submit(&self, event: InboundEvent) -> Result<()> {
        self.dispatcher.submit(event)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn payments(&self) -> &PaymentHandler {
        &self.payments
    }

    /// A sweeper sharing this gatekeeper's store and transport, for running
    /// a pass on demand.
    pub fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    /// Stop the sweep, drain queued events, and flush the journal.
    pub fn shutdown(self) -> Result<()> {
        self.sweep.shutdown();
        self.dispatcher.shutdown();
        self.store.sync()?;
        info!("gatekeeper stopped");
        Ok(())
    }
}
