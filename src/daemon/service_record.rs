use std::sync::Arc;

use super::work::Serviceable;

/// A recurring client registered with the scheduler, plus its trigger state.
pub struct ServiceRecord {
    client: Arc<dyn Serviceable>,
    on_demand_only: bool,
    pending: bool,
}

impl ServiceRecord {
    pub fn new(client: Arc<dyn Serviceable>, on_demand_only: bool) -> Self {
        Self {
            client,
            on_demand_only,
            pending: false,
        }
    }

    pub fn client(&self) -> Arc<dyn Serviceable> {
        Arc::clone(&self.client)
    }

    pub fn is_on_demand_only(&self) -> bool {
        self.on_demand_only
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// External "service me now" signal.
    pub fn request_service(&mut self) {
        self.pending = true;
    }

    /// Clears the trigger as the record is handed to the worker. A request that
    /// arrives while the client is running marks it pending again.
    pub fn take_pending(&mut self) -> bool {
        std::mem::replace(&mut self.pending, false)
    }

    /// Periodic clients are serviced on every full pass; on-demand ones only when triggered.
    pub fn needs_periodic_service(&self) -> bool {
        !self.on_demand_only
    }
}
