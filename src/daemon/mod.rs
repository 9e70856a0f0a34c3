//! General purpose background scheduler.
//!
//! A [`DaemonScheduler`] owns one worker thread that services recurring
//! subscriptions and one-off jobs in two priority tiers.

mod scheduler;
mod service_record;
mod work;

pub use scheduler::{DaemonScheduler, DaemonState, SchedulerStats, SubscriptionId};
pub use service_record::ServiceRecord;
pub use work::{Disposition, Serviceable};
