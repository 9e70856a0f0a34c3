//! Background maintenance daemons for an embedded database engine.
//!
//! [`DaemonScheduler`] runs recurring subscriptions and one-off jobs on a
//! single worker thread. [`IndexStatsDaemon`] keeps index cardinality
//! statistics current, talking to the engine only through the traits in
//! [`stats::catalog`].

pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod stats;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use daemon::{DaemonScheduler, DaemonState, Disposition, Serviceable};
pub use error::{DaemonError, ErrorClass};
pub use stats::IndexStatsDaemon;
