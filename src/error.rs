use std::any::Any;
use std::io;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

/// How the statistics daemon reacts to a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, AsRefStr)]
pub enum ErrorClass {
    /// A lock could not be obtained in time. Retried with backoff.
    LockContention,
    /// Concurrent structural change or interrupted I/O. The job is abandoned quietly.
    Expected,
    /// Anything we did not anticipate. Logged in full and counted toward the breaker.
    Unexpected,
    /// The daemon cannot make progress any more and disables itself.
    Fatal,
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Lock not available: {0}")]
    LockTimeout(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("I/O interrupted: {0}")]
    IoInterrupted(String),

    #[error("Catalog is read-only: {0}")]
    ReadOnlyCatalog(String),

    #[error("Database is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] Box<figment::Error>),

    #[error("Logger error: {0}")]
    LoggerError(#[from] flexi_logger::FlexiLoggerError),

    #[error("Work item panicked: {0}")]
    WorkPanicked(String),

    #[error("Error: {0}")]
    Error(String),
}

impl DaemonError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DaemonError::LockTimeout(_) => ErrorClass::LockContention,
            DaemonError::IndexNotFound(_)
            | DaemonError::TableNotFound(_)
            | DaemonError::IoInterrupted(_) => ErrorClass::Expected,
            DaemonError::ReadOnlyCatalog(_) | DaemonError::ShuttingDown => ErrorClass::Fatal,
            _ => ErrorClass::Unexpected,
        }
    }

    pub fn is_lock_timeout(&self) -> bool {
        self.class() == ErrorClass::LockContention
    }

    /// Expected failures abandon the job without escalation. A lock timeout that
    /// survived every retry ends up here as well.
    pub fn is_expected(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Expected | ErrorClass::LockContention
        )
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl From<figment::Error> for DaemonError {
    fn from(err: figment::Error) -> Self {
        DaemonError::ConfigError(Box::new(err))
    }
}

/// Extracts the message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
