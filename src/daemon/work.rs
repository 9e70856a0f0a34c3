use crate::error::DaemonError;

/// What a work item wants the scheduler to do with it once it has run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    Done,
    /// Put the item back on the queue matching its own urgency.
    Reschedule,
}

/// A unit of background maintenance work
///
/// Implementations are shared with the scheduler's worker thread and run
/// outside any scheduler lock. A subscribed client is invoked repeatedly, so
/// any state it carries between runs lives behind its own synchronization.
///
/// Returning an error (or panicking) never stops the scheduler; the failure
/// is logged and the item is treated as done.
pub trait Serviceable: Send + Sync {
    fn perform_work(&self) -> Result<Disposition, DaemonError>;
}

impl<F> Serviceable for F
where
    F: Fn() -> Result<Disposition, DaemonError> + Send + Sync,
{
    fn perform_work(&self) -> Result<Disposition, DaemonError> {
        self()
    }
}
