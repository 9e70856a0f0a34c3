use serde::Serialize;
use strum_macros::Display;

/// Why `schedule` refused a table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum RejectReason {
    #[strum(serialize = "daemon disabled")]
    Disabled,
    #[strum(serialize = "queue full")]
    QueueFull,
    #[strum(serialize = "duplicate")]
    Duplicate,
}

/// Running totals for one statistics daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStatsCounters {
    pub scheduled: u64,
    pub processed: u64,
    pub rejected_full: u64,
    pub rejected_duplicate: u64,
    pub rejected_disabled: u64,
    pub errors_known: u64,
    pub errors_unknown: u64,
    /// Unexpected failures since the last successful job.
    pub errors_consecutive: u32,
}

impl IndexStatsCounters {
    pub fn record_rejection(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::Disabled => self.rejected_disabled += 1,
            RejectReason::QueueFull => self.rejected_full += 1,
            RejectReason::Duplicate => self.rejected_duplicate += 1,
        }
    }

    pub fn rejected(&self) -> u64 {
        self.rejected_full + self.rejected_duplicate + self.rejected_disabled
    }

    /// Compact one-line form used in the daemon's log messages.
    pub fn summary(&self, queue_len: usize) -> String {
        format!(
            "[q/p/s={}/{}/{},err:k/u/c={}/{}/{},rej:f/d/o={}/{}/{}]",
            queue_len,
            self.processed,
            self.scheduled,
            self.errors_known,
            self.errors_unknown,
            self.errors_consecutive,
            self.rejected_full,
            self.rejected_duplicate,
            self.rejected_disabled,
        )
    }
}
