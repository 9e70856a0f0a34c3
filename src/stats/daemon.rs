use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn, Level};
use logging_timer::timer;

use super::cardinality::{CardinalityScanner, CardinalityStats, ScanOutcome};
use super::catalog::{
    Database, IndexDescriptor, IndexId, Isolation, StatisticsRow, StatsTransaction, TableId,
};
use super::counters::{IndexStatsCounters, RejectReason};
use crate::config::IndexStatsConfig;
use crate::error::{panic_message, DaemonError};

const WORKER_THREAD_NAME: &str = "index-stat-thread";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RunMode {
    Background,
    Explicit,
}

impl RunMode {
    fn is_background(self) -> bool {
        self == RunMode::Background
    }

    fn isolation(self) -> Isolation {
        match self {
            RunMode::Background => Isolation::ReadUncommitted,
            RunMode::Explicit => Isolation::RepeatableRead,
        }
    }
}

struct StatsJob {
    table: TableId,
    reason: Option<String>,
}

struct QueueState {
    queue: VecDeque<StatsJob>,
    disabled: bool,
    worker_running: bool,
    worker_id: Option<ThreadId>,
    worker: Option<JoinHandle<()>>,
    counters: IndexStatsCounters,
    /// Time spent processing jobs, across all workers.
    run_time: Duration,
}

impl QueueState {
    fn on_worker_thread(&self) -> bool {
        self.worker_id == Some(thread::current().id())
    }

    fn rejection(&self, table: &TableId, queue_size: usize) -> Option<RejectReason> {
        if self.disabled {
            Some(RejectReason::Disabled)
        } else if self.queue.len() >= queue_size {
            Some(RejectReason::QueueFull)
        } else if self.queue.iter().any(|job| &job.table == table) {
            // The head of the queue is the job in progress, so it counts too
            Some(RejectReason::Duplicate)
        } else {
            None
        }
    }
}

struct Inner {
    db: Arc<dyn Database>,
    config: IndexStatsConfig,
    state: Mutex<QueueState>,
    /// Signalled when the daemon is disabled, to cut retry pauses short.
    wakeup: Condvar,
    created: Instant,
}

/// Timing of one index scan, for the scan durations log line.
struct ScanTime {
    index: IndexId,
    elapsed: Option<Duration>,
}

struct ScanTimes<'a>(&'a [ScanTime]);

impl fmt::Display for ScanTimes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan durations (")?;
        for (i, time) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match time.elapsed {
                Some(elapsed) => write!(f, "c{}={}ms", time.index, elapsed.as_millis())?,
                None => write!(f, "c{}=ABORTED", time.index)?,
            }
        }
        write!(f, ")")
    }
}

struct Cardinality<'a>(&'a [u64]);

impl fmt::Display for Cardinality<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, count) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{count}")?;
        }
        write!(f, "]")
    }
}

/// Keeps index statistics fresh in the background
///
/// Tables are queued with [`schedule`](Self::schedule) and processed in
/// order by a single worker thread that exists only while there is work.
/// Each index of a table is scanned, its distinct key prefixes counted and
/// the results written back to the catalog in a transaction of its own.
///
/// Failures never reach the caller. Lock timeouts are retried, a concurrently
/// dropped table or index abandons the job, and a run of unexpected failures
/// disables the daemon until [`reactivate`](Self::reactivate) is called.
#[derive(Clone)]
pub struct IndexStatsDaemon {
    inner: Arc<Inner>,
}

impl IndexStatsDaemon {
    pub fn new(db: Arc<dyn Database>, config: IndexStatsConfig) -> Self {
        trace!(
            "{{istat}} created {{log={}, queueLength={}, fetchSize={}}}",
            config.log_activity,
            config.queue_size,
            config.fetch_size
        );
        Self {
            inner: Arc::new(Inner {
                db,
                config,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    disabled: false,
                    worker_running: false,
                    worker_id: None,
                    worker: None,
                    counters: IndexStatsCounters::default(),
                    run_time: Duration::ZERO,
                }),
                wakeup: Condvar::new(),
                created: Instant::now(),
            }),
        }
    }

    /// Requests a statistics refresh for `table`, starting a worker if none is
    /// running. Returns false if the request was dropped because the daemon is
    /// disabled, the queue is full or the table is already queued.
    pub fn schedule(&self, table: &TableId, reason: Option<&str>) -> bool {
        let mut state = self.lock_state();

        if let Some(reject) = state.rejection(table, self.inner.config.queue_size) {
            state.counters.record_rejection(reject);
            trace!("{{istat}} {table} rejected, {reject}");
            return false;
        }

        state.queue.push_back(StatsJob {
            table: table.clone(),
            reason: reason.map(str::to_string),
        });
        state.counters.scheduled += 1;

        let reason_note = match reason {
            Some(reason) => format!(", reason=[{reason}]"),
            None => String::new(),
        };
        self.log(
            RunMode::Background,
            Some(table),
            format_args!(
                "update scheduled{reason_note} (queueSize={})",
                state.queue.len()
            ),
        );

        if !state.worker_running {
            self.spawn_worker_locked(&mut state);
        }

        true
    }

    /// Recomputes statistics for the given indexes on the caller's transaction.
    ///
    /// Scans run at repeatable-read, nothing is committed and lock timeouts are
    /// returned to the caller rather than retried.
    pub fn run_explicitly(
        &self,
        txn: &mut dyn StatsTransaction,
        table: &TableId,
        indexes: &[IndexDescriptor],
        run_context: Option<&str>,
    ) -> Result<(), DaemonError> {
        self.update_index_stats(txn, table, indexes, RunMode::Explicit)?;
        match run_context {
            Some(context) => trace!(
                "{{istat}} explicit run completed ({context}): {table} {}",
                self.summary()
            ),
            None => trace!("{{istat}} explicit run completed: {table} {}", self.summary()),
        }
        Ok(())
    }

    /// Disables the daemon, drops queued work and waits for the worker to exit.
    /// Safe to call more than once.
    pub fn stop(&self) {
        // Take the handle under the lock, join after releasing it
        let handle = {
            let mut state = self.lock_state();
            if !state.disabled {
                let summary = state.counters.summary(state.queue.len());
                self.log(
                    RunMode::Background,
                    None,
                    format_args!(
                        "stopping daemon, active={}, work/age={}/{} {}",
                        state.worker_running,
                        state.run_time.as_millis(),
                        self.inner.created.elapsed().as_millis(),
                        summary
                    ),
                );
                self.disable_locked(&mut state);
            }
            if state.on_worker_thread() {
                None
            } else {
                state.worker.take()
            }
        };

        if let Some(handle) = handle {
            debug!("{{istat}} waiting for worker thread to exit");
            if handle.join().is_err() {
                error!("{{istat}} worker thread panicked");
            }
        }
    }

    /// Re-enables a daemon that was stopped or disabled itself.
    pub fn reactivate(&self) {
        let mut state = self.lock_state();
        if state.disabled {
            state.disabled = false;
            state.counters.errors_consecutive = 0;
            info!(
                "{{istat}} daemon reactivated {}",
                state.counters.summary(state.queue.len())
            );
        }
    }

    pub fn counters(&self) -> IndexStatsCounters {
        self.lock_state().counters.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.lock_state().queue.len()
    }

    pub fn is_disabled(&self) -> bool {
        self.lock_state().disabled
    }

    pub fn is_worker_active(&self) -> bool {
        self.lock_state().worker_running
    }

    /// Counter summary for trace lines. Must not be called with the state lock held.
    fn summary(&self) -> String {
        let state = self.lock_state();
        state.counters.summary(state.queue.len())
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker_locked(&self, state: &mut QueueState) {
        let daemon = self.clone();
        match thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || daemon.run_worker())
        {
            Ok(handle) => {
                state.worker_running = true;
                state.worker_id = Some(handle.thread().id());
                state.worker = Some(handle);
            }
            Err(e) => {
                // The job stays queued and the next schedule call tries again
                error!("{{istat}} failed to start worker thread: {e}");
            }
        }
    }

    fn disable_locked(&self, state: &mut QueueState) {
        state.disabled = true;
        state.queue.clear();
        self.inner.wakeup.notify_all();
    }

    fn is_shutting_down(&self) -> bool {
        self.lock_state().disabled || !self.inner.db.is_active()
    }

    /// Sleeps for `delay`, returning early with `ShuttingDown` if the daemon is
    /// disabled or the database goes away in the meantime.
    fn backoff(&self, delay: Duration) -> Result<(), DaemonError> {
        let state = self.lock_state();
        let (state, _) = self
            .inner
            .wakeup
            .wait_timeout_while(state, delay, |s| !s.disabled)
            .unwrap_or_else(PoisonError::into_inner);
        if state.disabled || !self.inner.db.is_active() {
            return Err(DaemonError::ShuttingDown);
        }
        Ok(())
    }

    fn run_worker(&self) {
        trace!("{{istat}} worker thread started {}", self.summary());
        let mut txn: Option<Box<dyn StatsTransaction>> = None;

        loop {
            let job = {
                let mut state = self.lock_state();
                let next = if state.disabled {
                    state.queue.clear();
                    trace!("{{istat}} daemon disabled");
                    None
                } else {
                    state.queue.front().map(|job| StatsJob {
                        table: job.table.clone(),
                        reason: job.reason.clone(),
                    })
                };
                match next {
                    Some(job) => job,
                    None => {
                        if !state.disabled {
                            trace!("{{istat}} queue empty");
                        }
                        state.worker_running = false;
                        state.worker_id = None;
                        break;
                    }
                }
            };

            self.process_job(&mut txn, job);
        }

        if let Some(mut conn) = txn {
            if !conn.is_pristine() {
                warn!("{{istat}} transaction not pristine - forcing rollback");
                if let Err(e) = conn.rollback() {
                    warn!("{{istat}} forced rollback failed: {e}");
                }
            }
        }
        trace!("{{istat}} worker thread exiting {}", self.summary());
    }

    fn process_job(&self, txn: &mut Option<Box<dyn StatsTransaction>>, job: StatsJob) {
        let _tmr = timer!(Level::Trace; "IndexStatsDaemon::process_job", "{}", job.table);
        let started = Instant::now();
        let mut panicked = false;

        let result = match self.connection(txn) {
            Ok(conn) => panic::catch_unwind(AssertUnwindSafe(|| {
                self.generate_statistics(&mut **conn, &job.table)
            }))
            .unwrap_or_else(|payload| {
                panicked = true;
                Err(DaemonError::WorkPanicked(panic_message(&*payload)))
            }),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if panicked {
                // The connection may be half way through anything, do not reuse it
                *txn = None;
            } else if let Some(conn) = txn.as_mut() {
                if let Err(e) = conn.rollback() {
                    warn!("{{istat}} {}: rollback after failure failed: {e}", job.table);
                }
            }
        }

        let mut state = self.lock_state();
        state.run_time += started.elapsed();

        match result {
            Ok(()) => {
                state.counters.processed += 1;
                state.counters.errors_consecutive = 0;
                self.log(
                    RunMode::Background,
                    Some(&job.table),
                    format_args!("generation complete ({} ms)", started.elapsed().as_millis()),
                );
            }
            Err(e) if e.is_fatal() || !self.inner.db.is_active() => {
                if matches!(e, DaemonError::ShuttingDown) || !self.inner.db.is_active() {
                    trace!("{{istat}} swallowed exception during shutdown: {e}");
                } else {
                    error!("{{istat}} {}: disabling daemon: {e}", job.table);
                }
                self.disable_locked(&mut state);
            }
            Err(e) if e.is_expected() => {
                state.counters.errors_known += 1;
                debug!("{{istat}} {}: generation aborted (reason: {e})", job.table);
            }
            Err(e) => {
                state.counters.errors_unknown += 1;
                state.counters.errors_consecutive += 1;
                error!(
                    "{{istat}} {}: generation failed{}: {e:?}",
                    job.table,
                    job.reason
                        .as_deref()
                        .map(|r| format!(" (reason=[{r}])"))
                        .unwrap_or_default()
                );
            }
        }

        // The queue may have been cleared, or refilled, by a stop in the meantime
        if state
            .queue
            .front()
            .is_some_and(|front| front.table == job.table)
        {
            state.queue.pop_front();
        }

        let consecutive = state.counters.errors_consecutive;
        if consecutive >= self.inner.config.max_consecutive_errors && !state.disabled {
            error!(
                "{{istat}} shutting down daemon, {consecutive} consecutive errors seen {}",
                state.counters.summary(state.queue.len())
            );
            self.disable_locked(&mut state);
        }
    }

    fn connection<'a>(
        &self,
        txn: &'a mut Option<Box<dyn StatsTransaction>>,
    ) -> Result<&'a mut Box<dyn StatsTransaction>, DaemonError> {
        let conn = match txn.take() {
            Some(conn) => conn,
            None => {
                let conn = self.inner.db.connect()?;
                trace!("{{istat}} worker connection opened");
                conn
            }
        };
        Ok(txn.insert(conn))
    }

    /// Refreshes every index of `table`. A lock timeout gets one retry of the
    /// whole table after releasing all locks and pausing.
    fn generate_statistics(
        &self,
        txn: &mut dyn StatsTransaction,
        table: &TableId,
    ) -> Result<(), DaemonError> {
        trace!("{{istat}} processing {table}");
        let mut lock_conflict_seen = false;
        loop {
            let attempt = txn
                .index_descriptors(table)
                .and_then(|indexes| {
                    self.update_index_stats(txn, table, &indexes, RunMode::Background)
                });
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if e.is_lock_timeout() && !lock_conflict_seen => {
                    trace!("{{istat}} {table}: locks unavailable, retrying");
                    lock_conflict_seen = true;
                    txn.rollback()?;
                    self.backoff(self.inner.config.outer_retry_delay())?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn update_index_stats(
        &self,
        txn: &mut dyn StatsTransaction,
        table: &TableId,
        indexes: &[IndexDescriptor],
        mode: RunMode,
    ) -> Result<(), DaemonError> {
        let background = mode.is_background();
        let mut scan_times = Vec::with_capacity(indexes.len());

        for index in indexes {
            if background && self.is_shutting_down() {
                break;
            }

            let started = Instant::now();
            let outcome = {
                let _tmr = timer!(Level::Trace; "IndexStatsDaemon::scan", "{} {}", table, index.name);
                let mut scan = txn.open_index_scan(table, index, mode.isolation())?;
                CardinalityScanner::new(index.key_columns, self.inner.config.fetch_size)
                    .scan(&mut *scan, || background && self.is_shutting_down())?
            };

            let stats = match outcome {
                ScanOutcome::Complete(stats) => stats,
                ScanOutcome::Aborted => {
                    scan_times.push(ScanTime {
                        index: index.id,
                        elapsed: None,
                    });
                    break;
                }
            };
            scan_times.push(ScanTime {
                index: index.id,
                elapsed: Some(started.elapsed()),
            });

            let mut retries = 0;
            loop {
                match self.write_updated_stats(txn, table, index, &stats, mode) {
                    Ok(()) => break,
                    Err(e) => {
                        retries += 1;
                        if background
                            && e.is_lock_timeout()
                            && retries < self.inner.config.write_retries
                        {
                            trace!("{{istat}}   lock timeout when writing stats, retrying");
                            self.backoff(self.inner.config.backoff(retries))?;
                        } else {
                            return Err(e);
                        }
                    }
                }
            }
        }

        if !scan_times.is_empty() {
            self.log(mode, Some(table), format_args!("{}", ScanTimes(&scan_times)));
        }
        Ok(())
    }

    fn write_updated_stats(
        &self,
        txn: &mut dyn StatsTransaction,
        table: &TableId,
        index: &IndexDescriptor,
        stats: &CardinalityStats,
        mode: RunMode,
    ) -> Result<(), DaemonError> {
        trace!("{{istat}}  writing new stats for {table}");
        let background = mode.is_background();

        txn.set_row_estimate(table, stats.row_count)?;
        // Plans must be invalidated before the old statistics disappear
        self.invalidate_statements(txn, table, mode)?;
        txn.drop_statistics(table, index.id)?;

        if stats.row_count == 0 {
            trace!("{{istat}}   empty table, no stats written");
        } else {
            for (prefix, &cardinality) in stats.cardinality.iter().enumerate() {
                txn.insert_statistics(StatisticsRow {
                    table: table.clone(),
                    index: index.id,
                    column_count: prefix + 1,
                    row_count: stats.row_count,
                    cardinality,
                })?;
            }

            let exists = txn.index_exists(table, index.id)?;
            self.log(
                mode,
                Some(table),
                format_args!(
                    "wrote stats for index {} ({}): rows={}, card={}",
                    if exists { index.name.as_str() } else { "n/a" },
                    index.id,
                    stats.row_count,
                    Cardinality(&stats.cardinality)
                ),
            );

            // Background scans take no locks that keep the index from being
            // dropped, so it may be gone by now
            if background && !exists {
                self.log(
                    mode,
                    Some(table),
                    format_args!("rolled back index stats because index has been dropped"),
                );
                txn.rollback()?;
            }
        }

        if background {
            txn.commit()?;
        }
        Ok(())
    }

    fn invalidate_statements(
        &self,
        txn: &mut dyn StatsTransaction,
        table: &TableId,
        mode: RunMode,
    ) -> Result<(), DaemonError> {
        let mut retries = 0;
        loop {
            match txn.invalidate_dependents(table) {
                Ok(()) => {
                    trace!("{{istat}}  invalidation completed");
                    return Ok(());
                }
                Err(e)
                    if mode.is_background()
                        && e.is_lock_timeout()
                        && retries < self.inner.config.invalidate_retries =>
                {
                    retries += 1;
                    // Keep our locks on the first retry, release them after that
                    if retries > 1 {
                        trace!("{{istat}}   releasing locks");
                        txn.rollback()?;
                    }
                    trace!("{{istat}}   lock timeout when invalidating");
                    self.backoff(self.inner.config.backoff(1 + retries))?;
                }
                Err(e) => {
                    trace!("{{istat}}  invalidation failed");
                    return Err(e);
                }
            }
        }
    }

    /// Routine activity message. Only background runs log, and only with
    /// `log_activity` enabled.
    fn log(&self, mode: RunMode, table: Option<&TableId>, msg: fmt::Arguments<'_>) {
        if mode.is_background() && self.inner.config.log_activity {
            match table {
                Some(table) => info!("{{istat}} {table}: {msg}"),
                None => info!("{{istat}} {msg}"),
            }
        }
    }
}
