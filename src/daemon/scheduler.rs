use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn, Level};
use logging_timer::timer;
use strum_macros::Display;

use super::service_record::ServiceRecord;
use super::work::{Disposition, Serviceable};
use crate::config::SchedulerConfig;
use crate::error::{panic_message, DaemonError};

/// Identifier handed out by [`DaemonScheduler::subscribe`]. Slots are never reused.
pub type SubscriptionId = usize;

/// Lifecycle of a scheduler. `Stopped` is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum DaemonState {
    Created,
    Running,
    Paused,
    Stopped,
}

/// Per-instance counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub processed: u64,
    pub requeued: u64,
    pub failed: u64,
    pub early_wakeups: u64,
    pub full_passes: u64,
}

struct QueuedJob {
    client: Arc<dyn Serviceable>,
    urgent: bool,
}

enum Assignment {
    Subscription(Arc<dyn Serviceable>),
    Job(QueuedJob),
}

impl Assignment {
    fn client(&self) -> &Arc<dyn Serviceable> {
        match self {
            Assignment::Subscription(client) => client,
            Assignment::Job(job) => &job.client,
        }
    }
}

/// Outcome of a rest period.
enum Rest {
    Stop,
    Paused,
    Work { urgent_only: bool },
}

struct SchedulerState {
    subscriptions: Vec<Option<ServiceRecord>>,
    urgent: VecDeque<QueuedJob>,
    normal: VecDeque<QueuedJob>,
    /// Cursor over `subscriptions` for the current pass.
    next_service: usize,
    /// Someone signalled the worker since it last went to rest.
    awakened: bool,
    in_work: bool,
    paused: bool,
    stop_requested: bool,
    started: bool,
    exited: bool,
    last_full_pass: Instant,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
    stats: SchedulerStats,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
            urgent: VecDeque::new(),
            normal: VecDeque::new(),
            next_service: 0,
            awakened: false,
            in_work: false,
            paused: false,
            stop_requested: false,
            started: false,
            exited: false,
            last_full_pass: Instant::now(),
            worker: None,
            worker_id: None,
            stats: SchedulerStats::default(),
        }
    }

    fn on_worker_thread(&self) -> bool {
        self.worker_id == Some(thread::current().id())
    }

    fn is_idle(&self) -> bool {
        self.urgent.is_empty() && self.normal.is_empty() && !self.in_work
    }

    /// Picks the next item, in strict priority order: triggered subscriptions,
    /// periodic subscriptions not yet visited in this pass, the urgent queue
    /// and finally the normal queue. Urgent-only passes skip the periodic
    /// subscriptions and the normal queue.
    fn next_assignment(&mut self, urgent_only: bool) -> Option<Assignment> {
        for record in self.subscriptions.iter_mut().flatten() {
            if record.take_pending() {
                return Some(Assignment::Subscription(record.client()));
            }
        }

        if !urgent_only {
            while self.next_service < self.subscriptions.len() {
                let idx = self.next_service;
                self.next_service += 1;
                if let Some(record) = &self.subscriptions[idx] {
                    if record.needs_periodic_service() {
                        return Some(Assignment::Subscription(record.client()));
                    }
                }
            }
        }

        if let Some(job) = self.urgent.pop_front() {
            return Some(Assignment::Job(job));
        }

        if urgent_only {
            return None;
        }

        self.normal.pop_front().map(Assignment::Job)
    }
}

struct Shared {
    name: String,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    /// Signalled to end the worker's rest early.
    wakeup: Condvar,
    /// Signalled whenever a work item finishes or the worker exits.
    quiescent: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_locked(&self, state: &mut SchedulerState) {
        if !state.awakened {
            state.awakened = true;
            self.wakeup.notify_all();
        }
    }

    fn run(&self) {
        info!("Daemon '{}' worker started", self.name);

        loop {
            match self.rest() {
                Rest::Stop => break,
                Rest::Paused => continue,
                Rest::Work { urgent_only } => self.work(urgent_only),
            }
        }

        let mut state = self.lock();
        state.exited = true;
        state.in_work = false;
        self.quiescent.notify_all();
        info!(
            "Daemon '{}' worker exiting: processed={}, requeued={}, failed={}",
            self.name, state.stats.processed, state.stats.requeued, state.stats.failed
        );
    }

    /// Sleeps until signalled or until the timer delay expires, then decides
    /// whether the coming pass is restricted to urgent work.
    fn rest(&self) -> Rest {
        let timer_delay = self.config.timer_delay();
        let mut state = self.lock();

        if state.stop_requested {
            return Rest::Stop;
        }

        if !state.awakened {
            let (guard, _) = self
                .wakeup
                .wait_timeout_while(state, timer_delay, |s| {
                    !s.awakened && !s.stop_requested
                })
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }

        if state.stop_requested {
            return Rest::Stop;
        }

        state.next_service = 0;
        let woken_early = std::mem::replace(&mut state.awakened, false);

        if state.paused {
            return Rest::Paused;
        }

        // A steady stream of signals keeps waking us early. Still make a full
        // pass at least once per timer interval so periodic subscriptions and
        // the normal queue are not starved.
        let urgent_only = if woken_early {
            state.stats.early_wakeups += 1;
            state.last_full_pass.elapsed() < timer_delay
        } else {
            false
        };

        if !urgent_only {
            state.last_full_pass = Instant::now();
            state.stats.full_passes += 1;
        }

        trace!(
            "Daemon '{}' awake (early={}, urgent_only={})",
            self.name,
            woken_early,
            urgent_only
        );

        Rest::Work { urgent_only }
    }

    fn work(&self, urgent_only: bool) {
        let _tmr = timer!(Level::Trace; "DaemonScheduler::work", "{}", self.name);
        // Queued jobs served in this pass. Subscriptions are not counted, so a
        // cursor reset never keeps the pass away from the backlog.
        let mut jobs_served: usize = 0;

        loop {
            let assignment = {
                let mut state = self.lock();
                if state.stop_requested || state.paused {
                    break;
                }
                match state.next_assignment(urgent_only) {
                    Some(assignment) => {
                        state.in_work = true;
                        assignment
                    }
                    None => break,
                }
            };

            let result = Self::service(assignment.client());
            let is_job = matches!(assignment, Assignment::Job(_));

            let should_yield = {
                let mut state = self.lock();
                state.in_work = false;
                state.stats.processed += 1;

                match result {
                    Ok(Disposition::Done) => {}
                    Ok(Disposition::Reschedule) => {
                        // Subscriptions come round again on their own.
                        if let Assignment::Job(job) = assignment {
                            state.stats.requeued += 1;
                            if job.urgent {
                                state.urgent.push_back(job);
                            } else {
                                state.normal.push_back(job);
                            }
                        }
                    }
                    Err(e) => {
                        state.stats.failed += 1;
                        warn!("Daemon '{}' work item failed: {}", self.name, e);
                    }
                }

                self.quiescent.notify_all();

                if is_job {
                    jobs_served += 1;
                }
                if is_job && jobs_served % self.config.yield_every.max(1) == 0 {
                    state.next_service = 0;
                    true
                } else {
                    false
                }
            };

            if should_yield {
                thread::sleep(self.config.yield_pause());
            }
        }
    }

    /// Runs one item outside the lock, turning a panic into an error.
    fn service(client: &Arc<dyn Serviceable>) -> Result<Disposition, DaemonError> {
        match panic::catch_unwind(AssertUnwindSafe(|| client.perform_work())) {
            Ok(result) => result,
            Err(payload) => Err(DaemonError::WorkPanicked(panic_message(&*payload))),
        }
    }
}

/// A single background worker servicing recurring subscriptions and one-off jobs
///
/// Producers only touch the queues and subscriptions under one lock; the
/// worker runs each item with that lock released. Handles are cheap to clone
/// so work items can hold one and enqueue follow-up work.
#[derive(Clone)]
pub struct DaemonScheduler {
    shared: Arc<Shared>,
}

impl DaemonScheduler {
    /// Creates a scheduler in the `Created` state. Work may be queued before [`start`](Self::start).
    pub fn new(name: &str, config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                config,
                state: Mutex::new(SchedulerState::new()),
                wakeup: Condvar::new(),
                quiescent: Condvar::new(),
            }),
        }
    }

    /// Creates and starts a scheduler.
    pub fn spawn(name: &str, config: SchedulerConfig) -> Result<Self, DaemonError> {
        let scheduler = Self::new(name, config);
        scheduler.start()?;
        Ok(scheduler)
    }

    /// Starts the worker thread. Does nothing if already started or stopped.
    pub fn start(&self) -> Result<(), DaemonError> {
        let mut state = self.shared.lock();
        if state.started || state.stop_requested {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || shared.run())?;

        state.worker_id = Some(handle.thread().id());
        state.worker = Some(handle);
        state.started = true;
        state.last_full_pass = Instant::now();

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> DaemonState {
        let state = self.shared.lock();
        if state.stop_requested || state.exited {
            DaemonState::Stopped
        } else if !state.started {
            DaemonState::Created
        } else if state.paused {
            DaemonState::Paused
        } else {
            DaemonState::Running
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.lock().stats.clone()
    }

    /// Registers a recurring client.
    pub fn subscribe(&self, client: Arc<dyn Serviceable>, on_demand_only: bool) -> SubscriptionId {
        let mut state = self.shared.lock();
        state
            .subscriptions
            .push(Some(ServiceRecord::new(client, on_demand_only)));
        let id = state.subscriptions.len() - 1;
        debug!(
            "Daemon '{}' subscription {} registered (on_demand_only={})",
            self.name(), id, on_demand_only
        );
        id
    }

    /// Removes a client. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.shared.lock();
        if let Some(slot) = state.subscriptions.get_mut(id) {
            if slot.take().is_some() {
                debug!(
                    "Daemon '{}' subscription {} removed",
                    self.name(), id
                );
            }
        }
    }

    /// Asks for a subscription to be serviced as soon as possible.
    pub fn service_now(&self, id: SubscriptionId) {
        let mut state = self.shared.lock();
        let requested = match state.subscriptions.get_mut(id) {
            Some(Some(record)) => {
                record.request_service();
                true
            }
            _ => false,
        };
        if requested {
            self.shared.wake_locked(&mut state);
        }
    }

    /// Queues a one-off job. Returns true when the urgent queue has grown past
    /// its optimal size, as a hint to throttle. Jobs offered to a stopped
    /// scheduler are dropped.
    pub fn enqueue(&self, job: Arc<dyn Serviceable>, urgent: bool) -> bool {
        let mut state = self.shared.lock();
        if state.stop_requested {
            debug!(
                "Daemon '{}' is stopped, dropping enqueued job",
                self.name()
            );
            return false;
        }

        let queued = QueuedJob {
            client: job,
            urgent,
        };

        if urgent {
            state.urgent.push_back(queued);
            self.shared.wake_locked(&mut state);
            state.urgent.len() > self.shared.config.optimal_queue_size
        } else {
            state.normal.push_back(queued);
            false
        }
    }

    /// Prevents new work from starting and waits for the item in flight, if any.
    pub fn pause(&self) {
        let mut state = self.shared.lock();
        if !state.paused {
            state.paused = true;
            debug!("Daemon '{}' pausing", self.name());
        }
        self.wait_quiescent_locked(state);
    }

    pub fn resume(&self) {
        let mut state = self.shared.lock();
        if state.paused && !state.stop_requested {
            state.paused = false;
            debug!("Daemon '{}' resumed", self.name());
            // Signals that arrived while paused were consumed by the paused rest
            let triggered = state
                .subscriptions
                .iter()
                .flatten()
                .any(ServiceRecord::is_pending);
            if triggered || !state.urgent.is_empty() {
                self.shared.wake_locked(&mut state);
            }
        }
    }

    /// Requests termination and waits for the worker to finish. Safe to call
    /// repeatedly and from inside a work item.
    pub fn stop(&self) {
        // Extract the handle in a separate scope so the mutex is released before joining
        let handle = {
            let mut state = self.shared.lock();
            if !state.stop_requested {
                info!("Daemon '{}' stopping", self.name());
                state.stop_requested = true;
                state.paused = true;
                self.shared.wake_locked(&mut state);
            }
            if state.on_worker_thread() {
                None
            } else {
                let mut state = self.wait_quiescent_locked(state);
                state.worker.take()
            }
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Daemon '{}' worker terminated abnormally", self.name());
            }
        }
    }

    /// Blocks until both queues are drained and nothing is in flight, the
    /// scheduler stops, or `timeout` elapses. Returns true when drained.
    pub fn wait_until_queue_empty(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .quiescent
            .wait_timeout_while(state, timeout, |s| !s.is_idle() && !s.exited)
            .unwrap_or_else(PoisonError::into_inner);
        state.is_idle()
    }

    fn wait_quiescent_locked<'a>(
        &'a self,
        mut state: MutexGuard<'a, SchedulerState>,
    ) -> MutexGuard<'a, SchedulerState> {
        if state.on_worker_thread() {
            return state;
        }
        while state.in_work && !state.exited {
            state = self
                .shared
                .quiescent
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
    }
}
