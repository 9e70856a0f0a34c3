//! In-memory engine used by the unit tests.
//!
//! Implements the catalog boundary traits over plain collections, with
//! switches for injecting the failures the statistics daemon must survive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::DaemonError;
use crate::stats::catalog::{
    Database, IndexDescriptor, IndexId, IndexRow, IndexScan, Isolation, StatisticsRow,
    StatsTransaction, TableId,
};

pub(crate) struct MemIndex {
    pub descriptor: IndexDescriptor,
    pub rows: Vec<IndexRow>,
    /// Reported as missing by `index_exists`, as if dropped after the scan.
    pub dropped: bool,
}

#[derive(Default)]
pub(crate) struct Catalog {
    pub tables: HashMap<TableId, Vec<MemIndex>>,
    pub stats: Vec<StatisticsRow>,
    pub row_estimates: HashMap<TableId, u64>,
    pub invalidations: u32,
    pub commits: u32,
    pub rollbacks: u32,
    pub connects: u32,
    pub descriptor_calls: u32,
    pub isolations: Vec<Isolation>,
}

impl Catalog {
    pub fn stats_for(&self, table: &TableId, index: IndexId) -> Vec<StatisticsRow> {
        self.stats
            .iter()
            .filter(|s| &s.table == table && s.index == index)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct Faults {
    pub descriptor_lock_timeouts: u32,
    pub invalidate_lock_timeouts: u32,
    pub insert_lock_timeouts: u32,
    pub unexpected_errors: u32,
    pub always_unexpected: bool,
    pub panic_on_descriptors: bool,
    pub read_only: bool,
    pub fail_connect: u32,
    /// Marks the database inactive while the next batch is fetched.
    pub deactivate_on_fetch: bool,
}

struct MemShared {
    active: AtomicBool,
    gate: Mutex<bool>,
    gate_cv: Condvar,
    catalog: Mutex<Catalog>,
    faults: Mutex<Faults>,
}

pub(crate) struct MemoryDatabase {
    shared: Arc<MemShared>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MemShared {
                active: AtomicBool::new(true),
                gate: Mutex::new(true),
                gate_cv: Condvar::new(),
                catalog: Mutex::new(Catalog::default()),
                faults: Mutex::new(Faults::default()),
            }),
        }
    }

    pub fn add_table(&self, table: &TableId, indexes: Vec<(IndexDescriptor, Vec<IndexRow>)>) {
        let indexes = indexes
            .into_iter()
            .map(|(descriptor, rows)| MemIndex {
                descriptor,
                rows,
                dropped: false,
            })
            .collect();
        lock(&self.shared.catalog).tables.insert(table.clone(), indexes);
    }

    pub fn catalog(&self) -> MutexGuard<'_, Catalog> {
        lock(&self.shared.catalog)
    }

    pub fn faults(&self) -> MutexGuard<'_, Faults> {
        lock(&self.shared.faults)
    }

    pub fn set_active(&self, active: bool) {
        self.shared.active.store(active, Ordering::SeqCst);
    }

    /// While closed, `connect` blocks. Lets a test hold a worker before its first job.
    pub fn close_gate(&self) {
        *lock(&self.shared.gate) = false;
    }

    pub fn open_gate(&self) {
        *lock(&self.shared.gate) = true;
        self.shared.gate_cv.notify_all();
    }
}

impl Database for MemoryDatabase {
    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    fn connect(&self) -> Result<Box<dyn StatsTransaction>, DaemonError> {
        {
            let gate = lock(&self.shared.gate);
            let _open = self
                .shared
                .gate_cv
                .wait_while(gate, |open| !*open)
                .unwrap_or_else(PoisonError::into_inner);
        }

        lock(&self.shared.catalog).connects += 1;

        let mut faults = lock(&self.shared.faults);
        if faults.fail_connect > 0 {
            faults.fail_connect -= 1;
            return Err(DaemonError::Error("connection refused".into()));
        }

        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            pending: Vec::new(),
        }))
    }
}

enum PendingOp {
    Invalidate,
    DropStats(TableId, IndexId),
    Insert(StatisticsRow),
}

pub(crate) struct MemoryTransaction {
    shared: Arc<MemShared>,
    pending: Vec<PendingOp>,
}

impl MemoryTransaction {
    fn faults(&self) -> MutexGuard<'_, Faults> {
        lock(&self.shared.faults)
    }
}

impl StatsTransaction for MemoryTransaction {
    fn index_descriptors(&mut self, table: &TableId) -> Result<Vec<IndexDescriptor>, DaemonError> {
        lock(&self.shared.catalog).descriptor_calls += 1;
        {
            let mut faults = self.faults();
            if faults.panic_on_descriptors {
                drop(faults);
                panic!("catalog corrupted");
            }
            if faults.descriptor_lock_timeouts > 0 {
                faults.descriptor_lock_timeouts -= 1;
                return Err(DaemonError::LockTimeout(table.to_string()));
            }
            if faults.always_unexpected {
                return Err(DaemonError::Error("injected failure".into()));
            }
            if faults.unexpected_errors > 0 {
                faults.unexpected_errors -= 1;
                return Err(DaemonError::Error("injected failure".into()));
            }
        }

        let catalog = lock(&self.shared.catalog);
        let indexes = catalog
            .tables
            .get(table)
            .ok_or_else(|| DaemonError::TableNotFound(table.to_string()))?;
        Ok(indexes.iter().map(|i| i.descriptor.clone()).collect())
    }

    fn open_index_scan(
        &mut self,
        table: &TableId,
        index: &IndexDescriptor,
        isolation: Isolation,
    ) -> Result<Box<dyn IndexScan>, DaemonError> {
        let mut catalog = lock(&self.shared.catalog);
        catalog.isolations.push(isolation);
        let rows = catalog
            .tables
            .get(table)
            .and_then(|indexes| indexes.iter().find(|i| i.descriptor.id == index.id))
            .map(|i| i.rows.clone())
            .ok_or_else(|| DaemonError::IndexNotFound(index.name.clone()))?;
        Ok(Box::new(MemoryScan {
            shared: Arc::clone(&self.shared),
            rows,
            pos: 0,
        }))
    }

    fn set_row_estimate(&mut self, table: &TableId, rows: u64) -> Result<(), DaemonError> {
        lock(&self.shared.catalog)
            .row_estimates
            .insert(table.clone(), rows);
        Ok(())
    }

    fn invalidate_dependents(&mut self, table: &TableId) -> Result<(), DaemonError> {
        let mut faults = self.faults();
        if faults.read_only {
            return Err(DaemonError::ReadOnlyCatalog(table.to_string()));
        }
        if faults.invalidate_lock_timeouts > 0 {
            faults.invalidate_lock_timeouts -= 1;
            return Err(DaemonError::LockTimeout(table.to_string()));
        }
        drop(faults);
        self.pending.push(PendingOp::Invalidate);
        Ok(())
    }

    fn drop_statistics(&mut self, table: &TableId, index: IndexId) -> Result<(), DaemonError> {
        self.pending.push(PendingOp::DropStats(table.clone(), index));
        Ok(())
    }

    fn insert_statistics(&mut self, row: StatisticsRow) -> Result<(), DaemonError> {
        let mut faults = self.faults();
        if faults.insert_lock_timeouts > 0 {
            faults.insert_lock_timeouts -= 1;
            return Err(DaemonError::LockTimeout(row.table.to_string()));
        }
        drop(faults);
        self.pending.push(PendingOp::Insert(row));
        Ok(())
    }

    fn index_exists(&mut self, table: &TableId, index: IndexId) -> Result<bool, DaemonError> {
        let catalog = lock(&self.shared.catalog);
        Ok(catalog
            .tables
            .get(table)
            .map(|indexes| {
                indexes
                    .iter()
                    .any(|i| i.descriptor.id == index && !i.dropped)
            })
            .unwrap_or(false))
    }

    fn commit(&mut self) -> Result<(), DaemonError> {
        let mut catalog = lock(&self.shared.catalog);
        for op in self.pending.drain(..) {
            match op {
                PendingOp::Invalidate => catalog.invalidations += 1,
                PendingOp::DropStats(table, index) => catalog
                    .stats
                    .retain(|s| !(s.table == table && s.index == index)),
                PendingOp::Insert(row) => catalog.stats.push(row),
            }
        }
        catalog.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DaemonError> {
        self.pending.clear();
        lock(&self.shared.catalog).rollbacks += 1;
        Ok(())
    }

    fn is_pristine(&self) -> bool {
        self.pending.is_empty()
    }
}

struct MemoryScan {
    shared: Arc<MemShared>,
    rows: Vec<IndexRow>,
    pos: usize,
}

impl IndexScan for MemoryScan {
    fn fetch_next_batch(
        &mut self,
        batch: &mut Vec<IndexRow>,
        max_rows: usize,
    ) -> Result<usize, DaemonError> {
        if lock(&self.shared.faults).deactivate_on_fetch {
            self.shared.active.store(false, Ordering::SeqCst);
        }
        batch.clear();
        let end = (self.pos + max_rows).min(self.rows.len());
        batch.extend_from_slice(&self.rows[self.pos..end]);
        self.pos = end;
        Ok(batch.len())
    }
}

/// Polls `cond` until it holds or `timeout` passes. Returns the last result.
pub(crate) fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
