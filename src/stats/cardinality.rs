use super::catalog::{IndexRow, IndexScan, Value};
use crate::error::DaemonError;

/// Result of scanning one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardinalityStats {
    pub row_count: u64,
    /// `cardinality[i]` is the number of distinct values of the first `i + 1` key columns.
    pub cardinality: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Complete(CardinalityStats),
    /// The abort check fired before the scan reached the end of the index.
    Aborted,
}

/// Counts distinct key prefixes in one forward pass over a sorted index
///
/// Each row is compared with the row before it. The first key column that
/// differs (or is null on either side) starts a new distinct value for that
/// column prefix and every longer prefix. Only the last key of the previous
/// batch is kept, so memory is bounded by the batch size.
pub struct CardinalityScanner {
    key_columns: usize,
    fetch_size: usize,
    last_key: Option<Vec<Value>>,
    cardinality: Vec<u64>,
    row_count: u64,
}

impl CardinalityScanner {
    pub fn new(key_columns: usize, fetch_size: usize) -> Self {
        Self {
            key_columns,
            fetch_size: fetch_size.max(1),
            last_key: None,
            cardinality: vec![0; key_columns],
            row_count: 0,
        }
    }

    /// Drains `scan`, calling `should_abort` after every fetched batch.
    pub fn scan(
        mut self,
        scan: &mut dyn IndexScan,
        mut should_abort: impl FnMut() -> bool,
    ) -> Result<ScanOutcome, DaemonError> {
        let mut batch = Vec::with_capacity(self.fetch_size);
        loop {
            let fetched = scan.fetch_next_batch(&mut batch, self.fetch_size)?;
            if fetched == 0 {
                break;
            }
            if should_abort() {
                return Ok(ScanOutcome::Aborted);
            }
            self.observe_batch(&batch[..fetched.min(batch.len())]);
        }
        Ok(ScanOutcome::Complete(self.finish()))
    }

    pub fn observe_batch(&mut self, rows: &[IndexRow]) {
        for (i, row) in rows.iter().enumerate() {
            self.row_count += 1;

            let changed_at = if self.row_count == 1 {
                Some(0)
            } else {
                let prev = if i == 0 {
                    self.last_key.as_deref()
                } else {
                    Some(rows[i - 1].key.as_slice())
                };
                match prev {
                    Some(prev) => self.first_difference(prev, &row.key),
                    None => Some(0),
                }
            };

            if let Some(pos) = changed_at {
                for count in &mut self.cardinality[pos..] {
                    *count += 1;
                }
            }
        }

        if let Some(last) = rows.last() {
            self.last_key = Some(last.key.clone());
        }
    }

    pub fn finish(self) -> CardinalityStats {
        CardinalityStats {
            row_count: self.row_count,
            cardinality: self.cardinality,
        }
    }

    /// Position of the first key column where `curr` starts a new value.
    /// A column missing from either key counts as null.
    fn first_difference(&self, prev: &[Value], curr: &[Value]) -> Option<usize> {
        (0..self.key_columns).find(|&col| match (prev.get(col), curr.get(col)) {
            (Some(p), Some(c)) => !p.same_as(c),
            _ => true,
        })
    }
}
