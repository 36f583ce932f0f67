//! Test doubles.

use crate::cursor::BatchRange;
use crate::errors::Result;
use crate::scheduler::{DelayedBatch, DelayedQueue};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// In-memory [`DelayedQueue`], ordered by dispatch time.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    sequence: u64,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    not_before: DateTime<Utc>,
    sequence: u64,
    migration_id: i64,
    batch: BatchKey,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct BatchKey {
    min: Vec<i64>,
    max: Vec<i64>,
    batch_size: i32,
    sub_batch_size: i32,
}

impl MemoryQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued batches.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Every queued batch with its dispatch time, earliest first.
    pub fn scheduled(&self) -> Vec<(DelayedBatch, DateTime<Utc>)> {
        let mut entries = self.heap.iter().map(|Reverse(entry)| entry).collect::<Vec<_>>();
        entries.sort();
        entries.into_iter().map(Entry::to_batch).collect()
    }

    /// Remove and return the batches due at `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(DelayedBatch, DateTime<Utc>)> {
        let mut due = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.not_before <= now)
        {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.to_batch());
            }
        }
        due
    }
}

impl Entry {
    fn to_batch(&self) -> (DelayedBatch, DateTime<Utc>) {
        let batch = DelayedBatch {
            migration_id: self.migration_id,
            range: BatchRange::new(self.batch.min.clone(), self.batch.max.clone()),
            batch_size: self.batch.batch_size,
            sub_batch_size: self.batch.sub_batch_size,
        };
        (batch, self.not_before)
    }
}

impl DelayedQueue for MemoryQueue {
    async fn enqueue(&mut self, batch: DelayedBatch, not_before: DateTime<Utc>) -> Result<()> {
        self.sequence += 1;
        self.heap.push(Reverse(Entry {
            not_before,
            sequence: self.sequence,
            migration_id: batch.migration_id,
            batch: BatchKey {
                min: batch.range.min.into_values(),
                max: batch.range.max.into_values(),
                batch_size: batch.batch_size,
                sub_batch_size: batch.sub_batch_size,
            },
        }));
        Ok(())
    }
}
