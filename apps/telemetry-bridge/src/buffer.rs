//! Bounded FIFO shared between the transport task and the flush task.
//!
//! Appends evict the oldest entry when full. Retries go back in at the front
//! and evict from the back, so data that already failed once is attempted
//! before anything newer.

use crate::telemetry::{device_id, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub struct BoundedBuffer {
    entries: Mutex<VecDeque<Value>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl BoundedBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends to the back. Returns how many entries were evicted.
    pub fn append(&self, entry: Value) -> usize {
        self.extend(std::iter::once(entry))
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = Value>) -> usize {
        let mut evicted = 0;
        {
            let mut buffer = self.lock();
            for entry in entries {
                if buffer.len() >= self.capacity {
                    buffer.pop_front();
                    evicted += 1;
                }
                buffer.push_back(entry);
            }
        }
        self.note_evicted(evicted);
        evicted
    }

    /// Removes and returns every entry in FIFO order.
    pub fn drain_all(&self) -> Vec<Value> {
        self.lock().drain(..).collect()
    }

    /// Puts `entries` back at the front, keeping their relative order.
    /// Overflow is trimmed from the back. Returns how many entries were
    /// evicted.
    pub fn requeue_front(&self, entries: Vec<Value>) -> usize {
        let mut evicted = 0;
        {
            let mut buffer = self.lock();
            for entry in entries.into_iter().rev() {
                buffer.push_front(entry);
            }
            while buffer.len() > self.capacity {
                buffer.pop_back();
                evicted += 1;
            }
        }
        self.note_evicted(evicted);
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Distinct device identities among the entries currently held.
    pub fn distinct_device_count(&self) -> usize {
        self.lock()
            .iter()
            .filter_map(device_id)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.lock().iter().cloned().collect()
    }

    pub fn total_evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn note_evicted(&self, evicted: usize) {
        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::warn!(evicted, capacity = self.capacity, "buffer full; evicted entries");
        }
    }
}
