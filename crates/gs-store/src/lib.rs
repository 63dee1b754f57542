//! The forward log: a durable (for the process lifetime), append-only,
//! sequentially-keyed log of a runtime's outbound messages, supporting
//! prefix truncation and blocking iteration.
//!
//! `output_message_id` is widened to `u64` here even though the wire
//! format and the [`Entry`] the runtime hands out to peers is `u32` — see
//! the module-level note on wraparound in [`Entry`]. The log's own keys
//! never wrap; only the wire encoding does.
//!
//! Backed by an in-memory `BTreeMap`. Durability across process crashes is
//! not required: a crashed runtime is replaced by the plan watcher, which
//! rebuilds state by replaying from its own upstreams.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One forward-log record. `output_message_id` is the runtime's own
/// monotonically increasing sequence number (widened to `u64`; truncated
/// to `u32` only when framed onto the wire in `gs-net`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub input_id: u16,
    pub flags: u16,
    pub input_message_id: u32,
    pub output_message_id: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("append out of order: got {got}, log already holds up to {max}")]
    OutOfOrder { got: u64, max: u64 },
}

struct Inner {
    map: BTreeMap<u64, Entry>,
}

/// The forward log. Cheaply cloneable (internally `Arc`-shared); every
/// clone observes the same log.
#[derive(Clone)]
pub struct ForwardLog {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<tokio::sync::Notify>,
}

impl Default for ForwardLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardLog {
    pub fn new() -> Self {
        ForwardLog { inner: Arc::new(Mutex::new(Inner { map: BTreeMap::new() })), notify: Arc::new(tokio::sync::Notify::new()) }
    }

    /// Appends `entry`. Entries must arrive in strictly ascending
    /// `output_message_id` order (the forwarder core's own counter
    /// guarantees this); violating it is a bug in the caller, not a
    /// recoverable runtime condition.
    pub fn append(&self, entry: Entry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((&max, _)) = inner.map.last_key_value() {
            if entry.output_message_id <= max {
                return Err(StoreError::OutOfOrder { got: entry.output_message_id, max });
            }
        }
        inner.map.insert(entry.output_message_id, entry);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Deletes every entry with `output_message_id <= bound`, returning the
    /// per-`input_id` max `input_message_id` observed among the trimmed
    /// entries (folded by the caller into the upstream-ack aggregate).
    pub fn trim(&self, bound: u64) -> HashMap<u16, u32> {
        let mut inner = self.inner.lock().unwrap();
        let mut aggregate: HashMap<u16, u32> = HashMap::new();
        let tail = inner.map.split_off(&(bound + 1));
        let trimmed = std::mem::replace(&mut inner.map, tail);
        for entry in trimmed.into_values() {
            let slot = aggregate.entry(entry.input_id).or_insert(0);
            *slot = (*slot).max(entry.input_message_id);
        }
        aggregate
    }

    /// The smallest `output_message_id` still present, or — if the log is
    /// empty — `next_assigned`, the id that would be assigned next. This is
    /// the watermark reported as a runtime's `oldest_output` telemetry.
    pub fn oldest(&self, next_assigned: u64) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.map.keys().next().copied().unwrap_or(next_assigned)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    /// A fresh iterator positioned at the log's current front. Appends that
    /// land after creation are still visible; entries already trimmed
    /// before creation are not replayed.
    pub fn iterator(&self) -> LogIter {
        let cursor = self.inner.lock().unwrap().map.keys().next().copied().unwrap_or(0);
        LogIter { inner: self.inner.clone(), notify: self.notify.clone(), cursor }
    }
}

/// An independent, position-tracking view over a [`ForwardLog`]. Multiple
/// iterators over the same log do not interfere with one another.
pub struct LogIter {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<tokio::sync::Notify>,
    cursor: u64,
}

impl LogIter {
    /// Returns the next entry at or after the cursor, blocking until one is
    /// appended if the iterator has caught up to the tail. Returns `None`
    /// if `cancel` fires first.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<Entry> {
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if let Some((&key, entry)) = inner.map.range(self.cursor..).next() {
                    self.cursor = key + 1;
                    return Some(entry.clone());
                }
            }
            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = cancel.cancelled() => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, input_id: u16, input_message_id: u32) -> Entry {
        Entry { input_id, flags: 0, input_message_id, output_message_id: id, payload: vec![id as u8] }
    }

    #[test]
    fn append_must_be_strictly_ascending() {
        let log = ForwardLog::new();
        log.append(entry(1, 0, 1)).unwrap();
        let err = log.append(entry(1, 0, 2)).unwrap_err();
        assert_eq!(err, StoreError::OutOfOrder { got: 1, max: 1 });
    }

    #[test]
    fn trim_removes_prefix_and_aggregates_input_max() {
        let log = ForwardLog::new();
        log.append(entry(1, 0, 10)).unwrap();
        log.append(entry(2, 0, 11)).unwrap();
        log.append(entry(3, 1, 5)).unwrap();
        let agg = log.trim(2);
        assert_eq!(agg.get(&0), Some(&11));
        assert_eq!(agg.get(&1), None);
        assert_eq!(log.len(), 1);
        assert_eq!(log.oldest(99), 3);
    }

    #[test]
    fn oldest_falls_back_to_next_assigned_when_empty() {
        let log = ForwardLog::new();
        assert_eq!(log.oldest(42), 42);
    }

    #[tokio::test]
    async fn iterator_blocks_at_tail_and_resumes_on_append() {
        let log = ForwardLog::new();
        log.append(entry(1, 0, 1)).unwrap();
        let mut it = log.iterator();
        let cancel = CancellationToken::new();
        assert_eq!(it.next(&cancel).await.unwrap().output_message_id, 1);

        let log2 = log.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            log2.append(entry(2, 0, 2)).unwrap();
        });
        let got = it.next(&cancel).await.unwrap();
        assert_eq!(got.output_message_id, 2);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn iterator_returns_none_on_cancellation() {
        let log = ForwardLog::new();
        let mut it = log.iterator();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(it.next(&cancel).await, None);
    }

    #[tokio::test]
    async fn fresh_iterator_only_sees_entries_from_its_front_onward() {
        let log = ForwardLog::new();
        log.append(entry(1, 0, 1)).unwrap();
        log.append(entry(2, 0, 2)).unwrap();
        log.trim(1);
        let mut it = log.iterator();
        let cancel = CancellationToken::new();
        assert_eq!(it.next(&cancel).await.unwrap().output_message_id, 2);
    }
}
