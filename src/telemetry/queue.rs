use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::warn;

use super::event::TelemetryEvent;
use crate::store::{EncryptedStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub size: usize,
    pub oldest_at: Option<DateTime<Utc>>,
    pub newest_at: Option<DateTime<Utc>>,
}

/// Bounded FIFO of pending events, persisted to one store slot.
///
/// Every persisted write truncates to the newest `max_size` entries. Dropping the
/// oldest entries under pressure is expected behaviour, not an error.
pub struct OfflineQueue {
    store: Arc<EncryptedStore>,
    slot: String,
    max_size: usize,
    buffer: VecDeque<TelemetryEvent>,
}

impl OfflineQueue {
    /// Opens the queue, restoring whatever the slot already holds.
    pub fn open(store: Arc<EncryptedStore>, slot: impl Into<String>, max_size: usize) -> Self {
        let slot = slot.into();
        let buffer: VecDeque<TelemetryEvent> = store.read(&slot, VecDeque::new());
        let mut queue = Self { store, slot, max_size: max_size.max(1), buffer };
        queue.truncate();
        queue
    }

    /// Appends `event` and persists. Returns how many old entries were evicted.
    /// On a failed write the queue is left exactly as it was.
    pub fn enqueue(&mut self, event: TelemetryEvent) -> Result<usize, StoreError> {
        self.append(std::iter::once(event))
    }

    /// Appends every event in order with a single write.
    pub fn append(&mut self, events: impl IntoIterator<Item = TelemetryEvent>) -> Result<usize, StoreError> {
        let mut next = self.buffer.clone();
        next.extend(events);
        let evicted = self.commit(next)?;
        if evicted > 0 {
            warn!(slot = %self.slot, evicted, max = self.max_size, "queue full; dropped oldest events");
        }
        Ok(evicted)
    }

    /// Copies of up to `limit` oldest events. Nothing is removed.
    pub fn dequeue_batch(&self, limit: usize) -> Vec<TelemetryEvent> {
        self.buffer.iter().take(limit).cloned().collect()
    }

    pub fn remove_by_ids(&mut self, ids: &[String]) -> Result<usize, StoreError> {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let next: VecDeque<TelemetryEvent> = self
            .buffer
            .iter()
            .filter(|e| !ids.contains(e.id.as_str()))
            .cloned()
            .collect();
        let removed = self.buffer.len() - next.len();
        if removed > 0 {
            self.commit(next)?;
        }
        Ok(removed)
    }

    pub fn increment_retries(&mut self, ids: &[String]) -> Result<usize, StoreError> {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut next = self.buffer.clone();
        let mut touched = 0;
        for event in next.iter_mut().filter(|e| ids.contains(e.id.as_str())) {
            event.retries = event.retries.saturating_add(1);
            touched += 1;
        }
        if touched > 0 {
            self.commit(next)?;
        }
        Ok(touched)
    }

    /// Removes every event whose retry counter is above `max_retries`, returning them.
    pub fn drop_exceeded_retries(&mut self, max_retries: u32) -> Result<Vec<TelemetryEvent>, StoreError> {
        let (dropped, kept): (Vec<_>, Vec<_>) = self
            .buffer
            .iter()
            .cloned()
            .partition(|e| e.retries > max_retries);
        if !dropped.is_empty() {
            self.commit(kept.into())?;
        }
        Ok(dropped)
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.commit(VecDeque::new()).map(|_| ())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            size: self.buffer.len(),
            oldest_at: self.buffer.front().map(|e| e.occurred_at),
            newest_at: self.buffer.back().map(|e| e.occurred_at),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TelemetryEvent> {
        self.buffer.iter()
    }

    pub fn all(&self) -> Vec<TelemetryEvent> {
        self.buffer.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn truncate(&mut self) -> usize {
        let excess = self.buffer.len().saturating_sub(self.max_size);
        self.buffer.drain(..excess);
        excess
    }

    /// Truncates `next`, writes it, and only then makes it the live buffer.
    fn commit(&mut self, mut next: VecDeque<TelemetryEvent>) -> Result<usize, StoreError> {
        let evicted = next.len().saturating_sub(self.max_size);
        next.drain(..evicted);
        self.store.write(&self.slot, &next)?;
        self.buffer = next;
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;
    use chrono::{Duration, TimeZone};

    fn event(n: i64) -> TelemetryEvent {
        let at = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap() + Duration::minutes(n);
        TelemetryEvent::new("PRICE_QUERY", payload! { "n" => n }, at)
    }

    #[test]
    fn dequeue_batch_peeks_without_removing() {
        let mut q = OfflineQueue::open(Arc::new(EncryptedStore::in_memory()), "telemetry.queue", 10);
        for n in 0..5 {
            q.enqueue(event(n)).unwrap();
        }
        let batch = q.dequeue_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].number("n"), Some(0.0));
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn drop_exceeded_keeps_events_at_the_limit() {
        let mut q = OfflineQueue::open(Arc::new(EncryptedStore::in_memory()), "telemetry.queue", 10);
        q.enqueue(event(0)).unwrap();
        q.enqueue(event(1)).unwrap();
        let first = vec![q.all()[0].id.clone()];

        for _ in 0..3 {
            q.increment_retries(&first).unwrap();
        }
        assert!(q.drop_exceeded_retries(3).unwrap().is_empty());

        q.increment_retries(&first).unwrap();
        let dropped = q.drop_exceeded_retries(3).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].retries, 4);
        assert_eq!(q.len(), 1);
    }
}
