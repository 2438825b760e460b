// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Short-lived accumulation of sampled telemetry items.
//!
//! Producers append under a short lock and never wait on the network. Once the
//! buffer holds `capacity` items the full callback fires so the transmitter can
//! turn the contents into a transmission. Draining swaps the backing vector out,
//! so the consumer iterates without holding the lock.

use crate::item::TelemetryItem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub const DEFAULT_BUFFER_CAPACITY: usize = 500;

/// Hard ceiling on items held between flushes. Beyond this the buffer drops
/// instead of growing, in case the consumer stalls.
pub const DEFAULT_BACKLOG_SIZE: usize = 1_000_000;

pub type FullCallback = Arc<dyn Fn() + Send + Sync>;

pub struct TelemetryBuffer {
    items: Mutex<Vec<TelemetryItem>>,
    capacity: AtomicUsize,
    backlog_size: AtomicUsize,
    dropped: AtomicU64,
    on_full: FullCallback,
}

impl TelemetryBuffer {
    pub fn new(capacity: usize, on_full: FullCallback) -> Self {
        let buffer = Self {
            items: Mutex::new(Vec::new()),
            capacity: AtomicUsize::new(DEFAULT_BUFFER_CAPACITY),
            backlog_size: AtomicUsize::new(DEFAULT_BACKLOG_SIZE),
            dropped: AtomicU64::new(0),
            on_full,
        };
        buffer.set_capacity(capacity);
        buffer
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Values below 1 fall back to [`DEFAULT_BUFFER_CAPACITY`].
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = if capacity < 1 {
            DEFAULT_BUFFER_CAPACITY
        } else {
            capacity
        };
        self.capacity.store(capacity, Ordering::Relaxed);
        if self.backlog_size() < capacity {
            self.backlog_size.store(capacity, Ordering::Relaxed);
        }
    }

    pub fn backlog_size(&self) -> usize {
        self.backlog_size.load(Ordering::Relaxed)
    }

    /// The backlog never goes below the current capacity.
    pub fn set_backlog_size(&self, backlog_size: usize) {
        self.backlog_size
            .store(backlog_size.max(self.capacity()), Ordering::Relaxed);
    }

    pub fn enqueue(&self, item: TelemetryItem) {
        let count = {
            #[allow(clippy::expect_used)]
            let mut items = self.items.lock().expect("lock poisoned");
            if items.len() >= self.backlog_size() {
                drop(items);
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("Telemetry buffer backlog is full, dropping items");
                }
                return;
            }
            items.push(item);
            items.len()
        };

        if count >= self.capacity() {
            (self.on_full)();
        }
    }

    pub fn drain(&self) -> Vec<TelemetryItem> {
        #[allow(clippy::expect_used)]
        let mut items = self.items.lock().expect("lock poisoned");
        if items.is_empty() {
            return Vec::new();
        }
        std::mem::replace(&mut *items, Vec::with_capacity(self.capacity()))
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.items.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items discarded because the backlog was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TelemetryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBuffer")
            .field("capacity", &self.capacity())
            .field("backlog_size", &self.backlog_size())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counting_buffer(capacity: usize) -> (TelemetryBuffer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let buffer = TelemetryBuffer::new(
            capacity,
            Arc::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (buffer, fired)
    }

    fn item(name: &str) -> TelemetryItem {
        TelemetryItem::new(name, json!(null))
    }

    #[test]
    fn test_full_signal_and_drain_order() {
        let (buffer, fired) = counting_buffer(2);

        buffer.enqueue(item("first"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        buffer.enqueue(item("second"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let drained = buffer.drain();
        let names: Vec<&str> = drained.iter().map(TelemetryItem::name).collect();
        assert_eq!(names, vec!["first", "second"]);

        assert!(buffer.drain().is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_capacity_below_one_resets_to_default() {
        let (buffer, _) = counting_buffer(0);
        assert_eq!(buffer.capacity(), DEFAULT_BUFFER_CAPACITY);

        buffer.set_capacity(10);
        assert_eq!(buffer.capacity(), 10);

        buffer.set_capacity(0);
        assert_eq!(buffer.capacity(), DEFAULT_BUFFER_CAPACITY);
    }

    #[test]
    fn test_full_signal_keeps_firing_until_drained() {
        let (buffer, fired) = counting_buffer(1);

        buffer.enqueue(item("a"));
        buffer.enqueue(item("b"));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(buffer.drain().len(), 2);
    }

    #[test]
    fn test_backlog_drops_overflow() {
        let (buffer, _) = counting_buffer(2);
        buffer.set_backlog_size(3);

        for i in 0..5 {
            buffer.enqueue(item(&format!("item-{i}")));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 2);
    }

    #[test]
    fn test_backlog_never_below_capacity() {
        let (buffer, _) = counting_buffer(10);
        buffer.set_backlog_size(1);
        assert_eq!(buffer.backlog_size(), 10);
    }

    #[test]
    fn test_concurrent_enqueue_and_drain() {
        use std::thread;

        let (buffer, _) = counting_buffer(50);
        let buffer = Arc::new(buffer);

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..250 {
                        buffer.enqueue(item(&format!("{p}-{i}")));
                    }
                })
            })
            .collect();

        let drainer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut total = 0;
                for _ in 0..20 {
                    total += buffer.drain().len();
                    thread::yield_now();
                }
                total
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        let drained = drainer.join().unwrap() + buffer.drain().len();
        assert_eq!(drained, 1000);
    }
}
