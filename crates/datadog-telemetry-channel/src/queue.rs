// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-bounded FIFO of transmissions waiting for a sender.

use crate::gate::Gate;
use crate::transmission::Transmission;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug)]
pub enum EnqueueResult {
    Enqueued,
    /// The producer had nothing to give.
    Empty,
    /// No room. Carries the transmission when the producer had already been
    /// called, so the caller can route it elsewhere.
    Rejected(Option<Transmission>),
}

#[derive(Debug, Default)]
struct QueueState {
    size: usize,
    items: VecDeque<Transmission>,
}

/// Effective capacity is the smaller of the configured byte capacity and the
/// gate's queue limit, so a closed gate rejects everything.
#[derive(Debug)]
pub struct TransmissionQueue {
    capacity: usize,
    gate: Gate,
    state: Mutex<QueueState>,
    dequeued: Arc<Notify>,
}

impl TransmissionQueue {
    pub fn new(capacity: usize, gate: Gate) -> Self {
        Self {
            capacity,
            gate,
            state: Mutex::new(QueueState::default()),
            dequeued: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }

    /// Configured byte capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn effective_capacity(&self) -> usize {
        self.gate.current().queue_limit(self.capacity)
    }

    /// Calls `producer` only while there is room. `Empty` tells a pumping
    /// caller to stop.
    pub fn enqueue<F>(&self, producer: F) -> EnqueueResult
    where
        F: FnOnce() -> Option<Transmission>,
    {
        if self.size() >= self.effective_capacity() {
            return EnqueueResult::Rejected(None);
        }

        let Some(transmission) = producer() else {
            return EnqueueResult::Empty;
        };

        match self.try_push(transmission) {
            Ok(()) => EnqueueResult::Enqueued,
            Err(transmission) => EnqueueResult::Rejected(Some(transmission)),
        }
    }

    /// Appends when the transmission fits, otherwise hands it back.
    pub fn try_push(&self, transmission: Transmission) -> Result<(), Transmission> {
        let capacity = self.effective_capacity();
        let mut state = self.lock();
        let size = transmission.size();
        if state.size.saturating_add(size) > capacity {
            return Err(transmission);
        }
        state.size += size;
        state.items.push_back(transmission);
        Ok(())
    }

    /// Pops the oldest transmission. Always signals "dequeued", even when the
    /// queue was empty, since that is what wakes a refill.
    pub fn dequeue(&self) -> Option<Transmission> {
        let transmission = {
            let mut state = self.lock();
            let transmission = state.items.pop_front();
            if let Some(t) = &transmission {
                state.size -= t.size();
            }
            transmission
        };
        self.dequeued.notify_one();
        transmission
    }

    pub fn drain_all(&self) -> Vec<Transmission> {
        let mut state = self.lock();
        state.size = 0;
        state.items.drain(..).collect()
    }

    pub fn size(&self) -> usize {
        self.lock().size
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dequeued_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.dequeued)
    }
}
