// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capacity limits shared between the backoff policy (writer) and the
//! transmitter (reader).
//!
//! The gate is a `watch` channel with exactly one [`GateWriter`]. The writer is
//! not `Clone`, so only whoever owns it (the backoff policy) can change limits.
//! Any number of [`Gate`] readers can observe them.

use tokio::sync::watch;

/// Limits imposed on the pipeline. `None` means unrestricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub queue: Option<usize>,
    pub senders: Option<usize>,
}

impl Capacity {
    pub const UNRESTRICTED: Self = Self {
        queue: None,
        senders: None,
    };

    /// Nothing is queued in memory and nothing is sent.
    pub const CLOSED: Self = Self {
        queue: Some(0),
        senders: Some(0),
    };

    pub fn allows_queue(&self) -> bool {
        self.queue != Some(0)
    }

    pub fn allows_sending(&self) -> bool {
        self.senders != Some(0)
    }

    pub fn queue_limit(&self, configured: usize) -> usize {
        self.queue.map_or(configured, |limit| limit.min(configured))
    }

    pub fn sender_limit(&self, configured: usize) -> usize {
        self.senders.map_or(configured, |limit| limit.min(configured))
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self::UNRESTRICTED
    }
}

/// Creates a gate starting unrestricted.
pub fn capacity_gate() -> (GateWriter, Gate) {
    let (tx, rx) = watch::channel(Capacity::UNRESTRICTED);
    (GateWriter { tx }, Gate { rx })
}

#[derive(Debug)]
pub struct GateWriter {
    tx: watch::Sender<Capacity>,
}

impl GateWriter {
    /// Returns true when the limits changed.
    pub fn set(&self, capacity: Capacity) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == capacity {
                false
            } else {
                *current = capacity;
                true
            }
        })
    }

    pub fn current(&self) -> Capacity {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> Gate {
        Gate {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Gate {
    rx: watch::Receiver<Capacity>,
}

impl Gate {
    pub fn current(&self) -> Capacity {
        *self.rx.borrow()
    }

    /// Waits for the next change. Returns false once the writer is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Marks the current value as seen and returns it.
    pub fn observe(&mut self) -> Capacity {
        *self.rx.borrow_and_update()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_limits() {
        assert!(Capacity::UNRESTRICTED.allows_queue());
        assert!(Capacity::UNRESTRICTED.allows_sending());
        assert_eq!(Capacity::UNRESTRICTED.queue_limit(1024), 1024);
        assert_eq!(Capacity::UNRESTRICTED.sender_limit(3), 3);

        assert!(!Capacity::CLOSED.allows_queue());
        assert!(!Capacity::CLOSED.allows_sending());
        assert_eq!(Capacity::CLOSED.queue_limit(1024), 0);

        let partial = Capacity {
            queue: Some(10),
            senders: Some(1),
        };
        assert_eq!(partial.queue_limit(1024), 10);
        assert_eq!(partial.sender_limit(3), 1);
        assert_eq!(partial.sender_limit(0), 0);
    }

    #[tokio::test]
    async fn test_reader_sees_writes() {
        let (writer, mut gate) = capacity_gate();
        assert_eq!(gate.current(), Capacity::UNRESTRICTED);

        assert!(writer.set(Capacity::CLOSED));
        assert!(gate.changed().await);
        assert_eq!(gate.observe(), Capacity::CLOSED);

        // Same value is not a change.
        assert!(!writer.set(Capacity::CLOSED));
        assert!(!gate.rx.has_changed().unwrap());

        assert!(writer.set(Capacity::UNRESTRICTED));
        assert_eq!(writer.subscribe().current(), Capacity::UNRESTRICTED);
    }

    #[tokio::test]
    async fn test_changed_returns_false_without_writer() {
        let (writer, mut gate) = capacity_gate();
        drop(writer);
        assert!(!gate.changed().await);
    }
}
