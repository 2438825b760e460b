// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the transmitter task and read by the channel.
#[derive(Debug, Default)]
pub struct ChannelCounters {
    pub transmissions_sent: AtomicU64,
    pub transmissions_retried: AtomicU64,
    pub transmissions_stored: AtomicU64,
    pub transmissions_dropped: AtomicU64,
    pub serialization_failures: AtomicU64,
}

impl ChannelCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of what the channel did with the items it was given.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelStats {
    /// Items discarded by the sampler.
    pub items_sampled_out: u64,
    /// Items discarded because the buffer backlog was full.
    pub items_dropped: u64,
    pub transmissions_sent: u64,
    pub transmissions_retried: u64,
    /// Transmissions written to the persistent store.
    pub transmissions_stored: u64,
    /// Transmissions discarded: rejected by the intake, or no room left
    /// anywhere.
    pub transmissions_dropped: u64,
    pub serialization_failures: u64,
    pub sampling_percentage: f64,
    pub queued_bytes: usize,
    pub stored_files: usize,
}

impl ChannelCounters {
    pub(crate) fn fill(&self, stats: &mut ChannelStats) {
        stats.transmissions_sent = self.transmissions_sent.load(Ordering::Relaxed);
        stats.transmissions_retried = self.transmissions_retried.load(Ordering::Relaxed);
        stats.transmissions_stored = self.transmissions_stored.load(Ordering::Relaxed);
        stats.transmissions_dropped = self.transmissions_dropped.load(Ordering::Relaxed);
        stats.serialization_failures = self.serialization_failures.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_copies_counters() {
        let counters = ChannelCounters::default();
        ChannelCounters::incr(&counters.transmissions_sent);
        ChannelCounters::incr(&counters.transmissions_sent);
        ChannelCounters::incr(&counters.transmissions_dropped);

        let mut stats = ChannelStats::default();
        counters.fill(&mut stats);
        assert_eq!(stats.transmissions_sent, 2);
        assert_eq!(stats.transmissions_dropped, 1);
        assert_eq!(stats.transmissions_stored, 0);
    }
}
