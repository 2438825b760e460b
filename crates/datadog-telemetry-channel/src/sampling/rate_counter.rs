// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counts events per interval and keeps an exponential moving average of the
/// per-interval counts.
#[derive(Debug)]
pub struct RateCounter {
    count: AtomicU64,
    average: Mutex<Option<f64>>,
    coefficient: f64,
}

impl RateCounter {
    /// `coefficient` is the weight given to the newest interval and is clamped
    /// to `[0, 1]`.
    pub fn new(coefficient: f64) -> Self {
        let coefficient = if coefficient.is_nan() {
            1.0
        } else {
            coefficient.clamp(0.0, 1.0)
        };
        Self {
            count: AtomicU64::new(0),
            average: Mutex::new(None),
            coefficient,
        }
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Closes the current interval and folds its count into the average.
    /// The first interval has no history, so the average becomes the raw count.
    pub fn start_new_interval(&self) -> f64 {
        let count = self.count.swap(0, Ordering::Relaxed) as f64;

        #[allow(clippy::expect_used)]
        let mut average = self.average.lock().expect("lock poisoned");
        let updated = match *average {
            Some(previous) => self.coefficient * count + (1.0 - self.coefficient) * previous,
            None => count,
        };
        *average = Some(updated);
        updated
    }

    pub fn average(&self) -> Option<f64> {
        #[allow(clippy::expect_used)]
        *self.average.lock().expect("lock poisoned")
    }

    /// Events counted since the last interval started.
    pub fn current(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
