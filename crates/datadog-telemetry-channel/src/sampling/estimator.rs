// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Control loop that keeps the kept-item throughput near a target.
//!
//! The sampling decision is stored as an integer rate `N` ("keep one item in
//! `N`"), the percentage being `100 / N`. Every evaluation the smoothed rate of
//! kept items is compared with the target and `N` is scaled by the ratio. A 10%
//! tolerance band and separate cool-downs for decreasing and increasing the
//! percentage keep it from oscillating.

use crate::config::SamplingConfig;
use crate::sampling::rate_counter::RateCounter;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Lowest percentage the estimator can be configured with.
pub const MIN_PERCENTAGE: f64 = 0.001;
pub const MAX_PERCENTAGE: f64 = 100.0;

/// Relative deviation from the target tolerated before the rate changes.
pub const RATE_TOLERANCE: f64 = 0.1;

#[derive(Debug, Default)]
struct EstimatorState {
    last_decrease: Option<Instant>,
    last_increase: Option<Instant>,
    observed_rate: Option<f64>,
}

#[derive(Debug)]
pub struct SamplingEstimator {
    counter: RateCounter,
    target_items_per_second: f64,
    min_rate: u32,
    max_rate: u32,
    evaluation_interval: Duration,
    decrease_timeout: Duration,
    increase_timeout: Duration,
    rate: AtomicU32,
    state: Mutex<EstimatorState>,
}

fn clamp_percentage(percentage: f64) -> f64 {
    if percentage.is_nan() {
        return MAX_PERCENTAGE;
    }
    percentage.clamp(MIN_PERCENTAGE, MAX_PERCENTAGE)
}

fn percentage_to_rate(percentage: f64) -> u32 {
    (MAX_PERCENTAGE / clamp_percentage(percentage)).round() as u32
}

impl SamplingEstimator {
    pub fn new(config: &SamplingConfig) -> Self {
        let target_items_per_second = if config.target_items_per_second > 0.0 {
            config.target_items_per_second
        } else {
            f64::EPSILON
        };

        let mut min_percentage = clamp_percentage(config.min_percentage);
        let mut max_percentage = clamp_percentage(config.max_percentage);
        if min_percentage > max_percentage {
            std::mem::swap(&mut min_percentage, &mut max_percentage);
        }

        // A high percentage means a low rate.
        let min_rate = ((MAX_PERCENTAGE / max_percentage).ceil() as u32).max(1);
        let max_rate = ((MAX_PERCENTAGE / min_percentage + 1e-9).floor() as u32).max(min_rate);
        let rate = percentage_to_rate(config.initial_percentage).clamp(min_rate, max_rate);

        Self {
            counter: RateCounter::new(config.moving_average_ratio),
            target_items_per_second,
            min_rate,
            max_rate,
            evaluation_interval: config.evaluation_interval,
            decrease_timeout: config.decrease_timeout,
            increase_timeout: config.increase_timeout,
            rate: AtomicU32::new(rate),
            state: Mutex::new(EstimatorState::default()),
        }
    }

    /// Records one kept item.
    pub fn record_kept(&self) {
        self.counter.increment();
    }

    pub fn percentage(&self) -> f64 {
        MAX_PERCENTAGE / f64::from(self.rate())
    }

    pub fn rate(&self) -> u32 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn evaluation_interval(&self) -> Duration {
        self.evaluation_interval
    }

    /// Smoothed kept items per second as of the last evaluation.
    pub fn observed_rate(&self) -> Option<f64> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").observed_rate
    }

    /// Closes the current interval and adjusts the rate. Returns the new
    /// percentage when it changed.
    pub fn evaluate(&self, now: Instant) -> Option<f64> {
        let average = self.counter.start_new_interval();
        let interval_secs = self.evaluation_interval.as_secs_f64().max(f64::EPSILON);
        let observed = average / interval_secs;
        let ratio = observed / self.target_items_per_second;

        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        state.observed_rate = Some(observed);

        let current = self.rate();
        let suggested = (f64::from(current) * ratio)
            .ceil()
            .clamp(f64::from(self.min_rate), f64::from(self.max_rate)) as u32;

        let elapsed = |since: Option<Instant>, timeout: Duration| match since {
            Some(at) => now.saturating_duration_since(at) >= timeout,
            None => true,
        };

        if ratio > 1.0 + RATE_TOLERANCE
            && suggested > current
            && elapsed(state.last_decrease, self.decrease_timeout)
        {
            state.last_decrease = Some(now);
        } else if ratio < 1.0 - RATE_TOLERANCE
            && suggested < current
            && elapsed(state.last_increase, self.increase_timeout)
        {
            state.last_increase = Some(now);
        } else {
            return None;
        }

        self.rate.store(suggested, Ordering::Relaxed);
        let percentage = MAX_PERCENTAGE / f64::from(suggested);
        debug!(
            "Sampling percentage changed from {:.3} to {:.3} (observed {:.2} items/s, target {:.2})",
            MAX_PERCENTAGE / f64::from(current),
            percentage,
            observed,
            self.target_items_per_second
        );
        Some(percentage)
    }
}
