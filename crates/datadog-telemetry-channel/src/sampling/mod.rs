// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adaptive, correlation-aware sampling.
//!
//! An item is kept iff its correlation score is below the current sampling
//! percentage. The percentage is owned by the [`estimator::SamplingEstimator`],
//! which the transmitter ticks once per evaluation interval.

pub mod estimator;
pub mod rate_counter;
pub mod score;

use crate::config::SamplingConfig;
use crate::item::TelemetryItem;
use estimator::{SamplingEstimator, MAX_PERCENTAGE};
use score::CorrelationHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct AdaptiveSampler {
    enabled: bool,
    hasher: CorrelationHasher,
    estimator: SamplingEstimator,
    sampled_out: AtomicU64,
}

impl AdaptiveSampler {
    pub fn new(config: &SamplingConfig) -> Self {
        Self::with_hasher(config, CorrelationHasher::new(config.missing_correlation))
    }

    pub fn with_hasher(config: &SamplingConfig, hasher: CorrelationHasher) -> Self {
        Self {
            enabled: config.enabled,
            hasher,
            estimator: SamplingEstimator::new(config),
            sampled_out: AtomicU64::new(0),
        }
    }

    /// Returns the item if it is kept. Kept items carry the percentage they
    /// were sampled at when it is below 100.
    pub fn sample(&self, mut item: TelemetryItem) -> Option<TelemetryItem> {
        if !self.enabled {
            return Some(item);
        }

        // Sampled upstream, keep the original decision.
        if item
            .sampling_percentage()
            .is_some_and(|percentage| percentage < MAX_PERCENTAGE)
        {
            self.estimator.record_kept();
            return Some(item);
        }

        let percentage = self.estimator.percentage();
        if self.hasher.score(item.correlation_id()) < percentage {
            if percentage < MAX_PERCENTAGE {
                item.set_sampling_percentage(percentage);
            }
            self.estimator.record_kept();
            Some(item)
        } else {
            self.sampled_out.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn evaluate(&self, now: Instant) -> Option<f64> {
        if !self.enabled {
            return None;
        }
        self.estimator.evaluate(now)
    }

    pub fn percentage(&self) -> f64 {
        self.estimator.percentage()
    }

    pub fn evaluation_interval(&self) -> Duration {
        self.estimator.evaluation_interval()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn sampled_out(&self) -> u64 {
        self.sampled_out.load(Ordering::Relaxed)
    }
}
