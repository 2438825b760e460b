// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Maps correlation ids to a score in `[0, 100)`.
//!
//! Items sharing an id get the same score and therefore the same sampling
//! decision, so a sampled operation is kept or dropped as a whole.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Short ids are repeated up to this length before hashing.
const MIN_HASH_INPUT_LENGTH: usize = 8;

/// What to score an item that has no correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingCorrelation {
    /// Uniformly random score, so uncorrelated items are sampled independently.
    #[default]
    Random,
    /// Score 0, so uncorrelated items are always kept.
    Zero,
}

impl FromStr for MissingCorrelation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "zero" => Ok(Self::Zero),
            other => Err(format!("unknown missing correlation policy: {other}")),
        }
    }
}

impl fmt::Display for MissingCorrelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::Zero => write!(f, "zero"),
        }
    }
}

/// Deterministic score for a correlation id. The empty id scores 0.
pub fn correlation_score(id: &str) -> f64 {
    if id.is_empty() {
        return 0.0;
    }

    let mut input = id.to_string();
    while input.encode_utf16().count() < MIN_HASH_INPUT_LENGTH {
        input.push_str(id);
    }

    let mut hash: i32 = 5381;
    for c in input.encode_utf16() {
        hash = hash.wrapping_mul(33).wrapping_add(i32::from(c));
    }

    let positive = if hash == i32::MIN {
        i32::MAX
    } else {
        hash.abs()
    };

    f64::from(positive) / 2f64.powi(31) * 100.0
}

/// Scores items, falling back to [`MissingCorrelation`] when an item has no id.
#[derive(Debug)]
pub struct CorrelationHasher {
    missing: MissingCorrelation,
    rng: Mutex<fastrand::Rng>,
}

impl CorrelationHasher {
    pub fn new(missing: MissingCorrelation) -> Self {
        Self {
            missing,
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Seeded hasher with a reproducible random fallback.
    pub fn with_seed(missing: MissingCorrelation, seed: u64) -> Self {
        Self {
            missing,
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }

    pub fn score(&self, correlation_id: Option<&str>) -> f64 {
        match correlation_id {
            Some(id) if !id.is_empty() => correlation_score(id),
            _ => match self.missing {
                MissingCorrelation::Zero => 0.0,
                MissingCorrelation::Random => {
                    #[allow(clippy::expect_used)]
                    let mut rng = self.rng.lock().expect("lock poisoned");
                    rng.f64() * 100.0
                }
            },
        }
    }
}
