// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interprets send outcomes and throttles the pipeline while the intake is
//! unhealthy.
//!
//! ```text
//!            retryable failure
//!   Normal ─────────────────────> Backing off
//!  (gate open)                    (gate closed)
//!      ^                              │
//!      └──────── timer expired ───────┘
//! ```
//!
//! While the gate is closed the transmitter cannot queue or send, so every
//! transmission is routed to the persistent store until the timer reopens it.

use crate::gate::{Capacity, Gate, GateWriter};
use crate::transmission::SendOutcome;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Statuses worth retrying. Everything else outside 2xx is dropped.
pub const RETRYABLE_STATUS_CODES: [StatusCode; 6] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Deadline used when `now + delay` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

pub fn is_retryable(status: StatusCode) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Success,
    /// Keep the transmission for later; the gate has been closed.
    Retry,
    /// Permanently discard the transmission.
    Drop,
}

/// `max(slot, min(slot * (2^n - 1) / 2, max_delay))` for `n` consecutive
/// failures.
pub fn compute_delay(slot: Duration, max_delay: Duration, consecutive_failures: u32) -> Duration {
    let exponent = i32::try_from(consecutive_failures).unwrap_or(i32::MAX);
    let backoff = slot.as_secs_f64() * (2f64.powi(exponent) - 1.0) / 2.0;
    let capped = backoff.min(max_delay.as_secs_f64());
    Duration::try_from_secs_f64(capped)
        .unwrap_or(max_delay)
        .max(slot)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackoffState {
    pub consecutive_failures: u32,
    pub current_delay: Duration,
    /// When the gate reopens. `None` while not backing off.
    pub restore_at: Option<Instant>,
}

#[derive(Debug)]
pub struct BackoffPolicy {
    gate: GateWriter,
    slot: Duration,
    max_delay: Duration,
    state: BackoffState,
    dropped: u64,
}

impl BackoffPolicy {
    /// Takes the only writer of the gate.
    pub fn new(gate: GateWriter, slot: Duration, max_delay: Duration) -> Self {
        Self {
            gate,
            slot,
            max_delay,
            state: BackoffState::default(),
            dropped: 0,
        }
    }

    pub fn subscribe(&self) -> Gate {
        self.gate.subscribe()
    }

    pub fn state(&self) -> &BackoffState {
        &self.state
    }

    pub fn is_backing_off(&self) -> bool {
        self.state.restore_at.is_some()
    }

    pub fn restore_at(&self) -> Option<Instant> {
        self.state.restore_at
    }

    /// Transmissions this policy decided to drop.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn handle(&mut self, id: Uuid, outcome: &SendOutcome, now: Instant) -> PolicyAction {
        match outcome {
            SendOutcome::Response(response) if response.status.is_success() => {
                if response.status == StatusCode::PARTIAL_CONTENT {
                    let size = response.content.as_ref().map_or(0, |body| body.len());
                    warn!(
                        "Transmission {} partially accepted, response body of {} bytes",
                        id, size
                    );
                }
                self.state.consecutive_failures = 0;
                PolicyAction::Success
            }
            SendOutcome::Response(response) if is_retryable(response.status) => {
                debug!(
                    "Transmission {} failed with retryable status {}",
                    id, response.status
                );
                self.back_off(response.retry_after, now);
                PolicyAction::Retry
            }
            SendOutcome::Response(response) => {
                self.dropped += 1;
                error!(
                    "Data loss: transmission {} rejected with status {}, dropping",
                    id, response.status
                );
                PolicyAction::Drop
            }
            SendOutcome::TransportFailure(reason) => {
                debug!("Transmission {} failed without response: {}", id, reason);
                self.back_off(None, now);
                PolicyAction::Retry
            }
            SendOutcome::LocalFailure(reason) => {
                self.dropped += 1;
                error!(
                    "Data loss: transmission {} could not be sent: {}, dropping",
                    id, reason
                );
                PolicyAction::Drop
            }
        }
    }

    fn back_off(&mut self, retry_after: Option<Duration>, now: Instant) {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        // Retry-After is server-controlled, never wait longer than max_delay.
        let delay = match retry_after {
            Some(retry_after) => retry_after.min(self.max_delay),
            None => compute_delay(self.slot, self.max_delay, self.state.consecutive_failures),
        };
        self.state.current_delay = delay;

        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + FAR_FUTURE);
        self.state.restore_at = Some(match self.state.restore_at {
            Some(existing) => existing.max(deadline),
            None => deadline,
        });

        if self.gate.set(Capacity::CLOSED) {
            warn!(
                "Telemetry intake unavailable, pausing transmissions for {:?}",
                delay
            );
        }
    }

    /// Reopens the gate once the restore deadline has passed. Returns true if
    /// it did.
    pub fn on_timer(&mut self, now: Instant) -> bool {
        match self.state.restore_at {
            Some(deadline) if deadline <= now => {
                self.state.restore_at = None;
                self.gate.set(Capacity::UNRESTRICTED);
                debug!("Resuming transmissions");
                true
            }
            _ => false,
        }
    }
}
