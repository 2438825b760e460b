// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::TransmissionError;
use crate::http::HttpSender;
use crate::store::StoreLease;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// What the intake answered.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub retry_after: Option<Duration>,
    /// Only captured for 206 Partial Content.
    pub content: Option<Bytes>,
}

/// Result of one send attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Response(HttpResponse),
    /// No response: connect errors, resets and timeouts.
    TransportFailure(String),
    /// The request could not be built or authenticated locally.
    LocalFailure(String),
}

impl SendOutcome {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Response(response) => Some(response.status),
            _ => None,
        }
    }
}

/// One serialized batch bound for the intake.
///
/// A `Transmission` is deliberately not `Clone`: each value represents a single
/// delivery attempt, and `send` refuses to run twice at the same time. When it
/// was read back from the persistent store it carries the store lease until the
/// transmitter commits or releases it.
#[derive(Debug)]
pub struct Transmission {
    id: Uuid,
    endpoint: Url,
    content: Bytes,
    content_type: String,
    content_encoding: Option<String>,
    timeout: Duration,
    in_flight: AtomicBool,
    lease: Option<StoreLease>,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Transmission {
    pub fn new(
        endpoint: &str,
        content: impl Into<Bytes>,
        content_type: impl Into<String>,
        content_encoding: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransmissionError> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            TransmissionError::InvalidArgument(format!("endpoint {endpoint:?}: {e}"))
        })?;
        if endpoint.scheme() != "http" && endpoint.scheme() != "https" {
            return Err(TransmissionError::InvalidArgument(format!(
                "endpoint scheme must be http or https, got {}",
                endpoint.scheme()
            )));
        }

        let content = content.into();
        if content.is_empty() {
            return Err(TransmissionError::InvalidArgument(
                "content must not be empty".to_string(),
            ));
        }

        let content_type = content_type.into();
        if content_type.trim().is_empty() {
            return Err(TransmissionError::InvalidArgument(
                "content type must not be empty".to_string(),
            ));
        }

        if timeout.is_zero() {
            return Err(TransmissionError::InvalidArgument(
                "timeout must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            endpoint,
            content,
            content_type,
            content_encoding: content_encoding.filter(|encoding| !encoding.is_empty()),
            timeout,
            in_flight: AtomicBool::new(false),
            lease: None,
        })
    }

    /// Keeps the id a stored transmission was written with.
    pub(crate) fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub(crate) fn attach_lease(&mut self, lease: StoreLease) {
        self.lease = Some(lease);
    }

    pub(crate) fn take_lease(&mut self) -> Option<StoreLease> {
        self.lease.take()
    }

    pub fn is_stored(&self) -> bool {
        self.lease.is_some()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Size in bytes accounted against queue capacity.
    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Sends the transmission once, bounded by its timeout. A timeout cancels
    /// the request and is reported as a transport failure.
    pub async fn send(&self, sender: &dyn HttpSender) -> Result<SendOutcome, TransmissionError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransmissionError::AlreadyInFlight(self.id));
        }
        let _guard = InFlightGuard(&self.in_flight);

        match tokio::time::timeout(self.timeout, sender.post(self)).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                debug!(
                    "Transmission {} timed out after {:?}",
                    self.id, self.timeout
                );
                Ok(SendOutcome::TransportFailure(format!(
                    "request timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}
