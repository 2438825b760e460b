// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A completed telemetry event handed to the channel by instrumentation code.
///
/// The channel treats the payload as opaque. The only fields it looks at are the
/// correlation id, which keeps related events under one sampling decision, and the
/// sampling percentage, which is set once the item has been sampled (either
/// upstream or by the channel itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryItem {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sampling_percentage: Option<f64>,
    #[serde(default)]
    payload: Value,
}

impl TelemetryItem {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            correlation_id: None,
            sampling_percentage: None,
            payload,
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Marks the item as already sampled at the given percentage. The channel
    /// keeps such items without sampling them a second time.
    #[must_use]
    pub fn with_sampling_percentage(mut self, percentage: f64) -> Self {
        self.sampling_percentage = Some(percentage);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn sampling_percentage(&self) -> Option<f64> {
        self.sampling_percentage
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub(crate) fn set_sampling_percentage(&mut self, percentage: f64) {
        self.sampling_percentage = Some(percentage);
    }
}
