// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use uuid::Uuid;

/// Misuse of a [`crate::transmission::Transmission`].
#[derive(Debug, thiserror::Error)]
pub enum TransmissionError {
    #[error("Invalid transmission argument: {0}")]
    InvalidArgument(String),

    #[error("Transmission {0} is already being sent")]
    AlreadyInFlight(Uuid),
}

/// Errors raised by the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Stored transmission {0} no longer exists")]
    NotFound(String),

    #[error("Stored transmission {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("Failed to encode telemetry items: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to compress payload: {0}")]
    Compress(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that can occur when starting or driving a telemetry channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Channel already shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::Invalid("endpoint must use http or https".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: endpoint must use http or https"
        );

        let error = StoreError::Corrupt {
            name: "a.trn".to_string(),
            reason: "missing header".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Stored transmission a.trn is corrupt: missing header"
        );
    }

    #[test]
    fn test_channel_error_is_transparent() {
        let error: ChannelError = ConfigError::Invalid("zero senders".into()).into();
        assert_eq!(error.to_string(), "Invalid configuration: zero senders");

        let error: ChannelError =
            StoreError::from(io::Error::new(io::ErrorKind::Other, "disk full")).into();
        assert_eq!(error.to_string(), "Storage I/O error: disk full");
    }

    #[test]
    fn test_already_in_flight_mentions_id() {
        let id = Uuid::new_v4();
        let error = TransmissionError::AlreadyInFlight(id);
        assert!(error.to_string().contains(&id.to_string()));
    }
}
