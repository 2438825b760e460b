// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns a drained buffer into the bytes of one transmission.
//!
//! The wire format belongs to the intake, so the channel only depends on the
//! [`Serializer`] trait. [`JsonLinesSerializer`] is the default: one JSON document
//! per line, optionally zstd-compressed.

use crate::error::SerializeError;
use crate::item::TelemetryItem;
use bytes::Bytes;
use std::io::Write;
use zstd::stream::write::Encoder;

pub const JSON_STREAM_CONTENT_TYPE: &str = "application/x-json-stream";
pub const ZSTD_CONTENT_ENCODING: &str = "zstd";

#[derive(Debug, Clone, PartialEq)]
pub struct SerializedBatch {
    pub content: Bytes,
    pub content_type: String,
    pub content_encoding: Option<String>,
}

pub trait Serializer: Send + Sync {
    fn serialize(&self, items: &[TelemetryItem]) -> Result<SerializedBatch, SerializeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesSerializer {
    compression_level: Option<i32>,
}

impl JsonLinesSerializer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_compression(level: i32) -> Self {
        Self {
            compression_level: Some(level),
        }
    }

    fn encode(&self, items: &[TelemetryItem]) -> Result<Vec<u8>, SerializeError> {
        let mut buffer = Vec::with_capacity(items.len() * 128);
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                buffer.push(b'\n');
            }
            serde_json::to_writer(&mut buffer, item)?;
        }
        Ok(buffer)
    }
}

impl Serializer for JsonLinesSerializer {
    fn serialize(&self, items: &[TelemetryItem]) -> Result<SerializedBatch, SerializeError> {
        let data = self.encode(items)?;

        let Some(level) = self.compression_level else {
            return Ok(SerializedBatch {
                content: Bytes::from(data),
                content_type: JSON_STREAM_CONTENT_TYPE.to_string(),
                content_encoding: None,
            });
        };

        let mut encoder = Encoder::new(Vec::new(), level)?;
        encoder.write_all(&data)?;
        let compressed = encoder.finish()?;

        Ok(SerializedBatch {
            content: Bytes::from(compressed),
            content_type: JSON_STREAM_CONTENT_TYPE.to_string(),
            content_encoding: Some(ZSTD_CONTENT_ENCODING.to_string()),
        })
    }
}
