// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Datadog Telemetry Channel
//!
//! The delivery pipeline that sits between instrumented code and a remote
//! telemetry intake. Events are sampled, buffered in memory, serialized into
//! batches and shipped over HTTP. Batches that cannot be sent right away are
//! spilled to a directory on disk and picked up again once the intake
//! recovers, including after a process restart.
//!
//! ```text
//!   send(item)
//!       │
//!       v
//!   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!   │   Sampler    │──>│    Buffer    │──>│  Serializer  │
//!   └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                                │ Transmission
//!                                                v
//!   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!   │  HttpSender  │<──│    Queue     │<─>│    Store     │
//!   └──────┬───────┘   └──────────────┘   └──────────────┘
//!          │ outcome          ^ gate
//!          v                  │
//!   ┌──────────────┐          │
//!   │   Backoff    │──────────┘
//!   └──────────────┘
//! ```
//!
//! Producers never block: every stage drops (and counts) instead of applying
//! backpressure to the host application.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backoff;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod credential;
pub mod error;
pub mod gate;
pub mod http;
pub mod item;
pub mod logger;
pub mod queue;
pub mod sampling;
pub mod serializer;
pub mod stats;
pub mod store;
pub mod transmission;
pub mod transmitter;

pub use channel::TelemetryChannel;
pub use config::{ChannelConfig, SamplingConfig};
pub use item::TelemetryItem;
