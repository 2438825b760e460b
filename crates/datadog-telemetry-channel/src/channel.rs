// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::buffer::TelemetryBuffer;
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::http::HttpSender;
use crate::item::TelemetryItem;
use crate::queue::TransmissionQueue;
use crate::sampling::AdaptiveSampler;
use crate::serializer::{JsonLinesSerializer, Serializer};
use crate::stats::{ChannelCounters, ChannelStats};
use crate::store::{PersistentStore, StoreConfig};
use crate::transmitter::{Transmitter, TransmitterHandle, TransmitterParts, TransmitterSettings};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Producer-facing entry point of the pipeline.
///
/// `send` samples the item and appends it to the buffer; everything else
/// happens on a background task spawned on the current tokio runtime. Several
/// channels can live in one process, they share nothing.
pub struct TelemetryChannel {
    sampler: Arc<AdaptiveSampler>,
    buffer: Arc<TelemetryBuffer>,
    handle: TransmitterHandle,
    queue: Arc<TransmissionQueue>,
    store: Option<PersistentStore>,
    counters: Arc<ChannelCounters>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TelemetryChannel {
    /// Starts a channel with the JSON-lines serializer, compressed when the
    /// configuration asks for it.
    pub fn with_defaults(
        config: ChannelConfig,
        sender: Arc<dyn HttpSender>,
    ) -> Result<Self, ChannelError> {
        let serializer = if config.compression {
            JsonLinesSerializer::with_compression(config.compression_level)
        } else {
            JsonLinesSerializer::new()
        };
        Self::start(config, sender, Arc::new(serializer))
    }

    /// Starts a channel, opening the persistent store at `storage_path` when
    /// one is configured.
    pub fn start(
        config: ChannelConfig,
        sender: Arc<dyn HttpSender>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        let store = match &config.storage_path {
            Some(path) => Some(PersistentStore::open_local(path, store_config(&config))?),
            None => None,
        };
        Self::start_with_store(config, sender, serializer, store)
    }

    /// Starts a channel over an already opened store.
    pub fn start_with_store(
        config: ChannelConfig,
        sender: Arc<dyn HttpSender>,
        serializer: Arc<dyn Serializer>,
        store: Option<PersistentStore>,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| ChannelError::Runtime(e.to_string()))?;

        let flush_signal = Arc::new(Notify::new());
        let signal = Arc::clone(&flush_signal);
        let buffer = Arc::new(TelemetryBuffer::new(
            config.buffer_capacity,
            Arc::new(move || signal.notify_one()),
        ));
        let sampler = Arc::new(AdaptiveSampler::new(&config.sampling));
        let counters = Arc::new(ChannelCounters::default());

        let (transmitter, handle) = Transmitter::new(
            TransmitterSettings {
                endpoint: config.endpoint.clone(),
                request_timeout: config.request_timeout,
                sending_interval: config.sending_interval,
                queue_capacity_bytes: config.queue_capacity_bytes,
                max_sender_concurrency: config.max_sender_concurrency,
                backoff_slot: config.backoff_slot,
                backoff_max_delay: config.backoff_max_delay,
                shutdown_timeout: config.shutdown_timeout,
            },
            TransmitterParts {
                buffer: Arc::clone(&buffer),
                flush_signal,
                serializer,
                sampler: Arc::clone(&sampler),
                sender,
                store: store.clone(),
                counters: Arc::clone(&counters),
            },
        );
        let queue = transmitter.queue();

        let cancel = CancellationToken::new();
        let task = runtime.spawn(transmitter.run(cancel.clone()));
        debug!(
            "Telemetry channel started for {} (store: {})",
            config.endpoint,
            store
                .as_ref()
                .map_or("disabled".to_string(), |s| s.dir().display().to_string())
        );

        Ok(Self {
            sampler,
            buffer,
            handle,
            queue,
            store,
            counters,
            cancel,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Hands an item to the pipeline. Never blocks and never fails; items sent
    /// after shutdown are discarded.
    pub fn send(&self, item: TelemetryItem) {
        if self.closed.load(Ordering::Acquire) {
            debug!("Telemetry channel is shut down, discarding {}", item.name());
            return;
        }
        if let Some(item) = self.sampler.sample(item) {
            self.buffer.enqueue(item);
        }
    }

    /// Serializes the buffered items and starts sending them without waiting
    /// for the sending interval.
    pub async fn flush(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.handle.flush().await.map_err(ChannelError::Runtime)
    }

    pub fn stats(&self) -> ChannelStats {
        let mut stats = ChannelStats {
            items_sampled_out: self.sampler.sampled_out(),
            items_dropped: self.buffer.dropped(),
            sampling_percentage: self.sampler.percentage(),
            queued_bytes: self.queue.size(),
            stored_files: self.store.as_ref().map_or(0, PersistentStore::len),
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    /// Stops the background task after a final bounded flush. Unsent
    /// transmissions end up in the persistent store when there is one.
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::Closed);
        }
        self.cancel.cancel();

        let task = {
            #[allow(clippy::expect_used)]
            let mut task = self.task.lock().expect("lock poisoned");
            task.take()
        };
        if let Some(task) = task {
            task.await
                .map_err(|e| ChannelError::Runtime(format!("Transmitter task failed: {}", e)))?;
        }
        debug!("Telemetry channel shut down");
        Ok(())
    }
}

impl Drop for TelemetryChannel {
    fn drop(&mut self) {
        // The transmitter still runs its final flush in the background.
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TelemetryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryChannel")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

pub fn store_config(config: &ChannelConfig) -> StoreConfig {
    StoreConfig {
        max_files: config.storage_max_files,
        capacity_bytes: config.storage_capacity_bytes,
        transmission_timeout: config.request_timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmission::{HttpResponse, SendOutcome, Transmission};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSender {
        requests: AtomicUsize,
    }

    #[async_trait]
    impl HttpSender for CountingSender {
        async fn post(&self, _transmission: &Transmission) -> SendOutcome {
            self.requests.fetch_add(1, Ordering::SeqCst);
            SendOutcome::Response(HttpResponse {
                status: StatusCode::OK,
                retry_after: None,
                content: None,
            })
        }
    }

    #[test]
    fn test_start_requires_runtime() {
        let result = TelemetryChannel::with_defaults(
            ChannelConfig::default(),
            Arc::new(CountingSender::default()),
        );
        assert!(matches!(result, Err(ChannelError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = ChannelConfig {
            max_sender_concurrency: 0,
            ..Default::default()
        };
        let result = TelemetryChannel::with_defaults(config, Arc::new(CountingSender::default()));
        assert!(matches!(result, Err(ChannelError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_flush_and_stats() {
        let sender = Arc::new(CountingSender::default());
        let channel = TelemetryChannel::with_defaults(ChannelConfig::default(), sender.clone())
            .expect("channel starts");

        channel.send(TelemetryItem::new("event", json!({"n": 1})));
        channel.send(TelemetryItem::new("event", json!({"n": 2})));
        channel.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sender.requests.load(Ordering::SeqCst), 1);
        let stats = channel.stats();
        assert_eq!(stats.transmissions_sent, 1);
        assert_eq!(stats.items_sampled_out, 0);
        assert!((stats.sampling_percentage - 100.0).abs() < f64::EPSILON);

        channel.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sending_interval_flushes() {
        let sender = Arc::new(CountingSender::default());
        let config = ChannelConfig {
            sending_interval: Duration::from_secs(1),
            ..Default::default()
        };
        let channel = TelemetryChannel::with_defaults(config, sender.clone()).unwrap();

        channel.send(TelemetryItem::new("event", json!(null)));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(sender.requests.load(Ordering::SeqCst), 1);

        channel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let sender = Arc::new(CountingSender::default());
        let channel = TelemetryChannel::with_defaults(ChannelConfig::default(), sender.clone())
            .expect("channel starts");

        channel.send(TelemetryItem::new("event", json!(1)));
        channel.shutdown().await.unwrap();
        assert_eq!(sender.requests.load(Ordering::SeqCst), 1);

        // Further use is a no-op or an error, never a panic.
        channel.send(TelemetryItem::new("event", json!(2)));
        assert!(matches!(channel.flush().await, Err(ChannelError::Closed)));
        assert!(matches!(channel.shutdown().await, Err(ChannelError::Closed)));
    }
}
