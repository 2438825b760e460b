// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background task moving batches from the buffer to the intake.
//!
//! The transmitter is the only owner of the queue's consumer side, the backoff
//! policy and the in-flight sends. One `run` loop per channel:
//!
//! 1. refill the queue from the persistent store while the gate allows it,
//! 2. start sends up to the sender limit,
//! 3. hand each finished send to the backoff policy,
//! 4. wait for the buffer to fill, the sending interval, a sampling tick, the
//!    backoff deadline, a finished send, a gate change or cancellation.

use crate::backoff::{BackoffPolicy, PolicyAction};
use crate::buffer::TelemetryBuffer;
use crate::error::TransmissionError;
use crate::gate::{capacity_gate, Gate};
use crate::http::HttpSender;
use crate::queue::{EnqueueResult, TransmissionQueue};
use crate::sampling::AdaptiveSampler;
use crate::serializer::Serializer;
use crate::stats::ChannelCounters;
use crate::store::{PersistentStore, StoreEntry};
use crate::transmission::{SendOutcome, Transmission};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

type SendResult = (Transmission, Result<SendOutcome, TransmissionError>);

#[derive(Debug, Clone)]
pub struct TransmitterSettings {
    pub endpoint: String,
    pub request_timeout: Duration,
    pub sending_interval: Duration,
    pub queue_capacity_bytes: usize,
    pub max_sender_concurrency: usize,
    pub backoff_slot: Duration,
    pub backoff_max_delay: Duration,
    pub shutdown_timeout: Duration,
}

/// Collaborators shared with the channel.
pub struct TransmitterParts {
    pub buffer: Arc<TelemetryBuffer>,
    /// Raised by the buffer when it reaches capacity.
    pub flush_signal: Arc<Notify>,
    pub serializer: Arc<dyn Serializer>,
    pub sampler: Arc<AdaptiveSampler>,
    pub sender: Arc<dyn HttpSender>,
    pub store: Option<PersistentStore>,
    pub counters: Arc<ChannelCounters>,
}

#[derive(Debug)]
pub enum TransmitterCommand {
    Flush(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct TransmitterHandle {
    tx: mpsc::UnboundedSender<TransmitterCommand>,
}

impl TransmitterHandle {
    /// Serializes whatever is buffered and starts sending it.
    pub async fn flush(&self) -> Result<(), String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(TransmitterCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {}", e))
    }
}

pub struct Transmitter {
    settings: TransmitterSettings,
    buffer: Arc<TelemetryBuffer>,
    flush_signal: Arc<Notify>,
    serializer: Arc<dyn Serializer>,
    sampler: Arc<AdaptiveSampler>,
    sender: Arc<dyn HttpSender>,
    store: Option<PersistentStore>,
    counters: Arc<ChannelCounters>,
    queue: Arc<TransmissionQueue>,
    policy: BackoffPolicy,
    gate: Gate,
    in_flight: JoinSet<SendResult>,
    rx: mpsc::UnboundedReceiver<TransmitterCommand>,
}

impl Transmitter {
    pub fn new(settings: TransmitterSettings, parts: TransmitterParts) -> (Self, TransmitterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (writer, gate) = capacity_gate();
        let queue = Arc::new(TransmissionQueue::new(
            settings.queue_capacity_bytes,
            gate.clone(),
        ));
        let policy = BackoffPolicy::new(writer, settings.backoff_slot, settings.backoff_max_delay);

        let transmitter = Self {
            settings,
            buffer: parts.buffer,
            flush_signal: parts.flush_signal,
            serializer: parts.serializer,
            sampler: parts.sampler,
            sender: parts.sender,
            store: parts.store,
            counters: parts.counters,
            queue,
            policy,
            gate,
            in_flight: JoinSet::new(),
            rx,
        };
        (transmitter, TransmitterHandle { tx })
    }

    pub fn queue(&self) -> Arc<TransmissionQueue> {
        Arc::clone(&self.queue)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("Transmitter started");

        let sending_interval = self.settings.sending_interval;
        let mut sending =
            tokio::time::interval_at(Instant::now() + sending_interval, sending_interval);
        sending.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let evaluation_interval = self.sampler.evaluation_interval();
        let mut sampling =
            tokio::time::interval_at(Instant::now() + evaluation_interval, evaluation_interval);
        sampling.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let dequeued = self.queue.dequeued_signal();
        let flush_signal = Arc::clone(&self.flush_signal);
        self.gate.observe();
        self.pump_store();

        loop {
            self.dispatch();
            let restore_at = self.policy.restore_at();
            let restore = tokio::time::sleep_until(restore_at.unwrap_or_else(Instant::now));

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(command) = self.rx.recv() => self.handle_command(command),
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.handle_joined(joined);
                }
                changed = self.gate.changed() => {
                    if changed {
                        self.apply_gate();
                    }
                }
                () = restore, if restore_at.is_some() => {
                    self.policy.on_timer(Instant::now());
                }
                () = flush_signal.notified() => self.flush_buffer(),
                _ = sending.tick() => self.flush_buffer(),
                _ = sampling.tick() => {
                    self.sampler.evaluate(Instant::now());
                }
                () = dequeued.notified() => self.pump_store(),
            }
        }

        self.shutdown().await;
        debug!("Transmitter stopped");
    }

    fn handle_command(&mut self, command: TransmitterCommand) {
        match command {
            TransmitterCommand::Flush(response_tx) => {
                self.flush_buffer();
                self.dispatch();
                if response_tx.send(()).is_err() {
                    debug!("Flush requester went away before completion");
                }
            }
        }
    }

    /// Turns the buffered items into a transmission.
    fn flush_buffer(&mut self) {
        let items = self.buffer.drain();
        if items.is_empty() {
            return;
        }

        let batch = match self.serializer.serialize(&items) {
            Ok(batch) => batch,
            Err(e) => {
                ChannelCounters::incr(&self.counters.serialization_failures);
                error!("Data loss: failed to serialize {} items: {}", items.len(), e);
                return;
            }
        };

        match Transmission::new(
            &self.settings.endpoint,
            batch.content,
            batch.content_type,
            batch.content_encoding,
            self.settings.request_timeout,
        ) {
            Ok(transmission) => {
                debug!(
                    "Created transmission {} with {} items ({} bytes)",
                    transmission.id(),
                    items.len(),
                    transmission.size()
                );
                self.enqueue(transmission);
            }
            Err(e) => {
                ChannelCounters::incr(&self.counters.serialization_failures);
                error!("Data loss: failed to create transmission: {}", e);
            }
        }
    }

    /// Queues in memory when there is room, otherwise persists.
    fn enqueue(&mut self, transmission: Transmission) {
        let transmission = match self.queue.try_push(transmission) {
            Ok(()) => return,
            Err(transmission) => transmission,
        };

        // Larger than the whole queue, it can only be sent on its own.
        if self.queue.is_empty() && self.has_free_sender() {
            self.spawn_send(transmission);
            return;
        }

        self.route_to_store(transmission);
    }

    /// Puts a transmission back where it can be picked up again. Transmissions
    /// read from the store only release their lease.
    fn route_to_store(&mut self, mut transmission: Transmission) {
        if let Some(lease) = transmission.take_lease() {
            lease.release();
            return;
        }

        let Some(store) = &self.store else {
            ChannelCounters::incr(&self.counters.transmissions_dropped);
            warn!(
                "Data loss: no room for transmission {} and no persistent store configured",
                transmission.id()
            );
            return;
        };

        match store.enqueue(&transmission) {
            Ok(true) => ChannelCounters::incr(&self.counters.transmissions_stored),
            Ok(false) => ChannelCounters::incr(&self.counters.transmissions_dropped),
            Err(e) => {
                ChannelCounters::incr(&self.counters.transmissions_dropped);
                error!(
                    "Data loss: failed to persist transmission {}: {}",
                    transmission.id(),
                    e
                );
            }
        }
    }

    /// Moves stored transmissions into the queue until it is full or the store
    /// has nothing left to lease.
    fn pump_store(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if !self.gate.current().allows_queue() {
            return;
        }

        loop {
            match self
                .queue
                .enqueue(|| store.peek().map(StoreEntry::into_transmission))
            {
                EnqueueResult::Enqueued => {}
                EnqueueResult::Empty | EnqueueResult::Rejected(None) => break,
                EnqueueResult::Rejected(Some(transmission)) => {
                    if transmission.size() > self.queue.capacity() && self.has_free_sender() {
                        self.spawn_send(transmission);
                    }
                    // Otherwise dropping it releases the lease for a later pump.
                    break;
                }
            }
        }
    }

    fn sender_limit(&self) -> usize {
        self.gate
            .current()
            .sender_limit(self.settings.max_sender_concurrency)
    }

    fn has_free_sender(&self) -> bool {
        self.in_flight.len() < self.sender_limit()
    }

    /// Starts sends for queued transmissions while senders are available.
    fn dispatch(&mut self) {
        while self.has_free_sender() && !self.queue.is_empty() {
            let Some(transmission) = self.queue.dequeue() else {
                break;
            };
            self.spawn_send(transmission);
        }
    }

    fn spawn_send(&mut self, transmission: Transmission) {
        let sender = Arc::clone(&self.sender);
        self.in_flight.spawn(async move {
            let outcome = transmission.send(sender.as_ref()).await;
            (transmission, outcome)
        });
    }

    fn handle_joined(&mut self, joined: Result<SendResult, JoinError>) {
        let (mut transmission, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                ChannelCounters::incr(&self.counters.transmissions_dropped);
                error!("Data loss: send task failed: {}", e);
                return;
            }
        };

        let outcome = outcome.unwrap_or_else(|e| SendOutcome::LocalFailure(e.to_string()));

        match self.policy.handle(transmission.id(), &outcome, Instant::now()) {
            PolicyAction::Success => {
                ChannelCounters::incr(&self.counters.transmissions_sent);
                Self::commit(&mut transmission);
            }
            PolicyAction::Drop => {
                ChannelCounters::incr(&self.counters.transmissions_dropped);
                Self::commit(&mut transmission);
            }
            PolicyAction::Retry => {
                ChannelCounters::incr(&self.counters.transmissions_retried);
                self.route_to_store(transmission);
            }
        }
    }

    fn commit(transmission: &mut Transmission) {
        if let Some(lease) = transmission.take_lease() {
            let name = lease.name().to_string();
            if let Err(e) = lease.commit() {
                warn!("Failed to delete stored transmission {}: {}", name, e);
            }
        }
    }

    /// Reacts to a gate change. A closed gate empties the in-memory queue into
    /// the store; an open gate starts refilling from it.
    fn apply_gate(&mut self) {
        let capacity = self.gate.observe();
        if capacity.allows_queue() {
            self.pump_store();
            return;
        }

        if self.store.is_none() {
            return;
        }
        let drained = self.queue.drain_all();
        if !drained.is_empty() {
            debug!("Moving {} queued transmissions to the store", drained.len());
        }
        for transmission in drained {
            self.route_to_store(transmission);
        }
    }

    /// Final bounded flush. Whatever cannot be sent before the deadline is
    /// persisted.
    async fn shutdown(&mut self) {
        self.flush_buffer();

        let deadline = Instant::now() + self.settings.shutdown_timeout;
        let flushed = tokio::time::timeout_at(deadline, async {
            loop {
                self.dispatch();
                match self.in_flight.join_next().await {
                    Some(joined) => self.handle_joined(joined),
                    None => break,
                }
            }
        })
        .await;

        if flushed.is_err() {
            let abandoned = self.in_flight.len();
            self.in_flight.abort_all();
            while self.in_flight.join_next().await.is_some() {}
            warn!(
                "Shutdown timed out after {:?}, abandoned {} in-flight transmissions",
                self.settings.shutdown_timeout, abandoned
            );
        }

        for transmission in self.queue.drain_all() {
            self.route_to_store(transmission);
        }
    }
}
