// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::router::RoutingKey;

/// Delivery of encoded payloads over a partitioned stream.
#[async_trait]
pub trait TransportSink: Send + Sync {
    /// Sends a payload to the partition owning `routing_key`. Payloads with
    /// the same routing key must reach the same partition.
    async fn send(&self, routing_key: &RoutingKey, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Sends a payload to every partition.
    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Payload captured by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub routing_key: RoutingKey,
    pub payload: Vec<u8>,
}

impl Delivered {
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.routing_key.is_broadcast()
    }
}

/// Keeps every delivered payload in memory, in delivery order.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<Delivered>>,
    failures: AtomicUsize,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next `count` deliveries.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Drains the payloads delivered so far.
    pub fn take(&self) -> Vec<Delivered> {
        #[allow(clippy::expect_used)]
        let mut delivered = self.delivered.lock().expect("lock poisoned");
        std::mem::take(&mut *delivered)
    }

    fn record(&self, routing_key: RoutingKey, payload: Vec<u8>) -> Result<(), TransportError> {
        let rejected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(TransportError::Rejected("injected failure".to_string()));
        }
        #[allow(clippy::expect_used)]
        let mut delivered = self.delivered.lock().expect("lock poisoned");
        delivered.push(Delivered {
            routing_key,
            payload,
        });
        Ok(())
    }
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&self, routing_key: &RoutingKey, payload: Vec<u8>) -> Result<(), TransportError> {
        self.record(routing_key.clone(), payload)
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.record(RoutingKey::broadcast(), payload)
    }
}

/// Forwards payloads into a bounded channel. A full channel suspends the
/// flush until the consumer catches up.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<(RoutingKey, Vec<u8>)>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(RoutingKey, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TransportSink for ChannelSink {
    async fn send(&self, routing_key: &RoutingKey, payload: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send((routing_key.clone(), payload))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send((RoutingKey::broadcast(), payload))
            .await
            .map_err(|_| TransportError::Closed)
    }
}
