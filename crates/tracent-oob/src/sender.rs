// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::buffer::EventBuffer;
use crate::config::Config;
use crate::errors::{ConfigError, SendError};
use crate::execution_unit::{ExecutionUnitDirectory, ExecutionUnitHandle};
use crate::model::{EuType, Event, ExecutionUnit, Tag};
use crate::registry::{RegistryStats, StringRegistry};
use crate::router::Router;
use crate::scheduler::{FlushScheduler, PartitionState, SchedulerCommand};
use crate::tags::TagEncoder;
use crate::transport::TransportSink;

#[derive(Debug, Default)]
pub(crate) struct Partition {
    pub(crate) buffer: Mutex<EventBuffer>,
    pub(crate) flush_requested: AtomicBool,
    pub(crate) flushing: AtomicBool,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) events: AtomicU64,
    pub(crate) payloads_sent: AtomicU64,
    pub(crate) payloads_shed: AtomicU64,
}

#[derive(Debug)]
pub(crate) struct SenderCore {
    pub(crate) config: Config,
    pub(crate) sender_id: Vec<u8>,
    pub(crate) registry: StringRegistry,
    pub(crate) directory: ExecutionUnitDirectory,
    pub(crate) router: Router,
    pub(crate) partitions: Vec<Partition>,
    pub(crate) counters: Counters,
    pub(crate) closed: AtomicBool,
    commands: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SenderCore {
    /// Appends without checking whether the sender is shut down. Used by the
    /// scheduler to emit the final FINISH_EU events.
    pub(crate) fn append_unchecked(
        &self,
        eu_id: &[u8],
        trace_id: &[u8],
        event: Event,
    ) -> Result<(), SendError> {
        if trace_id.is_empty() {
            return Err(SendError::EmptyId("trace"));
        }
        self.directory.observe(eu_id, trace_id, &event)?;

        let routing_key = self.router.route(trace_id, eu_id);
        let index = self.router.partition_of(&routing_key);
        let partition = &self.partitions[index];
        let encoder = TagEncoder::new(&self.registry, self.config.alias_string_values);
        let size = {
            #[allow(clippy::expect_used)]
            let mut buffer = partition.buffer.lock().expect("lock poisoned");
            buffer.append(
                routing_key,
                eu_id,
                trace_id,
                &event,
                &encoder,
                self.config.elide_repeated_tag_values,
            )
        };
        self.counters.events.fetch_add(1, Ordering::Relaxed);

        if size >= self.config.max_buffer_bytes
            && !partition.flush_requested.swap(true, Ordering::AcqRel)
        {
            debug!("Partition {index} reached {size} bytes, requesting flush");
            if self
                .commands
                .send(SchedulerCommand::FlushPartition(index))
                .is_err()
            {
                debug!("Flush scheduler is gone, partition {index} stays buffered");
            }
        }
        Ok(())
    }
}

impl SenderCore {
    pub(crate) fn add_tags(
        &self,
        eu_id: &[u8],
        trace_id: &[u8],
        sequence_number: u64,
        tags: &[Tag],
    ) -> Result<(), SendError> {
        let routing_key = self.router.route(trace_id, eu_id);
        let partition = &self.partitions[self.router.partition_of(&routing_key)];
        let encoder = TagEncoder::new(&self.registry, self.config.alias_string_values);
        #[allow(clippy::expect_used)]
        let mut buffer = partition.buffer.lock().expect("lock poisoned");
        if buffer.add_tags(eu_id, trace_id, sequence_number, tags, &encoder) {
            Ok(())
        } else {
            Err(SendError::EventNotBuffered(sequence_number))
        }
    }
}

/// Counters describing a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderStats {
    pub events: u64,
    pub payloads_sent: u64,
    pub payloads_shed: u64,
    pub execution_units: usize,
    pub registry: RegistryStats,
}

/// Entry point of instrumentation. Cheap to clone; every clone feeds the
/// same partitions and the same [`FlushScheduler`].
#[derive(Debug, Clone)]
pub struct TraceSender {
    core: Arc<SenderCore>,
}

impl TraceSender {
    /// Builds a sender and the scheduler that must be run for it to emit
    /// anything.
    pub fn new(
        config: Config,
        sink: Arc<dyn TransportSink>,
    ) -> Result<(Self, FlushScheduler), ConfigError> {
        config.validate()?;
        let sender_id = config
            .sender_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().as_bytes().to_vec());
        let (tx, rx) = mpsc::unbounded_channel();

        let core = Arc::new(SenderCore {
            router: Router::new(config.routing, config.partitions),
            partitions: (0..config.partitions).map(|_| Partition::default()).collect(),
            registry: StringRegistry::new(),
            directory: ExecutionUnitDirectory::new(),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            commands: tx,
            sender_id,
            config,
        });
        debug!(
            "Created sender {} with {} partitions",
            hex::encode(&core.sender_id),
            core.partitions.len()
        );

        let scheduler = FlushScheduler::new(Arc::clone(&core), sink, rx);
        Ok((Self { core }, scheduler))
    }

    #[must_use]
    pub fn sender_id(&self) -> &[u8] {
        &self.core.sender_id
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.core.config
    }

    fn ensure_open(&self) -> Result<(), SendError> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(SendError::Shutdown);
        }
        Ok(())
    }

    /// Makes an execution unit known to the sender. Events can only be
    /// appended to registered units.
    pub fn register_execution_unit(&self, unit: ExecutionUnit) -> Result<(), SendError> {
        self.ensure_open()?;
        self.core.directory.register(unit)
    }

    /// Registers a unit with a random id and emits its CREATE_EU event in a
    /// fresh trace.
    pub fn start_execution_unit(
        &self,
        eu_type: EuType,
        tags: Vec<Tag>,
    ) -> Result<ExecutionUnitHandle, SendError> {
        ExecutionUnitHandle::create(self.clone(), eu_type, tags)
    }

    /// Buffers `event` in the fragment of `(trace_id, eu_id)`.
    pub fn append(&self, eu_id: &[u8], trace_id: &[u8], event: Event) -> Result<(), SendError> {
        self.ensure_open()?;
        self.core.append_unchecked(eu_id, trace_id, event)
    }

    /// Attaches `tags` to the latest event of `(trace_id, eu_id)` while its
    /// window is still open. Tags with a key already on the event replace it.
    pub fn add_tags(
        &self,
        eu_id: &[u8],
        trace_id: &[u8],
        sequence_number: u64,
        tags: Vec<Tag>,
    ) -> Result<(), SendError> {
        self.ensure_open()?;
        self.core.add_tags(eu_id, trace_id, sequence_number, &tags)
    }

    /// Local partition buffering the fragment of `(trace_id, eu_id)`.
    #[must_use]
    pub fn partition_of(&self, trace_id: &[u8], eu_id: &[u8]) -> usize {
        let router = &self.core.router;
        router.partition_of(&router.route(trace_id, eu_id))
    }

    #[must_use]
    pub fn partition_state(&self, index: usize) -> Option<PartitionState> {
        self.core.partitions.get(index).map(|partition| {
            if partition.flushing.load(Ordering::Acquire) {
                PartitionState::Flushing
            } else {
                PartitionState::Open
            }
        })
    }

    #[must_use]
    pub fn stats(&self) -> SenderStats {
        let counters = &self.core.counters;
        SenderStats {
            events: counters.events.load(Ordering::Relaxed),
            payloads_sent: counters.payloads_sent.load(Ordering::Relaxed),
            payloads_shed: counters.payloads_shed.load(Ordering::Relaxed),
            execution_units: self.core.directory.len(),
            registry: self.core.registry.stats(),
        }
    }

    /// Flushes every partition now and waits until the payloads were handed
    /// to the transport.
    pub async fn flush(&self) -> Result<(), SendError> {
        self.ensure_open()?;
        let (response_tx, response_rx) = oneshot::channel();
        self.core
            .commands
            .send(SchedulerCommand::FlushAll(response_tx))
            .map_err(|_| SendError::Shutdown)?;
        response_rx.await.map_err(|_| SendError::Shutdown)
    }

    /// Finishes every live execution unit, drains all partitions and stops
    /// the scheduler.
    pub async fn shutdown(&self) -> Result<(), SendError> {
        self.ensure_open()?;
        let (response_tx, response_rx) = oneshot::channel();
        self.core
            .commands
            .send(SchedulerCommand::Shutdown(response_tx))
            .map_err(|_| SendError::Shutdown)?;
        response_rx.await.map_err(|_| SendError::Shutdown)
    }
}
