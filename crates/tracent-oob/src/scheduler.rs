// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flush scheduling.
//!
//! A single task owns the transport. It closes partition windows every flush
//! interval, or earlier when a partition reports its size bound, and hands the
//! resulting payloads to the sink. Appends only ever take a partition lock for
//! the duration of one append or one window swap, so buffering continues while
//! the task waits on a slow sink.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use fnv::FnvHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::buffer::ClosedWindow;
use crate::codec;
use crate::model::{Event, EventType, ExecutionUnitId, Status};
use crate::pb;
use crate::router::RoutingKey;
use crate::sender::SenderCore;
use crate::tags::TagEncoder;
use crate::transport::TransportSink;

#[derive(Debug)]
pub(crate) enum SchedulerCommand {
    /// Size bound reached on one partition.
    FlushPartition(usize),
    FlushAll(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Accepting appends into the current window.
    Open,
    /// A closed window of this partition is being sent. Appends go to the
    /// next window.
    Flushing,
}

/// Routed payload under construction for one routing key.
struct RoutedGroup {
    routing_key: RoutingKey,
    fragments: Vec<pb::TraceFragment>,
    referenced: Vec<ExecutionUnitId>,
}

pub struct FlushScheduler {
    core: Arc<SenderCore>,
    sink: Arc<dyn TransportSink>,
    rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    cycle: u64,
}

impl FlushScheduler {
    pub(crate) fn new(
        core: Arc<SenderCore>,
        sink: Arc<dyn TransportSink>,
        rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    ) -> Self {
        Self {
            core,
            sink,
            rx,
            cycle: 0,
        }
    }

    /// Completed full flush cycles.
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Runs until shutdown is requested through the sender or `cancel` fires.
    /// Both paths drain every partition before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("Flush scheduler started");
        let mut interval = tokio::time::interval(self.core.config.flush_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => self.flush_cycle().await,
                command = self.rx.recv() => match command {
                    Some(SchedulerCommand::FlushPartition(index)) => {
                        self.flush_partition(index).await;
                    }
                    Some(SchedulerCommand::FlushAll(response_tx)) => {
                        self.flush_cycle().await;
                        if response_tx.send(()).is_err() {
                            debug!("Flush requester went away before completion");
                        }
                    }
                    Some(SchedulerCommand::Shutdown(response_tx)) => {
                        self.drain().await;
                        if response_tx.send(()).is_err() {
                            debug!("Shutdown requester went away before completion");
                        }
                        break;
                    }
                    None => break,
                },
                () = cancel.cancelled() => {
                    self.drain().await;
                    break;
                }
            }
        }
        debug!("Flush scheduler stopped after {} cycles", self.cycle);
    }

    /// Closes every window, emits final FINISH_EU events first.
    async fn drain(&mut self) {
        self.core.closed.store(true, Ordering::Release);
        for unit in self.core.directory.live() {
            let event = Event::new(unit.next_sequence, EventType::FinishEu, Status::Idle);
            if let Err(e) = self
                .core
                .append_unchecked(&unit.id, &unit.trace_id, event)
            {
                warn!("Failed to finish execution unit {}: {e}", hex::encode(&unit.id));
            }
        }
        self.flush_cycle().await;
    }

    /// Flushes every partition and runs the per-cycle registry upkeep.
    pub(crate) async fn flush_cycle(&mut self) {
        self.cycle += 1;
        let cycle = self.cycle;
        self.core.directory.begin_cycle(cycle);
        let rebroadcast = cycle % u64::from(self.core.config.rebroadcast_every) == 0;

        let windows: Vec<ClosedWindow> = (0..self.core.partitions.len())
            .map(|index| self.close(index))
            .collect();
        self.emit(windows, rebroadcast).await;
        self.finish_flush(0..self.core.partitions.len());

        let pruned = self.core.directory.prune_finished(cycle);
        let evicted = self.core.registry.age_out(self.core.config.registry_capacity);
        self.core.registry.advance_generation();
        if pruned > 0 || evicted > 0 {
            debug!("Cycle {cycle}: pruned {pruned} finished execution units, aged out {evicted} aliases");
        }
    }

    async fn flush_partition(&mut self, index: usize) {
        if index >= self.core.partitions.len() {
            return;
        }
        let window = self.close(index);
        self.emit(vec![window], false).await;
        self.finish_flush(index..=index);
    }

    fn close(&self, index: usize) -> ClosedWindow {
        let partition = &self.core.partitions[index];
        partition.flushing.store(true, Ordering::Release);
        let window = {
            #[allow(clippy::expect_used)]
            let mut buffer = partition.buffer.lock().expect("lock poisoned");
            buffer.close()
        };
        partition.flush_requested.store(false, Ordering::Release);
        window
    }

    fn finish_flush(&self, indexes: impl IntoIterator<Item = usize>) {
        for index in indexes {
            self.core.partitions[index]
                .flushing
                .store(false, Ordering::Release);
        }
    }

    /// Sends broadcast payloads first, then one routed payload per routing
    /// key with fragments in append order.
    async fn emit(&self, windows: Vec<ClosedWindow>, rebroadcast: bool) {
        let core = &self.core;
        let encoder = TagEncoder::new(&core.registry, core.config.alias_string_values);

        let mut groups: Vec<RoutedGroup> = Vec::new();
        let mut by_key: FnvHashMap<RoutingKey, usize> = FnvHashMap::default();
        let mut referenced: Vec<ExecutionUnitId> = Vec::new();
        let mut events = 0;
        for window in windows {
            events += window.event_count();
            for id in window.referenced {
                if !referenced.contains(&id) {
                    referenced.push(id);
                }
            }
            for (routing_key, fragment) in window.fragments {
                let slot = *by_key.entry(routing_key.clone()).or_insert_with(|| {
                    groups.push(RoutedGroup {
                        routing_key,
                        fragments: Vec::new(),
                        referenced: Vec::new(),
                    });
                    groups.len() - 1
                });
                let group = &mut groups[slot];
                if !group.referenced.contains(&fragment.execution_unit_id) {
                    group.referenced.push(fragment.execution_unit_id.clone());
                }
                group.fragments.push(fragment);
            }
        }

        let inline: FnvHashMap<ExecutionUnitId, pb::ExecutionUnit> = core
            .directory
            .inline_units(&referenced, self.cycle, &encoder)
            .into_iter()
            .map(|unit| (unit.id.clone(), unit))
            .collect();
        let routed: Vec<(RoutingKey, pb::RoutedData)> = groups
            .into_iter()
            .map(|group| {
                let execution_units = group
                    .referenced
                    .iter()
                    .filter_map(|id| inline.get(id).cloned())
                    .collect();
                (
                    group.routing_key,
                    pb::RoutedData {
                        trace_fragments: group.fragments,
                        execution_units,
                    },
                )
            })
            .collect();

        // Encoding execution units above may intern strings, collect them last.
        let units = core
            .directory
            .due_for_broadcast(rebroadcast, self.cycle, &encoder);
        let strings = core.registry.pending_broadcast(rebroadcast);

        let mut broadcasts = 0;
        let chunk = core.config.max_broadcast_entries;
        let mut strings = strings.into_iter();
        let mut units = units.into_iter();
        loop {
            let data = pb::BroadcastData {
                strings: strings.by_ref().take(chunk).collect(),
                execution_units: units.by_ref().take(chunk).collect(),
            };
            if data.strings.is_empty() && data.execution_units.is_empty() {
                break;
            }
            let message = codec::broadcast(&core.sender_id, data);
            self.deliver(&RoutingKey::broadcast(), codec::encode(&message))
                .await;
            broadcasts += 1;
        }

        let payloads = routed.len();
        for (routing_key, data) in routed {
            let message = codec::routed(&core.sender_id, routing_key.clone(), data);
            self.deliver(&routing_key, codec::encode(&message)).await;
        }

        if payloads > 0 || broadcasts > 0 {
            debug!(
                "Flushed {events} events in {payloads} routed and {broadcasts} broadcast payloads"
            );
        }
    }

    /// Hands a payload to the sink, retrying a bounded number of times before
    /// shedding it.
    async fn deliver(&self, routing_key: &RoutingKey, bytes: Vec<u8>) -> bool {
        let counters = &self.core.counters;
        let payload = match self.core.config.compression_level {
            Some(level) => match codec::compress(&bytes, level) {
                Ok(compressed) => compressed,
                Err(e) => {
                    error!("Failed to compress payload for {routing_key:?}: {e}");
                    counters.payloads_shed.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            },
            None => bytes,
        };

        let attempts = self.core.config.max_send_attempts;
        for attempt in 1..=attempts {
            let result = if routing_key.is_broadcast() {
                self.sink.broadcast(payload.clone()).await
            } else {
                self.sink.send(routing_key, payload.clone()).await
            };
            match result {
                Ok(()) => {
                    counters.payloads_sent.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(e) => warn!("Attempt {attempt}/{attempts} to send payload for {routing_key:?} failed: {e}"),
            }
        }
        error!("Dropping payload for {routing_key:?} after {attempts} failed attempts");
        counters.payloads_shed.fetch_add(1, Ordering::Relaxed);
        false
    }

    #[cfg(test)]
    pub(crate) fn pending_commands(&mut self) -> Vec<SchedulerCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.rx.try_recv() {
            commands.push(command);
        }
        commands
    }
}
