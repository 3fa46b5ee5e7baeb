// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Receiving side of the transport.
//!
//! Aliases and execution units are learned from broadcast and routed payloads,
//! keyed by sender. Fragments that reference an alias or an execution unit not
//! seen yet are parked until the missing definition arrives or the park window
//! elapses. Released fragments carry fully resolved tags, absolute timestamps
//! and causal references with their trace ids filled in.

use std::collections::VecDeque;
use std::mem;
use std::time::{Instant, SystemTime};

use fnv::FnvHashMap;
use tracing::{debug, warn};

use crate::codec;
use crate::config::ReceiverConfig;
use crate::errors::{DecodeError, ProtocolViolation};
use crate::model::{apply_delta, Event, EventId, ExecutionUnit, ExecutionUnitId, TraceContext, TraceId};
use crate::pb;
use crate::pb::tracing_data::Data;
use crate::registry::ReceiverRegistry;
use crate::tags::{InheritedValues, TagResolver};

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    pub id: EventId,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFragment {
    pub sender_id: Vec<u8>,
    pub trace_id: TraceId,
    pub execution_unit_id: ExecutionUnitId,
    /// `None` when the fragment was released before its execution unit was
    /// ever announced.
    pub execution_unit: Option<ExecutionUnit>,
    pub time_reference: SystemTime,
    /// Ordered by sequence number.
    pub events: Vec<ResolvedEvent>,
}

/// Fragments released and violations detected while handling one payload.
#[derive(Debug, Default)]
pub struct Ingested {
    pub fragments: Vec<ResolvedFragment>,
    pub violations: Vec<ProtocolViolation>,
}

#[derive(Debug)]
struct Parked {
    sender_id: Vec<u8>,
    fragment: pb::TraceFragment,
    since: Instant,
}

#[derive(Debug)]
pub struct Receiver {
    config: ReceiverConfig,
    registry: ReceiverRegistry,
    units: FnvHashMap<(Vec<u8>, ExecutionUnitId), pb::ExecutionUnit>,
    parked: VecDeque<Parked>,
}

impl Receiver {
    #[must_use]
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            registry: ReceiverRegistry::new(),
            units: FnvHashMap::default(),
            parked: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ReceiverRegistry {
        &self.registry
    }

    /// Fragments waiting for a missing alias or execution unit.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// Decodes one payload and releases every fragment that became
    /// resolvable. A fatal error means the payload cannot be attributed to
    /// any sender.
    pub fn ingest(&mut self, payload: &[u8], now: Instant) -> Result<Ingested, DecodeError> {
        let decompressed;
        let bytes = if self.config.compressed {
            decompressed = codec::decompress(payload)?;
            decompressed.as_slice()
        } else {
            payload
        };
        let message = codec::decode(bytes).map_err(|e| {
            if e.is_fatal() {
                warn!("Rejected payload from unidentified sender: {e}");
            } else {
                warn!("Dropped malformed payload: {e}");
            }
            e
        })?;

        let sender_id = message.sender_id;
        let mut ingested = Ingested::default();
        let fragments = match message.data {
            Some(Data::BroadcastData(data)) => {
                ingested
                    .violations
                    .extend(self.registry.observe_broadcast(&sender_id, &data.strings));
                self.store_units(&sender_id, data.execution_units, &mut ingested.violations);
                Vec::new()
            }
            Some(Data::RoutedData(data)) => {
                self.store_units(&sender_id, data.execution_units, &mut ingested.violations);
                data.trace_fragments
            }
            None => return Err(DecodeError::MissingData),
        };

        self.retry_parked(&sender_id, &mut ingested);
        for fragment in fragments {
            self.accept(&sender_id, fragment, now, &mut ingested);
        }
        Ok(ingested)
    }

    /// Releases fragments parked for longer than the park window. Tags whose
    /// aliases never resolved are dropped.
    pub fn expire(&mut self, now: Instant) -> Ingested {
        let window = self.config.park_window();
        let mut ingested = Ingested::default();
        while let Some(parked) = self.parked.front() {
            if now.saturating_duration_since(parked.since) < window {
                break;
            }
            if let Some(parked) = self.parked.pop_front() {
                debug!(
                    "Releasing unresolved fragment of trace {} after {:?}",
                    hex::encode(&parked.fragment.trace_id),
                    window
                );
                let fragment =
                    self.resolve(&parked.sender_id, parked.fragment, &mut ingested.violations);
                ingested.fragments.push(fragment);
            }
        }
        ingested
    }

    fn store_units(
        &mut self,
        sender_id: &[u8],
        units: Vec<pb::ExecutionUnit>,
        violations: &mut Vec<ProtocolViolation>,
    ) {
        let resolver = TagResolver::new(&self.registry, sender_id);
        for unit in units {
            let (_, unit_violations) = resolver.execution_unit_tags(&unit.tags);
            report(&unit_violations);
            violations.extend(unit_violations);
            // Latest announcement wins.
            self.units.insert((sender_id.to_vec(), unit.id.clone()), unit);
        }
    }

    fn is_ready(&self, sender_id: &[u8], fragment: &pb::TraceFragment) -> bool {
        let Some(unit) = self
            .units
            .get(&(sender_id.to_vec(), fragment.execution_unit_id.clone()))
        else {
            return false;
        };
        let resolver = TagResolver::new(&self.registry, sender_id);
        let tags = unit
            .tags
            .iter()
            .chain(fragment.events.iter().flat_map(|event| event.tags.iter()));
        resolver.unknown_aliases(tags).is_empty()
    }

    fn accept(
        &mut self,
        sender_id: &[u8],
        fragment: pb::TraceFragment,
        now: Instant,
        ingested: &mut Ingested,
    ) {
        if self.is_ready(sender_id, &fragment) {
            let resolved = self.resolve(sender_id, fragment, &mut ingested.violations);
            ingested.fragments.push(resolved);
            return;
        }
        if self.parked.len() >= self.config.max_parked_fragments {
            if let Some(oldest) = self.parked.pop_front() {
                debug!("Park capacity reached, releasing oldest unresolved fragment");
                let resolved =
                    self.resolve(&oldest.sender_id, oldest.fragment, &mut ingested.violations);
                ingested.fragments.push(resolved);
            }
        }
        self.parked.push_back(Parked {
            sender_id: sender_id.to_vec(),
            fragment,
            since: now,
        });
    }

    fn retry_parked(&mut self, sender_id: &[u8], ingested: &mut Ingested) {
        if self.parked.is_empty() {
            return;
        }
        let parked = mem::take(&mut self.parked);
        for entry in parked {
            if entry.sender_id == sender_id && self.is_ready(sender_id, &entry.fragment) {
                let resolved = self.resolve(sender_id, entry.fragment, &mut ingested.violations);
                ingested.fragments.push(resolved);
            } else {
                self.parked.push_back(entry);
            }
        }
    }

    fn resolve(
        &self,
        sender_id: &[u8],
        fragment: pb::TraceFragment,
        violations: &mut Vec<ProtocolViolation>,
    ) -> ResolvedFragment {
        let resolver = TagResolver::new(&self.registry, sender_id);
        let execution_unit = self
            .units
            .get(&(sender_id.to_vec(), fragment.execution_unit_id.clone()))
            .map(|unit| ExecutionUnit {
                id: unit.id.clone(),
                eu_type: unit.r#type(),
                tags: resolver.execution_unit_tags(&unit.tags).0,
            });
        let time_reference = fragment
            .time_reference
            .and_then(|timestamp| SystemTime::try_from(timestamp).ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut events = fragment.events;
        events.sort_by_key(|event| event.sequence_number);

        let reported = violations.len();
        let mut inherited = InheritedValues::new();
        let events = events
            .into_iter()
            .map(|event| {
                let tags = inherited.event_tags(
                    &resolver,
                    event.sequence_number,
                    &event.tags,
                    violations,
                );
                let timestamp = event
                    .timestamp
                    .as_ref()
                    .and_then(|delta| apply_delta(time_reference, delta))
                    .unwrap_or(time_reference);
                let causes = event
                    .causing_events
                    .iter()
                    .filter_map(|reference| {
                        let Some(event_id) = EventId::from_slice(&reference.event_id) else {
                            debug!("Discarding causal reference with a {}-byte event id", reference.event_id.len());
                            return None;
                        };
                        let trace_id = if reference.trace_id.is_empty() {
                            fragment.trace_id.clone()
                        } else {
                            reference.trace_id.clone()
                        };
                        Some(TraceContext { trace_id, event_id })
                    })
                    .collect();
                ResolvedEvent {
                    id: EventId::derive(event.sequence_number, &fragment.execution_unit_id),
                    event: Event {
                        sequence_number: event.sequence_number,
                        timestamp,
                        event_type: event.event_type(),
                        status: event.status(),
                        causes,
                        tags,
                    },
                }
            })
            .collect();
        report(&violations[reported..]);

        ResolvedFragment {
            sender_id: sender_id.to_vec(),
            trace_id: fragment.trace_id,
            execution_unit_id: fragment.execution_unit_id,
            execution_unit,
            time_reference,
            events,
        }
    }
}

fn report(violations: &[ProtocolViolation]) {
    for violation in violations {
        warn!("Protocol violation: {violation}");
    }
}
