// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-partition accumulation of trace fragments over one flush window.

use std::mem;
use std::time::SystemTime;

use fnv::FnvHashMap;
use prost::Message;

use crate::constants::FRAGMENT_OVERHEAD_BYTES;
use crate::model::{Event, ExecutionUnitId, Tag, TraceId};
use crate::pb;
use crate::router::RoutingKey;
use crate::tags::{TagEncoder, ValueElision};

#[derive(Debug)]
struct PendingFragment {
    routing_key: RoutingKey,
    time_reference: SystemTime,
    fragment: pb::TraceFragment,
    elision: ValueElision,
}

/// Contents of a window detached by [`EventBuffer::close`].
#[derive(Debug, Default)]
pub struct ClosedWindow {
    /// Fragments in the order they were opened.
    pub fragments: Vec<(RoutingKey, pb::TraceFragment)>,
    /// Execution units referenced by the fragments, in first-reference order.
    pub referenced: Vec<ExecutionUnitId>,
}

impl ClosedWindow {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.fragments
            .iter()
            .map(|(_, fragment)| fragment.events.len())
            .sum()
    }
}

/// Fragments of the open window, one per `(trace_id, execution_unit_id)`.
///
/// Every execution unit a fragment points at is recorded as referenced; the
/// flush decides which of them still have to travel inline.
#[derive(Debug, Default)]
pub struct EventBuffer {
    fragments: Vec<PendingFragment>,
    index: FnvHashMap<(TraceId, ExecutionUnitId), usize>,
    referenced: Vec<ExecutionUnitId>,
    approx_bytes: usize,
}

impl EventBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Estimated encoded size of the window.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    /// Appends `event` to the fragment of `(trace_id, eu_id)`, opening the
    /// fragment with the event timestamp as its time reference when absent.
    /// Returns the estimated size of the window afterwards.
    pub fn append(
        &mut self,
        routing_key: RoutingKey,
        eu_id: &[u8],
        trace_id: &[u8],
        event: &Event,
        encoder: &TagEncoder<'_>,
        elide_repeated_values: bool,
    ) -> usize {
        let slot = match self.index.get(&(trace_id.to_vec(), eu_id.to_vec())) {
            Some(slot) => *slot,
            None => {
                let slot = self.fragments.len();
                self.fragments.push(PendingFragment {
                    routing_key,
                    time_reference: event.timestamp,
                    fragment: pb::TraceFragment {
                        trace_id: trace_id.to_vec(),
                        execution_unit_id: eu_id.to_vec(),
                        time_reference: Some(event.timestamp.into()),
                        events: Vec::new(),
                    },
                    elision: ValueElision::default(),
                });
                self.index.insert((trace_id.to_vec(), eu_id.to_vec()), slot);
                if !self.referenced.iter().any(|known| known == eu_id) {
                    self.referenced.push(eu_id.to_vec());
                }
                self.approx_bytes += FRAGMENT_OVERHEAD_BYTES + trace_id.len() + eu_id.len();
                slot
            }
        };

        let pending = &mut self.fragments[slot];
        let encoded = encode_event(pending, event, encoder, elide_repeated_values);
        self.approx_bytes += encoded.encoded_len();
        pending.fragment.events.push(encoded);
        self.approx_bytes
    }

    /// Attaches `tags` to event `sequence_number` of `(trace_id, eu_id)`,
    /// replacing tags that share a key. Only the last event of a fragment
    /// accepts tags. Returns false when that event is not in this window.
    pub fn add_tags(
        &mut self,
        eu_id: &[u8],
        trace_id: &[u8],
        sequence_number: u64,
        tags: &[Tag],
        encoder: &TagEncoder<'_>,
    ) -> bool {
        let Some(slot) = self.index.get(&(trace_id.to_vec(), eu_id.to_vec())) else {
            return false;
        };
        let PendingFragment {
            fragment, elision, ..
        } = &mut self.fragments[*slot];
        let Some(event) = fragment
            .events
            .last_mut()
            .filter(|event| event.sequence_number == sequence_number)
        else {
            return false;
        };

        for tag in tags {
            // The override becomes the latest value of its key.
            elision.repeats(tag);
            let encoded = encoder.encode(tag);
            self.approx_bytes += encoded.encoded_len();
            match event.tags.iter_mut().find(|known| known.key == encoded.key) {
                Some(known) => {
                    self.approx_bytes = self.approx_bytes.saturating_sub(known.encoded_len());
                    *known = encoded;
                }
                None => event.tags.push(encoded),
            }
        }
        true
    }

    /// Detaches the window and leaves an empty one in its place.
    pub fn close(&mut self) -> ClosedWindow {
        let closed = mem::take(self);
        ClosedWindow {
            fragments: closed
                .fragments
                .into_iter()
                .map(|pending| (pending.routing_key, pending.fragment))
                .collect(),
            referenced: closed.referenced,
        }
    }
}

fn encode_event(
    pending: &mut PendingFragment,
    event: &Event,
    encoder: &TagEncoder<'_>,
    elide_repeated_values: bool,
) -> pb::Event {
    let trace_id = &pending.fragment.trace_id;
    let causing_events = event
        .causes
        .iter()
        .map(|cause| pb::EventReference {
            trace_id: if cause.trace_id == *trace_id {
                Vec::new()
            } else {
                cause.trace_id.clone()
            },
            event_id: cause.event_id.as_bytes().to_vec(),
        })
        .collect();

    let tags = event
        .tags
        .iter()
        .map(|tag| {
            if elide_repeated_values && pending.elision.repeats(tag) {
                encoder.encode_key_only(&tag.key)
            } else {
                encoder.encode(tag)
            }
        })
        .collect();

    pb::Event {
        sequence_number: event.sequence_number,
        timestamp: Some(crate::model::signed_delta(
            pending.time_reference,
            event.timestamp,
        )),
        event_type: event.event_type as i32,
        status: event.status as i32,
        causing_events,
        tags,
    }
}
