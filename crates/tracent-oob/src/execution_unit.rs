// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sender-side bookkeeping of execution units and the handles instrumentation
//! uses to emit events on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use fnv::FnvHashMap;
use tracing::debug;
use uuid::Uuid;

use crate::errors::SendError;
use crate::model::{
    EuType, Event, EventId, EventType, ExecutionUnit, ExecutionUnitId, Status, Tag,
    TraceContext, TraceId,
};
use crate::pb;
use crate::router::must_inline;
use crate::sender::TraceSender;
use crate::tags::TagEncoder;

#[derive(Debug)]
struct Record {
    unit: ExecutionUnit,
    next_sequence: u64,
    current_trace: Option<TraceId>,
    last_broadcast_cycle: Option<u64>,
    finished_cycle: Option<u64>,
}

impl Record {
    fn encode(&self, encoder: &TagEncoder<'_>) -> pb::ExecutionUnit {
        pb::ExecutionUnit {
            id: self.unit.id.clone(),
            r#type: self.unit.eu_type as i32,
            tags: encoder.encode_all(&self.unit.tags),
        }
    }
}

/// Execution unit still running when the sender shuts down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveExecutionUnit {
    pub id: ExecutionUnitId,
    pub trace_id: TraceId,
    pub next_sequence: u64,
}

/// Registered execution units of one sender.
///
/// Tags are encoded whenever a unit is broadcast or inlined, so aliases that
/// aged out of the registry are announced again.
#[derive(Debug, Default)]
pub struct ExecutionUnitDirectory {
    units: RwLock<FnvHashMap<ExecutionUnitId, Mutex<Record>>>,
    cycle: AtomicU64,
}

impl ExecutionUnitDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, unit: ExecutionUnit) -> Result<(), SendError> {
        if unit.id.is_empty() {
            return Err(SendError::EmptyId("execution unit"));
        }
        #[allow(clippy::expect_used)]
        let mut units = self.units.write().expect("lock poisoned");
        if units.contains_key(&unit.id) {
            return Err(SendError::DuplicateExecutionUnit(hex::encode(&unit.id)));
        }
        debug!("Registered execution unit {}", hex::encode(&unit.id));
        units.insert(
            unit.id.clone(),
            Mutex::new(Record {
                unit,
                next_sequence: 0,
                current_trace: None,
                last_broadcast_cycle: None,
                finished_cycle: None,
            }),
        );
        Ok(())
    }

    /// Records that `event` is emitted on `eu_id` in `trace_id`.
    pub fn observe(&self, eu_id: &[u8], trace_id: &[u8], event: &Event) -> Result<(), SendError> {
        #[allow(clippy::expect_used)]
        let units = self.units.read().expect("lock poisoned");
        let Some(record) = units.get(eu_id) else {
            return Err(SendError::UnknownExecutionUnit(hex::encode(eu_id)));
        };
        #[allow(clippy::expect_used)]
        let mut record = record.lock().expect("lock poisoned");
        if record.finished_cycle.is_some() {
            return Err(SendError::UnknownExecutionUnit(hex::encode(eu_id)));
        }
        let next = match event.sequence_number.checked_add(1) {
            Some(next) => next,
            // the last event of a unit has no successor
            None if event.event_type == EventType::FinishEu => u64::MAX,
            None => return Err(SendError::SequenceExhausted(hex::encode(eu_id))),
        };
        record.next_sequence = record.next_sequence.max(next);
        if record.current_trace.as_deref() != Some(trace_id) {
            record.current_trace = Some(trace_id.to_vec());
        }
        if event.event_type == EventType::FinishEu {
            record.finished_cycle = Some(self.cycle.load(Ordering::Relaxed));
        }
        Ok(())
    }

    /// Marks the start of flush cycle `cycle`.
    pub fn begin_cycle(&self, cycle: u64) {
        self.cycle.store(cycle, Ordering::Relaxed);
    }

    /// Units among `referenced` that receivers cannot know from an earlier
    /// broadcast, encoded for inclusion in a routed payload.
    pub fn inline_units(
        &self,
        referenced: &[ExecutionUnitId],
        cycle: u64,
        encoder: &TagEncoder<'_>,
    ) -> Vec<pb::ExecutionUnit> {
        #[allow(clippy::expect_used)]
        let units = self.units.read().expect("lock poisoned");
        referenced
            .iter()
            .filter_map(|id| units.get(id))
            .filter_map(|record| {
                #[allow(clippy::expect_used)]
                let record = record.lock().expect("lock poisoned");
                must_inline(record.last_broadcast_cycle, cycle).then(|| record.encode(encoder))
            })
            .collect()
    }

    /// Units never broadcast, or every unit still running when `rebroadcast`
    /// is set. Returned units are marked as broadcast in `cycle`.
    pub fn due_for_broadcast(
        &self,
        rebroadcast: bool,
        cycle: u64,
        encoder: &TagEncoder<'_>,
    ) -> Vec<pb::ExecutionUnit> {
        #[allow(clippy::expect_used)]
        let units = self.units.read().expect("lock poisoned");
        let mut due: Vec<pb::ExecutionUnit> = units
            .values()
            .filter_map(|record| {
                #[allow(clippy::expect_used)]
                let mut record = record.lock().expect("lock poisoned");
                let due = match record.last_broadcast_cycle {
                    None => true,
                    Some(_) => rebroadcast && record.finished_cycle.is_none(),
                };
                if !due {
                    return None;
                }
                record.last_broadcast_cycle = Some(cycle);
                Some(record.encode(encoder))
            })
            .collect();
        due.sort_unstable_by(|a, b| a.id.cmp(&b.id));
        due
    }

    /// Drops units finished before `cycle` began. Their events were all part
    /// of windows closed during `cycle` or earlier.
    pub fn prune_finished(&self, cycle: u64) -> usize {
        #[allow(clippy::expect_used)]
        let mut units = self.units.write().expect("lock poisoned");
        let before = units.len();
        units.retain(|_, record| {
            #[allow(clippy::expect_used)]
            let record = record.lock().expect("lock poisoned");
            !matches!(record.finished_cycle, Some(finished) if finished < cycle)
        });
        before - units.len()
    }

    /// Units that joined a trace and never emitted FINISH_EU.
    #[must_use]
    pub fn live(&self) -> Vec<LiveExecutionUnit> {
        #[allow(clippy::expect_used)]
        let units = self.units.read().expect("lock poisoned");
        let mut live: Vec<LiveExecutionUnit> = units
            .values()
            .filter_map(|record| {
                #[allow(clippy::expect_used)]
                let record = record.lock().expect("lock poisoned");
                if record.finished_cycle.is_some() {
                    return None;
                }
                let trace_id = record.current_trace.clone()?;
                Some(LiveExecutionUnit {
                    id: record.unit.id.clone(),
                    trace_id,
                    next_sequence: record.next_sequence,
                })
            })
            .collect();
        live.sort_unstable_by(|a, b| a.id.cmp(&b.id));
        live
    }

    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let units = self.units.read().expect("lock poisoned");
        units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn new_trace_id() -> TraceId {
    Uuid::new_v4().as_bytes().to_vec()
}

/// Emits the events of one execution unit.
///
/// Sequence numbers start at 0 with the CREATE_EU event emitted on creation.
/// The handle always belongs to a trace, a fresh one unless joined otherwise.
#[derive(Debug)]
pub struct ExecutionUnitHandle {
    sender: TraceSender,
    id: ExecutionUnitId,
    trace_id: TraceId,
    last_trace_id: TraceId,
    next_sequence: u64,
}

impl ExecutionUnitHandle {
    pub(crate) fn create(
        sender: TraceSender,
        eu_type: EuType,
        tags: Vec<Tag>,
    ) -> Result<Self, SendError> {
        let id = fastrand::u64(..).to_le_bytes().to_vec();
        sender.register_execution_unit(ExecutionUnit {
            id: id.clone(),
            eu_type,
            tags,
        })?;
        let trace_id = new_trace_id();
        let mut handle = Self {
            sender,
            id,
            last_trace_id: trace_id.clone(),
            trace_id,
            next_sequence: 0,
        };
        handle.trace_point(EventType::CreateEu, Status::Busy, None, Vec::new())?;
        Ok(handle)
    }

    #[must_use]
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    #[must_use]
    pub fn trace_id(&self) -> &[u8] {
        &self.trace_id
    }

    /// Emits an event. A cause from another trace moves the handle into
    /// that trace first. Returns the context of the emitted event.
    pub fn trace_point(
        &mut self,
        event_type: EventType,
        status: Status,
        cause: Option<TraceContext>,
        tags: Vec<Tag>,
    ) -> Result<TraceContext, SendError> {
        if let Some(cause) = &cause {
            if cause.trace_id != self.trace_id {
                self.join_trace(cause.trace_id.clone());
            }
        }
        let mut event = Event::new(self.next_sequence, event_type, status);
        event.causes.extend(cause);
        event.tags = tags;
        self.sender.append(&self.id, &self.trace_id, event)?;
        self.next_sequence = self.next_sequence.saturating_add(1);
        self.last_trace_id.clone_from(&self.trace_id);
        Ok(self.trace_context())
    }

    /// Attaches `tags` to the most recently emitted event, overriding tags
    /// with the same key. Fails once that event has been flushed.
    pub fn add_tags(&self, tags: Vec<Tag>) -> Result<(), SendError> {
        self.sender.add_tags(
            &self.id,
            &self.last_trace_id,
            self.next_sequence.saturating_sub(1),
            tags,
        )
    }

    /// Context of the most recently emitted event.
    #[must_use]
    pub fn trace_context(&self) -> TraceContext {
        self.context_of(self.next_sequence.saturating_sub(1))
    }

    /// Context the next emitted event will have.
    #[must_use]
    pub fn peek(&self) -> TraceContext {
        self.context_of(self.next_sequence)
    }

    fn context_of(&self, sequence_number: u64) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id.clone(),
            event_id: EventId::derive(sequence_number, &self.id),
        }
    }

    /// Moves the handle into a fresh trace and returns its id.
    pub fn start_new_trace(&mut self) -> &[u8] {
        self.trace_id = new_trace_id();
        &self.trace_id
    }

    pub fn join_trace(&mut self, trace_id: TraceId) {
        self.trace_id = trace_id;
    }

    /// Emits FINISH_EU. The unit accepts no further events.
    pub fn finish(mut self) -> Result<(), SendError> {
        self.trace_point(EventType::FinishEu, Status::Idle, None, Vec::new())
            .map(|_| ())
    }
}
