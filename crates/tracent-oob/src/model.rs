// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Domain types fed into the sender and produced by the receiver.

use std::fmt;
use std::time::{Duration, SystemTime};

pub use crate::pb::event::{Status, Type as EventType};
pub use crate::pb::execution_unit::Type as EuType;

use crate::hash;

/// Opaque execution unit identity.
pub type ExecutionUnitId = Vec<u8>;
/// Opaque trace identity.
pub type TraceId = Vec<u8>;

/// 64-bit event id derived from the sequence number and the execution unit id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub [u8; 8]);

impl EventId {
    #[must_use]
    pub fn derive(sequence_number: u64, eu_id: &[u8]) -> Self {
        Self(hash::event_id(sequence_number, eu_id))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parses the wire representation. Anything but 8 bytes is rejected.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 8]>::try_from(bytes).ok().map(Self)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({:016x})", u64::from_le_bytes(self.0))
    }
}

/// Points at one event of one trace. Used for causal references.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub event_id: EventId,
}

/// Value of a tag attached to an execution unit or an event.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Float(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Str(value)
    }
}

impl From<Vec<u8>> for TagValue {
    fn from(value: Vec<u8>) -> Self {
        TagValue::Bytes(value)
    }
}

/// Key/value pair with a fully resolved key.
#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    pub key: String,
    pub value: TagValue,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Execution unit as announced by instrumentation.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionUnit {
    pub id: ExecutionUnitId,
    pub eu_type: EuType,
    pub tags: Vec<Tag>,
}

/// One event observed on an execution unit, with an absolute timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub sequence_number: u64,
    pub timestamp: SystemTime,
    pub event_type: EventType,
    pub status: Status,
    pub causes: Vec<TraceContext>,
    pub tags: Vec<Tag>,
}

impl Event {
    /// Creates an event stamped with the current wall clock time.
    #[must_use]
    pub fn new(sequence_number: u64, event_type: EventType, status: Status) -> Self {
        Self {
            sequence_number,
            timestamp: SystemTime::now(),
            event_type,
            status,
            causes: Vec::new(),
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn at(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: TraceContext) -> Self {
        self.causes.push(cause);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.push(Tag::new(key, value));
        self
    }
}

/// Signed offset of `at` relative to `reference`, in protobuf form.
///
/// Seconds and nanos always share the same sign.
#[must_use]
pub fn signed_delta(reference: SystemTime, at: SystemTime) -> prost_types::Duration {
    let (magnitude, negative) = match at.duration_since(reference) {
        Ok(elapsed) => (elapsed, false),
        Err(err) => (err.duration(), true),
    };
    let seconds = i64::try_from(magnitude.as_secs()).unwrap_or(i64::MAX);
    // subsec_nanos is below 10^9 and always fits
    let nanos = magnitude.subsec_nanos() as i32;
    if negative {
        prost_types::Duration {
            seconds: -seconds,
            nanos: -nanos,
        }
    } else {
        prost_types::Duration { seconds, nanos }
    }
}

/// Inverse of [`signed_delta`]. Returns `None` on overflow or mixed signs.
#[must_use]
pub fn apply_delta(reference: SystemTime, delta: &prost_types::Duration) -> Option<SystemTime> {
    if delta.seconds >= 0 && delta.nanos >= 0 {
        let offset = Duration::new(delta.seconds.unsigned_abs(), delta.nanos.unsigned_abs());
        reference.checked_add(offset)
    } else if delta.seconds <= 0 && delta.nanos <= 0 {
        let offset = Duration::new(delta.seconds.unsigned_abs(), delta.nanos.unsigned_abs());
        reference.checked_sub(offset)
    } else {
        None
    }
}
