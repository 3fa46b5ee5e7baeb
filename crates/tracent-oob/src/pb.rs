// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Protobuf messages of the out-of-band trace transport.
//!
//! Mirrors `proto/tracent_oob.proto`. Field numbers are part of the wire
//! contract and must never be changed.

/// Routing-key-only projection of [`TracingData`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TracingDataHeader {
    #[prost(bytes = "vec", tag = "1")]
    pub routing_key: ::prost::alloc::vec::Vec<u8>,
}
/// Envelope of every payload handed to the transport.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TracingData {
    /// Partitioning key. Empty for broadcast payloads.
    #[prost(bytes = "vec", tag = "1")]
    pub routing_key: ::prost::alloc::vec::Vec<u8>,
    /// Identity of the emitting sender session.
    #[prost(bytes = "vec", tag = "2")]
    pub sender_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(oneof = "tracing_data::Data", tags = "3, 4")]
    pub data: ::core::option::Option<tracing_data::Data>,
}
/// Nested message and enum types in `TracingData`.
pub mod tracing_data {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Data {
        #[prost(message, tag = "3")]
        RoutedData(super::RoutedData),
        #[prost(message, tag = "4")]
        BroadcastData(super::BroadcastData),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoutedData {
    #[prost(message, repeated, tag = "1")]
    pub trace_fragments: ::prost::alloc::vec::Vec<TraceFragment>,
    /// Execution units referenced by `trace_fragments` that were not broadcast before.
    #[prost(message, repeated, tag = "2")]
    pub execution_units: ::prost::alloc::vec::Vec<ExecutionUnit>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BroadcastData {
    #[prost(message, repeated, tag = "1")]
    pub strings: ::prost::alloc::vec::Vec<StringTableEntry>,
    #[prost(message, repeated, tag = "2")]
    pub execution_units: ::prost::alloc::vec::Vec<ExecutionUnit>,
}
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct StringTableEntry {
    /// FNV-1a 32 of the UTF-8 bytes of `value`.
    #[prost(fixed32, tag = "1")]
    pub alias: u32,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TraceFragment {
    #[prost(bytes = "vec", tag = "1")]
    pub trace_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub execution_unit_id: ::prost::alloc::vec::Vec<u8>,
    /// Absolute anchor the event timestamps are relative to.
    #[prost(message, optional, tag = "3")]
    pub time_reference: ::core::option::Option<::prost_types::Timestamp>,
    #[prost(message, repeated, tag = "4")]
    pub events: ::prost::alloc::vec::Vec<Event>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionUnit {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(enumeration = "execution_unit::Type", tag = "2")]
    pub r#type: i32,
    #[prost(message, repeated, tag = "3")]
    pub tags: ::prost::alloc::vec::Vec<Tag>,
}
/// Nested message and enum types in `ExecutionUnit`.
pub mod execution_unit {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Unknown = 0,
        Process = 1,
        Thread = 2,
        Coroutine = 3,
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(uint64, tag = "1")]
    pub sequence_number: u64,
    /// Signed offset from the time reference of the enclosing fragment.
    #[prost(message, optional, tag = "2")]
    pub timestamp: ::core::option::Option<::prost_types::Duration>,
    #[prost(enumeration = "event::Type", tag = "3")]
    pub event_type: i32,
    #[prost(enumeration = "event::Status", tag = "4")]
    pub status: i32,
    #[prost(message, repeated, tag = "5")]
    pub causing_events: ::prost::alloc::vec::Vec<EventReference>,
    #[prost(message, repeated, tag = "6")]
    pub tags: ::prost::alloc::vec::Vec<Tag>,
}
/// Nested message and enum types in `Event`.
pub mod event {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        UnknownType = 0,
        CreateEu = 1,
        FinishEu = 2,
        OtStartSpan = 3,
        OtLog = 4,
        OtGetContext = 5,
        OtFinishSpan = 6,
    }
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Status {
        Unknown = 0,
        Busy = 1,
        Idle = 2,
    }
}
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct EventReference {
    /// Omitted when equal to the trace of the enclosing fragment.
    #[prost(bytes = "vec", tag = "1")]
    pub trace_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub event_id: ::prost::alloc::vec::Vec<u8>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Tag {
    #[prost(oneof = "tag::Key", tags = "1, 2")]
    pub key: ::core::option::Option<tag::Key>,
    /// Absent on event tags that repeat the previous value of the same key.
    #[prost(oneof = "tag::Value", tags = "3, 4, 5, 6, 7, 8")]
    pub value: ::core::option::Option<tag::Value>,
}
/// Nested message and enum types in `Tag`.
pub mod tag {
    #[derive(Clone, PartialEq, Eq, Hash, ::prost::Oneof)]
    pub enum Key {
        #[prost(string, tag = "1")]
        StringKey(::prost::alloc::string::String),
        #[prost(fixed32, tag = "2")]
        AliasKey(u32),
    }
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(double, tag = "3")]
        FloatValue(f64),
        #[prost(int64, tag = "4")]
        IntValue(i64),
        #[prost(bool, tag = "5")]
        BooleanValue(bool),
        #[prost(string, tag = "6")]
        StringValue(::prost::alloc::string::String),
        #[prost(fixed32, tag = "7")]
        AliasValue(u32),
        #[prost(bytes, tag = "8")]
        BytesValue(::prost::alloc::vec::Vec<u8>),
    }
}
