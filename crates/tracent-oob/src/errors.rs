// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Rejected configuration. Always fatal for the sender being built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("flush interval of {0} ms exceeds the maximum buffering delay of {1} ms")]
    FlushIntervalTooLarge(u64, u64),
    #[error("rebroadcast period of {0} ms exceeds the maximum of {1} ms")]
    RebroadcastPeriodTooLong(u64, u64),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failure to turn bytes into a valid `TracingData`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] prost::DecodeError),
    #[error("payload truncated at offset {0}")]
    Truncated(usize),
    #[error("TracingData carries no sender_id")]
    MissingSenderId,
    #[error("TracingData carries neither routed_data nor broadcast_data")]
    MissingData,
    #[error("TracingData carries both routed_data and broadcast_data")]
    AmbiguousData,
    #[error("failed to decompress payload: {0}")]
    Decompression(#[from] std::io::Error),
}

impl DecodeError {
    /// Missing sender identity makes every alias in the payload meaningless.
    /// Everything else only costs the offending message.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::MissingSenderId)
    }
}

/// Broken sender obligation detected by a receiver. Reported, never fatal;
/// the offending unit is dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("sender {sender} redefined alias {alias} from {existing:?} to {incoming:?}")]
    AliasRedefined {
        sender: String,
        alias: u32,
        existing: String,
        incoming: String,
    },
    #[error("event {sequence_number} inherits a value for tag {key:?} that was never set")]
    MissingInheritedValue { key: String, sequence_number: u64 },
    #[error("execution unit tag {key:?} carries no value")]
    ExecutionUnitTagWithoutValue { key: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport rejected payload: {0}")]
    Rejected(String),
}

/// Failure to accept an event on the sending side.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("execution unit {0} is not registered")]
    UnknownExecutionUnit(String),
    #[error("execution unit {0} is already registered")]
    DuplicateExecutionUnit(String),
    #[error("{0} id cannot be empty")]
    EmptyId(&'static str),
    #[error("execution unit {0} has no sequence numbers left")]
    SequenceExhausted(String),
    #[error("event {0} is no longer buffered")]
    EventNotBuffered(u64),
    #[error("sender is shut down")]
    Shutdown,
}
