// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Out-of-band transport of trace fragments.
//!
//! Instrumentation appends events per execution unit and trace through a
//! [`TraceSender`]. Events are grouped into fragments inside per-partition
//! buffers, repeated strings are replaced by 32-bit FNV-1a aliases, and a
//! [`FlushScheduler`] turns every closed window into broadcast and routed
//! payloads for a [`TransportSink`]. A [`Receiver`] reverses the process.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer;
pub mod codec;
pub mod config;
pub mod constants;
pub mod errors;
pub mod execution_unit;
pub mod hash;
pub mod model;
pub mod pb;
pub mod receiver;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod sender;
pub mod tags;
pub mod transport;

pub use config::{Config, ReceiverConfig};
pub use errors::{ConfigError, DecodeError, ProtocolViolation, SendError, TransportError};
pub use execution_unit::ExecutionUnitHandle;
pub use model::{
    EuType, Event, EventId, EventType, ExecutionUnit, Status, Tag, TagValue, TraceContext,
};
pub use receiver::{Ingested, Receiver, ResolvedEvent, ResolvedFragment};
pub use registry::{AliasResult, ReceiverRegistry, StringRegistry};
pub use router::{RoutingKey, RoutingStrategy};
pub use scheduler::{FlushScheduler, PartitionState};
pub use sender::{SenderStats, TraceSender};
pub use transport::{ChannelSink, MemorySink, TransportSink};
