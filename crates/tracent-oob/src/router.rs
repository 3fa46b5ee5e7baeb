// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Partition routing.
//!
//! Every trace fragment is routed by a non-empty key derived from either its
//! trace or its execution unit. The empty key is reserved for broadcast
//! payloads. A single [`crate::registry::StringRegistry`] serves every
//! partition, so changing the partition count never requires migrating
//! alias state.

use std::fmt;

use serde::Deserialize;

use crate::hash::fnv1a_64;

/// Identity used to shard trace fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// All fragments of a trace land on the same partition.
    Trace,
    /// All fragments of an execution unit land on the same partition.
    ExecutionUnit,
}

impl RoutingStrategy {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "trace" => Some(RoutingStrategy::Trace),
            "execution_unit" | "eu" => Some(RoutingStrategy::ExecutionUnit),
            _ => None,
        }
    }
}

/// Partitioning key attached to every payload. Empty means broadcast.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct RoutingKey(Vec<u8>);

impl RoutingKey {
    #[must_use]
    pub fn broadcast() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RoutingKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for RoutingKey {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            f.write_str("RoutingKey(broadcast)")
        } else {
            write!(f, "RoutingKey({})", hex::encode(&self.0))
        }
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    strategy: RoutingStrategy,
    partitions: usize,
}

impl Router {
    #[must_use]
    pub fn new(strategy: RoutingStrategy, partitions: usize) -> Self {
        Self {
            strategy,
            partitions: partitions.max(1),
        }
    }

    #[must_use]
    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    #[must_use]
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Routing key of the fragment of `trace_id` on `eu_id`. Both ids are
    /// non-empty, so the key is never the broadcast key.
    #[must_use]
    pub fn route(&self, trace_id: &[u8], eu_id: &[u8]) -> RoutingKey {
        match self.strategy {
            RoutingStrategy::Trace => RoutingKey::from(trace_id),
            RoutingStrategy::ExecutionUnit => RoutingKey::from(eu_id),
        }
    }

    /// Local buffer receiving fragments with `key`.
    #[must_use]
    pub fn partition_of(&self, key: &RoutingKey) -> usize {
        // Reduce in u64 before narrowing so 32-bit targets agree with 64-bit ones.
        (fnv1a_64(key.as_bytes()) % self.partitions as u64) as usize
    }
}

/// Whether a routed payload must carry an execution unit inline.
///
/// An execution unit is only considered known to receivers once it was
/// broadcast in an earlier flush cycle than `current_cycle`. A broadcast of the
/// same cycle may reach another partition's consumer after the routed payload.
#[must_use]
pub fn must_inline(last_broadcast_cycle: Option<u64>, current_cycle: u64) -> bool {
    !matches!(last_broadcast_cycle, Some(cycle) if cycle < current_cycle)
}
