// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Upper bound on the buffering delay. Longer windows add unacceptable
/// end-to-end latency and are rejected at configuration time.
pub const MAX_FLUSH_INTERVAL_MS: u64 = 10_000;

pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;

/// Encoded size at which a partition is flushed before its window elapses.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 512 * 1024;

pub const DEFAULT_PARTITIONS: usize = 4;

/// Resident aliases kept by the sender before aging out the least used ones.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 65_536;

/// Flush cycles between two full rebroadcasts of aliases and live execution units.
pub const DEFAULT_REBROADCAST_EVERY: u32 = 10;

/// Longest accepted time between two rebroadcasts, i.e. flush interval times
/// rebroadcast cadence. A receiver joining mid-stream learns every live alias
/// within this period.
pub const MAX_REBROADCAST_PERIOD_MS: u64 = 10_000;

/// Strings or execution units per BroadcastData message.
pub const DEFAULT_MAX_BROADCAST_ENTRIES: usize = 1_024;

pub const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 3;

/// Strings up to this many UTF-8 bytes are always sent inline.
pub const MAX_LITERAL_LEN: usize = 4;

/// How long a receiver holds a fragment whose aliases or execution unit are unknown.
/// Covers one full rebroadcast period plus the flush that delivers it.
pub const DEFAULT_PARK_WINDOW_MS: u64 = MAX_REBROADCAST_PERIOD_MS + MAX_FLUSH_INTERVAL_MS;

pub const DEFAULT_MAX_PARKED_FRAGMENTS: usize = 4_096;

/// Bytes of overhead accounted per fragment when estimating buffer size.
pub(crate) const FRAGMENT_OVERHEAD_BYTES: usize = 48;
