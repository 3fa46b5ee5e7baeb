// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_MAX_BROADCAST_ENTRIES, DEFAULT_MAX_BUFFER_BYTES,
    DEFAULT_MAX_PARKED_FRAGMENTS, DEFAULT_MAX_SEND_ATTEMPTS, DEFAULT_PARK_WINDOW_MS,
    DEFAULT_PARTITIONS, DEFAULT_REBROADCAST_EVERY, DEFAULT_REGISTRY_CAPACITY,
    MAX_FLUSH_INTERVAL_MS, MAX_REBROADCAST_PERIOD_MS,
};
use crate::errors::ConfigError;
use crate::router::RoutingStrategy;

/// Configuration of a trace sender.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Buffering window per partition, in milliseconds
    pub flush_interval_ms: u64,
    /// Estimated encoded size that triggers an early flush of a partition
    pub max_buffer_bytes: usize,
    /// Number of local partition buffers
    pub partitions: usize,
    /// Identity used to derive routing keys
    pub routing: RoutingStrategy,
    /// Resident aliases before the least used ones age out
    pub registry_capacity: usize,
    /// Flush cycles between full rebroadcasts
    pub rebroadcast_every: u32,
    /// Entries per BroadcastData message
    pub max_broadcast_entries: usize,
    /// Alias string tag values as well as tag keys
    pub alias_string_values: bool,
    /// Omit event tag values that repeat the previous value of the key in the fragment
    pub elide_repeated_tag_values: bool,
    /// Attempts per payload before it is shed
    pub max_send_attempts: u32,
    /// zstd level applied to every payload, uncompressed when unset
    pub compression_level: Option<i32>,
    /// Sender identity, random per session when unset
    #[serde(skip)]
    pub sender_id: Option<Vec<u8>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            partitions: DEFAULT_PARTITIONS,
            routing: RoutingStrategy::Trace,
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
            rebroadcast_every: DEFAULT_REBROADCAST_EVERY,
            max_broadcast_entries: DEFAULT_MAX_BROADCAST_ENTRIES,
            alias_string_values: true,
            elide_repeated_tag_values: false,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            compression_level: None,
            sender_id: None,
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            flush_interval_ms: env_parse("TRACENT_FLUSH_INTERVAL_MS")
                .unwrap_or(defaults.flush_interval_ms),
            max_buffer_bytes: env_parse("TRACENT_MAX_BUFFER_BYTES")
                .unwrap_or(defaults.max_buffer_bytes),
            partitions: env_parse("TRACENT_PARTITIONS").unwrap_or(defaults.partitions),
            routing: env::var("TRACENT_ROUTING")
                .ok()
                .and_then(|val| RoutingStrategy::parse(&val))
                .unwrap_or(defaults.routing),
            registry_capacity: env_parse("TRACENT_REGISTRY_CAPACITY")
                .unwrap_or(defaults.registry_capacity),
            rebroadcast_every: env_parse("TRACENT_REBROADCAST_EVERY")
                .unwrap_or(defaults.rebroadcast_every),
            max_broadcast_entries: env_parse("TRACENT_MAX_BROADCAST_ENTRIES")
                .unwrap_or(defaults.max_broadcast_entries),
            alias_string_values: env_flag("TRACENT_ALIAS_STRING_VALUES")
                .unwrap_or(defaults.alias_string_values),
            elide_repeated_tag_values: env_flag("TRACENT_ELIDE_REPEATED_TAG_VALUES")
                .unwrap_or(defaults.elide_repeated_tag_values),
            max_send_attempts: env_parse("TRACENT_MAX_SEND_ATTEMPTS")
                .unwrap_or(defaults.max_send_attempts),
            compression_level: env_parse("TRACENT_COMPRESSION_LEVEL"),
            sender_id: env::var("TRACENT_SENDER_ID")
                .ok()
                .and_then(|val| parse_hex(val.trim())),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval_ms > MAX_FLUSH_INTERVAL_MS {
            return Err(ConfigError::FlushIntervalTooLarge(
                self.flush_interval_ms,
                MAX_FLUSH_INTERVAL_MS,
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "flush interval must be greater than 0".to_string(),
            ));
        }
        if self.max_buffer_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max buffer bytes must be greater than 0".to_string(),
            ));
        }
        if self.partitions == 0 {
            return Err(ConfigError::Invalid(
                "at least one partition is required".to_string(),
            ));
        }
        if self.registry_capacity == 0 {
            return Err(ConfigError::Invalid(
                "registry capacity must be greater than 0".to_string(),
            ));
        }
        if self.rebroadcast_every == 0 {
            return Err(ConfigError::Invalid(
                "rebroadcast cadence must be at least one flush cycle".to_string(),
            ));
        }
        let period = self.rebroadcast_period_ms();
        if period > MAX_REBROADCAST_PERIOD_MS {
            return Err(ConfigError::RebroadcastPeriodTooLong(
                period,
                MAX_REBROADCAST_PERIOD_MS,
            ));
        }
        if self.max_broadcast_entries == 0 {
            return Err(ConfigError::Invalid(
                "max broadcast entries must be greater than 0".to_string(),
            ));
        }
        if self.max_send_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max send attempts must be greater than 0".to_string(),
            ));
        }
        if let Some(level) = self.compression_level {
            if !zstd::compression_level_range().contains(&level) {
                return Err(ConfigError::Invalid(format!(
                    "compression level {level} is outside the zstd range"
                )));
            }
        }
        if matches!(&self.sender_id, Some(id) if id.is_empty()) {
            return Err(ConfigError::Invalid("sender id cannot be empty".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Time between two full rebroadcasts.
    #[must_use]
    pub fn rebroadcast_period(&self) -> Duration {
        Duration::from_millis(self.rebroadcast_period_ms())
    }

    fn rebroadcast_period_ms(&self) -> u64 {
        self.flush_interval_ms
            .saturating_mul(u64::from(self.rebroadcast_every))
    }
}

/// Configuration of a trace receiver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// How long fragments with unresolved aliases or execution units are held, in milliseconds
    pub park_window_ms: u64,
    /// Parked fragments kept before the oldest is released
    pub max_parked_fragments: usize,
    /// Payloads are zstd compressed
    pub compressed: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            park_window_ms: DEFAULT_PARK_WINDOW_MS,
            max_parked_fragments: DEFAULT_MAX_PARKED_FRAGMENTS,
            compressed: false,
        }
    }
}

impl ReceiverConfig {
    #[must_use]
    pub fn park_window(&self) -> Duration {
        Duration::from_millis(self.park_window_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|val| !matches!(val.trim().to_lowercase().as_str(), "false" | "0" | "no"))
}

fn parse_hex(value: &str) -> Option<Vec<u8>> {
    hex::decode(value).ok().filter(|bytes| !bytes.is_empty())
}
