// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! String registries mapping strings to 32-bit FNV-1a aliases.
//!
//! The sender side hands out aliases and remembers every alias it ever
//! assigned, so a colliding string is never given an alias already owned by
//! another string. Aging only removes entries from the set that is
//! (re)broadcast; the collision history lives as long as the session.
//!
//! The receiver side keys aliases by sender, since two senders may legally
//! map the same alias to different strings.

use std::collections::hash_map::Entry as MapEntry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use fnv::FnvHashMap;
use tracing::{debug, trace, warn};

use crate::constants::MAX_LITERAL_LEN;
use crate::errors::ProtocolViolation;
use crate::hash::fnv1a_32;
use crate::pb;

/// Outcome of interning a string on the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasResult {
    Aliased(u32),
    /// Send the string inline: too short, or its alias belongs to another string.
    Literal,
}

#[derive(Debug)]
struct Entry {
    value: Arc<str>,
    hits: AtomicU64,
    last_used: AtomicU64,
    // Only mutated under the write lock.
    resident: bool,
    announced: bool,
}

impl Entry {
    fn touch(&self, generation: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_used.fetch_max(generation, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    by_alias: FnvHashMap<u32, Entry>,
    resident: usize,
}

/// Counters describing the sender registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Aliases in the active broadcast set
    pub resident: usize,
    /// Aliases ever assigned this session
    pub known: usize,
    /// Intern calls answered with `Literal` because of a hash collision
    pub collisions: u64,
}

/// Sender-side alias table shared by every partition of a sender.
#[derive(Debug, Default)]
pub struct StringRegistry {
    state: RwLock<RegistryState>,
    generation: AtomicU64,
    collisions: AtomicU64,
}

impl StringRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the alias to send in place of `s`, or `Literal` when `s` must
    /// be sent inline.
    pub fn intern(&self, s: &str) -> AliasResult {
        if s.len() <= MAX_LITERAL_LEN {
            return AliasResult::Literal;
        }
        let alias = fnv1a_32(s.as_bytes());
        let generation = self.generation.load(Ordering::Relaxed);

        {
            #[allow(clippy::expect_used)]
            let state = self.state.read().expect("lock poisoned");
            match state.by_alias.get(&alias) {
                Some(entry) if *entry.value != *s => {
                    self.collisions.fetch_add(1, Ordering::Relaxed);
                    trace!("alias {alias} of {s:?} is owned by {:?}", entry.value);
                    return AliasResult::Literal;
                }
                Some(entry) if entry.resident => {
                    entry.touch(generation);
                    return AliasResult::Aliased(alias);
                }
                // Unknown or aged out, needs the write lock.
                _ => {}
            }
        }

        #[allow(clippy::expect_used)]
        let mut state = self.state.write().expect("lock poisoned");
        let state = &mut *state;
        match state.by_alias.entry(alias) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if *entry.value != *s {
                    self.collisions.fetch_add(1, Ordering::Relaxed);
                    return AliasResult::Literal;
                }
                if !entry.resident {
                    debug!("Reactivating alias {alias} for {s:?}");
                    entry.resident = true;
                    entry.announced = false;
                    state.resident += 1;
                }
                entry.touch(generation);
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: Arc::from(s),
                    hits: AtomicU64::new(1),
                    last_used: AtomicU64::new(generation),
                    resident: true,
                    announced: false,
                });
                state.resident += 1;
            }
        }
        AliasResult::Aliased(alias)
    }

    /// Entries that were never announced, or every resident entry when
    /// `rebroadcast` is set. Returned entries are marked as announced and
    /// sorted by alias.
    pub fn pending_broadcast(&self, rebroadcast: bool) -> Vec<pb::StringTableEntry> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.write().expect("lock poisoned");
        let mut pending: Vec<pb::StringTableEntry> = state
            .by_alias
            .iter_mut()
            .filter(|(_, entry)| entry.resident && (rebroadcast || !entry.announced))
            .map(|(alias, entry)| {
                entry.announced = true;
                pb::StringTableEntry {
                    alias: *alias,
                    value: entry.value.to_string(),
                }
            })
            .collect();
        pending.sort_unstable_by_key(|entry| entry.alias);
        pending
    }

    /// Evicts the least recently used resident entries (fewest hits first on
    /// ties) until at most `limit` remain. Returns the number evicted.
    ///
    /// Entries not announced yet are never evicted, so the resident count may
    /// stay above `limit` until the next broadcast.
    pub fn age_out(&self, limit: usize) -> usize {
        #[allow(clippy::expect_used)]
        let mut state = self.state.write().expect("lock poisoned");
        if state.resident <= limit {
            return 0;
        }
        let mut candidates: Vec<(u64, u64, u32)> = state
            .by_alias
            .iter()
            .filter(|(_, entry)| entry.resident && entry.announced)
            .map(|(alias, entry)| {
                (
                    entry.last_used.load(Ordering::Relaxed),
                    entry.hits.load(Ordering::Relaxed),
                    *alias,
                )
            })
            .collect();
        candidates.sort_unstable();

        let excess = state.resident - limit;
        let mut evicted = 0;
        for (_, _, alias) in candidates.into_iter().take(excess) {
            if let Some(entry) = state.by_alias.get_mut(&alias) {
                entry.resident = false;
                entry.announced = false;
                entry.hits.store(0, Ordering::Relaxed);
                evicted += 1;
            }
        }
        state.resident -= evicted;
        debug!("Aged out {evicted} aliases, {} remain resident", state.resident);
        evicted
    }

    /// Starts a new recency generation. Called once per flush cycle.
    pub fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// String currently owning `alias`, if any.
    #[must_use]
    pub fn lookup(&self, alias: u32) -> Option<Arc<str>> {
        #[allow(clippy::expect_used)]
        let state = self.state.read().expect("lock poisoned");
        state.by_alias.get(&alias).map(|entry| Arc::clone(&entry.value))
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        #[allow(clippy::expect_used)]
        let state = self.state.read().expect("lock poisoned");
        RegistryStats {
            resident: state.resident,
            known: state.by_alias.len(),
            collisions: self.collisions.load(Ordering::Relaxed),
        }
    }
}

/// Receiver-side alias table keyed by `(sender_id, alias)`.
#[derive(Debug, Default)]
pub struct ReceiverRegistry {
    senders: RwLock<FnvHashMap<Vec<u8>, FnvHashMap<u32, Arc<str>>>>,
}

impl ReceiverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the broadcast defining the alias has been observed.
    #[must_use]
    pub fn resolve(&self, sender_id: &[u8], alias: u32) -> Option<Arc<str>> {
        #[allow(clippy::expect_used)]
        let senders = self.senders.read().expect("lock poisoned");
        senders
            .get(sender_id)
            .and_then(|aliases| aliases.get(&alias))
            .map(Arc::clone)
    }

    /// Merges broadcast entries of one sender. A sender redefining one of its
    /// own aliases is reported and the first mapping is kept.
    pub fn observe_broadcast(
        &self,
        sender_id: &[u8],
        entries: &[pb::StringTableEntry],
    ) -> Vec<ProtocolViolation> {
        if entries.is_empty() {
            return Vec::new();
        }
        let mut violations = Vec::new();

        #[allow(clippy::expect_used)]
        let mut senders = self.senders.write().expect("lock poisoned");
        let aliases = senders.entry(sender_id.to_vec()).or_default();
        for entry in entries {
            match aliases.entry(entry.alias) {
                MapEntry::Occupied(existing) => {
                    if **existing.get() != *entry.value {
                        let violation = ProtocolViolation::AliasRedefined {
                            sender: hex::encode(sender_id),
                            alias: entry.alias,
                            existing: existing.get().to_string(),
                            incoming: entry.value.clone(),
                        };
                        warn!("Protocol violation: {violation}");
                        violations.push(violation);
                    }
                }
                MapEntry::Vacant(vacant) => {
                    vacant.insert(Arc::from(entry.value.as_str()));
                }
            }
        }
        violations
    }

    /// Number of `(sender, alias)` pairs known.
    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let senders = self.senders.read().expect("lock poisoned");
        senders.values().map(FnvHashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    fn entry(alias: u32, value: &str) -> pb::StringTableEntry {
        pb::StringTableEntry {
            alias,
            value: value.to_string(),
        }
    }

    #[test]
    fn test_short_strings_are_literal() {
        let registry = StringRegistry::new();
        assert_eq!(registry.intern(""), AliasResult::Literal);
        assert_eq!(registry.intern("abcd"), AliasResult::Literal);
        // 4 UTF-8 bytes even though it is 2 chars
        assert_eq!(registry.intern("éé"), AliasResult::Literal);
        assert_eq!(
            registry.intern("abcde"),
            AliasResult::Aliased(fnv1a_32(b"abcde"))
        );
        assert_eq!(registry.stats().resident, 1);
    }

    #[test]
    fn test_alias_matches_reference_value() {
        let registry = StringRegistry::new();
        assert_eq!(
            registry.intern("tagBoolean"),
            AliasResult::Aliased(3_191_348_081)
        );
    }

    #[test]
    fn test_collision_keeps_first_mapping() {
        let registry = StringRegistry::new();
        let alias = fnv1a_32(b"costarring");
        assert_eq!(registry.intern("costarring"), AliasResult::Aliased(alias));
        assert_eq!(registry.intern("liquid"), AliasResult::Literal);
        assert_eq!(registry.intern("liquid"), AliasResult::Literal);
        assert_eq!(registry.intern("costarring"), AliasResult::Aliased(alias));
        assert_eq!(registry.lookup(alias).as_deref(), Some("costarring"));

        let stats = registry.stats();
        assert_eq!(stats.known, 1);
        assert_eq!(stats.collisions, 2);

        let pending = registry.pending_broadcast(false);
        assert_eq!(pending, vec![entry(alias, "costarring")]);
    }

    #[test]
    fn test_collision_survives_eviction() {
        let registry = StringRegistry::new();
        registry.intern("costarring");
        registry.pending_broadcast(false);
        assert_eq!(registry.age_out(0), 1);
        assert_eq!(registry.stats().resident, 0);

        // The alias stays reserved for the evicted string.
        assert_eq!(registry.intern("liquid"), AliasResult::Literal);
        assert_eq!(
            registry.intern("costarring"),
            AliasResult::Aliased(fnv1a_32(b"costarring"))
        );
    }

    #[test]
    fn test_pending_broadcast_only_once() {
        let registry = StringRegistry::new();
        registry.intern("service");
        registry.intern("operation");
        assert_eq!(registry.pending_broadcast(false).len(), 2);

        registry.intern("service");
        registry.intern("operation");
        assert!(registry.pending_broadcast(false).is_empty());

        registry.intern("resource");
        let pending = registry.pending_broadcast(false);
        assert_eq!(pending, vec![entry(fnv1a_32(b"resource"), "resource")]);

        let all = registry.pending_broadcast(true);
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|pair| pair[0].alias < pair[1].alias));
    }

    #[test]
    fn test_age_out_evicts_least_recently_used() {
        let registry = StringRegistry::new();
        registry.intern("stale-string");
        registry.advance_generation();
        registry.intern("fresh-string");
        registry.intern("busy-string");
        registry.intern("busy-string");
        registry.pending_broadcast(false);

        assert_eq!(registry.age_out(2), 1);
        assert_eq!(registry.age_out(2), 0);
        let resident: Vec<String> = registry
            .pending_broadcast(true)
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert!(!resident.contains(&"stale-string".to_string()));
        assert_eq!(resident.len(), 2);

        // Ties on recency are broken by the hit count.
        assert_eq!(registry.age_out(1), 1);
        let resident = registry.pending_broadcast(true);
        assert_eq!(resident, vec![entry(fnv1a_32(b"busy-string"), "busy-string")]);
    }

    #[test]
    fn test_age_out_keeps_unannounced_entries() {
        let registry = StringRegistry::new();
        registry.intern("announced-early");
        registry.pending_broadcast(false);
        registry.advance_generation();
        registry.intern("late-key-one");
        registry.intern("late-key-two");

        // Only the announced entry can go, even though two more are over the limit.
        assert_eq!(registry.age_out(1), 1);
        assert_eq!(registry.stats().resident, 2);
        assert_eq!(registry.age_out(0), 0);

        let pending: Vec<String> = registry
            .pending_broadcast(false)
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(pending.len(), 2);
        assert!(pending.contains(&"late-key-one".to_string()));
        assert!(pending.contains(&"late-key-two".to_string()));

        // Once announced they become eligible.
        assert_eq!(registry.age_out(1), 1);
        assert_eq!(registry.stats().resident, 1);
    }

    #[test]
    fn test_reactivated_entry_is_announced_again() {
        let registry = StringRegistry::new();
        registry.intern("ephemeral");
        assert_eq!(registry.pending_broadcast(false).len(), 1);
        registry.age_out(0);
        assert!(registry.pending_broadcast(true).is_empty());

        registry.intern("ephemeral");
        assert_eq!(
            registry.pending_broadcast(false),
            vec![entry(fnv1a_32(b"ephemeral"), "ephemeral")]
        );
    }

    #[test]
    fn test_concurrent_interning() {
        let registry = Arc::new(StringRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let shared = format!("shared-{}", i % 10);
                        let own = format!("worker-{worker}-{i}");
                        assert_eq!(
                            registry.intern(&shared),
                            AliasResult::Aliased(fnv1a_32(shared.as_bytes()))
                        );
                        registry.intern(&own);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.pending_broadcast(false).len(), 10 + 4 * 200);
    }

    #[test]
    fn test_receiver_keys_aliases_by_sender() {
        let registry = ReceiverRegistry::new();
        assert!(registry.resolve(b"S1", 77).is_none());

        assert!(registry.observe_broadcast(b"S1", &[entry(77, "foo")]).is_empty());
        assert!(registry.observe_broadcast(b"S2", &[entry(77, "bar")]).is_empty());

        assert_eq!(registry.resolve(b"S1", 77).as_deref(), Some("foo"));
        assert_eq!(registry.resolve(b"S2", 77).as_deref(), Some("bar"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    #[traced_test]
    fn test_receiver_reports_redefinition() {
        let registry = ReceiverRegistry::new();
        registry.observe_broadcast(b"S1", &[entry(77, "foo")]);
        // Rebroadcast of the same mapping is fine.
        assert!(registry.observe_broadcast(b"S1", &[entry(77, "foo")]).is_empty());

        let violations = registry.observe_broadcast(b"S1", &[entry(77, "bar")]);
        assert_eq!(
            violations,
            vec![ProtocolViolation::AliasRedefined {
                sender: hex::encode(b"S1"),
                alias: 77,
                existing: "foo".to_string(),
                incoming: "bar".to_string(),
            }]
        );
        assert_eq!(registry.resolve(b"S1", 77).as_deref(), Some("foo"));
        assert!(logs_contain("Protocol violation"));
    }

    proptest! {
        #[test]
        fn interning_is_deterministic(s in "[a-z]{5,24}") {
            let registry = StringRegistry::new();
            let first = registry.intern(&s);
            prop_assert_eq!(first, AliasResult::Aliased(fnv1a_32(s.as_bytes())));
            prop_assert_eq!(registry.intern(&s), first);
            prop_assert_eq!(registry.pending_broadcast(false).len(), 1);
            registry.intern(&s);
            prop_assert!(registry.pending_broadcast(false).is_empty());
        }
    }
}
