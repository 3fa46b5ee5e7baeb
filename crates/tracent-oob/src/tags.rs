// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tag encoding on the sender and tag resolution on the receiver.

use tracing::debug;

use crate::errors::ProtocolViolation;
use crate::model::{Tag, TagValue};
use crate::pb;
use crate::pb::tag::{Key, Value};
use crate::registry::{AliasResult, ReceiverRegistry, StringRegistry};

/// Encodes tags through the shared sender registry.
#[derive(Debug, Clone, Copy)]
pub struct TagEncoder<'a> {
    registry: &'a StringRegistry,
    alias_string_values: bool,
}

impl<'a> TagEncoder<'a> {
    #[must_use]
    pub fn new(registry: &'a StringRegistry, alias_string_values: bool) -> Self {
        Self {
            registry,
            alias_string_values,
        }
    }

    #[must_use]
    pub fn key(&self, key: &str) -> Key {
        match self.registry.intern(key) {
            AliasResult::Aliased(alias) => Key::AliasKey(alias),
            AliasResult::Literal => Key::StringKey(key.to_string()),
        }
    }

    #[must_use]
    pub fn value(&self, value: &TagValue) -> Value {
        match value {
            TagValue::Float(v) => Value::FloatValue(*v),
            TagValue::Int(v) => Value::IntValue(*v),
            TagValue::Bool(v) => Value::BooleanValue(*v),
            TagValue::Bytes(v) => Value::BytesValue(v.clone()),
            TagValue::Str(v) if self.alias_string_values => match self.registry.intern(v) {
                AliasResult::Aliased(alias) => Value::AliasValue(alias),
                AliasResult::Literal => Value::StringValue(v.clone()),
            },
            TagValue::Str(v) => Value::StringValue(v.clone()),
        }
    }

    #[must_use]
    pub fn encode(&self, tag: &Tag) -> pb::Tag {
        pb::Tag {
            key: Some(self.key(&tag.key)),
            value: Some(self.value(&tag.value)),
        }
    }

    /// Tag inheriting the value of the previous tag with the same key.
    #[must_use]
    pub fn encode_key_only(&self, key: &str) -> pb::Tag {
        pb::Tag {
            key: Some(self.key(key)),
            value: None,
        }
    }

    #[must_use]
    pub fn encode_all(&self, tags: &[Tag]) -> Vec<pb::Tag> {
        tags.iter().map(|tag| self.encode(tag)).collect()
    }
}

/// Outcome of resolving a single wire tag.
#[derive(Debug, Clone, PartialEq)]
pub enum TagResolution {
    Resolved(Tag),
    /// Key resolved, value absent.
    MissingValue(String),
    MissingKey,
    /// An alias of the tag is not known yet.
    UnknownAlias(u32),
}

/// Resolves wire tags of one sender against the receiver registry.
#[derive(Debug, Clone, Copy)]
pub struct TagResolver<'a> {
    registry: &'a ReceiverRegistry,
    sender_id: &'a [u8],
}

impl<'a> TagResolver<'a> {
    #[must_use]
    pub fn new(registry: &'a ReceiverRegistry, sender_id: &'a [u8]) -> Self {
        Self {
            registry,
            sender_id,
        }
    }

    fn string(&self, alias: u32) -> Result<String, u32> {
        self.registry
            .resolve(self.sender_id, alias)
            .map(|value| value.to_string())
            .ok_or(alias)
    }

    /// Key first, then value, each either inline or through an alias.
    #[must_use]
    pub fn resolve(&self, tag: &pb::Tag) -> TagResolution {
        let key = match &tag.key {
            None => return TagResolution::MissingKey,
            Some(Key::StringKey(key)) => key.clone(),
            Some(Key::AliasKey(alias)) => match self.string(*alias) {
                Ok(key) => key,
                Err(alias) => return TagResolution::UnknownAlias(alias),
            },
        };
        let value = match &tag.value {
            None => return TagResolution::MissingValue(key),
            Some(Value::FloatValue(v)) => TagValue::Float(*v),
            Some(Value::IntValue(v)) => TagValue::Int(*v),
            Some(Value::BooleanValue(v)) => TagValue::Bool(*v),
            Some(Value::StringValue(v)) => TagValue::Str(v.clone()),
            Some(Value::BytesValue(v)) => TagValue::Bytes(v.clone()),
            Some(Value::AliasValue(alias)) => match self.string(*alias) {
                Ok(v) => TagValue::Str(v),
                Err(alias) => return TagResolution::UnknownAlias(alias),
            },
        };
        TagResolution::Resolved(Tag { key, value })
    }

    /// Aliases used by `tags` that this sender has not defined yet.
    pub fn unknown_aliases<'t>(&self, tags: impl IntoIterator<Item = &'t pb::Tag>) -> Vec<u32> {
        let mut unknown = Vec::new();
        for tag in tags {
            let key_alias = match tag.key {
                Some(Key::AliasKey(alias)) => Some(alias),
                _ => None,
            };
            let value_alias = match tag.value {
                Some(Value::AliasValue(alias)) => Some(alias),
                _ => None,
            };
            for alias in key_alias.into_iter().chain(value_alias) {
                if self.registry.resolve(self.sender_id, alias).is_none()
                    && !unknown.contains(&alias)
                {
                    unknown.push(alias);
                }
            }
        }
        unknown
    }

    /// Execution unit tags need both key and value in the same tag. Anything
    /// else is discarded without affecting the other tags.
    pub fn execution_unit_tags(&self, tags: &[pb::Tag]) -> (Vec<Tag>, Vec<ProtocolViolation>) {
        let mut resolved = Vec::with_capacity(tags.len());
        let mut violations = Vec::new();
        for tag in tags {
            match self.resolve(tag) {
                TagResolution::Resolved(tag) => resolved.push(tag),
                TagResolution::MissingValue(key) => {
                    violations.push(ProtocolViolation::ExecutionUnitTagWithoutValue { key });
                }
                TagResolution::MissingKey => debug!("Discarding execution unit tag without key"),
                TagResolution::UnknownAlias(alias) => {
                    debug!("Discarding execution unit tag with unknown alias {alias}");
                }
            }
        }
        (resolved, violations)
    }
}

/// Carries the most recent value of every key across the events of one
/// fragment. Events must be visited in sequence number order.
#[derive(Debug, Default)]
pub struct InheritedValues {
    last: Vec<(String, TagValue)>,
}

impl InheritedValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn remember(&mut self, tag: &Tag) {
        match self.last.iter_mut().find(|(key, _)| *key == tag.key) {
            Some((_, value)) => value.clone_from(&tag.value),
            None => self.last.push((tag.key.clone(), tag.value.clone())),
        }
    }

    /// Resolves the tags of the event numbered `sequence_number`.
    pub fn event_tags(
        &mut self,
        resolver: &TagResolver<'_>,
        sequence_number: u64,
        tags: &[pb::Tag],
        violations: &mut Vec<ProtocolViolation>,
    ) -> Vec<Tag> {
        let mut resolved = Vec::with_capacity(tags.len());
        for tag in tags {
            match resolver.resolve(tag) {
                TagResolution::Resolved(tag) => {
                    self.remember(&tag);
                    resolved.push(tag);
                }
                TagResolution::MissingValue(key) => {
                    match self.last.iter().find(|(known, _)| *known == key) {
                        Some((_, value)) => resolved.push(Tag {
                            key,
                            value: value.clone(),
                        }),
                        None => violations.push(ProtocolViolation::MissingInheritedValue {
                            key,
                            sequence_number,
                        }),
                    }
                }
                TagResolution::MissingKey => {
                    debug!("Discarding tag without key on event {sequence_number}");
                }
                TagResolution::UnknownAlias(alias) => {
                    debug!("Discarding tag with unknown alias {alias} on event {sequence_number}");
                }
            }
        }
        resolved
    }
}

/// Sender-side counterpart of [`InheritedValues`]: decides which event tags
/// can omit their value within one fragment.
#[derive(Debug, Default)]
pub(crate) struct ValueElision {
    last: Vec<(String, TagValue)>,
}

impl ValueElision {
    /// True when `tag` repeats the previous value of its key. Records the
    /// value otherwise.
    pub(crate) fn repeats(&mut self, tag: &Tag) -> bool {
        match self.last.iter_mut().find(|(key, _)| *key == tag.key) {
            Some((_, value)) if *value == tag.value => true,
            Some((_, value)) => {
                value.clone_from(&tag.value);
                false
            }
            None => {
                self.last.push((tag.key.clone(), tag.value.clone()));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fnv1a_32;

    fn alias_tag(key: u32, value: Option<Value>) -> pb::Tag {
        pb::Tag {
            key: Some(Key::AliasKey(key)),
            value,
        }
    }

    fn entry(value: &str) -> pb::StringTableEntry {
        pb::StringTableEntry {
            alias: fnv1a_32(value.as_bytes()),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_encode_aliases_long_strings() {
        let registry = StringRegistry::new();
        let encoder = TagEncoder::new(&registry, true);

        let tag = encoder.encode(&Tag::new("component", "alpha"));
        assert_eq!(tag.key, Some(Key::AliasKey(fnv1a_32(b"component"))));
        assert_eq!(tag.value, Some(Value::AliasValue(fnv1a_32(b"alpha"))));

        let tag = encoder.encode(&Tag::new("pid", 42i64));
        assert_eq!(tag.key, Some(Key::StringKey("pid".to_string())));
        assert_eq!(tag.value, Some(Value::IntValue(42)));

        let tag = encoder.encode(&Tag::new("host", "db"));
        assert_eq!(tag.value, Some(Value::StringValue("db".to_string())));
    }

    #[test]
    fn test_encode_inline_string_values() {
        let registry = StringRegistry::new();
        let encoder = TagEncoder::new(&registry, false);
        let tag = encoder.encode(&Tag::new("message", "connection reset"));
        assert_eq!(
            tag.value,
            Some(Value::StringValue("connection reset".to_string()))
        );
        assert_eq!(registry.stats().known, 1);
    }

    #[test]
    fn test_encode_colliding_key_is_literal() {
        let registry = StringRegistry::new();
        let encoder = TagEncoder::new(&registry, true);
        let first = encoder.encode(&Tag::new("costarring", true));
        assert_eq!(first.key, Some(Key::AliasKey(fnv1a_32(b"costarring"))));
        let tag = encoder.encode(&Tag::new("liquid", true));
        assert_eq!(tag.key, Some(Key::StringKey("liquid".to_string())));
    }

    #[test]
    fn test_resolve_waits_for_broadcast() {
        let registry = ReceiverRegistry::new();
        let resolver = TagResolver::new(&registry, b"S1");
        let alpha = fnv1a_32(b"alpha");
        let tag = alias_tag(fnv1a_32(b"component"), Some(Value::AliasValue(alpha)));

        assert_eq!(
            resolver.resolve(&tag),
            TagResolution::UnknownAlias(fnv1a_32(b"component"))
        );
        assert_eq!(resolver.unknown_aliases([&tag]).len(), 2);

        registry.observe_broadcast(b"S1", &[entry("component"), entry("alpha")]);
        assert_eq!(
            resolver.resolve(&tag),
            TagResolution::Resolved(Tag::new("component", "alpha"))
        );
        assert!(resolver.unknown_aliases([&tag]).is_empty());
    }

    #[test]
    fn test_execution_unit_tags_require_key_and_value() {
        let registry = ReceiverRegistry::new();
        let resolver = TagResolver::new(&registry, b"S1");
        let tags = vec![
            pb::Tag {
                key: Some(Key::StringKey("pid".to_string())),
                value: Some(Value::IntValue(7)),
            },
            pb::Tag {
                key: Some(Key::StringKey("host".to_string())),
                value: None,
            },
            pb::Tag {
                key: None,
                value: Some(Value::BooleanValue(true)),
            },
        ];

        let (resolved, violations) = resolver.execution_unit_tags(&tags);
        assert_eq!(resolved, vec![Tag::new("pid", 7i64)]);
        assert_eq!(
            violations,
            vec![ProtocolViolation::ExecutionUnitTagWithoutValue {
                key: "host".to_string()
            }]
        );
    }

    #[test]
    fn test_event_tags_inherit_previous_value() {
        let registry = ReceiverRegistry::new();
        let resolver = TagResolver::new(&registry, b"S1");
        let mut inherited = InheritedValues::new();
        let mut violations = Vec::new();

        let key = |k: &str| Some(Key::StringKey(k.to_string()));
        let first = vec![pb::Tag {
            key: key("state"),
            value: Some(Value::StringValue("v".to_string())),
        }];
        let silent = vec![pb::Tag {
            key: key("state"),
            value: None,
        }];
        let orphan = vec![pb::Tag {
            key: key("other"),
            value: None,
        }];

        inherited.event_tags(&resolver, 0, &first, &mut violations);
        assert_eq!(
            inherited.event_tags(&resolver, 1, &silent, &mut violations),
            vec![Tag::new("state", "v")]
        );
        assert_eq!(
            inherited.event_tags(&resolver, 2, &silent, &mut violations),
            vec![Tag::new("state", "v")]
        );
        assert!(violations.is_empty());

        assert!(inherited
            .event_tags(&resolver, 3, &orphan, &mut violations)
            .is_empty());
        assert_eq!(
            violations,
            vec![ProtocolViolation::MissingInheritedValue {
                key: "other".to_string(),
                sequence_number: 3
            }]
        );
    }

    #[test]
    fn test_value_elision() {
        let mut elision = ValueElision::default();
        assert!(!elision.repeats(&Tag::new("state", "a")));
        assert!(elision.repeats(&Tag::new("state", "a")));
        assert!(!elision.repeats(&Tag::new("state", "b")));
        assert!(elision.repeats(&Tag::new("state", "b")));
        assert!(!elision.repeats(&Tag::new("count", 1i64)));
    }
}
