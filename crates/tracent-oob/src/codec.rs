// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Envelope encoding and decoding.
//!
//! `TracingData` carries exactly one of `routed_data` and `broadcast_data`.
//! The constructors below are the only way the sender builds an envelope, so
//! the oneof is populated by construction. Decoding checks the raw field
//! stream because prost silently keeps the last branch when both are present.

use prost::bytes::Buf;
use prost::encoding::{decode_varint, WireType};
use prost::Message;

use crate::errors::DecodeError;
use crate::pb;
use crate::pb::tracing_data::Data;
use crate::router::RoutingKey;

const ROUTED_DATA_TAG: u64 = 3;
const BROADCAST_DATA_TAG: u64 = 4;

#[must_use]
pub fn routed(sender_id: &[u8], routing_key: RoutingKey, data: pb::RoutedData) -> pb::TracingData {
    pb::TracingData {
        routing_key: routing_key.into_bytes(),
        sender_id: sender_id.to_vec(),
        data: Some(Data::RoutedData(data)),
    }
}

/// Broadcast envelopes always carry the empty routing key.
#[must_use]
pub fn broadcast(sender_id: &[u8], data: pb::BroadcastData) -> pb::TracingData {
    pb::TracingData {
        routing_key: Vec::new(),
        sender_id: sender_id.to_vec(),
        data: Some(Data::BroadcastData(data)),
    }
}

#[must_use]
pub fn encode(message: &pb::TracingData) -> Vec<u8> {
    message.encode_to_vec()
}

/// Decodes and validates an envelope.
pub fn decode(bytes: &[u8]) -> Result<pb::TracingData, DecodeError> {
    let message = pb::TracingData::decode(bytes)?;
    if message.sender_id.is_empty() {
        return Err(DecodeError::MissingSenderId);
    }
    let (routed, broadcast) = data_branches(bytes)?;
    match (routed, broadcast) {
        (false, false) => Err(DecodeError::MissingData),
        (true, true) => Err(DecodeError::AmbiguousData),
        _ => Ok(message),
    }
}

/// Routing key of an envelope without decoding its payload.
pub fn decode_header(bytes: &[u8]) -> Result<RoutingKey, DecodeError> {
    let header = pb::TracingDataHeader::decode(bytes)?;
    Ok(RoutingKey::from(header.routing_key))
}

/// Which oneof branches appear in the top-level field stream.
fn data_branches(bytes: &[u8]) -> Result<(bool, bool), DecodeError> {
    let mut buf = bytes;
    let mut routed = false;
    let mut broadcast = false;
    while buf.has_remaining() {
        let offset = bytes.len() - buf.remaining();
        let key = decode_varint(&mut buf).map_err(|_| DecodeError::Truncated(offset))?;
        let field = key >> 3;
        let skip = match WireType::try_from(key & 0x7) {
            Ok(WireType::Varint) => {
                decode_varint(&mut buf).map_err(|_| DecodeError::Truncated(offset))?;
                0
            }
            Ok(WireType::SixtyFourBit) => 8,
            Ok(WireType::ThirtyTwoBit) => 4,
            Ok(WireType::LengthDelimited) => {
                let len = decode_varint(&mut buf).map_err(|_| DecodeError::Truncated(offset))?;
                match field {
                    ROUTED_DATA_TAG => routed = true,
                    BROADCAST_DATA_TAG => broadcast = true,
                    _ => {}
                }
                usize::try_from(len).map_err(|_| DecodeError::Truncated(offset))?
            }
            // Groups never appear in this schema and prost rejected them already.
            _ => return Err(DecodeError::Truncated(offset)),
        };
        if buf.remaining() < skip {
            return Err(DecodeError::Truncated(offset));
        }
        buf.advance(skip);
    }
    Ok((routed, broadcast))
}

/// zstd compression of an encoded payload.
pub fn compress(payload: &[u8], level: i32) -> std::io::Result<Vec<u8>> {
    zstd::encode_all(payload, level)
}

pub fn decompress(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    Ok(zstd::decode_all(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pb::tag::{Key, Value};
    use proptest::prelude::*;

    fn sample_routed() -> pb::TracingData {
        routed(
            b"sender-1",
            RoutingKey::from(b"trace-1".to_vec()),
            pb::RoutedData {
                trace_fragments: vec![pb::TraceFragment {
                    trace_id: b"trace-1".to_vec(),
                    execution_unit_id: b"eu-1".to_vec(),
                    time_reference: Some(prost_types::Timestamp {
                        seconds: 1_700_000_000,
                        nanos: 5,
                    }),
                    events: vec![pb::Event {
                        sequence_number: 1,
                        timestamp: Some(prost_types::Duration {
                            seconds: 0,
                            nanos: -10,
                        }),
                        event_type: pb::event::Type::OtLog as i32,
                        status: pb::event::Status::Busy as i32,
                        causing_events: vec![pb::EventReference {
                            trace_id: Vec::new(),
                            event_id: vec![1, 2, 3, 4, 5, 6, 7, 8],
                        }],
                        tags: vec![pb::Tag {
                            key: Some(Key::AliasKey(77)),
                            value: Some(Value::FloatValue(0.5)),
                        }],
                    }],
                }],
                execution_units: vec![pb::ExecutionUnit {
                    id: b"eu-1".to_vec(),
                    r#type: pb::execution_unit::Type::Coroutine as i32,
                    tags: Vec::new(),
                }],
            },
        )
    }

    #[test]
    fn test_round_trip_routed() {
        let message = sample_routed();
        let bytes = encode(&message);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(encode(&decoded), bytes);
    }

    #[test]
    fn test_broadcast_has_empty_routing_key() {
        let message = broadcast(
            b"sender-1",
            pb::BroadcastData {
                strings: vec![pb::StringTableEntry {
                    alias: 77,
                    value: "alpha".to_string(),
                }],
                execution_units: Vec::new(),
            },
        );
        let bytes = encode(&message);
        assert!(decode_header(&bytes).unwrap().is_broadcast());
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_alias_is_fixed32_on_the_wire() {
        let entry = pb::StringTableEntry {
            alias: 1,
            value: String::new(),
        };
        // Field 1, wire type 5, then four little-endian bytes.
        assert_eq!(entry.encode_to_vec(), vec![0x0d, 1, 0, 0, 0]);
    }

    #[test]
    fn test_decode_header_reads_routing_key_only() {
        let bytes = encode(&sample_routed());
        assert_eq!(decode_header(&bytes).unwrap().as_bytes(), b"trace-1");
    }

    #[test]
    fn test_decode_rejects_missing_sender() {
        let mut message = sample_routed();
        message.sender_id.clear();
        let error = decode(&encode(&message)).unwrap_err();
        assert!(matches!(error, DecodeError::MissingSenderId));
        assert!(error.is_fatal());
    }

    #[test]
    fn test_decode_rejects_missing_data() {
        let message = pb::TracingData {
            routing_key: Vec::new(),
            sender_id: b"sender-1".to_vec(),
            data: None,
        };
        let error = decode(&encode(&message)).unwrap_err();
        assert!(matches!(error, DecodeError::MissingData));
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_decode_rejects_both_branches() {
        let mut bytes = encode(&sample_routed());
        // An empty broadcast_data field appended to a routed envelope.
        bytes.extend_from_slice(&[(4 << 3) | 2, 0]);
        assert!(matches!(decode(&bytes), Err(DecodeError::AmbiguousData)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let bytes = encode(&sample_routed());
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(decode(truncated), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_compression_round_trip() {
        let bytes = encode(&sample_routed());
        let compressed = compress(&bytes, 3).unwrap();
        assert_eq!(decompress(&compressed).unwrap(), bytes);
        assert!(matches!(
            decompress(b"not zstd"),
            Err(DecodeError::Decompression(_))
        ));
    }

    fn arb_tag() -> impl Strategy<Value = pb::Tag> {
        let key = prop_oneof![
            "[a-z]{1,12}".prop_map(Key::StringKey),
            any::<u32>().prop_map(Key::AliasKey),
        ];
        let value = prop_oneof![
            any::<i64>().prop_map(Value::IntValue),
            any::<bool>().prop_map(Value::BooleanValue),
            "[a-z ]{0,16}".prop_map(Value::StringValue),
            any::<u32>().prop_map(Value::AliasValue),
            proptest::collection::vec(any::<u8>(), 0..8).prop_map(Value::BytesValue),
        ];
        (proptest::option::of(key), proptest::option::of(value))
            .prop_map(|(key, value)| pb::Tag { key, value })
    }

    fn arb_event() -> impl Strategy<Value = pb::Event> {
        (
            any::<u64>(),
            -1_000i64..1_000,
            0i32..7,
            0i32..3,
            proptest::collection::vec(arb_tag(), 0..4),
        )
            .prop_map(|(sequence_number, millis, event_type, status, tags)| pb::Event {
                sequence_number,
                timestamp: Some(prost_types::Duration {
                    seconds: millis / 1_000,
                    nanos: ((millis % 1_000) * 1_000_000) as i32,
                }),
                event_type,
                status,
                causing_events: Vec::new(),
                tags,
            })
    }

    proptest! {
        #[test]
        fn routed_round_trip(
            sender in proptest::collection::vec(any::<u8>(), 1..16),
            trace in proptest::collection::vec(any::<u8>(), 1..16),
            events in proptest::collection::vec(arb_event(), 0..6),
        ) {
            let message = routed(
                &sender,
                RoutingKey::from(trace.clone()),
                pb::RoutedData {
                    trace_fragments: vec![pb::TraceFragment {
                        trace_id: trace,
                        execution_unit_id: vec![1; 8],
                        time_reference: None,
                        events,
                    }],
                    execution_units: Vec::new(),
                },
            );
            let bytes = encode(&message);
            let decoded = decode(&bytes).unwrap();
            prop_assert_eq!(&decoded, &message);
            prop_assert_eq!(encode(&decoded), bytes);
        }
    }
}
