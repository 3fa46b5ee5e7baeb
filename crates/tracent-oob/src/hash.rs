// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! FNV-1a hashing used for string aliases, event ids and partition selection.

use std::hash::Hasher;

use fnv::FnvHasher;

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a of `bytes`. This is the alias of a string on the wire.
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV32_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV32_PRIME)
    })
}

/// 64-bit FNV-1a of `bytes`.
#[must_use]
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// Event id of the event numbered `sequence_number` on execution unit `eu_id`.
///
/// The hash covers the little-endian sequence number followed by the raw
/// execution unit id and is returned in little-endian byte order.
#[must_use]
pub fn event_id(sequence_number: u64, eu_id: &[u8]) -> [u8; 8] {
    let mut hasher = FnvHasher::default();
    hasher.write(&sequence_number.to_le_bytes());
    hasher.write(eu_id);
    hasher.finish().to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fnv1a_32_reference_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_fnv1a_32_known_collision() {
        // Published FNV-1a 32 collision pair.
        assert_eq!(fnv1a_32(b"costarring"), fnv1a_32(b"liquid"));
    }

    #[test]
    fn test_fnv1a_64_reference_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_event_id_depends_on_sequence_and_eu() {
        let eu = [1u8, 2, 3, 4, 5, 6, 7, 8];
        assert_ne!(event_id(0, &eu), event_id(1, &eu));
        assert_ne!(event_id(0, &eu), event_id(0, &[8u8, 7, 6, 5, 4, 3, 2, 1]));

        let mut concatenated = 7u64.to_le_bytes().to_vec();
        concatenated.extend_from_slice(&eu);
        assert_eq!(event_id(7, &eu), fnv1a_64(&concatenated).to_le_bytes());
    }

    proptest! {
        #[test]
        fn fnv1a_32_is_deterministic(s in ".*") {
            prop_assert_eq!(fnv1a_32(s.as_bytes()), fnv1a_32(s.clone().as_bytes()));
        }
    }
}
