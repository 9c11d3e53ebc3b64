//! Property tests for the packet codec
//!
//! Decoding must never panic on network input, and every packet must survive a
//! round trip through its byte layout.

use bytes::Bytes;
use proptest::prelude::*;
use shared::{decode, encode, DecodeError, FieldChange, GameStateDiff, Packet};

fn field_change() -> impl Strategy<Value = FieldChange> {
    prop_oneof![
        (any::<u32>(), prop::collection::vec(any::<u8>(), 0..32)).prop_map(|(field_id, bytes)| {
            FieldChange::Set {
                field_id,
                bytes: Bytes::from(bytes),
            }
        }),
        any::<u32>().prop_map(|field_id| FieldChange::Remove { field_id }),
    ]
}

fn packet() -> impl Strategy<Value = Packet> {
    prop_oneof![
        any::<i32>().prop_map(|state| Packet::Ack { state }),
        (
            -1.0e9f64..1.0e9f64,
            -1.0e9f64..1.0e9f64
        )
            .prop_map(|(x, y)| Packet::MouseMove { x, y }),
        any::<u8>().prop_map(|keycode| Packet::KeyStroke { keycode }),
        ".{0,64}".prop_map(|message| Packet::Chat { message }),
        (
            any::<u32>(),
            any::<u32>(),
            any::<bool>(),
            prop::collection::vec(field_change(), 0..8)
        )
            .prop_map(|(base_snapshot_id, target_snapshot_id, is_full, changes)| {
                Packet::GameStateDelta(GameStateDiff {
                    base_snapshot_id,
                    target_snapshot_id,
                    is_full,
                    changes,
                })
            }),
        (any::<i32>(), "[a-zA-Z:_]{0,32}")
            .prop_map(|(class_id, name)| Packet::ClassIdMapping { class_id, name }),
        any::<u32>().prop_map(|peer_id| Packet::Welcome { peer_id }),
    ]
}

proptest! {
    /// Property: every packet decodes back to itself
    #[test]
    fn packets_roundtrip(packet in packet()) {
        let encoded = encode(&packet);
        prop_assert_eq!(encoded.len(), packet.encoded_len());

        let decoded = decode(&encoded).unwrap();
        prop_assert_eq!(decoded, packet);
    }

    /// Property: any strict prefix of a valid frame is reported as truncated
    #[test]
    fn truncated_frames_are_rejected(packet in packet()) {
        let encoded = encode(&packet);

        for len in 0..encoded.len() {
            prop_assert_eq!(decode(&encoded[..len]), Err(DecodeError::Truncated));
        }
    }

    /// Property: arbitrary bytes don't crash the decoder
    #[test]
    fn arbitrary_bytes_dont_crash(
        random_bytes in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let _result = decode(&random_bytes);
    }

    /// Property: a valid kind followed by garbage doesn't crash the decoder
    #[test]
    fn garbage_body_doesnt_crash(
        kind in 0u32..7,
        body in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut frame = kind.to_be_bytes().to_vec();
        frame.extend_from_slice(&body);
        let _result = decode(&frame);
    }
}
