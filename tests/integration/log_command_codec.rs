#![allow(missing_docs)]

use bytes::Bytes;
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use recstore::log::{
    tags, CaptureMode, EnrichmentCommand, EnrichmentMetadata, GroupDegreeCommand, LogCommand,
    LogCommandCodec, StartEntry, ENRICHMENT_METADATA_LEN,
};
use recstore::primitives::bytes::{InMemoryChannel, ReadableChannel, WritableChannel};
use recstore::types::{Direction, GroupId, LogCorruption, RelTypeId, StoreError, TxId};
use uuid::Uuid;

const MAX_SECTION: usize = 123;

fn arb_section() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=MAX_SECTION)
}

fn arb_enrichment() -> impl Strategy<Value = EnrichmentCommand> {
    (
        prop_oneof![Just(CaptureMode::Diff), Just(CaptureMode::Full)],
        any::<u128>(),
        any::<u64>(),
        any::<u64>(),
        any::<u32>(),
        (arb_section(), arb_section(), arb_section(), arb_section(), arb_section()),
    )
        .prop_map(|(mode, server, tx, time, user, sections)| {
            let (entities, details, changes, values, user_meta) = sections;
            EnrichmentCommand::new(
                EnrichmentMetadata {
                    capture_mode: mode,
                    server_id: Uuid::from_u128(server),
                    last_committed_tx: TxId(tx),
                    time_committed: time,
                    user_id: user,
                },
                Bytes::from(entities),
                Bytes::from(details),
                Bytes::from(changes),
                Bytes::from(values),
                Some(Bytes::from(user_meta)),
            )
        })
}

fn arb_enrichment_codec() -> impl Strategy<Value = LogCommandCodec> {
    prop_oneof![Just(LogCommandCodec::V5_12), Just(LogCommandCodec::V5_20)]
}

proptest! {
    #[test]
    fn enrichment_roundtrips_and_stops_after_checksum(
        codec in arb_enrichment_codec(),
        command in arb_enrichment(),
        trailing in prop::collection::vec(any::<u8>(), 0..8),
    ) {
        let command = LogCommand::Enrichment(command);
        let mut channel = InMemoryChannel::new();
        codec.write(&mut channel, &command).unwrap();
        let entry_end = channel.write_position();
        channel.put_bytes(&trailing);

        let decoded = codec.read(&mut channel).unwrap();
        prop_assert_eq!(&decoded, &command);
        prop_assert_eq!(channel.read_position(), entry_end);
        prop_assert_eq!(channel.remaining(), trailing.len() as u64);
    }

    #[test]
    fn any_flipped_byte_after_the_tag_is_corruption(
        codec in arb_enrichment_codec(),
        command in arb_enrichment(),
        index in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let mut bytes = codec.encode(&LogCommand::Enrichment(command)).unwrap();
        let at = 1 + index.index(bytes.len() - 1);
        bytes[at] ^= mask;
        let err = codec.decode(&bytes).unwrap_err();
        prop_assert!(err.is_corruption(), "byte {} flipped gave {:?}", at, err);
    }

    #[test]
    fn truncated_entries_are_corrupt(
        codec in arb_enrichment_codec(),
        command in arb_enrichment(),
        cut in any::<prop::sample::Index>(),
    ) {
        let bytes = codec.encode(&LogCommand::Enrichment(command)).unwrap();
        let keep = 1 + cut.index(bytes.len() - 1);
        let err = codec.decode(&bytes[..keep]).unwrap_err();
        prop_assert!(
            matches!(
                err,
                StoreError::CorruptLogEntry {
                    position: 0,
                    reason: LogCorruption::Truncated,
                }
            ),
            "kept {} bytes, got {:?}",
            keep,
            err
        );
    }
}

#[test]
fn generations_lay_out_sections_differently() {
    let command = LogCommand::Enrichment(EnrichmentCommand::new(
        EnrichmentMetadata {
            capture_mode: CaptureMode::Full,
            server_id: Uuid::from_u64_pair(5, 6),
            last_committed_tx: TxId(50),
            time_committed: 1_700_000_000_000,
            user_id: 3,
        },
        Bytes::from_static(b"ent"),
        Bytes::from_static(b"det"),
        Bytes::from_static(b"chg"),
        Bytes::from_static(b"val"),
        None,
    ));
    let older = LogCommandCodec::V5_12.encode(&command).unwrap();
    let latest = LogCommandCodec::V5_20.encode(&command).unwrap();
    assert_eq!(older.len(), latest.len());
    assert_ne!(older, latest);
    // lengths come first in the older layout, right after the fixed metadata
    let lengths = 1 + ENRICHMENT_METADATA_LEN;
    assert_eq!(&older[lengths..lengths + 8], &[0, 0, 0, 3, 0, 0, 0, 3]);
    assert_eq!(&latest[lengths..lengths + 7], &[0, 0, 0, 3, b'e', b'n', b't']);
    assert_eq!(LogCommandCodec::V5_12.decode(&older).unwrap(), command);
    assert_eq!(LogCommandCodec::V5_20.decode(&latest).unwrap(), command);
}

#[test]
fn oldest_codec_refuses_enrichment_both_ways() {
    let command = LogCommand::Enrichment(EnrichmentCommand::new(
        EnrichmentMetadata {
            capture_mode: CaptureMode::Diff,
            server_id: Uuid::nil(),
            last_committed_tx: TxId::BASE,
            time_committed: 0,
            user_id: 0,
        },
        Bytes::new(),
        Bytes::new(),
        Bytes::new(),
        Bytes::new(),
        None,
    ));
    assert!(matches!(
        LogCommandCodec::V4_3.encode(&command),
        Err(StoreError::UnsupportedCommand {
            tag: tags::ENRICHMENT,
            ..
        })
    ));
    let encoded = LogCommandCodec::LATEST.encode(&command).unwrap();
    assert!(matches!(
        LogCommandCodec::V4_3.decode(&encoded),
        Err(StoreError::UnsupportedCommand {
            tag: tags::ENRICHMENT,
            ..
        })
    ));
}

#[test]
fn seeded_command_stream_reads_back_in_order() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x51);
    for codec in [LogCommandCodec::V4_3, LogCommandCodec::V5_12, LogCommandCodec::V5_20] {
        let mut commands = Vec::new();
        for tx in 2..40u64 {
            commands.push(LogCommand::Start(StartEntry {
                tx_id: TxId(tx),
                time_written: rng.gen(),
            }));
            for _ in 0..rng.gen_range(1..4) {
                commands.push(LogCommand::GroupDegree(GroupDegreeCommand {
                    group: GroupId(rng.gen_range(0..1_000)),
                    rel_type: RelTypeId(rng.gen_range(0..16)),
                    direction: Direction::ALL[rng.gen_range(0..3)],
                    delta: rng.gen_range(-5..=5),
                }));
            }
        }
        let mut channel = InMemoryChannel::new();
        for command in &commands {
            codec.write(&mut channel, command).unwrap();
        }
        let mut decoded = Vec::new();
        while channel.remaining() > 0 {
            decoded.push(codec.read(&mut channel).unwrap());
        }
        assert_eq!(decoded, commands, "codec {codec}");
    }
}
