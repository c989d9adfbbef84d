use anyhow::Result;

use crate::models::{PChannelMeta, TaskKind, TaskRecord, TaskState};
use crate::utils;

#[test]
fn encode_decode_u64_round_trip() -> Result<()> {
    for val in [0u64, 1, 42, u64::MAX] {
        let encoded = utils::encode_u64(val);
        let decoded = utils::decode_u64(&encoded)?;
        assert_eq!(val, decoded, "expected decoded u64 to be {} got {}", val, decoded);
    }
    Ok(())
}

#[test]
fn decode_u64_invalid_len_errors() {
    let res = utils::decode_u64(&[0u8; 3]);
    assert!(res.is_err(), "expected an error decoding a 3 byte u64, got {:?}", res);
}

#[test]
fn encode_decode_i64_round_trip() -> Result<()> {
    for val in [i64::MIN, -1, 0, 1, i64::MAX] {
        let encoded = utils::encode_i64(val);
        let decoded = utils::decode_i64(&encoded)?;
        assert_eq!(val, decoded, "expected decoded i64 to be {} got {}", val, decoded);
    }
    Ok(())
}

#[test]
fn encode_decode_model_round_trip() -> Result<()> {
    let mut meta = PChannelMeta {
        name: "wal-0".into(),
        term: 3,
        node_id: 7,
        vchannel_count: 2,
        ..Default::default()
    };
    meta.state = crate::models::ChannelState::Assigned as i32;
    let encoded = utils::encode_model(&meta)?;
    let decoded: PChannelMeta = utils::decode_model(&encoded)?;
    assert_eq!(meta, decoded, "expected channel metas to be identical after round trip");

    let record = TaskRecord {
        task_id: 11,
        kind: TaskKind::IndexBuild as i32,
        state: TaskState::Init as i32,
        collection_id: 100,
        segment_id: 200,
        payload_size: 1 << 20,
        ..Default::default()
    };
    let encoded = utils::encode_model(&record)?;
    let decoded: TaskRecord = utils::decode_model(&encoded)?;
    assert_eq!(record, decoded, "expected task records to be identical after round trip");
    Ok(())
}
