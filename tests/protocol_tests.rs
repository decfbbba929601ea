use kubos_telemetry::protocol::*;
use kubos_telemetry::*;
use serde_cbor::Value;
use std::collections::BTreeMap;

fn raw_map(entries: &[(&str, Value)]) -> Vec<u8> {
    let map: BTreeMap<Value, Value> = entries
        .iter()
        .map(|(k, v)| (Value::Text((*k).to_owned()), v.clone()))
        .collect();
    serde_cbor::to_vec(&Value::Map(map)).unwrap()
}

#[test]
fn test_int_packet_keeps_every_field() {
    let packet = TelemetryPacket::with_timestamp(12, 3, TelemetryData::Int(99), 1_700_000_000_123);
    let bytes = packet.encode().unwrap();

    let decoded = TelemetryPacket::decode(&bytes).unwrap();
    assert_eq!(decoded.topic_id, 12);
    assert_eq!(decoded.subsystem_id, 3);
    assert_eq!(decoded.data, TelemetryData::Int(99));
    assert_eq!(decoded.data_type(), DataType::Int);
    assert_eq!(decoded.timestamp, 1_700_000_000_123);
}

#[test]
fn test_float_packet_decodes_as_float() {
    let packet = TelemetryPacket::with_timestamp(4, -1, TelemetryData::Float(21.5), 42);
    let decoded = TelemetryPacket::decode(&packet.encode().unwrap()).unwrap();

    assert_eq!(decoded.data.as_float(), Some(21.5));
    assert_eq!(decoded.data.as_int(), None);
    assert_eq!(decoded.subsystem_id, -1);
}

#[test]
fn test_new_packet_is_timestamped() {
    let before = current_timestamp_ms();
    let packet = TelemetryPacket::new(1, 1, TelemetryData::Int(0));
    assert!(packet.timestamp >= before);
}

#[test]
fn test_control_envelopes() {
    for envelope in [
        Envelope::Subscribe(12),
        Envelope::Unsubscribe(65535),
        Envelope::Disconnect,
        Envelope::Ack(Ack {
            request: AckKind::Unsubscribe,
            topic_id: 7,
            accepted: false,
        }),
    ] {
        let bytes = envelope.encode().unwrap();
        assert_eq!(decode_message_type(&bytes).unwrap(), envelope.message_type());
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }
}

#[test]
fn test_wire_message_type_codes() {
    let bytes = Envelope::Disconnect.encode().unwrap();
    let value: Value = serde_cbor::from_slice(&bytes).unwrap();
    match value {
        Value::Map(map) => {
            assert_eq!(map.len(), 1);
            assert_eq!(map.get(&Value::Text(KEY_MESSAGE_TYPE.into())), Some(&Value::Integer(3)));
        }
        other => panic!("expected a map, got {:?}", other),
    }

    let ack = Envelope::Ack(Ack {
        request: AckKind::Subscribe,
        topic_id: 5,
        accepted: true,
    });
    assert_eq!(ack.message_type().code(), 4);
    let value: Value = serde_cbor::from_slice(&ack.encode().unwrap()).unwrap();
    if let Value::Map(map) = value {
        assert_eq!(map.get(&Value::Text(KEY_ACK_TYPE.into())), Some(&Value::Integer(1)));
        assert_eq!(map.get(&Value::Text(KEY_ACCEPTED.into())), Some(&Value::Bool(true)));
    }
}

#[test]
fn test_decode_packet_from_foreign_encoder() {
    let bytes = raw_map(&[
        (KEY_MESSAGE_TYPE, Value::Integer(0)),
        (KEY_TOPIC_ID, Value::Integer(12)),
        (KEY_SUBSYSTEM_ID, Value::Integer(2)),
        (KEY_DATA_TYPE, Value::Integer(1)),
        (KEY_DATA, Value::Float(0.25)),
        (KEY_TIMESTAMP, Value::Integer(10)),
    ]);

    let packet = TelemetryPacket::decode(&bytes).unwrap();
    assert_eq!(packet.data, TelemetryData::Float(0.25));
    assert_eq!(packet.topic_id, 12);
}

#[test]
fn test_malformed_buffers() {
    assert_eq!(Envelope::decode(&[0xff, 0x00, 0x13]), Err(CodecError::Malformed));
    assert_eq!(Envelope::decode(&[]), Err(CodecError::Malformed));

    let not_a_map = serde_cbor::to_vec(&Value::Integer(3)).unwrap();
    assert_eq!(Envelope::decode(&not_a_map), Err(CodecError::NotAMap));
}

#[test]
fn test_unknown_message_type() {
    let bytes = raw_map(&[(KEY_MESSAGE_TYPE, Value::Integer(9))]);
    assert_eq!(decode_message_type(&bytes), Err(CodecError::UnknownMessageType(9)));
    assert_eq!(Envelope::decode(&bytes), Err(CodecError::UnknownMessageType(9)));
}

#[test]
fn test_missing_and_mistyped_fields() {
    let no_topic = raw_map(&[(KEY_MESSAGE_TYPE, Value::Integer(1))]);
    assert_eq!(Envelope::decode(&no_topic), Err(CodecError::MissingField(KEY_TOPIC_ID)));

    let no_type = raw_map(&[(KEY_TOPIC_ID, Value::Integer(1))]);
    assert_eq!(Envelope::decode(&no_type), Err(CodecError::MissingField(KEY_MESSAGE_TYPE)));

    let text_topic = raw_map(&[
        (KEY_MESSAGE_TYPE, Value::Integer(1)),
        (KEY_TOPIC_ID, Value::Text("twelve".into())),
    ]);
    assert_eq!(Envelope::decode(&text_topic), Err(CodecError::TypeMismatch(KEY_TOPIC_ID)));

    let big_topic = raw_map(&[
        (KEY_MESSAGE_TYPE, Value::Integer(2)),
        (KEY_TOPIC_ID, Value::Integer(70_000)),
    ]);
    assert_eq!(Envelope::decode(&big_topic), Err(CodecError::OutOfRange(KEY_TOPIC_ID)));
}

#[test]
fn test_data_must_match_declared_type() {
    let mut fields = vec![
        (KEY_MESSAGE_TYPE, Value::Integer(0)),
        (KEY_TOPIC_ID, Value::Integer(1)),
        (KEY_SUBSYSTEM_ID, Value::Integer(1)),
        (KEY_DATA_TYPE, Value::Integer(0)),
        (KEY_DATA, Value::Float(1.5)),
        (KEY_TIMESTAMP, Value::Integer(0)),
    ];
    assert_eq!(Envelope::decode(&raw_map(&fields)), Err(CodecError::TypeMismatch(KEY_DATA)));

    fields[3] = (KEY_DATA_TYPE, Value::Integer(7));
    assert_eq!(Envelope::decode(&raw_map(&fields)), Err(CodecError::InvalidDataType(7)));
}

#[test]
fn test_packet_decode_rejects_other_kinds() {
    let bytes = Envelope::Subscribe(3).encode().unwrap();
    assert_eq!(
        TelemetryPacket::decode(&bytes),
        Err(CodecError::UnexpectedMessageType(MessageType::Subscribe))
    );
}

#[test]
fn test_packet_fits_default_frame() {
    let packet = TelemetryPacket::new(u16::MAX, i32::MIN, TelemetryData::Int(i32::MAX));
    assert!(packet.encode().unwrap().len() < config::DEFAULT_MAX_FRAME_SIZE);
}
