//! Telemetry message types and the CBOR envelope codec.
//!
//! Every message on the wire is a CBOR map carrying a `MESSAGE_TYPE`
//! discriminator plus the fields of that kind. Decoding reads the
//! discriminator first and only then the kind-specific fields; the decoded
//! value is assembled locally and handed back only when every field parsed.

use serde::{Deserialize, Serialize};
use serde_cbor::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const KEY_MESSAGE_TYPE: &str = "MESSAGE_TYPE";
pub const KEY_TOPIC_ID: &str = "TOPIC_ID";
pub const KEY_SUBSYSTEM_ID: &str = "SUBSYSTEM_ID";
pub const KEY_DATA_TYPE: &str = "DATA_TYPE";
pub const KEY_DATA: &str = "DATA";
pub const KEY_TIMESTAMP: &str = "TIMESTAMP";
pub const KEY_ACK_TYPE: &str = "ACK_TYPE";
pub const KEY_ACCEPTED: &str = "ACCEPTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Packet,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Ack,
}

impl MessageType {
    pub fn code(self) -> i128 {
        match self {
            MessageType::Packet => 0,
            MessageType::Subscribe => 1,
            MessageType::Unsubscribe => 2,
            MessageType::Disconnect => 3,
            MessageType::Ack => 4,
        }
    }

    pub fn from_code(code: i128) -> Result<Self, CodecError> {
        match code {
            0 => Ok(MessageType::Packet),
            1 => Ok(MessageType::Subscribe),
            2 => Ok(MessageType::Unsubscribe),
            3 => Ok(MessageType::Disconnect),
            4 => Ok(MessageType::Ack),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int,
    Float,
}

impl DataType {
    pub fn code(self) -> i128 {
        match self {
            DataType::Int => 0,
            DataType::Float => 1,
        }
    }

    pub fn from_code(code: i128) -> Result<Self, CodecError> {
        match code {
            0 => Ok(DataType::Int),
            1 => Ok(DataType::Float),
            other => Err(CodecError::InvalidDataType(other)),
        }
    }
}

/// Sample value carried by a packet. The variant is the data type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TelemetryData {
    Int(i32),
    Float(f32),
}

impl TelemetryData {
    pub fn data_type(self) -> DataType {
        match self {
            TelemetryData::Int(_) => DataType::Int,
            TelemetryData::Float(_) => DataType::Float,
        }
    }

    pub fn as_int(self) -> Option<i32> {
        match self {
            TelemetryData::Int(i) => Some(i),
            TelemetryData::Float(_) => None,
        }
    }

    pub fn as_float(self) -> Option<f32> {
        match self {
            TelemetryData::Int(_) => None,
            TelemetryData::Float(f) => Some(f),
        }
    }
}

impl core::fmt::Display for TelemetryData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TelemetryData::Int(i) => write!(f, "{i}"),
            TelemetryData::Float(v) => write!(f, "{v}"),
        }
    }
}

/// One telemetry sample as produced by a subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPacket {
    pub topic_id: u16,
    pub subsystem_id: i32,
    pub data: TelemetryData,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
}

impl TelemetryPacket {
    /// Packet stamped with the current wall-clock time.
    pub fn new(topic_id: u16, subsystem_id: i32, data: TelemetryData) -> Self {
        Self::with_timestamp(topic_id, subsystem_id, data, current_timestamp_ms())
    }

    pub fn with_timestamp(topic_id: u16, subsystem_id: i32, data: TelemetryData, timestamp: u64) -> Self {
        Self {
            topic_id,
            subsystem_id,
            data,
            timestamp,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Envelope::Packet(*self).encode()
    }

    /// Decodes a buffer that must hold a PACKET envelope.
    pub fn decode(buffer: &[u8]) -> Result<Self, CodecError> {
        match Envelope::decode(buffer)? {
            Envelope::Packet(packet) => Ok(packet),
            other => Err(CodecError::UnexpectedMessageType(other.message_type())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckKind {
    Subscribe,
    Unsubscribe,
}

impl AckKind {
    fn message_type(self) -> MessageType {
        match self {
            AckKind::Subscribe => MessageType::Subscribe,
            AckKind::Unsubscribe => MessageType::Unsubscribe,
        }
    }
}

/// Broker reply confirming whether a subscription change was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub request: AckKind,
    pub topic_id: u16,
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    Packet(TelemetryPacket),
    Subscribe(u16),
    Unsubscribe(u16),
    Disconnect,
    Ack(Ack),
}

impl Envelope {
    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Packet(_) => MessageType::Packet,
            Envelope::Subscribe(_) => MessageType::Subscribe,
            Envelope::Unsubscribe(_) => MessageType::Unsubscribe,
            Envelope::Disconnect => MessageType::Disconnect,
            Envelope::Ack(_) => MessageType::Ack,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut map = BTreeMap::new();
        insert(&mut map, KEY_MESSAGE_TYPE, Value::Integer(self.message_type().code()));

        match self {
            Envelope::Packet(packet) => {
                insert(&mut map, KEY_TOPIC_ID, Value::Integer(i128::from(packet.topic_id)));
                insert(&mut map, KEY_SUBSYSTEM_ID, Value::Integer(i128::from(packet.subsystem_id)));
                insert(&mut map, KEY_DATA_TYPE, Value::Integer(packet.data_type().code()));
                let data = match packet.data {
                    TelemetryData::Int(i) => Value::Integer(i128::from(i)),
                    TelemetryData::Float(f) => Value::Float(f64::from(f)),
                };
                insert(&mut map, KEY_DATA, data);
                insert(&mut map, KEY_TIMESTAMP, Value::Integer(i128::from(packet.timestamp)));
            }
            Envelope::Subscribe(topic_id) | Envelope::Unsubscribe(topic_id) => {
                insert(&mut map, KEY_TOPIC_ID, Value::Integer(i128::from(*topic_id)));
            }
            Envelope::Disconnect => {}
            Envelope::Ack(ack) => {
                insert(&mut map, KEY_ACK_TYPE, Value::Integer(ack.request.message_type().code()));
                insert(&mut map, KEY_TOPIC_ID, Value::Integer(i128::from(ack.topic_id)));
                insert(&mut map, KEY_ACCEPTED, Value::Bool(ack.accepted));
            }
        }

        serde_cbor::to_vec(&Value::Map(map)).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, CodecError> {
        let map = parse_map(buffer)?;
        let message_type = read_message_type(&map)?;

        let envelope = match message_type {
            MessageType::Packet => Envelope::Packet(read_packet(&map)?),
            MessageType::Subscribe => Envelope::Subscribe(u16_field(&map, KEY_TOPIC_ID)?),
            MessageType::Unsubscribe => Envelope::Unsubscribe(u16_field(&map, KEY_TOPIC_ID)?),
            MessageType::Disconnect => Envelope::Disconnect,
            MessageType::Ack => Envelope::Ack(read_ack(&map)?),
        };

        Ok(envelope)
    }
}

/// First decoding phase: the discriminator alone.
pub fn decode_message_type(buffer: &[u8]) -> Result<MessageType, CodecError> {
    let map = parse_map(buffer)?;
    read_message_type(&map)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("buffer is not valid CBOR")]
    Malformed,
    #[error("envelope is not a CBOR map")]
    NotAMap,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {0} has the wrong type")]
    TypeMismatch(&'static str),
    #[error("field {0} is out of range")]
    OutOfRange(&'static str),
    #[error("unknown message type {0}")]
    UnknownMessageType(i128),
    #[error("unknown telemetry data type {0}")]
    InvalidDataType(i128),
    #[error("expected a packet, got {0:?}")]
    UnexpectedMessageType(MessageType),
    #[error("encoding failed: {0}")]
    Encode(String),
}

pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

type CborMap = BTreeMap<Value, Value>;

fn insert(map: &mut CborMap, key: &str, value: Value) {
    map.insert(Value::Text(key.to_owned()), value);
}

fn parse_map(buffer: &[u8]) -> Result<CborMap, CodecError> {
    match serde_cbor::from_slice::<Value>(buffer) {
        Ok(Value::Map(map)) => Ok(map),
        Ok(_) => Err(CodecError::NotAMap),
        Err(_) => Err(CodecError::Malformed),
    }
}

fn read_message_type(map: &CborMap) -> Result<MessageType, CodecError> {
    MessageType::from_code(int_field(map, KEY_MESSAGE_TYPE)?)
}

fn field<'a>(map: &'a CborMap, key: &'static str) -> Result<&'a Value, CodecError> {
    map.get(&Value::Text(key.to_owned()))
        .ok_or(CodecError::MissingField(key))
}

fn int_field(map: &CborMap, key: &'static str) -> Result<i128, CodecError> {
    match field(map, key)? {
        Value::Integer(i) => Ok(*i),
        _ => Err(CodecError::TypeMismatch(key)),
    }
}

fn u16_field(map: &CborMap, key: &'static str) -> Result<u16, CodecError> {
    u16::try_from(int_field(map, key)?).map_err(|_| CodecError::OutOfRange(key))
}

fn read_packet(map: &CborMap) -> Result<TelemetryPacket, CodecError> {
    let topic_id = u16_field(map, KEY_TOPIC_ID)?;
    let subsystem_id =
        i32::try_from(int_field(map, KEY_SUBSYSTEM_ID)?).map_err(|_| CodecError::OutOfRange(KEY_SUBSYSTEM_ID))?;
    let data_type = DataType::from_code(int_field(map, KEY_DATA_TYPE)?)?;

    let data = match (data_type, field(map, KEY_DATA)?) {
        (DataType::Int, Value::Integer(i)) => {
            TelemetryData::Int(i32::try_from(*i).map_err(|_| CodecError::OutOfRange(KEY_DATA))?)
        }
        (DataType::Float, Value::Float(f)) => TelemetryData::Float(*f as f32),
        _ => return Err(CodecError::TypeMismatch(KEY_DATA)),
    };

    let timestamp =
        u64::try_from(int_field(map, KEY_TIMESTAMP)?).map_err(|_| CodecError::OutOfRange(KEY_TIMESTAMP))?;

    Ok(TelemetryPacket {
        topic_id,
        subsystem_id,
        data,
        timestamp,
    })
}

fn read_ack(map: &CborMap) -> Result<Ack, CodecError> {
    let request = match MessageType::from_code(int_field(map, KEY_ACK_TYPE)?)? {
        MessageType::Subscribe => AckKind::Subscribe,
        MessageType::Unsubscribe => AckKind::Unsubscribe,
        _ => return Err(CodecError::OutOfRange(KEY_ACK_TYPE)),
    };
    let topic_id = u16_field(map, KEY_TOPIC_ID)?;
    let accepted = match field(map, KEY_ACCEPTED)? {
        Value::Bool(b) => *b,
        _ => return Err(CodecError::TypeMismatch(KEY_ACCEPTED)),
    };

    Ok(Ack {
        request,
        topic_id,
        accepted,
    })
}
