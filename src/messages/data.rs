use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServerError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataMessageType {
    UserInput,
    Ping,
    Pong,
    Heartbeat,
    Enter,
    Sync,
}

/// Wire encoding of one datagram. MessagePack maps never start with `{`,
/// so the first byte is enough to tell the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCodec {
    Json,
    MsgPack,
}

impl DataCodec {
    pub fn detect(bytes: &[u8]) -> Self {
        match bytes.first() {
            Some(b'{') => DataCodec::Json,
            _ => DataCodec::MsgPack,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    #[serde(rename = "type")]
    pub kind: DataMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub sequence_number: u64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl DataMessage {
    pub fn new(kind: DataMessageType) -> Self {
        Self {
            kind,
            actor: None,
            timestamp: 0,
            sequence_number: 0,
            data: Value::Null,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// The one-time code carried by an `ENTER` datagram.
    pub fn enter_code(&self) -> Option<&str> {
        self.data.as_str()
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, DataCodec), ServerError> {
        let codec = DataCodec::detect(bytes);
        let message = match codec {
            DataCodec::Json => serde_json::from_slice(bytes)
                .map_err(|e| ServerError::Protocol(format!("bad json datagram: {}", e)))?,
            DataCodec::MsgPack => rmp_serde::from_slice(bytes)
                .map_err(|e| ServerError::Protocol(format!("bad msgpack datagram: {}", e)))?,
        };
        Ok((message, codec))
    }

    pub fn encode(&self, codec: DataCodec) -> Result<Vec<u8>, ServerError> {
        match codec {
            DataCodec::Json => {
                serde_json::to_vec(self).map_err(|e| ServerError::Protocol(e.to_string()))
            }
            DataCodec::MsgPack => {
                rmp_serde::to_vec_named(self).map_err(|e| ServerError::Protocol(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_user_input() {
        let raw = br#"{"type":"USER_INPUT","actor":"a","timestamp":17,"sequenceNumber":3,"data":{"angle":1.5}}"#;
        let (msg, codec) = DataMessage::decode(raw).unwrap();
        assert_eq!(codec, DataCodec::Json);
        assert_eq!(msg.kind, DataMessageType::UserInput);
        assert_eq!(msg.sequence_number, 3);
        assert_eq!(msg.data, json!({"angle": 1.5}));
    }

    #[test]
    fn test_msgpack_is_detected_and_answered_in_kind() {
        let ping = DataMessage::new(DataMessageType::Ping).with_timestamp(1234);
        let bytes = ping.encode(DataCodec::MsgPack).unwrap();
        assert_eq!(DataCodec::detect(&bytes), DataCodec::MsgPack);

        let (decoded, codec) = DataMessage::decode(&bytes).unwrap();
        assert_eq!(codec, DataCodec::MsgPack);
        assert_eq!(decoded.timestamp, 1234);
        assert_eq!(decoded.data, Value::Null);
    }

    #[test]
    fn test_enter_code_travels_in_data() {
        let raw = br#"{"type":"ENTER","data":"K3Y9"}"#;
        let (msg, _) = DataMessage::decode(raw).unwrap();
        assert_eq!(msg.enter_code(), Some("K3Y9"));
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        assert!(matches!(
            DataMessage::decode(b"{oops"),
            Err(ServerError::Protocol(_))
        ));
        assert!(matches!(
            DataMessage::decode(&[0xc1, 0x00]),
            Err(ServerError::Protocol(_))
        ));
    }
}
