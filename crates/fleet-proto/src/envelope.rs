//! Wire envelope shared by both legs of an agent connection

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope `type` values
pub mod message_type {
    // Agent -> server
    pub const STATUS: &str = "status";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const EVENT: &str = "event";
    pub const PROBE_RESULT: &str = "probe_result";
    pub const CONFIG_ACK: &str = "config_ack";
    pub const RULE_SYNC_STATUS: &str = "rule_sync_status";
    pub const TUNNEL_HEALTH_REPORT: &str = "tunnel_health_report";

    // Server -> agent
    pub const COMMAND: &str = "command";
    pub const PROBE_TASK: &str = "probe_task";
    pub const CONFIG_SYNC: &str = "config_sync";
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected message type {expected}, got {actual}")]
    UnexpectedType { expected: String, actual: String },
}

/// `{ "type", "agent_id", "timestamp", "data" }`
///
/// `agent_id` carries the node id for node connections; the field name is kept
/// for wire compatibility with deployed agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub agent_id: String,
    /// Unix timestamp (seconds)
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Build an envelope stamped with the current time
    pub fn new<T: Serialize>(
        msg_type: &str,
        agent_id: &str,
        data: &T,
    ) -> Result<Self, ProtoError> {
        Ok(Self {
            msg_type: msg_type.to_string(),
            agent_id: agent_id.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize the `data` field into a typed payload
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        Ok(T::deserialize(&self.data)?)
    }

    /// Like [`Envelope::parse_data`], but first checks the envelope type
    pub fn expect<T: DeserializeOwned>(&self, msg_type: &str) -> Result<T, ProtoError> {
        if self.msg_type != msg_type {
            return Err(ProtoError::UnexpectedType {
                expected: msg_type.to_string(),
                actual: self.msg_type.clone(),
            });
        }
        self.parse_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ConfigAck;

    #[test]
    fn test_decode_agent_envelope() {
        let raw = r#"{"type":"config_ack","agent_id":"fa_001","timestamp":1700000000,"data":{"version":7,"success":true}}"#;
        let env = Envelope::decode(raw).unwrap();

        assert_eq!(env.msg_type, message_type::CONFIG_ACK);
        assert_eq!(env.agent_id, "fa_001");

        let ack: ConfigAck = env.expect(message_type::CONFIG_ACK).unwrap();
        assert_eq!(ack.version, 7);
        assert!(ack.success);
        assert!(ack.error.is_none());
    }

    #[test]
    fn test_missing_optional_fields() {
        let env = Envelope::decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(env.msg_type, "heartbeat");
        assert_eq!(env.agent_id, "");
        assert!(env.data.is_null());
    }

    #[test]
    fn test_type_field_is_renamed() {
        let env = Envelope::new(message_type::HEARTBEAT, "a1", &serde_json::json!({})).unwrap();
        let text = env.encode().unwrap();
        assert!(text.contains(r#""type":"heartbeat""#));
        assert!(!text.contains("msg_type"));
    }

    #[test]
    fn test_expect_wrong_type() {
        let env = Envelope::new(message_type::STATUS, "a1", &serde_json::json!({})).unwrap();
        let err = env.expect::<ConfigAck>(message_type::CONFIG_ACK).unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedType { .. }));
    }

    #[test]
    fn test_malformed_json() {
        assert!(Envelope::decode("{not json").is_err());
        assert!(Envelope::decode(r#"{"agent_id":"a1"}"#).is_err());
    }
}
