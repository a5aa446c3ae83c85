//! Subscription wire frames (`graphql-ws` sub-protocol)

use crate::backend::GraphQlRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// WebSocket sub-protocol spoken by the backend
pub const SUB_PROTOCOL: &str = "graphql-ws";

/// Id used for the single operation of a session
pub const OPERATION_ID: &str = "1";

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    ConnectionInit,
    ConnectionAck,
    Start,
    Stop,
    Data,
    Error,
    Complete,
    Ka,
    ConnectionTerminate,
    #[serde(alias = "conn_err")]
    ConnectionError,
}

/// One text frame `{id?, type, payload?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Frame {
    fn bare(frame_type: FrameType) -> Self {
        Self {
            id: None,
            frame_type,
            payload: None,
        }
    }

    pub fn connection_init() -> Self {
        Self::bare(FrameType::ConnectionInit)
    }

    pub fn connection_terminate() -> Self {
        Self::bare(FrameType::ConnectionTerminate)
    }

    /// Start frame carrying the subscription query and variables
    pub fn start(request: &GraphQlRequest) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Some(OPERATION_ID.to_string()),
            frame_type: FrameType::Start,
            payload: Some(serde_json::to_value(request)?),
        })
    }

    pub fn stop() -> Self {
        Self {
            id: Some(OPERATION_ID.to_string()),
            ..Self::bare(FrameType::Stop)
        }
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type_tags() {
        let cases = [
            ("connection_init", FrameType::ConnectionInit),
            ("connection_ack", FrameType::ConnectionAck),
            ("ka", FrameType::Ka),
            ("data", FrameType::Data),
            ("complete", FrameType::Complete),
            ("connection_terminate", FrameType::ConnectionTerminate),
            ("connection_error", FrameType::ConnectionError),
        ];
        for (tag, expected) in cases {
            let frame = Frame::decode(&format!(r#"{{"type":"{tag}"}}"#)).unwrap();
            assert_eq!(frame.frame_type, expected, "tag {tag}");
        }
    }

    #[test]
    fn test_conn_err_alias() {
        let frame = Frame::decode(r#"{"type":"conn_err","payload":"bad token"}"#).unwrap();
        assert_eq!(frame.frame_type, FrameType::ConnectionError);
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        assert!(Frame::decode(r#"{"type":"subscribe"}"#).is_err());
        assert!(Frame::decode(r#"{"id":"1"}"#).is_err());
        assert!(Frame::decode("not json").is_err());
    }

    #[test]
    fn test_start_frame_shape() {
        let request = GraphQlRequest::new("subscription S { a }", json!({"topic": "controls:t"}));

        let encoded = serde_json::to_value(Frame::start(&request).unwrap()).unwrap();

        assert_eq!(
            encoded,
            json!({
                "id": "1",
                "type": "start",
                "payload": {"query": "subscription S { a }", "variables": {"topic": "controls:t"}}
            })
        );
    }

    #[test]
    fn test_init_frame_has_no_optional_fields() {
        assert_eq!(
            Frame::connection_init().encode().unwrap(),
            r#"{"type":"connection_init"}"#
        );
    }
}
