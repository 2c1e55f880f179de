//! Wire envelope and the V2 JSON array codec.
//!
//! Every message in either direction is one envelope
//! `{join_ref, ref, topic, event, payload}`, encoded on the wire as the JSON
//! array `[join_ref, ref, topic, event, payload]`.
//!
//! Reserved protocol pieces:
//! - topic `"phoenix"` carries heartbeats
//! - `phx_join` / `phx_leave`: channel lifecycle requests
//! - `phx_reply`: reply to a client request, payload `{status, response}`
//! - `phx_error` / `phx_close`: server-side channel crash / close

use crate::error::WireError;
use serde_json::{json, Value};

/// Protocol version tag merged into the connect query parameters.
pub const VSN: &str = "2.0.0";

/// Reserved control topic carrying heartbeats.
pub const CONTROL_TOPIC: &str = "phoenix";

/// Reserved protocol event names.
pub mod events {
    /// Join a channel topic.
    pub const JOIN: &str = "phx_join";
    /// Leave a channel topic.
    pub const LEAVE: &str = "phx_leave";
    /// Reply to a client request.
    pub const REPLY: &str = "phx_reply";
    /// Server-side channel crash.
    pub const ERROR: &str = "phx_error";
    /// Server-side channel close.
    pub const CLOSE: &str = "phx_close";
    /// Keepalive on the control topic.
    pub const HEARTBEAT: &str = "heartbeat";
}

/// One wire envelope, either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Join reference scoping this message to a channel's join epoch.
    pub join_ref: Option<String>,
    /// Message reference for request/reply correlation.
    pub msg_ref: Option<String>,
    /// The topic (e.g. `"room:lobby"`).
    pub topic: String,
    /// The event name (e.g. `"phx_join"`, `"new_msg"`).
    pub event: String,
    /// The payload.
    pub payload: Value,
}

impl Message {
    /// Create an envelope with no references.
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Set the join reference.
    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Set the message reference.
    pub fn with_msg_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    /// A heartbeat envelope on the reserved control topic.
    pub fn heartbeat(msg_ref: impl Into<String>) -> Self {
        Message::new(CONTROL_TOPIC, events::HEARTBEAT, json!({})).with_msg_ref(msg_ref)
    }

    /// Encode as the V2 JSON array `[join_ref, ref, topic, event, payload]`.
    pub fn encode(&self) -> Result<String, WireError> {
        let frame = json!([
            self.join_ref,
            self.msg_ref,
            self.topic,
            self.event,
            self.payload
        ]);
        Ok(serde_json::to_string(&frame)?)
    }

    /// Decode a V2 JSON array frame.
    pub fn decode(raw: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(raw)?;
        let parts = value.as_array().ok_or(WireError::BadShape)?;
        if parts.len() != 5 {
            return Err(WireError::BadShape);
        }
        let topic = parts[2].as_str().ok_or(WireError::BadFields)?;
        let event = parts[3].as_str().ok_or(WireError::BadFields)?;
        Ok(Message {
            join_ref: parts[0].as_str().map(String::from),
            msg_ref: parts[1].as_str().map(String::from),
            topic: topic.to_string(),
            event: event.to_string(),
            payload: parts[4].clone(),
        })
    }

    /// Whether this envelope is a `phx_reply`.
    pub fn is_reply(&self) -> bool {
        self.event == events::REPLY
    }

    /// Parse the `{status, response}` payload of a reply envelope.
    pub fn reply(&self) -> Option<Reply> {
        if !self.is_reply() {
            return None;
        }
        let status = self.payload.get("status")?.as_str()?.to_string();
        let response = self
            .payload
            .get("response")
            .cloned()
            .unwrap_or(Value::Null);
        Some(Reply { status, response })
    }
}

/// Status and response carried by a `phx_reply` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Reply status, e.g. `"ok"`, `"error"`, or the locally synthesized `"timeout"`.
    pub status: String,
    /// The response payload.
    pub response: Value,
}

impl Reply {
    /// Create a reply.
    pub fn new(status: impl Into<String>, response: Value) -> Self {
        Self {
            status: status.into(),
            response,
        }
    }

    /// Whether the status is `"ok"`.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let message = Message::new("room:lobby", "shout", json!({"msg": "hi"}))
            .with_join_ref("1")
            .with_msg_ref("2");

        let frame = message.encode().unwrap();
        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_null_refs() {
        let decoded = Message::decode(r#"[null,null,"room:lobby","new_msg",{"a":1}]"#).unwrap();
        assert_eq!(decoded.join_ref, None);
        assert_eq!(decoded.msg_ref, None);
        assert_eq!(decoded.topic, "room:lobby");
        assert_eq!(decoded.payload, json!({"a": 1}));
    }

    #[test]
    fn test_decode_rejects_bad_shapes() {
        assert!(Message::decode("not json").is_err());
        assert!(Message::decode(r#"{"topic":"x"}"#).is_err());
        assert!(Message::decode(r#"[null,null,"topic","event"]"#).is_err());
        assert!(Message::decode(r#"[null,null,42,"event",{}]"#).is_err());
    }

    #[test]
    fn test_reply_parsing() {
        let reply = Message::decode(
            r#"["1","2","room:lobby","phx_reply",{"status":"ok","response":{"x":1}}]"#,
        )
        .unwrap()
        .reply()
        .unwrap();

        assert!(reply.is_ok());
        assert_eq!(reply.response, json!({"x": 1}));

        let not_reply = Message::new("room:lobby", "shout", json!({}));
        assert!(not_reply.reply().is_none());
    }

    #[test]
    fn test_heartbeat_shape() {
        let heartbeat = Message::heartbeat("7");
        assert_eq!(heartbeat.topic, CONTROL_TOPIC);
        assert_eq!(heartbeat.event, events::HEARTBEAT);
        assert_eq!(heartbeat.msg_ref.as_deref(), Some("7"));
        assert_eq!(heartbeat.join_ref, None);
    }
}
