// [[AXON]]/apps/kernel-server/src/protocol/mod.rs
// Purpose: Wire protocol. Request/response/notification frames in the JSON-RPC 2.0 shape.
// Architecture: Protocol Layer
// Dependencies: Serde, thiserror

pub mod binary;
pub mod methods;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::rpc_code;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("bad magic: expected 0x4D435057, got {0:#x}")]
    BadMagic(u32),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),
    #[error("unknown method id {0}")]
    UnknownMethodId(u16),
    #[error("payload of {got} bytes exceeds limit of {limit}")]
    PayloadTooLarge { got: usize, limit: usize },
    #[error("truncated header: {0} bytes")]
    Truncated(usize),
    #[error("compressed payloads are not supported")]
    CompressionUnsupported,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Request,
    Response,
    Notification,
    Error,
    Ping,
    Pong,
}

impl FrameKind {
    pub fn wire_byte(self) -> u8 {
        match self {
            FrameKind::Request => 0,
            FrameKind::Response => 1,
            FrameKind::Notification => 2,
            FrameKind::Error => 3,
            FrameKind::Ping => 4,
            FrameKind::Pong => 5,
        }
    }

    pub fn from_wire_byte(b: u8) -> Result<Self, ProtocolError> {
        Ok(match b {
            0 => FrameKind::Request,
            1 => FrameKind::Response,
            2 => FrameKind::Notification,
            3 => FrameKind::Error,
            4 => FrameKind::Ping,
            5 => FrameKind::Pong,
            other => return Err(ProtocolError::UnknownFrameType(other)),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// One protocol frame. Requests and responses carry an id; notifications,
/// pings and pongs do not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
}

impl Frame {
    pub fn request(id: u64, method: &str, params: serde_json::Value) -> Self {
        Frame {
            id: Some(id),
            kind: FrameKind::Request,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn response(id: u64, result: serde_json::Value) -> Self {
        Frame {
            id: Some(id),
            kind: FrameKind::Response,
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn notification(method: &str, params: serde_json::Value) -> Self {
        Frame {
            id: None,
            kind: FrameKind::Notification,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn error(id: Option<u64>, code: i32, message: &str, data: Option<serde_json::Value>) -> Self {
        Frame {
            id,
            kind: FrameKind::Error,
            method: None,
            params: None,
            result: None,
            error: Some(FrameError {
                code,
                message: message.to_string(),
                data,
            }),
        }
    }

    pub fn ping() -> Self {
        Frame {
            id: None,
            kind: FrameKind::Ping,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    pub fn pong() -> Self {
        Frame {
            id: None,
            kind: FrameKind::Pong,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self.kind {
            FrameKind::Request => {
                if self.id.is_none() || self.method.is_none() {
                    return Err(ProtocolError::Malformed(
                        "request requires id and method".to_string(),
                    ));
                }
            }
            FrameKind::Response => {
                if self.id.is_none() || self.result.is_none() {
                    return Err(ProtocolError::Malformed(
                        "response requires id and result".to_string(),
                    ));
                }
            }
            FrameKind::Notification => {
                if self.method.is_none() {
                    return Err(ProtocolError::Malformed(
                        "notification requires method".to_string(),
                    ));
                }
                if self.id.is_some() {
                    return Err(ProtocolError::Malformed(
                        "notification must not carry an id".to_string(),
                    ));
                }
            }
            FrameKind::Error => {
                if self.error.is_none() {
                    return Err(ProtocolError::Malformed(
                        "error frame requires error body".to_string(),
                    ));
                }
            }
            FrameKind::Ping | FrameKind::Pong => {}
        }
        Ok(())
    }

    pub fn encode_json(&self) -> String {
        // Frames are plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"type\":\"error\",\"error\":{{\"code\":{},\"message\":\"encode failure\"}}}}",
                rpc_code::INTERNAL
            )
        })
    }

    pub fn decode_json(raw: &str) -> Result<Self, ProtocolError> {
        let frame: Frame =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        frame.validate()?;
        Ok(frame)
    }
}

/// Negotiated wire encoding, chosen by WebSocket subprotocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Binary,
}

pub const SUBPROTOCOL_JSON: &str = "mcp.v1";
pub const SUBPROTOCOL_BINARY: &str = "mcp.v1.binary";

impl WireFormat {
    pub fn from_subprotocol(proto: Option<&str>) -> Self {
        match proto {
            Some(SUBPROTOCOL_BINARY) => WireFormat::Binary,
            _ => WireFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_request() {
        let frame = Frame::request(7, "task.create", json!({"title": "build it"}));
        let decoded = Frame::decode_json(&frame.encode_json()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn json_round_trip_error() {
        let frame = Frame::error(Some(3), rpc_code::INVALID_PARAMS, "bad params", None);
        let decoded = Frame::decode_json(&frame.encode_json()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn json_round_trip_notification() {
        let frame = Frame::notification("task.status", json!({"status": "running"}));
        let decoded = Frame::decode_json(&frame.encode_json()).unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.id.is_none());
    }

    #[test]
    fn request_without_id_is_rejected() {
        let raw = json!({"type": "request", "method": "ping"}).to_string();
        assert!(Frame::decode_json(&raw).is_err());
    }

    #[test]
    fn notification_with_id_is_rejected() {
        let raw = json!({"type": "notification", "method": "x", "id": 4}).to_string();
        assert!(Frame::decode_json(&raw).is_err());
    }

    #[test]
    fn subprotocol_negotiation() {
        assert_eq!(
            WireFormat::from_subprotocol(Some("mcp.v1.binary")),
            WireFormat::Binary
        );
        assert_eq!(WireFormat::from_subprotocol(Some("mcp.v1")), WireFormat::Json);
        assert_eq!(WireFormat::from_subprotocol(None), WireFormat::Json);
    }
}
