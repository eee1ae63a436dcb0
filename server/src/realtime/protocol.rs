//! Wire protocol for the WebSocket Hub: JSON text frames, a fixed envelope
//! shape inbound, a small tagged enum outbound.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Deserialize)]
struct InboundEnvelope {
    v: u8,
    id: Uuid,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    size: usize,
}

#[derive(Debug, Clone)]
pub enum ClientFrame {
    Msg {
        id: Uuid,
        payload: serde_json::Value,
        size: usize,
    },
    Resume {
        resume_token: String,
        last_client_seq: u64,
    },
    Ping,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "connection_ack")]
    ConnectionAck {
        #[serde(rename = "resumeToken")]
        resume_token: String,
    },
    #[serde(rename = "ack")]
    Ack {
        id: Uuid,
        status: AckStatus,
        seq: u64,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "msg")]
    Msg {
        payload: serde_json::Value,
        seq: u64,
    },
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "resume_failed")]
    ResumeFailed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    ProtocolError,
    MessageTooLarge,
    InternalError,
    HeartbeatTimeout,
    Overloaded,
    Unauthorized,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::ProtocolError => 1002,
            CloseCode::MessageTooLarge => 1009,
            CloseCode::InternalError | CloseCode::HeartbeatTimeout => 1011,
            CloseCode::Overloaded => 1013,
            CloseCode::Unauthorized => 4401,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::ProtocolError => "protocol_error",
            CloseCode::MessageTooLarge => "message_too_large",
            CloseCode::InternalError => "internal_error",
            CloseCode::HeartbeatTimeout => "heartbeat_timeout",
            CloseCode::Overloaded => "overloaded",
            CloseCode::Unauthorized => "unauthorized",
        }
    }
}

#[derive(Debug)]
pub enum ParseError {
    TooLarge,
    Malformed(String),
}

/// Parses one inbound text frame. `max_bytes` enforces `ws.messageMaxBytes`
/// ahead of the JSON parse so an oversized frame never gets fully decoded.
pub fn parse_client_frame(text: &str, max_bytes: usize) -> Result<ClientFrame, ParseError> {
    if text.len() > max_bytes {
        return Err(ParseError::TooLarge);
    }

    let envelope: InboundEnvelope =
        serde_json::from_str(text).map_err(|e| ParseError::Malformed(e.to_string()))?;

    if envelope.v != PROTOCOL_VERSION {
        return Err(ParseError::Malformed(format!(
            "unsupported protocol version {}",
            envelope.v
        )));
    }

    match envelope.kind.as_str() {
        "msg" => Ok(ClientFrame::Msg {
            id: envelope.id,
            payload: envelope.payload,
            size: envelope.size,
        }),
        "resume" => {
            let resume_token = envelope
                .payload
                .get("resumeToken")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ParseError::Malformed("resume frame missing resumeToken".into()))?
                .to_string();
            let last_client_seq = envelope
                .payload
                .get("lastClientSeq")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            Ok(ClientFrame::Resume {
                resume_token,
                last_client_seq,
            })
        }
        "ping" => Ok(ClientFrame::Ping),
        other => Err(ParseError::Malformed(format!("unknown frame type {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_msg_frame() {
        let text = r#"{"v":1,"id":"3fa85f64-5717-4562-b3fc-2c963f66afa6","type":"msg","payload":{"ciphertext":"abc"},"size":4}"#;
        let frame = parse_client_frame(text, 1024).unwrap();
        assert!(matches!(frame, ClientFrame::Msg { size: 4, .. }));
    }

    #[test]
    fn parses_resume_frame() {
        let text = r#"{"v":1,"id":"3fa85f64-5717-4562-b3fc-2c963f66afa6","type":"resume","payload":{"resumeToken":"tok","lastClientSeq":9},"size":0}"#;
        let frame = parse_client_frame(text, 1024).unwrap();
        match frame {
            ClientFrame::Resume { resume_token, last_client_seq } => {
                assert_eq!(resume_token, "tok");
                assert_eq!(last_client_seq, 9);
            }
            _ => panic!("wrong frame variant"),
        }
    }

    #[test]
    fn rejects_oversize_frame() {
        let text = "x".repeat(100);
        let result = parse_client_frame(&text, 10);
        assert!(matches!(result, Err(ParseError::TooLarge)));
    }

    #[test]
    fn rejects_unknown_type() {
        let text = r#"{"v":1,"id":"3fa85f64-5717-4562-b3fc-2c963f66afa6","type":"bogus","payload":{},"size":0}"#;
        let result = parse_client_frame(text, 1024);
        assert!(matches!(result, Err(ParseError::Malformed(_))));
    }
}
