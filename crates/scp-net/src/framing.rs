//! Relay message framing
//!
//! Every frame is a JSON array whose first element names the message type.
//!
//! Client to relay:
//! - `["REQ", id, request...]`
//! - `["EVENT", event]`
//! - `["CLOSE", id]`
//!
//! Relay to client:
//! - `["EVENT", id, event]`
//! - `["EOSE", id]`
//! - `["OK", id, accepted, message]`
//! - `["CLOSED", id, message]`
//! - `["NOTICE", message]`

use scp_core::{FetchRequest, ProtocolEvent};
use serde_json::{json, Value};
use thiserror::Error;

/// Framing errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid JSON: {0}")]
    Json(String),
    #[error("Frame is not a non-empty array")]
    NotAnArray,
    #[error("Unknown frame type: {0}")]
    UnknownType(String),
    #[error("Malformed {frame} frame: {reason}")]
    Malformed { frame: &'static str, reason: String },
}

/// Messages sent by the client
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Req {
        id: String,
        requests: Vec<FetchRequest>,
    },
    Event(ProtocolEvent),
    Close(String),
}

impl ClientMessage {
    /// Encode as a text frame
    pub fn to_text(&self) -> Result<String, FrameError> {
        let value = match self {
            Self::Req { id, requests } => {
                let mut frame = vec![json!("REQ"), json!(id)];
                for request in requests {
                    frame.push(serde_json::to_value(request).map_err(|e| FrameError::Json(e.to_string()))?);
                }
                Value::Array(frame)
            }
            Self::Event(event) => json!(["EVENT", event]),
            Self::Close(id) => json!(["CLOSE", id]),
        };
        Ok(value.to_string())
    }
}

/// Messages sent by the relay
#[derive(Clone, Debug, PartialEq)]
pub enum RelayMessage {
    Event { id: String, event: ProtocolEvent },
    Eose { id: String },
    Ok { id: String, accepted: bool, message: String },
    Closed { id: String, message: String },
    Notice(String),
}

impl RelayMessage {
    /// Decode a text frame
    pub fn from_text(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|e| FrameError::Json(e.to_string()))?;
        let arr = value.as_array().filter(|a| !a.is_empty()).ok_or(FrameError::NotAnArray)?;
        let kind = arr[0].as_str().ok_or(FrameError::NotAnArray)?;

        match kind {
            "EVENT" => {
                let id = str_at(arr, 1, "EVENT")?;
                let raw = arr.get(2).cloned().ok_or_else(|| malformed("EVENT", "missing event"))?;
                let event = serde_json::from_value(raw).map_err(|e| malformed("EVENT", e.to_string()))?;
                Ok(Self::Event { id, event })
            }
            "EOSE" => Ok(Self::Eose {
                id: str_at(arr, 1, "EOSE")?,
            }),
            "OK" => {
                let id = str_at(arr, 1, "OK")?;
                let accepted = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| malformed("OK", "missing accepted flag"))?;
                let message = arr.get(3).and_then(Value::as_str).unwrap_or_default().to_string();
                Ok(Self::Ok { id, accepted, message })
            }
            "CLOSED" => Ok(Self::Closed {
                id: str_at(arr, 1, "CLOSED")?,
                message: arr.get(2).and_then(Value::as_str).unwrap_or_default().to_string(),
            }),
            "NOTICE" => Ok(Self::Notice(
                arr.get(1).and_then(Value::as_str).unwrap_or_default().to_string(),
            )),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }

    /// Encode as a text frame (relay side; used by test relays)
    pub fn to_text(&self) -> String {
        match self {
            Self::Event { id, event } => json!(["EVENT", id, event]),
            Self::Eose { id } => json!(["EOSE", id]),
            Self::Ok { id, accepted, message } => json!(["OK", id, accepted, message]),
            Self::Closed { id, message } => json!(["CLOSED", id, message]),
            Self::Notice(message) => json!(["NOTICE", message]),
        }
        .to_string()
    }

    /// Correlation id carried by the frame, if any
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Event { id, .. } | Self::Eose { id } | Self::Ok { id, .. } | Self::Closed { id, .. } => Some(id),
            Self::Notice(_) => None,
        }
    }
}

fn str_at(arr: &[Value], index: usize, frame: &'static str) -> Result<String, FrameError> {
    arr.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| malformed(frame, format!("element {index} is not a string")))
}

fn malformed(frame: &'static str, reason: impl Into<String>) -> FrameError {
    FrameError::Malformed {
        frame,
        reason: reason.into(),
    }
}

/// Decode a client frame (relay side; used by test relays)
pub fn parse_client_text(text: &str) -> Result<(String, Vec<Value>), FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|e| FrameError::Json(e.to_string()))?;
    let mut arr = match value {
        Value::Array(arr) if !arr.is_empty() => arr,
        _ => return Err(FrameError::NotAnArray),
    };
    let kind = arr
        .remove(0)
        .as_str()
        .map(str::to_string)
        .ok_or(FrameError::NotAnArray)?;
    Ok((kind, arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scp_core::{Filter, Tag};

    fn event() -> ProtocolEvent {
        ProtocolEvent {
            id: "e1".into(),
            pubkey: "p1".into(),
            created_at: 1,
            kind: 1,
            tags: vec![Tag::new(["t", "news"])],
            content: "hi".into(),
            sig: "s".into(),
        }
    }

    #[test]
    fn test_req_frame_layout() {
        let msg = ClientMessage::Req {
            id: "0123456789".into(),
            requests: vec![
                Filter::new().kinds([1]).into(),
                Filter::new().authors(["p1"]).into(),
            ],
        };
        let value: Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!(["REQ", "0123456789", {"kinds": [1]}, {"authors": ["p1"]}])
        );
    }

    #[test]
    fn test_submit_and_close_frames() {
        let value: Value = serde_json::from_str(&ClientMessage::Event(event()).to_text().unwrap()).unwrap();
        assert_eq!(value[0], "EVENT");
        assert_eq!(value[1]["id"], "e1");

        assert_eq!(ClientMessage::Close("7".into()).to_text().unwrap(), r#"["CLOSE","7"]"#);
    }

    #[test]
    fn test_relay_frames_parse() {
        let ev = RelayMessage::from_text(&json!(["EVENT", "sub", event()]).to_string()).unwrap();
        assert_eq!(ev, RelayMessage::Event { id: "sub".into(), event: event() });

        assert_eq!(
            RelayMessage::from_text(r#"["EOSE","sub"]"#).unwrap(),
            RelayMessage::Eose { id: "sub".into() }
        );
        assert_eq!(
            RelayMessage::from_text(r#"["OK","e1",false,"blocked: spam"]"#).unwrap(),
            RelayMessage::Ok {
                id: "e1".into(),
                accepted: false,
                message: "blocked: spam".into()
            }
        );
        assert_eq!(
            RelayMessage::from_text(r#"["NOTICE","slow down"]"#).unwrap().request_id(),
            None
        );
    }

    #[test]
    fn test_relay_frame_errors() {
        assert!(matches!(RelayMessage::from_text("{}"), Err(FrameError::NotAnArray)));
        assert!(matches!(RelayMessage::from_text("[]"), Err(FrameError::NotAnArray)));
        assert!(matches!(
            RelayMessage::from_text(r#"["AUTH","x"]"#),
            Err(FrameError::UnknownType(_))
        ));
        assert!(matches!(
            RelayMessage::from_text(r#"["OK","e1"]"#),
            Err(FrameError::Malformed { frame: "OK", .. })
        ));
        assert!(matches!(RelayMessage::from_text("not json"), Err(FrameError::Json(_))));
    }

    #[test]
    fn test_relay_text_roundtrip() {
        let msg = RelayMessage::Closed {
            id: "sub".into(),
            message: "auth-required".into(),
        };
        assert_eq!(RelayMessage::from_text(&msg.to_text()).unwrap(), msg);
    }
}
