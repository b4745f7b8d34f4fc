use serde::{Deserialize, Serialize};

use crate::error::{malformed, RelayError, RelayResult};

/// Kind of a wire frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Bind,
    Heartbeat,
    Msg,
    Break,
    Error,
}

/// JSON envelope exchanged over the WebSocket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub target_id: String,
    pub message: String,
}

impl WireMessage {
    pub fn new(
        kind: MessageType,
        client_id: impl Into<String>,
        target_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            client_id: client_id.into(),
            target_id: target_id.into(),
            message: message.into(),
        }
    }
}

/// Serialize a message into a compact text frame
pub fn encode(message: &WireMessage) -> RelayResult<String> {
    serde_json::to_string(message)
        .map_err(|e| RelayError::Io(format!("failed to encode frame: {e}")))
}

/// Parse a text frame. Any structural problem is a `MalformedMessage`.
pub fn decode(text: &str) -> RelayResult<WireMessage> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(malformed)?;
    if !value.is_object() {
        return Err(malformed("frame is not a JSON object"));
    }
    // Some app builds send numeric codes; normalise before typed parsing
    let value = match value {
        serde_json::Value::Object(mut map) => {
            if let Some(serde_json::Value::Number(n)) = map.get("message") {
                let as_text = n.to_string();
                map.insert("message".to_string(), serde_json::Value::String(as_text));
            }
            serde_json::Value::Object(map)
        }
        other => other,
    };
    serde_json::from_value(value).map_err(malformed)
}
