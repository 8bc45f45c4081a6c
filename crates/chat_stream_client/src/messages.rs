//! Wire frames exchanged with the chat server. Client ↔ server JSON text frames.

use serde::{Deserialize, Serialize};

/// Client → server: one prompt submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestFrame {
    /// Correlation token echoed back as `requestId` on every reply frame.
    pub request_id: String,
    pub message: String,
    pub conversation_id: Option<i64>,
}

impl RequestFrame {
    pub fn new(request_id: String, message: String, conversation_id: Option<i64>) -> Self {
        Self {
            request_id,
            message,
            conversation_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Server → client: cumulative content for one exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkMessage {
    request_id: String,
    content: String,
    #[serde(default)]
    conversation_id: Option<i64>,
}

/// Server → client: exchange finished.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteMessage {
    request_id: String,
    #[serde(default)]
    conversation_id: Option<i64>,
}

/// Server → client: exchange (or payload) rejected. Payload validation errors carry no token.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorMessage {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// One server frame; discriminator is the JSON "type" field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Chunk {
        token: String,
        content: String,
        conversation_id: Option<i64>,
    },
    Complete {
        token: String,
        conversation_id: Option<i64>,
    },
    Error {
        token: Option<String>,
        detail: String,
    },
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        let typ = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or("missing type")?;
        match typ {
            "chunk" => {
                let m: ChunkMessage =
                    serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(ServerFrame::Chunk {
                    token: m.request_id,
                    content: m.content,
                    conversation_id: m.conversation_id,
                })
            }
            "complete" => {
                let m: CompleteMessage =
                    serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(ServerFrame::Complete {
                    token: m.request_id,
                    conversation_id: m.conversation_id,
                })
            }
            "error" => {
                let m: ErrorMessage =
                    serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(ServerFrame::Error {
                    token: m.request_id,
                    detail: m.detail.unwrap_or_else(|| "unknown server error".into()),
                })
            }
            _ => Err(format!("unknown type: {}", typ)),
        }
    }
}
