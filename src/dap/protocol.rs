use serde::{Deserialize, Serialize};
use serde_json::Value;

/// DAP request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DapRequest {
    pub seq: i64,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// DAP response envelope.
///
/// Note: the DAP specification allows responses with no `body` field at all.
/// Using a `serde_json::Value` keeps the envelope stable and avoids type
/// inference issues around `None` bodies.
#[derive(Debug, Serialize)]
pub struct DapResponse<'a> {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct DapEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Request sent by the adapter to the front end (e.g. `runInTerminal`).
#[derive(Debug, Serialize)]
pub struct DapReverseRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub command: &'static str,
    pub arguments: Value,
}

/// Front-end answer to a [`DapReverseRequest`].
#[derive(Debug, Clone, Deserialize)]
pub struct ClientResponse {
    pub request_seq: i64,
    pub success: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl ClientResponse {
    /// Synthetic failure used when the front end does not answer in time.
    pub fn timeout(request_seq: i64, command: &str) -> Self {
        Self {
            request_seq,
            success: false,
            command: command.to_string(),
            message: Some("timeout".to_string()),
            body: Value::Null,
        }
    }
}

/// Inbound message, classified by its `type` field.
#[derive(Debug)]
pub enum Incoming {
    Request(DapRequest),
    Response(ClientResponse),
    Other(Value),
}

impl Incoming {
    pub fn classify(msg: Value) -> serde_json::Result<Self> {
        match msg.get("type").and_then(Value::as_str) {
            Some("request") => serde_json::from_value(msg).map(Incoming::Request),
            Some("response") => serde_json::from_value(msg).map(Incoming::Response),
            _ => Ok(Incoming::Other(msg)),
        }
    }
}
