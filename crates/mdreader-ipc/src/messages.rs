//! Wire message types.
//!
//! Every message is a single JSON object on its own line:
//!
//! ```text
//! {"id":"a1b2c3d4-1","action":"ping","payload":{}}
//! {"id":"a1b2c3d4-1","success":true,"data":{"pong":true}}
//! {"id":"a1b2c3d4-2","success":false,"error":"Unknown action: frobnicate"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Correlation id of the handshake response sent by a plugin once it is ready.
pub const HANDSHAKE_ID: &str = "init";

/// Correlation id used for the graceful shutdown request.
pub const SHUTDOWN_ID: &str = "shutdown";

/// Action name of the graceful shutdown request.
pub const SHUTDOWN_ACTION: &str = "shutdown";

/// A line that could not be turned into a message.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Line is not valid JSON.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Line is JSON but not an object.
    #[error("Message is not a JSON object")]
    NotAnObject,

    /// Object has no string `id`.
    #[error("Message has no string id")]
    MissingId,
}

/// Request written by the host to a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRequest {
    /// Correlation id, echoed back in the response.
    pub id: String,
    /// Action name.
    pub action: String,
    /// Action arguments.
    #[serde(default)]
    pub payload: Value,
}

impl PluginRequest {
    /// Create a new request.
    #[must_use]
    pub fn new(id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            payload,
        }
    }

    /// The distinguished graceful shutdown request.
    #[must_use]
    pub fn shutdown() -> Self {
        Self::new(SHUTDOWN_ID, SHUTDOWN_ACTION, Value::Object(serde_json::Map::new()))
    }

    /// Serialize as a single newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        encode_line(self)
    }
}

/// Response (or unsolicited event) written by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResponse {
    /// Correlation id of the request this answers.
    pub id: String,
    /// Whether the action succeeded.
    #[serde(default)]
    pub success: bool,
    /// Result data (if success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message (if failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginResponse {
    /// Create a success response.
    #[must_use]
    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response.
    #[must_use]
    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// The handshake a plugin sends once it is ready to accept requests.
    #[must_use]
    pub fn ready(version: &str, capabilities: &[String]) -> Self {
        Self::success(
            HANDSHAKE_ID,
            serde_json::json!({
                "status": "ready",
                "version": version,
                "capabilities": capabilities,
            }),
        )
    }

    /// Convert into the outcome of the call it answers.
    ///
    /// A success without data resolves to `null`.
    ///
    /// # Errors
    ///
    /// Returns the plugin-reported error message when `success` is false.
    pub fn into_result(self) -> Result<Value, String> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "Plugin reported failure without an error message".to_string()))
        }
    }

    /// Serialize as a single newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns error if the data cannot be serialized.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        encode_line(self)
    }
}

/// A parsed inbound line, before it is matched against pending calls.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Correlation id (or event name for unsolicited messages).
    pub id: String,
    raw: Value,
}

impl InboundMessage {
    /// Parse one line (without its terminator).
    ///
    /// # Errors
    ///
    /// Returns error if the line is not a JSON object with a string `id`.
    pub fn parse(line: &[u8]) -> Result<Self, FrameError> {
        let raw: Value = serde_json::from_slice(line)?;
        let object = raw.as_object().ok_or(FrameError::NotAnObject)?;
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingId)?
            .to_string();
        Ok(Self { id, raw })
    }

    /// Whether this is the `{"id":"init","success":true,"data":{"status":"ready"}}` handshake.
    #[must_use]
    pub fn is_ready_handshake(&self) -> bool {
        self.id == HANDSHAKE_ID
            && self.raw.get("success").and_then(Value::as_bool) == Some(true)
            && self
                .raw
                .get("data")
                .and_then(|data| data.get("status"))
                .and_then(Value::as_str)
                == Some("ready")
    }

    /// Interpret the message as a response.
    ///
    /// # Errors
    ///
    /// Returns error if the fields have the wrong types.
    pub fn into_response(self) -> Result<PluginResponse, FrameError> {
        Ok(serde_json::from_value(self.raw)?)
    }

    /// The message as received.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.raw
    }

    /// Take the message as received.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.raw
    }
}

fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request = PluginRequest::new("abc-1", "ping", json!({}));
        assert_eq!(
            request.to_line().unwrap(),
            "{\"id\":\"abc-1\",\"action\":\"ping\",\"payload\":{}}\n"
        );
    }

    #[test]
    fn test_shutdown_request() {
        let request = PluginRequest::shutdown();
        assert_eq!(request.id, "shutdown");
        assert_eq!(request.action, "shutdown");
        assert_eq!(request.payload, json!({}));
    }

    #[test]
    fn test_error_response_omits_data() {
        let response = PluginResponse::error("x", "boom");
        let value: Value = serde_json::to_value(&response).unwrap();
        assert_eq!(value, json!({"id": "x", "success": false, "error": "boom"}));
    }

    #[test]
    fn test_into_result() {
        assert_eq!(
            PluginResponse::success("x", json!({"pong": true})).into_result(),
            Ok(json!({"pong": true}))
        );
        assert_eq!(
            PluginResponse::error("x", "nope").into_result(),
            Err("nope".to_string())
        );
    }

    #[test]
    fn test_ready_handshake_detection() {
        let line = br#"{"id":"init","success":true,"data":{"status":"ready"}}"#;
        assert!(InboundMessage::parse(line).unwrap().is_ready_handshake());

        let not_ready = br#"{"id":"init","success":true,"data":{"status":"starting"}}"#;
        assert!(!InboundMessage::parse(not_ready).unwrap().is_ready_handshake());

        let failed = br#"{"id":"init","success":false,"error":"bad token"}"#;
        assert!(!InboundMessage::parse(failed).unwrap().is_ready_handshake());
    }

    #[test]
    fn test_ready_builder_is_a_handshake() {
        let line = PluginResponse::ready("1.0.0", &["analyze".to_string()])
            .to_line()
            .unwrap();
        let message = InboundMessage::parse(line.trim_end().as_bytes()).unwrap();
        assert!(message.is_ready_handshake());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            InboundMessage::parse(b"not-json"),
            Err(FrameError::Json(_))
        ));
        assert!(matches!(
            InboundMessage::parse(b"[1,2]"),
            Err(FrameError::NotAnObject)
        ));
        assert!(matches!(
            InboundMessage::parse(br#"{"id":7}"#),
            Err(FrameError::MissingId)
        ));
    }

    #[test]
    fn test_into_response_type_mismatch() {
        let message = InboundMessage::parse(br#"{"id":"x","success":"yes"}"#).unwrap();
        assert!(message.into_response().is_err());
    }
}
