//! JSON control envelope
//!
//! Control messages share the connection with raw binary audio. Every message
//! is an object with a `type` tag; tags this client does not know are parsed
//! into [`ControlMessage::Unknown`] and ignored.

use crate::{Result, VoiceError};
use serde::{Deserialize, Serialize};

/// Default knowledge-base namespace requested on session creation
pub const DEFAULT_NAMESPACE: &str = "per4ex-kb";

/// Error codes with which the service reports that a session is gone
const INVALID_SESSION_CODES: &[&str] = &["session_invalid", "session_not_found", "invalid_session"];

/// Configuration sent with `session.create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub namespace: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "session.create")]
    SessionCreate { config: SessionConfig },

    #[serde(rename = "session.resume")]
    SessionResume { session_id: String },

    #[serde(rename = "session.created")]
    SessionCreated { session_id: String },

    #[serde(rename = "session.resumed")]
    SessionResumed { session_id: String },

    #[serde(rename = "transcript")]
    Transcript { text: String },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// Marks the start of a streamed input buffer
    #[serde(rename = "input_audio_buffer.append")]
    AudioBufferAppend,

    /// Closes the streamed input buffer so the service can respond
    #[serde(rename = "input_audio_buffer.commit")]
    AudioBufferCommit,

    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::SessionCreate { .. } => "session.create",
            ControlMessage::SessionResume { .. } => "session.resume",
            ControlMessage::SessionCreated { .. } => "session.created",
            ControlMessage::SessionResumed { .. } => "session.resumed",
            ControlMessage::Transcript { .. } => "transcript",
            ControlMessage::Error { .. } => "error",
            ControlMessage::AudioBufferAppend => "input_audio_buffer.append",
            ControlMessage::AudioBufferCommit => "input_audio_buffer.commit",
            ControlMessage::Unknown => "unknown",
        }
    }

    /// Messages only the client sends
    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            ControlMessage::SessionCreate { .. }
                | ControlMessage::SessionResume { .. }
                | ControlMessage::AudioBufferAppend
                | ControlMessage::AudioBufferCommit
        )
    }

    /// True for an `error` whose code says the session no longer exists
    pub fn invalidates_session(&self) -> bool {
        match self {
            ControlMessage::Error { code: Some(code), .. } => {
                INVALID_SESSION_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| VoiceError::ProtocolError(format!("Failed to encode {}: {}", self.kind(), e)))
    }
}

/// Parse one inbound text payload.
///
/// Malformed JSON and well-formed objects with unusable contents both come
/// back as `ProtocolError`; callers log and drop them.
pub fn parse(raw: &str) -> Result<ControlMessage> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| VoiceError::ProtocolError(format!("Malformed JSON: {}", e)))?;

    match value.get("type") {
        Some(serde_json::Value::String(_)) => {}
        _ => {
            return Err(VoiceError::ProtocolError(
                "Control message without a string `type`".to_string(),
            ))
        }
    }

    serde_json::from_value(value)
        .map_err(|e| VoiceError::ProtocolError(format!("Unexpected control message: {}", e)))
}
