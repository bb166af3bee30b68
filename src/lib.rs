//! Catalyst Voice - real-time bidirectional voice streaming client
//!
//! Captures microphone audio, frames it as PCM16 little-endian mono, streams it
//! over a single WebSocket to a remote voice service and plays back the
//! synthesized audio that comes back, while tracking the session identity and
//! the connection state machine.

pub mod audio;
pub mod integration;
pub mod messages;
pub mod state;
pub mod transport;

use state::ConnectionState;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio device error: {0}")]
    AudioDeviceError(String),

    #[error("Audio processing error: {0}")]
    AudioProcessingError(String),

    #[error("Capture already active")]
    CaptureActive,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Malformed frame: {len} bytes is not a whole number of PCM16 samples")]
    MalformedFrame { len: usize },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for VoiceError {
    fn from(e: std::io::Error) -> Self {
        VoiceError::IOError(e.to_string())
    }
}

impl VoiceError {
    /// Check if this error is recoverable without user action
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Capture attempt is over, the user has to change something
            VoiceError::PermissionDenied => false,
            VoiceError::DeviceUnavailable(_) => false,
            VoiceError::AudioDeviceError(_) => false,
            // Skip-and-continue
            VoiceError::AudioProcessingError(_) => true,
            VoiceError::MalformedFrame { .. } => true,
            VoiceError::ProtocolError(_) => true,
            VoiceError::NotConnected(_) => true,
            VoiceError::CaptureActive => true,
            // Manual reconnect required
            VoiceError::ConnectionError(_) => false,
            VoiceError::ConfigError(_) => false,
            VoiceError::ChannelError(_) => false,
            VoiceError::IOError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            VoiceError::PermissionDenied => {
                "Microphone access was denied. Allow microphone access and try again.".to_string()
            }
            VoiceError::DeviceUnavailable(_) => {
                "No microphone found. Please connect a microphone.".to_string()
            }
            VoiceError::AudioDeviceError(_) => {
                "Audio device error. Please check your microphone/speakers.".to_string()
            }
            VoiceError::AudioProcessingError(_) => {
                "Audio processing failed. Please try again.".to_string()
            }
            VoiceError::CaptureActive => "Already recording.".to_string(),
            VoiceError::ConnectionError(_) => {
                "Connection error. Reconnect to continue.".to_string()
            }
            VoiceError::MalformedFrame { .. } => {
                "Received a damaged audio frame; it was skipped.".to_string()
            }
            VoiceError::ProtocolError(_) => {
                "Received an unexpected message from the server.".to_string()
            }
            VoiceError::NotConnected(_) => "Not connected to the voice service.".to_string(),
            VoiceError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            VoiceError::ChannelError(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            VoiceError::IOError(_) => "File system error occurred.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
