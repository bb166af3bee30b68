//! Observable state of a voice session
//!
//! The connection manager is the only writer. UIs read through
//! `SharedVoiceState` (synchronous snapshot) and consume `VoiceEvent`s for
//! notifications such as transcripts and warnings.
//!
//! The design separates:
//! - **State**: data that can be queried at any time
//! - **Commands**: requests to the dispatch task (`VoiceCommand`)
//! - **Events**: notifications emitted as things happen (`VoiceEvent`)

use crate::messages::session::SessionState;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Connection state machine
///
/// `Disconnected -> Connecting -> Connected -> {Disconnected | Error}`;
/// `Error -> Disconnected` only through an explicit reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Only state in which audio and control messages may be sent
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// States from which `connect()` may start a new attempt
    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Error => write!(f, "Error"),
        }
    }
}

/// Frame counters for the current client
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Capture frames handed to the transport
    pub sent: u64,
    /// Capture frames dropped because the connection was not open
    pub dropped: u64,
    /// Binary frames received from the service
    pub received: u64,
    /// Received frames skipped because they failed to decode
    pub skipped: u64,
}

/// Voice client state
#[derive(Clone, Debug, Default)]
pub struct VoiceState {
    pub connection: ConnectionState,
    pub session_id: Option<String>,
    pub session_state: SessionState,
    pub recording: bool,
    pub playing: bool,
    /// Microphone level in [0, 1], 0 while not recording
    pub level: f32,
    /// Last transcript line reported by the service
    pub last_transcript: Option<String>,
    /// Current user-facing error (if any)
    pub error: Option<String>,
    pub frames: FrameStats,
}

impl VoiceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Nothing in flight: not recording and nothing queued for playback
    pub fn is_idle(&self) -> bool {
        !self.recording && !self.playing
    }
}

/// Thread-safe shared voice state
#[derive(Clone, Default)]
pub struct SharedVoiceState {
    inner: Arc<RwLock<VoiceState>>,
}

impl SharedVoiceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, VoiceState> {
        self.inner.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, VoiceState> {
        self.inner.write()
    }

    /// Get a copy of the current state (no lock held after return)
    pub fn snapshot(&self) -> VoiceState {
        self.inner.read().clone()
    }

    pub fn connection(&self) -> ConnectionState {
        self.inner.read().connection
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.read().session_id.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.read().recording
    }

    pub fn is_playing(&self) -> bool {
        self.inner.read().playing
    }

    pub fn level(&self) -> f32 {
        self.inner.read().level
    }

    pub fn error(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    pub fn frames(&self) -> FrameStats {
        self.inner.read().frames
    }
}

/// Requests processed by the voice client's dispatch task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoiceCommand {
    /// Open the connection using the configured endpoint
    Connect,
    /// Tear down the connection, the recording and the playback queue
    Disconnect,
    /// Leave the Error state
    Reset,
    /// Start streaming the microphone (connects first if disconnected)
    StartRecording,
    /// Stop streaming and commit the input buffer
    StopRecording,
    /// Disconnect and end the dispatch task
    Shutdown,
}

/// Notifications emitted by the connection manager
#[derive(Clone, Debug, PartialEq)]
pub enum VoiceEvent {
    StateChanged(ConnectionState),
    SessionChanged {
        session_id: Option<String>,
        state: SessionState,
    },
    RecordingStarted,
    RecordingStopped,
    PlaybackStarted,
    PlaybackFinished,
    Transcript {
        text: String,
        received_at: DateTime<Utc>,
    },
    /// Error reported by the remote service
    ServerError(String),
    /// Local failure that needs user attention (permission, connection)
    Error(String),
    /// Non-fatal condition, e.g. audio dropped while not connected
    Warning(String),
    Shutdown,
}
