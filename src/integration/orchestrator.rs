//! Voice client orchestrator
//!
//! Runs the connection manager on one tokio task. UI commands, transport
//! events and capture blocks are all handled by that task, so a reconnect can
//! never race a stop.

use crate::audio::capture::AudioCapture;
use crate::audio::playback::AudioPlayback;
use crate::integration::config::VoiceConfig;
use crate::integration::connection::ConnectionManager;
use crate::state::{ConnectionState, SharedVoiceState, VoiceCommand, VoiceEvent, VoiceState};
use crate::transport::{Connector, WsConnector};
use crate::{Result, VoiceError};
use crossbeam_channel::Receiver;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How often the playback queue is checked for drain
const PLAYBACK_POLL: Duration = Duration::from_millis(20);

/// Handle for controlling the voice client from the UI
#[derive(Clone)]
pub struct VoiceHandle {
    command_tx: mpsc::UnboundedSender<VoiceCommand>,
    event_rx: Receiver<VoiceEvent>,
    status: SharedVoiceState,
    level: watch::Receiver<f32>,
}

impl VoiceHandle {
    /// Send a command to the dispatch task
    pub fn send_command(&self, cmd: VoiceCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .map_err(|e| VoiceError::ChannelError(format!("Failed to send command: {}", e)))
    }

    /// Try to receive an event from the dispatch task
    pub fn try_recv_event(&self) -> Option<VoiceEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn event_receiver(&self) -> Receiver<VoiceEvent> {
        self.event_rx.clone()
    }

    /// Copy of the current state
    pub fn status(&self) -> VoiceState {
        self.status.snapshot()
    }

    pub fn shared_status(&self) -> SharedVoiceState {
        self.status.clone()
    }

    /// Microphone level in [0, 1]
    pub fn level(&self) -> watch::Receiver<f32> {
        self.level.clone()
    }

    pub fn connection(&self) -> ConnectionState {
        self.status.connection()
    }

    pub fn is_recording(&self) -> bool {
        self.status.is_recording()
    }
}

enum Step {
    Command(Option<VoiceCommand>),
    PlaybackTick,
    Connection,
}

/// Owns the connection manager and runs the dispatch loop
pub struct VoiceClient {
    manager: ConnectionManager,
    command_rx: mpsc::UnboundedReceiver<VoiceCommand>,
    /// StartRecording arrived while a connection was still being set up
    record_when_connected: bool,
}

impl VoiceClient {
    pub fn new(
        config: VoiceConfig,
        connector: Box<dyn Connector>,
        capture: Box<dyn AudioCapture>,
        playback: Box<dyn AudioPlayback>,
    ) -> Result<(Self, VoiceHandle)> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(config, connector, capture, playback);

        let handle = VoiceHandle {
            command_tx,
            event_rx: manager.events(),
            status: manager.status(),
            level: manager.level_receiver(),
        };

        let client = Self {
            manager,
            command_rx,
            record_when_connected: false,
        };

        Ok((client, handle))
    }

    /// Spawn the dispatch loop on the current tokio runtime
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Dispatch loop; returns after `Shutdown` or when every handle is gone
    pub async fn run(mut self) {
        info!("Voice client started");

        let mut ticker = tokio::time::interval(PLAYBACK_POLL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let step = tokio::select! {
                cmd = self.command_rx.recv() => Step::Command(cmd),
                _ = ticker.tick() => Step::PlaybackTick,
                _ = self.manager.next_event() => Step::Connection,
            };

            match step {
                Step::Command(Some(VoiceCommand::Shutdown)) => {
                    info!("Voice client shutdown requested");
                    break;
                }
                Step::Command(None) => {
                    warn!("Command channel disconnected");
                    break;
                }
                Step::Command(Some(cmd)) => self.handle_command(cmd),
                Step::PlaybackTick => self.manager.refresh_playback(),
                Step::Connection => {}
            }

            self.resume_pending_recording();
        }

        self.manager.disconnect();
        self.manager.emit(VoiceEvent::Shutdown);
        info!("Voice client stopped");
    }

    fn handle_command(&mut self, cmd: VoiceCommand) {
        debug!(command = ?cmd, "Handling command");

        match cmd {
            VoiceCommand::Connect => self.begin_connect(),
            VoiceCommand::Disconnect => {
                self.record_when_connected = false;
                self.manager.disconnect();
            }
            VoiceCommand::Reset => self.manager.reset(),
            VoiceCommand::StartRecording => match self.manager.state() {
                ConnectionState::Connected => {
                    if let Err(e) = self.manager.start_recording() {
                        warn!("Failed to start recording: {}", e);
                    }
                }
                ConnectionState::Connecting => self.record_when_connected = true,
                ConnectionState::Disconnected | ConnectionState::Error => {
                    self.record_when_connected = true;
                    self.begin_connect();
                }
            },
            VoiceCommand::StopRecording => {
                self.record_when_connected = false;
                self.manager.stop_recording();
            }
            // Handled by the dispatch loop
            VoiceCommand::Shutdown => {}
        }
    }

    fn begin_connect(&mut self) {
        let url = self.manager.config().url.clone();
        let auth = self.manager.config().auth();
        if let Err(e) = self.manager.begin_connect(&url, &auth) {
            warn!("Failed to start connection: {}", e);
        }
    }

    /// Start the recording a StartRecording asked for once the connection is
    /// up, or give up if the attempt failed.
    fn resume_pending_recording(&mut self) {
        if !self.record_when_connected {
            return;
        }

        match self.manager.state() {
            ConnectionState::Connecting => {}
            ConnectionState::Connected => {
                self.record_when_connected = false;
                if let Err(e) = self.manager.start_recording() {
                    warn!("Failed to start recording: {}", e);
                }
            }
            ConnectionState::Disconnected | ConnectionState::Error => {
                debug!("Connection attempt ended, dropping pending recording");
                self.record_when_connected = false;
            }
        }
    }
}

/// Builder for creating a voice client
pub struct VoiceClientBuilder {
    config: VoiceConfig,
    connector: Option<Box<dyn Connector>>,
    capture: Option<Box<dyn AudioCapture>>,
    playback: Option<Box<dyn AudioPlayback>>,
}

impl VoiceClientBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: VoiceConfig::default(),
            connector: None,
            capture: None,
            playback: None,
        }
    }

    pub fn with_config(mut self, config: VoiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_connector(mut self, connector: Box<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_capture(mut self, capture: Box<dyn AudioCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_playback(mut self, playback: Box<dyn AudioPlayback>) -> Self {
        self.playback = Some(playback);
        self
    }

    /// Build the client. Unset parts default to the WebSocket transport and,
    /// with the `audio-io` feature, the system microphone and speaker.
    pub fn build(self) -> Result<(VoiceClient, VoiceHandle)> {
        let connector = self
            .connector
            .unwrap_or_else(|| Box::new(WsConnector::new()));
        let capture = match self.capture {
            Some(capture) => capture,
            None => default_capture()?,
        };
        let playback = match self.playback {
            Some(playback) => playback,
            None => default_playback()?,
        };

        VoiceClient::new(self.config, connector, capture, playback)
    }
}

impl Default for VoiceClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "audio-io")]
fn default_capture() -> Result<Box<dyn AudioCapture>> {
    Ok(Box::new(crate::audio::CpalCapture::new()))
}

#[cfg(not(feature = "audio-io"))]
fn default_capture() -> Result<Box<dyn AudioCapture>> {
    Err(VoiceError::ConfigError(
        "No capture backend configured (built without audio-io)".into(),
    ))
}

#[cfg(feature = "audio-io")]
fn default_playback() -> Result<Box<dyn AudioPlayback>> {
    Ok(Box::new(crate::audio::CpalPlayback::new()))
}

#[cfg(not(feature = "audio-io"))]
fn default_playback() -> Result<Box<dyn AudioPlayback>> {
    Err(VoiceError::ConfigError(
        "No playback backend configured (built without audio-io)".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::{MemoryCapture, MemoryMic, MemoryPlayback};
    use crate::messages::ControlMessage;
    use crate::transport::{MemoryConnector, OpenBehavior};

    fn memory_client(behavior: OpenBehavior) -> (VoiceClient, VoiceHandle, MemoryConnector, MemoryMic) {
        let connector = MemoryConnector::with_behavior(behavior);
        let (capture, mic) = MemoryCapture::new();
        let (playback, _speaker) = MemoryPlayback::new();
        let (client, handle) = VoiceClientBuilder::new()
            .with_config(VoiceConfig::default().with_url("ws://localhost/ws/voice"))
            .with_connector(Box::new(connector.clone()))
            .with_capture(Box::new(capture))
            .with_playback(Box::new(playback))
            .build()
            .unwrap();
        (client, handle, connector, mic)
    }

    async fn wait_for(handle: &VoiceHandle, pred: impl Fn(&VoiceEvent) -> bool) -> Vec<VoiceEvent> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            while let Some(event) = handle.try_recv_event() {
                let done = pred(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("event not received, saw {:?}", seen);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (capture, _mic) = MemoryCapture::new();
        let (playback, _speaker) = MemoryPlayback::new();
        let result = VoiceClient::new(
            VoiceConfig::default().with_url("http://example.com"),
            Box::new(MemoryConnector::new()),
            Box::new(capture),
            Box::new(playback),
        );
        assert!(matches!(result, Err(VoiceError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_start_recording_connects_first() {
        let (client, handle, connector, mic) = memory_client(OpenBehavior::Accept);
        let task = client.start();

        handle.send_command(VoiceCommand::StartRecording).unwrap();
        wait_for(&handle, |e| *e == VoiceEvent::RecordingStarted).await;

        assert_eq!(handle.connection(), ConnectionState::Connected);
        assert!(handle.is_recording());
        assert!(mic.is_open());

        let mut peer = connector.take_peer().unwrap();
        let sent = peer.drain_control();
        assert!(matches!(sent[0], ControlMessage::SessionCreate { .. }));
        assert_eq!(sent[1], ControlMessage::AudioBufferAppend);

        handle.send_command(VoiceCommand::Shutdown).unwrap();
        task.await.unwrap();
        assert!(!mic.is_open());
    }

    #[tokio::test]
    async fn test_failed_connect_drops_pending_recording() {
        let (client, handle, _connector, mic) =
            memory_client(OpenBehavior::Refuse("offline".into()));
        let task = client.start();

        handle.send_command(VoiceCommand::StartRecording).unwrap();
        wait_for(&handle, |e| *e == VoiceEvent::StateChanged(ConnectionState::Error)).await;
        assert!(!handle.is_recording());
        assert_eq!(mic.open_count(), 0);

        handle.send_command(VoiceCommand::Reset).unwrap();
        wait_for(&handle, |e| *e == VoiceEvent::StateChanged(ConnectionState::Disconnected)).await;

        handle.send_command(VoiceCommand::Shutdown).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_and_notifies() {
        let (client, handle, connector, _mic) = memory_client(OpenBehavior::Accept);
        let task = client.start();

        handle.send_command(VoiceCommand::Connect).unwrap();
        wait_for(&handle, |e| *e == VoiceEvent::StateChanged(ConnectionState::Connected)).await;

        handle.send_command(VoiceCommand::Shutdown).unwrap();
        let events = wait_for(&handle, |e| *e == VoiceEvent::Shutdown).await;
        assert!(events.contains(&VoiceEvent::StateChanged(ConnectionState::Disconnected)));
        task.await.unwrap();

        let mut peer = connector.take_peer().unwrap();
        peer.drain();
        assert_eq!(peer.close_count(), 1);
        assert!(handle.send_command(VoiceCommand::Connect).is_err());
    }

    #[tokio::test]
    async fn test_dropping_handles_ends_task() {
        let (client, handle, _connector, _mic) = memory_client(OpenBehavior::Accept);
        let task = client.start();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("task ends")
            .unwrap();
    }
}
