//! Connection manager
//!
//! Owns the connection state machine, the session, the transport link and both
//! audio pipelines. Everything that happens to a connection goes through
//! [`ConnectionManager::next_event`], a single dispatch step over transport
//! events, capture blocks and the connect deadline, so state changes are
//! strictly sequential.

use crate::audio::capture::{AudioCapture, CaptureHandle, CapturePipeline};
use crate::audio::codec::AudioFrame;
use crate::audio::level::LevelMonitor;
use crate::audio::playback::{AudioPlayback, PlaybackPipeline};
use crate::integration::config::VoiceConfig;
use crate::messages::{parse, ControlMessage, Session};
use crate::state::{ConnectionState, SharedVoiceState, VoiceEvent};
use crate::transport::{
    endpoint_url, redacted, AuthParams, Connector, Inbound, OutboundMessage, TransportEvent,
    TransportLink,
};
use crate::{Result, VoiceError};
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of one wait in the dispatch step
enum Step {
    Transport(Option<TransportEvent>),
    Block(Option<Vec<f32>>),
    ConnectTimeout,
}

pub struct ConnectionManager {
    config: VoiceConfig,
    connector: Box<dyn Connector>,
    state: ConnectionState,
    session: Session,
    link: Option<TransportLink>,
    connect_deadline: Option<Instant>,
    last_error: Option<VoiceError>,
    capture: CapturePipeline,
    recording: Option<CaptureHandle>,
    playback: PlaybackPipeline,
    playing: bool,
    level: LevelMonitor,
    status: SharedVoiceState,
    event_tx: Sender<VoiceEvent>,
    event_rx: Receiver<VoiceEvent>,
    /// Set after the first dropped frame; cleared on every state change
    warned_not_connected: bool,
}

impl ConnectionManager {
    pub fn new(
        config: VoiceConfig,
        connector: Box<dyn Connector>,
        capture: Box<dyn AudioCapture>,
        playback: Box<dyn AudioPlayback>,
    ) -> Self {
        let (event_tx, event_rx) = bounded(config.event_capacity.max(1));
        let status = SharedVoiceState::new();

        Self {
            capture: CapturePipeline::new(capture, config.capture.clone()),
            playback: PlaybackPipeline::new(playback, config.sample_rate()),
            level: LevelMonitor::new(config.level_interval(), status.clone()),
            config,
            connector,
            state: ConnectionState::Disconnected,
            session: Session::new(),
            link: None,
            connect_deadline: None,
            last_error: None,
            recording: None,
            playing: false,
            status,
            event_tx,
            event_rx,
            warned_not_connected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    /// Cause of the last transition into `Error`
    pub fn last_error(&self) -> Option<&VoiceError> {
        self.last_error.as_ref()
    }

    pub fn status(&self) -> SharedVoiceState {
        self.status.clone()
    }

    pub fn events(&self) -> Receiver<VoiceEvent> {
        self.event_rx.clone()
    }

    pub fn level_receiver(&self) -> watch::Receiver<f32> {
        self.level.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_playing()
    }

    /// Connect and wait until the attempt resolves.
    ///
    /// Ignored with a warning while already connecting or connected.
    pub async fn connect(&mut self, base_url: &str, auth: &AuthParams) -> Result<()> {
        self.begin_connect(base_url, auth)?;

        while self.state == ConnectionState::Connecting {
            self.next_event().await;
        }

        match self.state {
            ConnectionState::Connected => Ok(()),
            _ => Err(self.last_error.clone().unwrap_or_else(|| {
                VoiceError::ConnectionError("Connection attempt was abandoned".into())
            })),
        }
    }

    /// Connect to the configured endpoint
    pub async fn connect_configured(&mut self) -> Result<()> {
        let url = self.config.url.clone();
        let auth = self.config.auth();
        self.connect(&url, &auth).await
    }

    /// Start a connection attempt without waiting for it.
    ///
    /// The state is `Connecting` on return; the attempt resolves through
    /// [`next_event`](Self::next_event).
    pub fn begin_connect(&mut self, base_url: &str, auth: &AuthParams) -> Result<()> {
        if !self.state.can_connect() {
            warn!("Connect requested while {}, ignoring", self.state);
            return Ok(());
        }

        self.last_error = None;
        self.status.write().clear_error();
        self.set_state(ConnectionState::Connecting);

        let url = match endpoint_url(base_url, auth, self.config.sample_rate()) {
            Ok(url) => url,
            Err(e) => {
                self.fail(e.clone());
                return Err(e);
            }
        };

        info!(url = %redacted(&url), "Connecting to voice service");
        self.link = Some(self.connector.open(&url));
        self.connect_deadline = Some(Instant::now() + self.config.connect_timeout());
        Ok(())
    }

    /// Send one captured frame. Only allowed while connected; otherwise the
    /// frame is dropped and `NotConnected` returned.
    pub fn send(&mut self, frame: AudioFrame) -> Result<()> {
        let link = match (&self.link, self.state.can_send()) {
            (Some(link), true) => link,
            _ => {
                self.status.write().frames.dropped += 1;
                if !self.warned_not_connected {
                    self.warned_not_connected = true;
                    warn!("Dropping audio while {}", self.state);
                    self.emit(VoiceEvent::Warning(format!(
                        "Audio dropped: not connected ({})",
                        self.state
                    )));
                }
                return Err(VoiceError::NotConnected(self.state));
            }
        };

        let samples = frame.sample_count();
        link.send(OutboundMessage::Binary(frame.into_bytes()))?;
        self.status.write().frames.sent += 1;
        debug!(samples, "Frame sent");
        Ok(())
    }

    /// Wait for the next thing to happen on this connection and handle it.
    ///
    /// Transport events take priority over capture blocks. Pends forever when
    /// there is no link and no recording. Cancel-safe.
    pub async fn next_event(&mut self) {
        let deadline = self.connect_deadline;
        let step = tokio::select! {
            biased;
            event = recv_transport(self.link.as_mut()) => Step::Transport(event),
            _ = wait_deadline(deadline) => Step::ConnectTimeout,
            block = recv_block(self.recording.as_mut()) => Step::Block(block),
        };

        match step {
            Step::Transport(Some(event)) => self.handle_transport_event(event),
            Step::Transport(None) => self.handle_transport_event(TransportEvent::Closed {
                reason: Some("transport ended".to_string()),
            }),
            Step::ConnectTimeout => {
                if self.state == ConnectionState::Connecting {
                    let ms = self.config.connect_timeout_ms;
                    self.fail(VoiceError::ConnectionError(format!(
                        "Timed out after {} ms waiting for the connection to open",
                        ms
                    )));
                }
            }
            Step::Block(Some(samples)) => {
                let frame = AudioFrame::from_samples(&samples, self.config.sample_rate());
                if let Err(e) = self.send(frame) {
                    debug!("Capture block not sent: {}", e);
                }
            }
            Step::Block(None) => {
                warn!("Capture ended unexpectedly");
                self.stop_recording();
            }
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.state == ConnectionState::Connecting {
                    self.on_opened();
                } else {
                    debug!("Ignoring open event while {}", self.state);
                }
            }
            TransportEvent::Message(inbound) => self.on_message(inbound),
            TransportEvent::Closed { reason } => match self.state {
                ConnectionState::Connecting => {
                    self.fail(VoiceError::ConnectionError(format!(
                        "Connection closed while connecting: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    )));
                }
                ConnectionState::Connected => self.on_remote_close(reason),
                _ => debug!("Ignoring close event while {}", self.state),
            },
            TransportEvent::Failed(cause) => match self.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    self.fail(VoiceError::ConnectionError(cause));
                }
                _ => debug!("Ignoring transport failure while {}: {}", self.state, cause),
            },
        }
    }

    /// Route one inbound payload: audio to playback, text to the control parser
    pub fn on_message(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Binary(bytes) => {
                self.status.write().frames.received += 1;
                match self.playback.enqueue(bytes) {
                    Ok(()) => {}
                    Err(VoiceError::MalformedFrame { .. }) => {
                        self.status.write().frames.skipped += 1;
                    }
                    Err(e) => {
                        error!("Playback failed: {}", e);
                        self.status.write().set_error(e.user_message());
                        self.emit(VoiceEvent::Error(e.to_string()));
                    }
                }
                self.refresh_playback();
            }
            Inbound::Text(text) => match parse(&text) {
                Ok(msg) => self.handle_control(msg),
                Err(e) => warn!("Ignoring control message: {}", e),
            },
        }
    }

    pub fn handle_control(&mut self, msg: ControlMessage) {
        let invalidates_session = msg.invalidates_session();

        match msg {
            ControlMessage::SessionCreated { session_id } => {
                if self.session.is_replaced_by(&session_id) {
                    info!(old = ?self.session.id(), new = %session_id, "Service replaced the session");
                    self.session.close();
                    self.publish_session();
                }
                match self.session.on_created(session_id) {
                    Ok(()) => self.publish_session(),
                    Err(e) => warn!("Ignoring session.created: {}", e),
                }
            }
            ControlMessage::SessionResumed { session_id } => {
                match self.session.on_resumed(session_id) {
                    Ok(()) => self.publish_session(),
                    Err(e) => warn!("Ignoring session.resumed: {}", e),
                }
            }
            ControlMessage::Transcript { text } => {
                debug!(chars = text.len(), "Transcript received");
                self.status.write().last_transcript = Some(text.clone());
                self.emit(VoiceEvent::Transcript {
                    text,
                    received_at: Utc::now(),
                });
            }
            ControlMessage::Error { message, code } => {
                warn!(code = ?code, "Service reported an error: {}", message);
                if invalidates_session {
                    self.session.close();
                    self.publish_session();
                }
                self.status.write().set_error(message.clone());
                self.emit(VoiceEvent::ServerError(message));
            }
            ControlMessage::Unknown => debug!("Ignoring unknown control message"),
            other => warn!(
                "{}",
                VoiceError::ProtocolError(format!("Unexpected inbound {}", other.kind()))
            ),
        }
    }

    /// Start streaming the microphone. Requires an open connection.
    pub fn start_recording(&mut self) -> Result<()> {
        if !self.state.can_send() {
            return Err(VoiceError::NotConnected(self.state));
        }
        if self.recording.is_some() {
            return Err(VoiceError::CaptureActive);
        }

        let handle = match self.capture.start() {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to start capture: {}", e);
                self.status.write().set_error(e.user_message());
                self.emit(VoiceEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        self.recording = Some(handle);
        self.level.start(self.capture.tap());
        self.send_control(&ControlMessage::AudioBufferAppend)?;

        self.status.write().recording = true;
        self.emit(VoiceEvent::RecordingStarted);
        info!("Recording started");
        Ok(())
    }

    /// Stop streaming and commit the input buffer. Idempotent.
    pub fn stop_recording(&mut self) {
        if self.halt_recording() && self.state.can_send() {
            if let Err(e) = self.send_control(&ControlMessage::AudioBufferCommit) {
                warn!("Failed to commit input buffer: {}", e);
            }
        }
    }

    /// Tear down recording, playback and the transport. Safe from any state.
    pub fn disconnect(&mut self) {
        // Commit buffered input while the link can still carry it
        self.stop_recording();

        self.playback.stop();
        self.refresh_playback();

        if let Some(link) = self.link.take() {
            link.close();
            info!("Connection closed");
        }
        self.connect_deadline = None;

        if self.session.id().is_some() {
            self.session.close();
            self.publish_session();
        } else {
            self.session.close();
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Leave the Error state
    pub fn reset(&mut self) {
        if self.state == ConnectionState::Error {
            self.last_error = None;
            self.status.write().clear_error();
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Publish playback start/finish when the output queue changes
    pub fn refresh_playback(&mut self) {
        let playing = self.playback.is_playing();
        if playing == self.playing {
            return;
        }

        self.playing = playing;
        self.status.write().playing = playing;
        if playing {
            self.emit(VoiceEvent::PlaybackStarted);
        } else {
            debug!(frames = self.playback.frames_played(), "Playback drained");
            self.emit(VoiceEvent::PlaybackFinished);
        }
    }

    fn on_opened(&mut self) {
        self.connect_deadline = None;
        self.set_state(ConnectionState::Connected);
        info!("Connected to voice service");

        let opening = self.session.opening_message(&self.config.session);
        match self.send_control(&opening) {
            Ok(()) => self.session.begin_handshake(),
            Err(e) => error!("Failed to send {}: {}", opening.kind(), e),
        }
    }

    fn on_remote_close(&mut self, reason: Option<String>) {
        info!(reason = ?reason, "Connection closed by service");
        self.link = None;
        self.session.abandon_handshake();
        self.halt_recording();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Enter `Error` with `err` as the cause; the link is dropped
    fn fail(&mut self, err: VoiceError) {
        error!("Connection failed: {}", err);
        self.connect_deadline = None;
        self.session.abandon_handshake();
        self.halt_recording();
        if let Some(link) = self.link.take() {
            link.close();
        }

        self.status.write().set_error(err.user_message());
        self.emit(VoiceEvent::Error(err.to_string()));
        self.last_error = Some(err);
        self.set_state(ConnectionState::Error);
    }

    /// Stop capture and metering. Returns whether a recording was running.
    fn halt_recording(&mut self) -> bool {
        let Some(handle) = self.recording.take() else {
            return false;
        };

        debug!(blocks = handle.blocks_emitted(), "Ending recording");
        drop(handle);
        self.capture.stop();
        self.level.stop();

        self.status.write().recording = false;
        self.emit(VoiceEvent::RecordingStopped);
        info!("Recording stopped");
        true
    }

    fn send_control(&mut self, msg: &ControlMessage) -> Result<()> {
        let link = match (&self.link, self.state.can_send()) {
            (Some(link), true) => link,
            _ => return Err(VoiceError::NotConnected(self.state)),
        };

        let json = msg.to_json()?;
        link.send(OutboundMessage::Text(json))?;
        debug!(kind = msg.kind(), "Control message sent");
        Ok(())
    }

    fn set_state(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }

        info!(from = %self.state, to = %next, "Connection state changed");
        self.state = next;
        self.warned_not_connected = false;
        self.status.write().connection = next;
        self.emit(VoiceEvent::StateChanged(next));
    }

    fn publish_session(&mut self) {
        let session_id = self.session.id().map(str::to_string);
        let state = self.session.state();
        {
            let mut status = self.status.write();
            status.session_id = session_id.clone();
            status.session_state = state;
        }
        self.emit(VoiceEvent::SessionChanged { session_id, state });
    }

    pub(crate) fn emit(&self, event: VoiceEvent) {
        if let Err(TrySendError::Full(event)) = self.event_tx.try_send(event) {
            warn!("Event channel full, dropping {:?}", event);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn recv_transport(link: Option<&mut TransportLink>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_block(recording: Option<&mut CaptureHandle>) -> Option<Vec<f32>> {
    match recording {
        Some(handle) => handle.next_block().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode;
    use crate::audio::memory::{MemoryCapture, MemoryMic, MemoryPlayback, MemorySpeaker};
    use crate::messages::SessionState;
    use crate::transport::{MemoryConnector, MemoryPeer, OpenBehavior};
    use std::time::Duration;

    struct Rig {
        manager: ConnectionManager,
        connector: MemoryConnector,
        mic: MemoryMic,
        speaker: MemorySpeaker,
    }

    fn rig_with(config: VoiceConfig, behavior: OpenBehavior) -> Rig {
        let connector = MemoryConnector::with_behavior(behavior);
        let (capture, mic) = MemoryCapture::new();
        let (playback, speaker) = MemoryPlayback::new();
        let manager = ConnectionManager::new(
            config,
            Box::new(connector.clone()),
            Box::new(capture),
            Box::new(playback),
        );
        Rig {
            manager,
            connector,
            mic,
            speaker,
        }
    }

    fn rig() -> Rig {
        rig_with(
            VoiceConfig::default().with_url("ws://localhost/ws/voice"),
            OpenBehavior::Accept,
        )
    }

    async fn connected() -> (Rig, MemoryPeer) {
        let mut rig = rig();
        rig.manager.connect_configured().await.unwrap();
        let peer = rig.connector.take_peer().unwrap();
        (rig, peer)
    }

    fn drain_events(manager: &ConnectionManager) -> Vec<VoiceEvent> {
        manager.events().try_iter().collect()
    }

    #[tokio::test]
    async fn test_connect_sends_session_create() {
        let (rig, mut peer) = connected().await;
        assert_eq!(rig.manager.state(), ConnectionState::Connected);
        assert_eq!(
            peer.drain_control(),
            vec![ControlMessage::SessionCreate {
                config: Default::default()
            }]
        );
        assert_eq!(peer.url().query_pairs().count(), 4);
    }

    #[tokio::test]
    async fn test_state_passes_through_connecting() {
        let (rig, _peer) = connected().await;
        let states: Vec<ConnectionState> = drain_events(&rig.manager)
            .into_iter()
            .filter_map(|e| match e {
                VoiceEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn test_refused_connection_enters_error() {
        let mut rig = rig_with(
            VoiceConfig::default().with_url("ws://localhost/ws/voice"),
            OpenBehavior::Refuse("connection refused".into()),
        );
        let err = rig.manager.connect_configured().await.unwrap_err();
        assert!(matches!(err, VoiceError::ConnectionError(ref c) if c.contains("refused")));
        assert_eq!(rig.manager.state(), ConnectionState::Error);
        assert!(rig.manager.status().error().is_some());

        rig.manager.reset();
        assert_eq!(rig.manager.state(), ConnectionState::Disconnected);
        assert!(rig.manager.last_error().is_none());
    }

    #[tokio::test]
    async fn test_close_during_connect_is_error() {
        let mut rig = rig_with(
            VoiceConfig::default().with_url("ws://localhost/ws/voice"),
            OpenBehavior::CloseDuringConnect,
        );
        assert!(rig.manager.connect_configured().await.is_err());
        assert_eq!(rig.manager.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let config = VoiceConfig::default()
            .with_url("ws://localhost/ws/voice")
            .with_connect_timeout(Duration::from_millis(30));
        let mut rig = rig_with(config, OpenBehavior::Hang);

        let err = rig.manager.connect_configured().await.unwrap_err();
        assert!(err.to_string().contains("Timed out"));
        assert_eq!(rig.manager.state(), ConnectionState::Error);

        let mut peer = rig.connector.take_peer().unwrap();
        assert_eq!(peer.drain(), vec![OutboundMessage::Close]);
    }

    #[tokio::test]
    async fn test_invalid_url_enters_error() {
        let mut rig = rig();
        let auth = rig.manager.config().auth();
        let err = rig.manager.connect("http://nope", &auth).await.unwrap_err();
        assert!(matches!(err, VoiceError::ConfigError(_)));
        assert_eq!(rig.manager.state(), ConnectionState::Error);
        assert_eq!(rig.connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_send_while_connecting_is_rejected() {
        let mut rig = rig_with(
            VoiceConfig::default().with_url("ws://localhost/ws/voice"),
            OpenBehavior::Hang,
        );
        let auth = rig.manager.config().auth();
        rig.manager.begin_connect("ws://localhost/ws/voice", &auth).unwrap();
        assert_eq!(rig.manager.state(), ConnectionState::Connecting);

        let frame = AudioFrame::from_samples(&[0.1; 16], 24000);
        let err = rig.manager.send(frame.clone()).unwrap_err();
        assert_eq!(err, VoiceError::NotConnected(ConnectionState::Connecting));
        let _ = rig.manager.send(frame);

        let mut peer = rig.connector.take_peer().unwrap();
        assert!(peer.drain().is_empty());
        assert_eq!(rig.manager.status().frames().dropped, 2);

        let warnings = drain_events(&rig.manager)
            .into_iter()
            .filter(|e| matches!(e, VoiceEvent::Warning(_)))
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn test_session_created_sets_id() {
        let (mut rig, peer) = connected().await;
        peer.send_control(&ControlMessage::SessionCreated {
            session_id: "abc123".into(),
        });
        rig.manager.next_event().await;

        assert_eq!(rig.manager.session().id(), Some("abc123"));
        assert_eq!(rig.manager.session().state(), SessionState::Created);
        assert_eq!(rig.manager.status().session_id().as_deref(), Some("abc123"));
        assert_eq!(rig.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_messages_ignored() {
        let (mut rig, peer) = connected().await;
        peer.send_text(r#"{"type":"response.delta","delta":"x"}"#);
        peer.send_text("{not json");
        peer.send_text(r#"{"type":"session.created"}"#);
        for _ in 0..3 {
            rig.manager.next_event().await;
        }

        assert_eq!(rig.manager.state(), ConnectionState::Connected);
        assert!(rig.manager.session().id().is_none());
    }

    #[tokio::test]
    async fn test_transcript_published() {
        let (mut rig, peer) = connected().await;
        drain_events(&rig.manager);

        peer.send_control(&ControlMessage::Transcript {
            text: "hello there".into(),
        });
        rig.manager.next_event().await;

        let events = drain_events(&rig.manager);
        assert!(matches!(
            events.as_slice(),
            [VoiceEvent::Transcript { text, .. }] if text == "hello there"
        ));
        assert_eq!(
            rig.manager.status().snapshot().last_transcript.as_deref(),
            Some("hello there")
        );
    }

    #[tokio::test]
    async fn test_invalid_session_error_closes_session() {
        let (mut rig, peer) = connected().await;
        peer.send_control(&ControlMessage::SessionCreated {
            session_id: "s-1".into(),
        });
        peer.send_control(&ControlMessage::Error {
            message: "gone".into(),
            code: Some("session_not_found".into()),
        });
        rig.manager.next_event().await;
        rig.manager.next_event().await;

        assert!(rig.manager.session().id().is_none());
        assert_eq!(rig.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_inbound_audio_plays_in_order() {
        let (mut rig, peer) = connected().await;
        peer.send_binary(encode(&[0.5, 0.5]));
        peer.send_binary(vec![1, 2, 3]);
        peer.send_binary(encode(&[-0.5]));
        for _ in 0..3 {
            rig.manager.next_event().await;
        }

        assert!(rig.manager.is_playing());
        let played = rig.speaker.play_all();
        assert_eq!(played.len(), 3);
        assert!(played[2] < 0.0);

        let frames = rig.manager.status().frames();
        assert_eq!(frames.received, 3);
        assert_eq!(frames.skipped, 1);

        rig.manager.refresh_playback();
        assert!(!rig.manager.status().is_playing());
    }

    #[tokio::test]
    async fn test_recording_streams_blocks() {
        let config = VoiceConfig::default()
            .with_url("ws://localhost/ws/voice")
            .with_block_size(4);
        let mut rig = rig_with(config, OpenBehavior::Accept);
        rig.manager.connect_configured().await.unwrap();
        let mut peer = rig.connector.take_peer().unwrap();
        peer.drain();

        rig.manager.start_recording().unwrap();
        assert!(rig.mic.is_open());
        assert!(rig.manager.status().is_recording());

        rig.mic.push(&[0.25; 6]);
        rig.mic.push(&[0.25; 2]);
        rig.manager.next_event().await;
        rig.manager.next_event().await;

        rig.manager.stop_recording();
        rig.manager.stop_recording();

        let sent = peer.drain();
        assert_eq!(
            sent,
            vec![
                OutboundMessage::Text(ControlMessage::AudioBufferAppend.to_json().unwrap()),
                OutboundMessage::Binary(encode(&[0.25; 4])),
                OutboundMessage::Binary(encode(&[0.25; 4])),
                OutboundMessage::Text(ControlMessage::AudioBufferCommit.to_json().unwrap()),
            ]
        );
        assert!(!rig.mic.is_open());
        assert_eq!(rig.mic.close_count(), 1);
        assert_eq!(rig.manager.status().frames().sent, 2);
    }

    #[tokio::test]
    async fn test_recording_requires_connection() {
        let mut rig = rig();
        assert_eq!(
            rig.manager.start_recording(),
            Err(VoiceError::NotConnected(ConnectionState::Disconnected))
        );
        assert_eq!(rig.mic.open_count(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces() {
        let (mut rig, _peer) = connected().await;
        rig.mic.set_failure(Some(VoiceError::PermissionDenied));

        assert_eq!(rig.manager.start_recording(), Err(VoiceError::PermissionDenied));
        assert!(!rig.manager.is_recording());
        assert!(drain_events(&rig.manager)
            .iter()
            .any(|e| matches!(e, VoiceEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_remote_close_keeps_session() {
        let (mut rig, peer) = connected().await;
        peer.send_control(&ControlMessage::SessionCreated {
            session_id: "s-9".into(),
        });
        rig.manager.next_event().await;
        rig.manager.start_recording().unwrap();

        peer.close(Some("1000 bye"));
        rig.manager.next_event().await;

        assert_eq!(rig.manager.state(), ConnectionState::Disconnected);
        assert!(!rig.manager.is_recording());
        assert!(!rig.mic.is_open());
        assert_eq!(rig.manager.session().id(), Some("s-9"));
    }

    #[tokio::test]
    async fn test_transport_failure_while_connected() {
        let (mut rig, peer) = connected().await;
        rig.manager.start_recording().unwrap();

        peer.fail("connection reset");
        rig.manager.next_event().await;

        assert_eq!(rig.manager.state(), ConnectionState::Error);
        assert!(!rig.mic.is_open());
        assert!(rig.manager.status().error().is_some());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (mut rig, mut peer) = connected().await;
        peer.send_binary(encode(&[0.1; 8]));
        rig.manager.next_event().await;
        rig.manager.start_recording().unwrap();

        rig.manager.disconnect();
        rig.manager.disconnect();

        peer.drain();
        assert_eq!(peer.close_count(), 1);
        assert_eq!(rig.manager.state(), ConnectionState::Disconnected);
        assert!(!rig.mic.is_open());
        assert_eq!(rig.speaker.queued(), 0);
        assert_eq!(rig.speaker.stop_count(), 1);
        assert_eq!(*rig.manager.level_receiver().borrow(), 0.0);
    }

    #[tokio::test]
    async fn test_disconnect_commits_before_close() {
        let (mut rig, mut peer) = connected().await;
        rig.manager.start_recording().unwrap();
        peer.drain();

        rig.manager.disconnect();

        assert_eq!(
            peer.drain(),
            vec![
                OutboundMessage::Text(ControlMessage::AudioBufferCommit.to_json().unwrap()),
                OutboundMessage::Close,
            ]
        );
        assert!(!rig.mic.is_open());
    }

    #[tokio::test]
    async fn test_resume_reply_with_other_id_ignored() {
        let (mut rig, peer) = connected().await;
        peer.send_control(&ControlMessage::SessionCreated {
            session_id: "abc123".into(),
        });
        rig.manager.next_event().await;
        peer.close(None);
        rig.manager.next_event().await;

        rig.manager.connect_configured().await.unwrap();
        let mut second = rig.connector.take_peer().unwrap();
        assert_eq!(
            second.drain_control(),
            vec![ControlMessage::SessionResume {
                session_id: "abc123".into()
            }]
        );

        second.send_control(&ControlMessage::SessionResumed {
            session_id: "zzz".into(),
        });
        rig.manager.next_event().await;
        assert_eq!(rig.manager.session().id(), Some("abc123"));
        assert_eq!(rig.manager.session().state(), SessionState::Created);
    }

    #[tokio::test]
    async fn test_created_during_resume_closes_old_session() {
        let (mut rig, peer) = connected().await;
        peer.send_control(&ControlMessage::SessionCreated {
            session_id: "abc123".into(),
        });
        rig.manager.next_event().await;
        peer.close(None);
        rig.manager.next_event().await;
        rig.manager.connect_configured().await.unwrap();
        let second = rig.connector.take_peer().unwrap();
        drain_events(&rig.manager);

        second.send_control(&ControlMessage::SessionCreated {
            session_id: "def456".into(),
        });
        rig.manager.next_event().await;

        let sessions: Vec<(Option<String>, SessionState)> = drain_events(&rig.manager)
            .into_iter()
            .filter_map(|e| match e {
                VoiceEvent::SessionChanged { session_id, state } => Some((session_id, state)),
                _ => None,
            })
            .collect();
        assert_eq!(
            sessions,
            vec![
                (None, SessionState::Closed),
                (Some("def456".to_string()), SessionState::Created),
            ]
        );
        assert_eq!(rig.manager.session().id(), Some("def456"));
    }

    #[tokio::test]
    async fn test_close_abandons_handshake() {
        let (mut rig, peer) = connected().await;
        assert!(rig.manager.session().is_awaiting_reply());

        peer.close(None);
        rig.manager.next_event().await;
        assert!(!rig.manager.session().is_awaiting_reply());
    }

    #[tokio::test]
    async fn test_disconnect_from_any_state() {
        let mut rig = rig();
        rig.manager.disconnect();
        assert_eq!(rig.manager.state(), ConnectionState::Disconnected);

        rig.connector.set_behavior(OpenBehavior::Refuse("down".into()));
        let _ = rig.manager.connect_configured().await;
        assert_eq!(rig.manager.state(), ConnectionState::Error);
        rig.manager.disconnect();
        assert_eq!(rig.manager.state(), ConnectionState::Disconnected);

        rig.connector.set_behavior(OpenBehavior::Hang);
        let auth = rig.manager.config().auth();
        rig.manager.begin_connect("ws://localhost/ws/voice", &auth).unwrap();
        rig.manager.disconnect();
        assert_eq!(rig.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_ignored_while_connected() {
        let (mut rig, _peer) = connected().await;
        rig.manager.connect_configured().await.unwrap();
        assert_eq!(rig.connector.open_count(), 1);
    }
}
