//! Server-assigned session identity

use super::control::{ControlMessage, SessionConfig};
use crate::{Result, VoiceError};
use tracing::debug;

/// Session lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Created,
    Resumed,
    Closed,
}

impl SessionState {
    /// A session the service knows about and that can be resumed
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Created | SessionState::Resumed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "Uninitialized"),
            SessionState::Created => write!(f, "Created"),
            SessionState::Resumed => write!(f, "Resumed"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Session identity tracked across reconnects.
///
/// The id is assigned by the service's handshake reply and stays fixed until
/// the session is closed. Outside a handshake, a reply carrying a different id
/// is rejected.
#[derive(Clone, Debug, Default)]
pub struct Session {
    id: Option<String>,
    state: SessionState,
    awaiting_reply: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live() && self.id.is_some()
    }

    /// First control message for a freshly opened connection: resume the
    /// live session if there is one, otherwise ask for a new one.
    pub fn opening_message(&self, config: &SessionConfig) -> ControlMessage {
        match (&self.id, self.state.is_live()) {
            (Some(id), true) => ControlMessage::SessionResume {
                session_id: id.clone(),
            },
            _ => ControlMessage::SessionCreate {
                config: config.clone(),
            },
        }
    }

    /// Record that the opening message went out and a reply is expected
    pub fn begin_handshake(&mut self) {
        self.awaiting_reply = true;
    }

    /// Drop an unanswered handshake; the connection it was sent on is gone
    pub fn abandon_handshake(&mut self) {
        if self.awaiting_reply {
            debug!("Session handshake abandoned");
        }
        self.awaiting_reply = false;
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    /// Whether `session.created` with `session_id` would replace the live
    /// session. Only an outstanding handshake may do that, and the caller
    /// closes the old session first.
    pub fn is_replaced_by(&self, session_id: &str) -> bool {
        self.awaiting_reply && self.is_live() && self.id.as_deref() != Some(session_id)
    }

    /// Apply `session.created`
    pub fn on_created(&mut self, session_id: String) -> Result<()> {
        check_id(&session_id)?;
        if let Some(current) = self.live_id() {
            if current != session_id && !self.awaiting_reply {
                return Err(VoiceError::ProtocolError(format!(
                    "Session id change from {} to {} outside handshake",
                    current, session_id
                )));
            }
        }
        self.assign(session_id, SessionState::Created);
        Ok(())
    }

    /// Apply `session.resumed`. The id must be the one being resumed.
    pub fn on_resumed(&mut self, session_id: String) -> Result<()> {
        check_id(&session_id)?;
        match self.live_id().map(str::to_string) {
            Some(current) if current == session_id => {
                self.assign(session_id, SessionState::Resumed);
                Ok(())
            }
            Some(current) => Err(VoiceError::ProtocolError(format!(
                "Resumed session {} while resuming {}",
                session_id, current
            ))),
            None => Err(VoiceError::ProtocolError(format!(
                "Resumed session {} without a session to resume",
                session_id
            ))),
        }
    }

    fn live_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|_| self.state.is_live())
    }

    fn assign(&mut self, session_id: String, next: SessionState) {
        debug!(session_id = %session_id, state = %next, "Session updated");
        self.id = Some(session_id);
        self.state = next;
        self.awaiting_reply = false;
    }

    /// Forget the session; the next connection creates a new one
    pub fn close(&mut self) {
        if self.state != SessionState::Closed || self.id.is_some() {
            debug!(session_id = ?self.id, "Session closed");
        }
        self.id = None;
        self.state = SessionState::Closed;
        self.awaiting_reply = false;
    }
}

fn check_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() {
        return Err(VoiceError::ProtocolError("Empty session id".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_creates() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(matches!(
            session.opening_message(&SessionConfig::default()),
            ControlMessage::SessionCreate { .. }
        ));
    }

    #[test]
    fn test_created_then_resume() {
        let mut session = Session::new();
        session.begin_handshake();
        session.on_created("abc123".into()).unwrap();
        assert_eq!(session.id(), Some("abc123"));
        assert_eq!(session.state(), SessionState::Created);

        assert_eq!(
            session.opening_message(&SessionConfig::default()),
            ControlMessage::SessionResume {
                session_id: "abc123".into()
            }
        );

        session.begin_handshake();
        session.on_resumed("abc123".into()).unwrap();
        assert_eq!(session.state(), SessionState::Resumed);
    }

    #[test]
    fn test_id_immutable_outside_handshake() {
        let mut session = Session::new();
        session.begin_handshake();
        session.on_created("abc123".into()).unwrap();

        assert!(session.on_created("zzz".into()).is_err());
        assert!(session.on_resumed("zzz".into()).is_err());
        assert_eq!(session.id(), Some("abc123"));

        // Same id again is harmless
        assert!(session.on_created("abc123".into()).is_ok());
    }

    #[test]
    fn test_handshake_may_replace_session() {
        let mut session = Session::new();
        session.begin_handshake();
        session.on_created("old".into()).unwrap();

        session.begin_handshake();
        session.on_created("new".into()).unwrap();
        assert_eq!(session.id(), Some("new"));
    }

    #[test]
    fn test_resumed_must_match_requested_id() {
        let mut session = Session::new();
        session.begin_handshake();
        session.on_created("abc123".into()).unwrap();

        session.begin_handshake();
        assert!(session.on_resumed("zzz".into()).is_err());
        assert_eq!(session.id(), Some("abc123"));
        assert_eq!(session.state(), SessionState::Created);

        // The handshake is still open for the right reply
        assert!(session.is_awaiting_reply());
        session.on_resumed("abc123".into()).unwrap();
        assert_eq!(session.state(), SessionState::Resumed);
    }

    #[test]
    fn test_resumed_without_session_rejected() {
        let mut session = Session::new();
        session.begin_handshake();
        assert!(session.on_resumed("abc123".into()).is_err());
        assert_eq!(session.id(), None);
    }

    #[test]
    fn test_abandoned_handshake_closes_window() {
        let mut session = Session::new();
        session.begin_handshake();
        session.on_created("abc123".into()).unwrap();

        session.begin_handshake();
        assert!(session.is_replaced_by("other"));
        session.abandon_handshake();
        assert!(!session.is_replaced_by("other"));
        assert!(session.on_created("other".into()).is_err());
        assert_eq!(session.id(), Some("abc123"));
    }

    #[test]
    fn test_close_resets() {
        let mut session = Session::new();
        session.begin_handshake();
        session.on_created("abc123".into()).unwrap();
        session.close();

        assert_eq!(session.id(), None);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.opening_message(&SessionConfig::default()),
            ControlMessage::SessionCreate { .. }
        ));

        // A closed session accepts a fresh id
        session.on_created("def456".into()).unwrap();
        assert_eq!(session.id(), Some("def456"));
    }

    #[test]
    fn test_empty_id_rejected() {
        let mut session = Session::new();
        assert!(session.on_created(String::new()).is_err());
        assert_eq!(session.state(), SessionState::Uninitialized);
    }
}
