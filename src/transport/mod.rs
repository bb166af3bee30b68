//! Message-oriented transport to the voice service
//!
//! A transport is seen by the rest of the crate as two channels: an ordered
//! stream of [`TransportEvent`]s and a sink for [`OutboundMessage`]s. The socket
//! itself lives in its own task, so the connection manager can be driven by a
//! single dispatch loop and tested without a live server.

pub mod memory;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryPeer, OpenBehavior};
pub use websocket::WsConnector;

use crate::{Result, VoiceError};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use url::Url;

/// Query parameters that are always set by this client
const OWNED_PARAMS: &[&str] = &["api_key", "tenant_id", "mode", "sample_rate", "format"];

/// Payload received from the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// PCM16 audio to play back
    Binary(Vec<u8>),
    /// JSON control message
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is open and may carry messages
    Opened,
    Message(Inbound),
    /// Remote or orderly close
    Closed { reason: Option<String> },
    /// The transport failed to open or broke
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Binary(Vec<u8>),
    Text(String),
    /// Close the connection; nothing is sent after this
    Close,
}

/// Client side of one open (or opening) connection
pub struct TransportLink {
    outbound: UnboundedSender<OutboundMessage>,
    events: UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    pub fn new(
        outbound: UnboundedSender<OutboundMessage>,
        events: UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { outbound, events }
    }

    /// Queue a message for the socket task
    pub fn send(&self, msg: OutboundMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| VoiceError::ConnectionError("Transport is closed".to_string()))
    }

    /// Next event in arrival order; `None` once the socket task is gone
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Close the connection. Consumes the link so it can only happen once.
    pub fn close(self) {
        let _ = self.outbound.send(OutboundMessage::Close);
    }
}

/// Opens transports. One call per connection attempt.
pub trait Connector: Send {
    fn open(&self, url: &Url) -> TransportLink;
}

/// Credentials and tenant passed on the connection URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthParams {
    pub api_key: Option<String>,
    pub tenant_id: String,
}

/// Build the realtime endpoint URL from the configured base URL.
///
/// Produces `<base>?api_key=<key>&tenant_id=<id>&mode=realtime&sample_rate=<N>&format=pcm16`,
/// keeping any unrelated query parameters already on the base.
pub fn endpoint_url(base: &str, auth: &AuthParams, sample_rate: u32) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| VoiceError::ConfigError(format!("Invalid endpoint URL {}: {}", base, e)))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(VoiceError::ConfigError(format!(
                "Endpoint scheme must be ws or wss, got {}",
                other
            )))
        }
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !OWNED_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        for (k, v) in &kept {
            query.append_pair(k, v);
        }
        if let Some(key) = auth.api_key.as_deref().filter(|k| !k.is_empty()) {
            query.append_pair("api_key", key);
        }
        query.append_pair("tenant_id", &auth.tenant_id);
        query.append_pair("mode", "realtime");
        query.append_pair("sample_rate", &sample_rate.to_string());
        query.append_pair("format", "pcm16");
    }

    Ok(url)
}

/// URL with the query stripped, safe to log
pub fn redacted(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}
