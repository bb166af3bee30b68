//! In-memory transport
//!
//! Every `open` hands the client a normal [`TransportLink`] and parks the
//! other end as a [`MemoryPeer`] that a test (or a local loopback) drives.

use super::{Connector, Inbound, OutboundMessage, TransportEvent, TransportLink};
use crate::messages::ControlMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use url::Url;

/// What a newly opened link reports before the peer does anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Report `Opened` immediately
    Accept,
    /// Report `Failed` with the given cause
    Refuse(String),
    /// Report `Closed` before ever opening
    CloseDuringConnect,
    /// Report nothing; the peer decides
    Hang,
}

/// Connector whose links end in [`MemoryPeer`]s. Clones share the same peers.
#[derive(Clone)]
pub struct MemoryConnector {
    behavior: Arc<Mutex<OpenBehavior>>,
    peers: Arc<Mutex<VecDeque<MemoryPeer>>>,
    opened: Arc<Mutex<usize>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::with_behavior(OpenBehavior::Accept)
    }

    pub fn with_behavior(behavior: OpenBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            peers: Arc::new(Mutex::new(VecDeque::new())),
            opened: Arc::new(Mutex::new(0)),
        }
    }

    /// Change the behavior for subsequent `open` calls
    pub fn set_behavior(&self, behavior: OpenBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Take the oldest peer that has not been taken yet
    pub fn take_peer(&self) -> Option<MemoryPeer> {
        self.peers.lock().pop_front()
    }

    /// Number of links opened so far
    pub fn open_count(&self) -> usize {
        *self.opened.lock()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemoryConnector {
    fn open(&self, url: &Url) -> TransportLink {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let initial = match &*self.behavior.lock() {
            OpenBehavior::Accept => Some(TransportEvent::Opened),
            OpenBehavior::Refuse(cause) => Some(TransportEvent::Failed(cause.clone())),
            OpenBehavior::CloseDuringConnect => Some(TransportEvent::Closed {
                reason: Some("closed during connect".to_string()),
            }),
            OpenBehavior::Hang => None,
        };
        if let Some(event) = initial {
            let _ = event_tx.send(event);
        }

        *self.opened.lock() += 1;
        self.peers.lock().push_back(MemoryPeer {
            url: url.clone(),
            to_client: event_tx,
            from_client: outbound_rx,
            close_count: 0,
        });

        TransportLink::new(outbound_tx, event_rx)
    }
}

/// Service side of an in-memory link
pub struct MemoryPeer {
    url: Url,
    to_client: UnboundedSender<TransportEvent>,
    from_client: UnboundedReceiver<OutboundMessage>,
    close_count: usize,
}

impl MemoryPeer {
    /// URL the client asked for
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn open(&self) {
        let _ = self.to_client.send(TransportEvent::Opened);
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self
            .to_client
            .send(TransportEvent::Message(Inbound::Text(text.into())));
    }

    pub fn send_control(&self, msg: &ControlMessage) {
        if let Ok(json) = msg.to_json() {
            self.send_text(json);
        }
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self
            .to_client
            .send(TransportEvent::Message(Inbound::Binary(bytes)));
    }

    /// Close from the service side
    pub fn close(&self, reason: Option<&str>) {
        let _ = self.to_client.send(TransportEvent::Closed {
            reason: reason.map(str::to_string),
        });
    }

    pub fn fail(&self, cause: impl Into<String>) {
        let _ = self.to_client.send(TransportEvent::Failed(cause.into()));
    }

    /// Everything the client has sent so far, in order
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.from_client.try_recv() {
            if msg == OutboundMessage::Close {
                self.close_count += 1;
            }
            out.push(msg);
        }
        out
    }

    /// Control messages the client has sent so far, parsed
    pub fn drain_control(&mut self) -> Vec<ControlMessage> {
        self.drain()
            .into_iter()
            .filter_map(|msg| match msg {
                OutboundMessage::Text(text) => crate::messages::parse(&text).ok(),
                _ => None,
            })
            .collect()
    }

    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        let msg = self.from_client.recv().await;
        if msg == Some(OutboundMessage::Close) {
            self.close_count += 1;
        }
        msg
    }

    /// Number of close requests observed through `drain`/`recv`
    pub fn close_count(&self) -> usize {
        self.close_count
    }

    /// The client dropped its side of the link
    pub fn is_client_gone(&mut self) -> bool {
        matches!(self.from_client.try_recv(), Err(TryRecvError::Disconnected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("ws://localhost/ws/voice").unwrap()
    }

    #[tokio::test]
    async fn test_accepting_link() {
        let connector = MemoryConnector::new();
        let mut link = connector.open(&url());
        assert_eq!(link.recv().await, Some(TransportEvent::Opened));

        let mut peer = connector.take_peer().unwrap();
        link.send(OutboundMessage::Text("hi".into())).unwrap();
        peer.send_binary(vec![1, 2]);

        assert_eq!(peer.drain(), vec![OutboundMessage::Text("hi".into())]);
        assert_eq!(
            link.recv().await,
            Some(TransportEvent::Message(Inbound::Binary(vec![1, 2])))
        );
    }

    #[tokio::test]
    async fn test_refusing_link() {
        let connector = MemoryConnector::with_behavior(OpenBehavior::Refuse("nope".into()));
        let mut link = connector.open(&url());
        assert_eq!(link.recv().await, Some(TransportEvent::Failed("nope".into())));
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test]
    async fn test_close_is_counted_once() {
        let connector = MemoryConnector::new();
        let link = connector.open(&url());
        let mut peer = connector.take_peer().unwrap();

        link.close();
        assert_eq!(peer.drain(), vec![OutboundMessage::Close]);
        assert_eq!(peer.close_count(), 1);
        assert!(peer.is_client_gone());
    }
}
