//! WebSocket transport on `tokio-tungstenite`
//!
//! Each opened link gets one task that owns the socket. Outbound messages are
//! written in queue order and inbound frames are forwarded as events in
//! arrival order. Ping/pong is answered by tungstenite itself.

use super::{Connector, Inbound, OutboundMessage, TransportEvent, TransportLink};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;

/// Opens real WebSocket connections. Must be used inside a tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &Url) -> TransportLink {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_socket(url.clone(), outbound_rx, event_tx));

        TransportLink::new(outbound_tx, event_rx)
    }
}

async fn run_socket(
    url: Url,
    mut outbound: UnboundedReceiver<OutboundMessage>,
    events: UnboundedSender<TransportEvent>,
) {
    let host = url.host_str().unwrap_or("unknown").to_string();

    // Nothing is queued before Opened, so anything arriving here means the
    // link was closed or dropped while still connecting.
    let stream = tokio::select! {
        result = connect_async(url.as_str()) => match result {
            Ok((stream, response)) => {
                debug!(host = %host, status = %response.status(), "WebSocket handshake complete");
                stream
            }
            Err(e) => {
                warn!(host = %host, "WebSocket connect failed: {}", e);
                let _ = events.send(TransportEvent::Failed(e.to_string()));
                return;
            }
        },
        _ = outbound.recv() => {
            debug!(host = %host, "Connection abandoned before open");
            return;
        }
    };

    info!(host = %host, "WebSocket connected");
    let _ = events.send(TransportEvent::Opened);

    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let frame = match msg {
                    Some(OutboundMessage::Binary(bytes)) => WsMessage::Binary(bytes),
                    Some(OutboundMessage::Text(text)) => WsMessage::Text(text),
                    Some(OutboundMessage::Close) | None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        let _ = write.close().await;
                        info!(host = %host, "WebSocket closed by client");
                        break;
                    }
                };

                if let Err(e) = write.send(frame).await {
                    warn!(host = %host, "WebSocket send failed: {}", e);
                    let _ = events.send(TransportEvent::Failed(e.to_string()));
                    break;
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        let _ = events.send(TransportEvent::Message(Inbound::Binary(bytes)));
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        let _ = events.send(TransportEvent::Message(Inbound::Text(text)));
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .filter(|r| !r.trim().is_empty());
                        info!(host = %host, reason = ?reason, "WebSocket closed by server");
                        let _ = events.send(TransportEvent::Closed { reason });
                        break;
                    }
                    Some(Ok(_)) => {
                        // ping/pong and raw frames
                    }
                    Some(Err(e)) => {
                        warn!(host = %host, "WebSocket receive failed: {}", e);
                        let _ = events.send(TransportEvent::Failed(e.to_string()));
                        break;
                    }
                    None => {
                        info!(host = %host, "WebSocket stream ended");
                        let _ = events.send(TransportEvent::Closed { reason: None });
                        break;
                    }
                }
            }
        }
    }
}
