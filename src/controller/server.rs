//! Controller WebSocket server - accept loop and per-connection tasks

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::codec;
use crate::protocol::{CloseInfo, DEFAULT_IDENTITY, NO_STATUS, SUBPROTOCOL_HEADER};

use super::session::RunTracker;
use super::{ConnectionId, ControllerEvent};

/// Close code sent to endpoints when the controller shuts down
pub(super) const GOING_AWAY: u16 = 1001;

pub(super) struct Entry {
    pub identity: String,
    pub peer: SocketAddr,
    pub outbound: mpsc::UnboundedSender<Message>,
    pub tracker: RunTracker,
}

/// Open connections, shared between the controller and its connection tasks
#[derive(Default)]
pub(super) struct Registry {
    next_id: u64,
    pub connections: HashMap<ConnectionId, Entry>,
}

impl Registry {
    fn register(
        &mut self,
        identity: String,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.connections.insert(
            id,
            Entry {
                identity,
                peer,
                outbound,
                tracker: RunTracker::new(),
            },
        );
        id
    }
}

pub(super) type SharedRegistry = Arc<Mutex<Registry>>;

pub(super) fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(super) fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

/// Accept endpoints until the task is aborted
pub(super) async fn accept_loop(
    listener: TcpListener,
    registry: SharedRegistry,
    events: mpsc::UnboundedSender<ControllerEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "Accepted TCP connection");
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    registry.clone(),
                    events.clone(),
                ));
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept error");
            }
        }
    }
}

/// First protocol the endpoint offered, if any
fn offered_protocol(request: &Request) -> Option<String> {
    request
        .headers()
        .get(SUBPROTOCOL_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: SharedRegistry,
    events: mpsc::UnboundedSender<ControllerEvent>,
) {
    let mut offered = None;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        if let Some(protocol) = offered_protocol(request) {
            // Clients refuse a handshake that does not echo their protocol
            if let Ok(value) = HeaderValue::from_str(&protocol) {
                response.headers_mut().insert(SUBPROTOCOL_HEADER, value);
            }
            offered = Some(protocol);
        }
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let identity = offered.unwrap_or_else(|| DEFAULT_IDENTITY.to_string());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = lock(&registry).register(identity.clone(), peer, tx);
    tracing::info!(%id, %identity, %peer, "Endpoint connected");
    let _ = events.send(ControllerEvent::Connected {
        id,
        identity: identity.clone(),
    });

    let (mut sink, mut stream) = ws.split();
    let mut outbound_open = true;
    // Set once the controller sent its own close frame
    let mut closing: Option<CloseInfo> = None;

    let close = loop {
        tokio::select! {
            outbound = rx.recv(), if outbound_open => {
                let message = match outbound {
                    Some(message) => message,
                    None => {
                        outbound_open = false;
                        if closing.is_some() {
                            continue;
                        }
                        close_message(GOING_AWAY, "controller shutting down")
                    }
                };
                if let Message::Close(Some(frame)) = &message {
                    closing = Some(CloseInfo::new(u16::from(frame.code), frame.reason.to_string()));
                }
                if let Err(e) = sink.send(message).await {
                    tracing::warn!(%id, error = %e, "Failed to write frame");
                    break closing.unwrap_or_else(|| CloseInfo::abnormal(e.to_string()));
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => match codec::decode_event(&text) {
                    Ok(event) => {
                        tracing::trace!(%id, event = %event.name, "Received event");
                        if let Some(entry) = lock(&registry).connections.get_mut(&id) {
                            entry.tracker.observe(event.name);
                        }
                        let _ = events.send(ControllerEvent::Event { id, event });
                    }
                    Err(e) => {
                        tracing::warn!(%id, error = %e, "Dropping undecodable event frame");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let _ = sink.close().await;
                    let received = match frame {
                        Some(frame) => CloseInfo::new(u16::from(frame.code), frame.reason.to_string()),
                        None => CloseInfo::new(NO_STATUS, ""),
                    };
                    break closing.unwrap_or(received);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%id, error = %e, "Connection error");
                    break closing.unwrap_or_else(|| CloseInfo::abnormal(e.to_string()));
                }
                None => break closing.unwrap_or_else(|| CloseInfo::abnormal("connection dropped")),
            },
        }
    };

    lock(&registry).connections.remove(&id);
    tracing::info!(%id, %identity, %close, "Endpoint disconnected");
    let _ = events.send(ControllerEvent::Disconnected {
        id,
        identity,
        close,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    #[test]
    fn test_offered_protocol_takes_first_entry() {
        let mut request = "ws://localhost:1".into_client_request().unwrap();
        request.headers_mut().insert(
            SUBPROTOCOL_HEADER,
            HeaderValue::from_static("browser-1, fallback"),
        );
        assert_eq!(offered_protocol(&request), Some("browser-1".to_string()));
    }

    #[test]
    fn test_missing_protocol() {
        let request = "ws://localhost:1".into_client_request().unwrap();
        assert_eq!(offered_protocol(&request), None);
    }

    #[test]
    fn test_registry_assigns_increasing_ids() {
        let mut registry = Registry::default();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = registry.register("a".to_string(), peer, tx.clone());
        let second = registry.register("a".to_string(), peer, tx);
        assert!(second > first);
        assert_eq!(registry.connections.len(), 2);
    }
}
