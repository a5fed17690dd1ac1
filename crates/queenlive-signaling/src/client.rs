use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use queenlive_core::events::ClientEvent;
use queenlive_core::ids::ConnectionId;
use queenlive_core::SessionError;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{websocket_endpoint, EnginePacket, SocketPacket};

const DEFAULT_SEND_QUEUE: usize = 256;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback for one named server event. Receives the first event argument
/// (or `Null` when the server sent none).
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Registered handlers plus the outbound queue, shared by the reader task
/// and the loopback peer.
#[derive(Clone)]
struct Dispatcher {
    handlers: Arc<DashMap<String, Vec<EventHandler>>>,
    outbound: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
    id: ConnectionId,
}

impl Dispatcher {
    /// Handle one raw Engine.IO frame.
    fn dispatch_frame(&self, frame: &str) {
        let packet = match EnginePacket::decode(frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "dropping undecodable frame");
                return;
            }
        };

        match packet {
            EnginePacket::Ping(data) => {
                if self.outbound.try_send(EnginePacket::Pong(data).encode()).is_err() {
                    warn!(conn_id = %self.id, "failed to queue pong");
                }
            }
            EnginePacket::Message(data) => self.dispatch_socket(&data),
            EnginePacket::Close => {
                info!(conn_id = %self.id, "server closed the session");
                self.connected.store(false, Ordering::Relaxed);
            }
            EnginePacket::Open(_) | EnginePacket::Pong(_) | EnginePacket::Upgrade | EnginePacket::Noop => {}
        }
    }

    fn dispatch_socket(&self, data: &str) {
        let packet = match SocketPacket::decode(data) {
            Ok(p) => p,
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "dropping malformed socket packet");
                return;
            }
        };

        match packet {
            SocketPacket::Event { name, mut args, .. } => {
                let payload = if args.is_empty() { Value::Null } else { args.swap_remove(0) };
                self.invoke(&name, payload);
            }
            SocketPacket::Disconnect { .. } => {
                info!(conn_id = %self.id, "server disconnected the socket");
                self.connected.store(false, Ordering::Relaxed);
            }
            SocketPacket::ConnectError { data, .. } => {
                warn!(conn_id = %self.id, ?data, "connect error from server");
                self.connected.store(false, Ordering::Relaxed);
            }
            SocketPacket::Connect { .. } | SocketPacket::Ack { .. } => {}
        }
    }

    fn invoke(&self, name: &str, payload: Value) {
        // Clone out of the map so handlers may call on/off without deadlocking.
        let handlers: Vec<EventHandler> = match self.handlers.get(name) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(conn_id = %self.id, event = name, "no handler for event");
                return;
            }
        };
        for handler in handlers {
            handler(payload.clone());
        }
    }
}

/// socket.io client over a single WebSocket.
///
/// Handlers run serially on the reader task, in arrival order.
pub struct SignalingClient {
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl SignalingClient {
    /// Connect to `base_url` (`http(s)://host:port`) and complete the
    /// Engine.IO open + Socket.IO connect handshake.
    pub async fn connect(base_url: &str) -> Result<Self, SessionError> {
        let endpoint = websocket_endpoint(base_url)?;
        let (ws, _response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(endpoint.as_str()))
            .await
            .map_err(|_| SessionError::Timeout(HANDSHAKE_TIMEOUT))?
            .map_err(|e| SessionError::Network(format!("websocket connect to {endpoint}: {e}")))?;

        let (mut ws_tx, mut ws_rx) = ws.split();

        let open = match next_text(&mut ws_rx).await? {
            Some(text) => match EnginePacket::decode(&text)? {
                EnginePacket::Open(open) => open,
                other => return Err(SessionError::Protocol(format!("expected open packet, got {other:?}"))),
            },
            None => return Err(SessionError::Network("closed before open packet".into())),
        };

        ws_tx
            .send(WsMessage::Text(SocketPacket::connect().to_frame().into()))
            .await
            .map_err(|e| SessionError::Network(e.to_string()))?;

        // Servers may interleave pings before acknowledging the connect.
        loop {
            let Some(text) = next_text(&mut ws_rx).await? else {
                return Err(SessionError::Network("closed during connect".into()));
            };
            match EnginePacket::decode(&text)? {
                EnginePacket::Message(data) => match SocketPacket::decode(&data)? {
                    SocketPacket::Connect { .. } => break,
                    SocketPacket::ConnectError { data, .. } => {
                        return Err(SessionError::Rejected(format!("socket connect refused: {}", data.unwrap_or(Value::Null))))
                    }
                    other => debug!(?other, "ignoring packet before connect ack"),
                },
                EnginePacket::Ping(data) => {
                    ws_tx
                        .send(WsMessage::Text(EnginePacket::Pong(data).encode().into()))
                        .await
                        .map_err(|e| SessionError::Network(e.to_string()))?;
                }
                other => debug!(?other, "ignoring engine packet before connect ack"),
            }
        }

        let (outbound, mut rx) = mpsc::channel::<String>(DEFAULT_SEND_QUEUE);
        let client = Self::from_parts(outbound);
        let id = client.dispatcher.id.clone();
        info!(conn_id = %id, sid = %open.sid, ping_interval_ms = open.ping_interval, "signaling connected");

        // Writer task: forward queued frames to the socket.
        let writer_shutdown = client.shutdown.clone();
        let writer_id = id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        match msg {
                            Some(text) => {
                                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                                    warn!(conn_id = %writer_id, error = %e, "websocket write failed");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = writer_shutdown.cancelled() => {
                        let _ = ws_tx.send(WsMessage::Text(EnginePacket::Close.encode().into())).await;
                        let _ = ws_tx.close().await;
                        break;
                    }
                }
            }
            debug!(conn_id = %writer_id, "writer task exited");
        });

        let heartbeat = open.heartbeat_timeout();
        let reader_shutdown = client.shutdown.clone();
        let dispatcher = client.dispatcher.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = tokio::time::timeout(heartbeat, ws_rx.next()) => next,
                    _ = reader_shutdown.cancelled() => break,
                };
                match next {
                    Err(_) => {
                        warn!(conn_id = %dispatcher.id, timeout_ms = heartbeat.as_millis() as u64, "no heartbeat from server");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        warn!(conn_id = %dispatcher.id, error = %e, "websocket read failed");
                        break;
                    }
                    Ok(Some(Ok(WsMessage::Text(text)))) => dispatcher.dispatch_frame(text.as_str()),
                    Ok(Some(Ok(WsMessage::Close(_)))) => break,
                    Ok(Some(Ok(_))) => {}
                }
            }
            dispatcher.connected.store(false, Ordering::Relaxed);
            info!(conn_id = %dispatcher.id, "signaling disconnected");
        });

        Ok(client)
    }

    /// In-memory client for tests: frames go to the returned peer instead of a socket.
    pub fn loopback() -> (Self, LoopbackPeer) {
        let (outbound, rx) = mpsc::channel(DEFAULT_SEND_QUEUE);
        let client = Self::from_parts(outbound);
        let peer = LoopbackPeer {
            dispatcher: client.dispatcher.clone(),
            outbound: rx,
        };
        (client, peer)
    }

    fn from_parts(outbound: mpsc::Sender<String>) -> Self {
        Self {
            dispatcher: Dispatcher {
                handlers: Arc::new(DashMap::new()),
                outbound,
                connected: Arc::new(AtomicBool::new(true)),
                id: ConnectionId::new(),
            },
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.dispatcher.id
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.connected.load(Ordering::Relaxed)
    }

    /// Queue an event for the server. Fails when the connection is gone or
    /// the send queue is full.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Network("signaling connection closed".into()));
        }
        let frame = SocketPacket::event(event, payload).to_frame();
        match self.dispatcher.outbound.try_send(frame) {
            Ok(()) => {
                debug!(conn_id = %self.dispatcher.id, event, "emitted");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(conn_id = %self.dispatcher.id, event, frame_len = frame.len(), "send queue full, dropping event");
                Err(SessionError::Network("send queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dispatcher.connected.store(false, Ordering::Relaxed);
                Err(SessionError::Network("signaling connection closed".into()))
            }
        }
    }

    pub fn emit_event(&self, event: &ClientEvent) -> Result<(), SessionError> {
        self.emit(event.name(), event.payload())
    }

    /// Register a handler. Several handlers per event run in registration order.
    pub fn on(&self, event: &str, handler: EventHandler) {
        self.dispatcher.handlers.entry(event.to_string()).or_default().push(handler);
    }

    /// Remove every handler for `event`.
    pub fn off(&self, event: &str) {
        self.dispatcher.handlers.remove(event);
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.dispatcher.handlers.get(event).map(|h| h.len()).unwrap_or(0)
    }

    /// Close the socket and stop background tasks.
    pub fn close(&self) {
        self.dispatcher.connected.store(false, Ordering::Relaxed);
        self.shutdown.cancel();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn next_text<S>(rx: &mut S) -> Result<Option<String>, SessionError>
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let next = tokio::time::timeout_at(deadline, rx.next())
            .await
            .map_err(|_| SessionError::Timeout(HANDSHAKE_TIMEOUT))?;
        match next {
            None | Some(Ok(WsMessage::Close(_))) => return Ok(None),
            Some(Err(e)) => return Err(SessionError::Network(e.to_string())),
            Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.as_str().to_string())),
            Some(Ok(_)) => continue,
        }
    }
}

/// The far side of [`SignalingClient::loopback`].
pub struct LoopbackPeer {
    dispatcher: Dispatcher,
    outbound: mpsc::Receiver<String>,
}

impl LoopbackPeer {
    /// Deliver a server event to the client's handlers synchronously.
    pub fn push_event(&self, name: &str, payload: Value) {
        self.dispatcher.dispatch_frame(&SocketPacket::event(name, payload).to_frame());
    }

    /// Deliver a raw Engine.IO frame.
    pub fn push_frame(&self, frame: &str) {
        self.dispatcher.dispatch_frame(frame);
    }

    /// Next raw frame the client sent, if any.
    pub fn next_frame(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Next event the client emitted, decoded to `(name, first arg)`.
    pub fn next_event(&mut self) -> Option<(String, Value)> {
        while let Some(frame) = self.next_frame() {
            if let Ok(EnginePacket::Message(data)) = EnginePacket::decode(&frame) {
                if let Ok(SocketPacket::Event { name, mut args, .. }) = SocketPacket::decode(&data) {
                    let payload = if args.is_empty() { Value::Null } else { args.swap_remove(0) };
                    return Some((name, payload));
                }
            }
        }
        None
    }

    /// All emitted events still queued.
    pub fn drain_events(&mut self) -> Vec<(String, Value)> {
        std::iter::from_fn(|| self.next_event()).collect()
    }

    /// Simulate the server dropping the connection.
    pub fn disconnect(&self) {
        self.dispatcher.connected.store(false, Ordering::Relaxed);
    }
}
