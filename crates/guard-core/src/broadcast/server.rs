//! WebSocket push channel for dashboard clients.
//!
//! ## Protocol
//!
//! Client to server (JSON text frames):
//!
//! - `{"type":"subscribe","token":"...","lastSeenSeq":42}`: must be the first
//!   frame; may be sent again to resubscribe
//! - `{"type":"heartbeat_ack"}`: answer to every `heartbeat` frame
//!
//! Server to client, always `{type, seq, payload}`:
//!
//! - `mode_changed` / `allocation_changed` / `session_changed`: one event
//! - `snapshot`: full state as of `seq`; discard anything older
//! - `heartbeat`: liveness probe carrying the latest `seq`
//! - `error`: `{errorKind, message}`; the connection is closed afterwards
//!
//! A client that misses two heartbeats in a row is released server-side and
//! disconnected. Reconnecting with the last `seq` it processed resumes the
//! stream without gaps, or yields a snapshot if that position is gone.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::broadcaster::{Delivery, Subscription};
use super::events::StatusEvent;
use crate::config::ServerConfig;
use crate::error::{ErrorKind, GuardError};
use crate::gate::RouteKind;
use crate::guard::{StatusSnapshot, StreamStart, TradingGuard};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PushServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum number of concurrent clients.
    pub max_clients: usize,
    /// Time allowed for the first `subscribe` frame.
    pub subscribe_timeout: Duration,
}

impl Default for PushServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            max_clients: 100,
            subscribe_timeout: Duration::from_secs(10),
        }
    }
}

impl PushServerConfig {
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.push_port,
            max_clients: config.max_clients,
            ..Default::default()
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct PushServerStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
    pub frames_sent: AtomicU64,
    pub subscribe_failures: AtomicU64,
}

// ============================================================================
// Wire frames
// ============================================================================

#[derive(Debug, Serialize)]
struct PushFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    seq: u64,
    payload: serde_json::Value,
}

impl PushFrame<'_> {
    fn into_message(self) -> Option<Message> {
        match serde_json::to_string(&self) {
            Ok(json) => Some(Message::Text(json)),
            Err(e) => {
                error!(error = %e, frame = self.kind, "Failed to serialize push frame");
                None
            }
        }
    }
}

fn event_frame(event: &StatusEvent) -> Option<Message> {
    PushFrame {
        kind: event.event_type(),
        seq: event.seq,
        payload: event.payload.data_json(),
    }
    .into_message()
}

fn snapshot_frame(snapshot: &StatusSnapshot) -> Option<Message> {
    PushFrame {
        kind: "snapshot",
        seq: snapshot.seq,
        payload: serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null),
    }
    .into_message()
}

fn heartbeat_frame(latest_seq: u64) -> Option<Message> {
    PushFrame {
        kind: "heartbeat",
        seq: latest_seq,
        payload: serde_json::Value::Null,
    }
    .into_message()
}

fn error_frame(kind: ErrorKind, message: &str) -> Option<Message> {
    PushFrame {
        kind: "error",
        seq: 0,
        payload: serde_json::json!({ "errorKind": kind, "message": message }),
    }
    .into_message()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe {
        token: String,
        #[serde(rename = "lastSeenSeq", default)]
        last_seen_seq: Option<u64>,
    },
    HeartbeatAck,
}

// ============================================================================
// Push Server
// ============================================================================

pub struct PushServer {
    config: PushServerConfig,
    guard: Arc<TradingGuard>,
    stats: Arc<PushServerStats>,
    next_client_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl PushServer {
    pub fn new(config: PushServerConfig, guard: Arc<TradingGuard>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            guard,
            stats: Arc::new(PushServerStats::default()),
            next_client_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    pub fn stats(&self) -> &Arc<PushServerStats> {
        &self.stats
    }

    /// Get the shutdown sender for triggering graceful shutdown.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, max_clients = self.config.max_clients, "Push server started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.handle_new_connection(stream, addr),
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Push server shutting down");
                    break;
                }
            }
        }

        info!("Push server stopped");
        Ok(())
    }

    fn handle_new_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let current = self.stats.active_connections.load(Ordering::Relaxed);
        if current >= self.config.max_clients as u64 {
            warn!(addr = %addr, current, max = self.config.max_clients, "Rejecting connection: max clients reached");
            return;
        }

        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let guard = Arc::clone(&self.guard);
        let stats = Arc::clone(&self.stats);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let subscribe_timeout = self.config.subscribe_timeout;

        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => {
                    stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    debug!(client_id, addr = %addr, "Client connected");
                    let (ws_tx, ws_rx) = ws.split();
                    let mut client = ClientTask {
                        client_id,
                        guard,
                        stats: Arc::clone(&stats),
                        ws_tx,
                        ws_rx,
                    };
                    client.run(subscribe_timeout, shutdown_rx).await;
                }
                Err(e) => warn!(addr = %addr, error = %e, "WebSocket handshake failed"),
            }
            stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            debug!(client_id, "Client disconnected");
        });
    }
}

/// Outcome of a client frame while streaming.
enum Inbound {
    Continue,
    Resubscribe { token: String, last_seen: Option<u64> },
    Close,
}

struct ClientTask {
    client_id: u64,
    guard: Arc<TradingGuard>,
    stats: Arc<PushServerStats>,
    ws_tx: WsSink,
    ws_rx: WsSource,
}

impl ClientTask {
    async fn send(&mut self, msg: Option<Message>) -> bool {
        let Some(msg) = msg else {
            return true;
        };
        match self.ws_tx.send(msg).await {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!(client_id = self.client_id, error = %e, "Failed to send frame");
                false
            }
        }
    }

    async fn fail(&mut self, kind: ErrorKind, message: &str) {
        self.stats.subscribe_failures.fetch_add(1, Ordering::Relaxed);
        self.send(error_frame(kind, message)).await;
        let _ = self.ws_tx.send(Message::Close(None)).await;
    }

    async fn run(&mut self, subscribe_timeout: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        let first = tokio::time::timeout(subscribe_timeout, self.next_client_frame()).await;
        let (mut token, mut last_seen) = match first {
            Ok(Some(ClientFrame::Subscribe { token, last_seen_seq })) => (token, last_seen_seq),
            Ok(Some(ClientFrame::HeartbeatAck)) | Ok(None) => {
                self.fail(ErrorKind::Validation, "first frame must be subscribe").await;
                return;
            }
            Err(_) => {
                self.fail(ErrorKind::Validation, "subscribe timed out").await;
                return;
            }
        };

        loop {
            let subscription = match self.open(&token, last_seen).await {
                Some(s) => s,
                None => return,
            };
            match self.stream(&subscription, &mut shutdown_rx).await {
                Inbound::Resubscribe {
                    token: next_token,
                    last_seen: next_seen,
                } => {
                    token = next_token;
                    last_seen = next_seen;
                }
                Inbound::Continue | Inbound::Close => return,
            }
        }
    }

    /// Authenticate, subscribe and send the replay or snapshot.
    async fn open(&mut self, token: &str, last_seen: Option<u64>) -> Option<Subscription> {
        let session = match self.guard.authorize(token, RouteKind::Onboarding).await {
            Ok(s) => s,
            Err(e) => {
                let kind = e.kind();
                self.fail(kind, &client_message(&e)).await;
                return None;
            }
        };

        let (subscription, start) = self.guard.subscribe(&session.user_id, last_seen).await;
        let ok = match start {
            StreamStart::Replay(events) => {
                debug!(client_id = self.client_id, user_id = %session.user_id, events = events.len(), "Replaying events");
                let mut ok = true;
                for event in &events {
                    if !self.send(event_frame(event)).await {
                        ok = false;
                        break;
                    }
                }
                ok
            }
            StreamStart::Snapshot(snapshot) => self.send(snapshot_frame(&snapshot)).await,
        };
        if ok {
            Some(subscription)
        } else {
            None
        }
    }

    async fn stream(
        &mut self,
        subscription: &Subscription,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Inbound {
        loop {
            tokio::select! {
                delivery = subscription.recv() => {
                    let msg = match delivery {
                        Some(Delivery::Event(event)) => event_frame(&event),
                        Some(Delivery::Heartbeat { latest_seq }) => heartbeat_frame(latest_seq),
                        Some(Delivery::ResyncRequired { .. }) => {
                            let snapshot = self.guard.resync(subscription).await;
                            snapshot_frame(&snapshot)
                        }
                        None => {
                            info!(client_id = self.client_id, user_id = %subscription.user_id(), "Observer released, closing connection");
                            let _ = self.ws_tx.send(Message::Close(None)).await;
                            return Inbound::Close;
                        }
                    };
                    if !self.send(msg).await {
                        return Inbound::Close;
                    }
                }
                msg_result = self.ws_rx.next() => {
                    match self.handle_inbound(msg_result, subscription).await {
                        Inbound::Continue => {}
                        other => return other,
                    }
                }
                _ = shutdown_rx.recv() => {
                    let _ = self.ws_tx.send(Message::Close(None)).await;
                    return Inbound::Close;
                }
            }
        }
    }

    async fn handle_inbound(
        &mut self,
        msg_result: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        subscription: &Subscription,
    ) -> Inbound {
        match msg_result {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::HeartbeatAck) => {
                    subscription.ack_heartbeat();
                    Inbound::Continue
                }
                Ok(ClientFrame::Subscribe {
                    token,
                    last_seen_seq,
                }) => Inbound::Resubscribe {
                    token,
                    last_seen: last_seen_seq,
                },
                Err(e) => {
                    debug!(client_id = self.client_id, error = %e, "Ignoring malformed client frame");
                    Inbound::Continue
                }
            },
            Some(Ok(Message::Ping(data))) => {
                if self.ws_tx.send(Message::Pong(data)).await.is_err() {
                    return Inbound::Close;
                }
                Inbound::Continue
            }
            Some(Ok(Message::Close(_))) | None => Inbound::Close,
            Some(Err(e)) => {
                debug!(client_id = self.client_id, error = %e, "WebSocket error");
                Inbound::Close
            }
            Some(Ok(_)) => Inbound::Continue,
        }
    }

    /// Next parsed client frame, skipping control frames. `None` on close.
    async fn next_client_frame(&mut self) -> Option<ClientFrame> {
        while let Some(msg) = self.ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                Ok(Message::Ping(data)) => {
                    let _ = self.ws_tx.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    }
}

fn client_message(e: &GuardError) -> String {
    match e.kind() {
        ErrorKind::Auth => "invalid or expired session".to_string(),
        _ => e.to_string(),
    }
}
