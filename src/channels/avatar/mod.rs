//! Avatar presentation channel.
//!
//! Runs an embedded WebSocket server that browser avatar clients connect to.
//! Agent replies are parsed for an emotion tag, queued, and broadcast to
//! every connected client; delivery is paced by the client-originated
//! `tts_complete` signal so the avatar finishes speaking one reply before
//! the next arrives.
//!
//! ```text
//! Agent ── Send ──► send_queue ── send_worker ──► clients (broadcast)
//!                                     ▲                   │
//!                                     └── tts_complete ◄──┘
//! ```

pub mod emotion;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, OutboundMessage};
use crate::channels::{Channel, ChannelCore};
use crate::config::AvatarConfig;
use crate::error::ChannelError;

use self::emotion::parse_emotion;

const CHANNEL_NAME: &str = "aituber";
const TTS_WAIT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server-to-client wire payload.
#[derive(Debug, Clone, Serialize)]
struct WirePayload {
    text: String,
    role: &'static str,
    emotion: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Client-to-server frame. Only `{"type":"tts_complete"}` is recognized.
#[derive(Debug, Deserialize)]
struct ClientEvent {
    #[serde(rename = "type", default)]
    kind: String,
}

struct ServerControl {
    token: Option<CancellationToken>,
    server: Option<JoinHandle<()>>,
    bound_addr: Option<SocketAddr>,
}

struct AvatarShared {
    core: ChannelCore,
    config: AvatarConfig,
    clients: RwLock<HashMap<u64, SplitSink<WebSocket, Message>>>,
    next_client_id: AtomicU64,
    /// Bounded outbound queue; overflow drops the oldest entry.
    queue: StdMutex<VecDeque<WirePayload>>,
    queue_notify: Notify,
    client_notify: Notify,
    /// Paces the send worker; coalescing.
    tts_done: Notify,
    /// Same event, exposed to the ingestion accumulator. A separate notify
    /// so the two consumers never race for one permit.
    tts_ready: Arc<Notify>,
    control: StdMutex<ServerControl>,
}

pub struct AvatarChannel {
    shared: Arc<AvatarShared>,
}

impl AvatarChannel {
    pub fn new(config: AvatarConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            shared: Arc::new(AvatarShared {
                core: ChannelCore::new(CHANNEL_NAME, bus, Vec::new()),
                config,
                clients: RwLock::new(HashMap::new()),
                next_client_id: AtomicU64::new(1),
                queue: StdMutex::new(VecDeque::new()),
                queue_notify: Notify::new(),
                client_notify: Notify::new(),
                tts_done: Notify::new(),
                tts_ready: Arc::new(Notify::new()),
                control: StdMutex::new(ServerControl {
                    token: None,
                    server: None,
                    bound_addr: None,
                }),
            }),
        }
    }

    /// Signal fired on every `tts_complete` frame, for wiring into the
    /// ingestion channel's accumulation loop.
    pub fn tts_ready_signal(&self) -> Arc<Notify> {
        self.shared.tts_ready.clone()
    }

    /// The address the server actually bound (useful with port 0).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.shared.control.lock().expect("control lock poisoned").bound_addr
    }
}

#[async_trait]
impl Channel for AvatarChannel {
    fn name(&self) -> &str {
        self.shared.core.name()
    }

    async fn start(&self, ctx: &CancellationToken) -> Result<(), ChannelError> {
        let shared = self.shared.clone();
        let token = ctx.child_token();

        let addr = format!("{}:{}", shared.config.ws_host, shared.config.ws_port);
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            ChannelError::StartupFailed {
                name: CHANNEL_NAME.to_string(),
                reason: format!("failed to bind to {addr}: {e}"),
            }
        })?;
        let bound_addr = listener
            .local_addr()
            .map_err(|e| ChannelError::StartupFailed {
                name: CHANNEL_NAME.to_string(),
                reason: format!("failed to get local addr: {e}"),
            })?;

        let app = Router::new()
            .route(&shared.config.ws_path, get(ws_handler))
            .route("/health/aituber", get(health_handler))
            .with_state(shared.clone());

        let server = {
            let token = token.clone();
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await
                {
                    tracing::error!(error = %e, "avatar server error");
                }
            })
        };

        tokio::spawn(shared.clone().send_worker(token.clone()));

        {
            let mut control = shared.control.lock().expect("control lock poisoned");
            control.token = Some(token);
            control.server = Some(server);
            control.bound_addr = Some(bound_addr);
        }
        shared.core.set_running(true);
        tracing::info!(
            address = %bound_addr,
            path = %shared.config.ws_path,
            "avatar channel started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        let (token, server) = {
            let mut control = self.shared.control.lock().expect("control lock poisoned");
            (control.token.take(), control.server.take())
        };
        if let Some(token) = token {
            token.cancel();
        }

        // Close client connections first: graceful shutdown waits for open
        // connections, and browser clients never hang up on their own.
        {
            let mut clients = self.shared.clients.write().await;
            for (_, mut sink) in clients.drain() {
                let _ = sink.close().await;
            }
        }

        if let Some(server) = server {
            if tokio::time::timeout(SHUTDOWN_GRACE, server).await.is_err() {
                tracing::warn!("avatar server did not shut down within grace period");
            }
        }

        self.shared.core.set_running(false);
        tracing::info!("avatar channel stopped");
        Ok(())
    }

    async fn send(&self, msg: OutboundMessage) -> Result<(), ChannelError> {
        let (text, emotion) = parse_emotion(&msg.content, &self.shared.config.default_emotion);
        let payload = WirePayload {
            text,
            role: "assistant",
            emotion,
            kind: "message",
        };

        {
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
            if queue.len() >= self.shared.config.max_queue_size {
                queue.pop_front();
                tracing::warn!("send queue full, dropped oldest message");
            }
            queue.push_back(payload);
        }
        self.shared.queue_notify.notify_one();
        Ok(())
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        self.shared.core.is_allowed(sender_id)
    }
}

async fn ws_handler(
    State(shared): State<Arc<AvatarShared>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // All origins are accepted: the server sits on a trusted LAN.
    ws.on_upgrade(move |socket| shared.client_session(socket))
}

async fn health_handler(State(shared): State<Arc<AvatarShared>>) -> impl IntoResponse {
    let clients = shared.clients.read().await.len();
    Json(serde_json::json!({ "status": "ok", "clients": clients }))
}

impl AvatarShared {
    async fn client_session(self: Arc<Self>, socket: WebSocket) {
        let (sink, mut stream) = socket.split();
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);

        let count = {
            let mut clients = self.clients.write().await;
            clients.insert(id, sink);
            clients.len()
        };
        tracing::info!(total_clients = count, "avatar client connected");
        self.client_notify.notify_one();

        // Read pump: the only meaningful inbound frame is tts_complete.
        while let Some(res) = stream.next().await {
            match res {
                Ok(Message::Text(text)) => {
                    if let Ok(event) = serde_json::from_str::<ClientEvent>(text.as_str()) {
                        if event.kind == "tts_complete" {
                            self.tts_done.notify_one();
                            self.tts_ready.notify_one();
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "avatar client read error");
                    break;
                }
            }
        }

        let count = {
            let mut clients = self.clients.write().await;
            if let Some(mut sink) = clients.remove(&id) {
                let _ = sink.close().await;
            }
            clients.len()
        };
        tracing::info!(total_clients = count, "avatar client disconnected");
    }

    /// Delivery serialization: one broadcast per TTS cycle.
    ///
    /// Dequeuing is gated on a connected client so payloads sent into an
    /// empty room wait in the bounded queue instead of vanishing.
    async fn send_worker(self: Arc<Self>, token: CancellationToken) {
        loop {
            while self.clients.read().await.is_empty() {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = self.client_notify.notified() => {}
                }
            }

            let payload = loop {
                let popped = self
                    .queue
                    .lock()
                    .expect("queue lock poisoned")
                    .pop_front();
                match popped {
                    Some(p) => break p,
                    None => {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = self.queue_notify.notified() => {}
                        }
                    }
                }
            };

            let sent = self.broadcast(&payload).await;
            if sent == 0 {
                continue;
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = self.tts_done.notified() => {}
                _ = tokio::time::sleep(TTS_WAIT) => {
                    tracing::warn!("TTS completion timeout, proceeding");
                }
            }
        }
    }

    /// Broadcast one payload to every client. Failing connections are
    /// removed in the same critical section. Returns the success count.
    async fn broadcast(&self, payload: &WirePayload) -> usize {
        let data = match serde_json::to_string(payload) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize avatar payload");
                return 0;
            }
        };

        let mut clients = self.clients.write().await;
        let mut sent = 0;
        let mut failed = Vec::new();
        for (id, sink) in clients.iter_mut() {
            if sink.send(Message::Text(data.clone().into())).await.is_err() {
                failed.push(*id);
            } else {
                sent += 1;
            }
        }
        for id in failed {
            if let Some(mut sink) = clients.remove(&id) {
                let _ = sink.close().await;
            }
        }
        sent
    }
}
