//! WebSocket Hub (C7): connection registry, protocol state, delivery,
//! heartbeat.
//!
//! Kept from the prior per-connection handler: one socket split into a
//! shared `Arc<Mutex<SplitSink>>`, four tasks per connection
//! (recv/send/heartbeat, plus the cancellation token that ties them
//! together), `tokio::select!` tearing the whole connection down the moment
//! any one task exits. What changed is the wire format (JSON envelopes
//! instead of DAG-CBOR), the authentication step (bearer JWT instead of a
//! subscription ticket), and the addition of a genuine heartbeat pong check
//! — the previous version only ever sent pings and never looked for the
//! reply.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actors::{ActorRegistry, ConvoMessage};
use crate::auth::Authenticator;
use crate::config::{DropPolicy, WsConfig};
use crate::crypto::redact_for_log;
use crate::db::DbPool;
use crate::middleware::rate_limit::{RateLimiter, Scope};
use crate::models::{DeliveryEnvelope, Identity, ResumeSnapshot};
use crate::pipeline::consumer::{Broadcaster, BroadcastOutcome};
use crate::resume::{generate_resume_token, ResumeStore};

use super::protocol::{parse_client_frame, AckStatus, ClientFrame, CloseCode, ParseError, ServerFrame};

/// Pure predicate over `(connectionIdentity, aggregateId)`; supplied by
/// whatever owns conversation membership, which this crate treats as an
/// external collaborator.
pub type AccessPolicy = Arc<dyn Fn(&Identity, &str) -> bool + Send + Sync>;

struct OutboundQueue {
    inner: Mutex<VecDeque<ServerFrame>>,
    notify: Notify,
    capacity: usize,
    policy: DropPolicy,
    buffered_bytes: AtomicUsize,
}

fn frame_size(frame: &ServerFrame) -> usize {
    serde_json::to_vec(frame).map(|b| b.len()).unwrap_or(0)
}

impl OutboundQueue {
    fn new(capacity: usize, policy: DropPolicy) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            notify: Notify::new(),
            capacity,
            policy,
            buffered_bytes: AtomicUsize::new(0),
        }
    }

    async fn push(&self, frame: ServerFrame) {
        let size = frame_size(&frame);
        let mut guard = self.inner.lock().await;
        if guard.len() >= self.capacity {
            match self.policy {
                DropPolicy::DropOld => {
                    if let Some(dropped) = guard.pop_front() {
                        self.buffered_bytes.fetch_sub(frame_size(&dropped), Ordering::Relaxed);
                    }
                }
                DropPolicy::DropNew => return,
            }
        }
        guard.push_back(frame);
        self.buffered_bytes.fetch_add(size, Ordering::Relaxed);
        drop(guard);
        self.notify.notify_one();
    }

    async fn pop(&self) -> ServerFrame {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if let Some(frame) = guard.pop_front() {
                    self.buffered_bytes.fetch_sub(frame_size(&frame), Ordering::Relaxed);
                    return frame;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }
}

/// Per-connection state, owned by the Hub's registry and shared by `Arc`
/// with the connection's own tasks.
pub struct ConnectionHandle {
    client_id: String,
    pub identity: Identity,
    last_server_seq: AtomicU64,
    queue: Arc<OutboundQueue>,
    /// Last few envelopes actually enqueued, independent of the wire-level
    /// queue (which also carries acks/pongs) — this is what gets handed
    /// back to the client as `pendingTail` on resume.
    pending_tail: Mutex<VecDeque<DeliveryEnvelope>>,
    close: CancellationToken,
    requested_close: StdMutex<Option<CloseCode>>,
}

impl ConnectionHandle {
    fn bump_seq(&self) -> u64 {
        self.last_server_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_seq(&self) -> u64 {
        self.last_server_seq.load(Ordering::SeqCst)
    }

    async fn enqueue_envelope(&self, envelope: DeliveryEnvelope, tail_capacity: usize) {
        let seq = self.bump_seq();
        {
            let mut tail = self.pending_tail.lock().await;
            if tail.len() >= tail_capacity {
                tail.pop_front();
            }
            tail.push_back(envelope.clone());
        }
        let payload = serde_json::json!({
            "conversationId": envelope.conversation_id,
            "messageId": envelope.message_id,
            "payload": envelope.payload,
        });
        self.queue.push(ServerFrame::Msg { payload, seq }).await;
    }

    fn request_close(&self, code: CloseCode) {
        *self.requested_close.lock().unwrap() = Some(code);
        self.close.cancel();
    }
}

#[derive(Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "resumeToken")]
    pub resume_token: Option<String>,
}

#[derive(Clone)]
pub struct HubState {
    pub hub: Arc<Hub>,
    pub authenticator: Arc<Authenticator>,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<HubState>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        state
            .hub
            .handle_socket(socket, headers, state.authenticator.clone(), query.resume_token)
            .await;
    })
}

pub struct Hub {
    connections: DashMap<String, Arc<ConnectionHandle>>,
    resume_store: Arc<dyn ResumeStore>,
    rate_limiter: RateLimiter,
    actors: ActorRegistry,
    #[allow(dead_code)]
    db_pool: DbPool,
    config: WsConfig,
    access_policy: AccessPolicy,
}

impl Hub {
    pub fn new(
        resume_store: Arc<dyn ResumeStore>,
        rate_limiter: RateLimiter,
        actors: ActorRegistry,
        db_pool: DbPool,
        config: WsConfig,
        access_policy: AccessPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            resume_store,
            rate_limiter,
            actors,
            db_pool,
            config,
            access_policy,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Force-closes every live connection. Each close runs through the same
    /// per-connection teardown in `handle_socket` that a normal disconnect
    /// does, which persists that connection's resume snapshot — so shutdown
    /// doesn't drop any pending tail, it just triggers the same path early.
    pub fn shutdown_all(&self) {
        for entry in self.connections.iter() {
            entry.value().request_close(CloseCode::InternalError);
        }
    }

    async fn handle_socket(
        self: Arc<Self>,
        socket: WebSocket,
        headers: HeaderMap,
        authenticator: Arc<Authenticator>,
        resume_token: Option<String>,
    ) {
        let (sender, mut receiver) = socket.split();
        let sender = Arc::new(Mutex::new(sender));

        if !self.rate_limiter.consume(Scope::Global, "ws-connect", 1).allowed {
            let _ = close_with(&mut *sender.lock().await, CloseCode::Overloaded).await;
            return;
        }

        let identity = match authenticator.authenticate(&headers).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "websocket authentication failed");
                let _ = close_with(&mut *sender.lock().await, CloseCode::Unauthorized).await;
                return;
            }
        };

        if !self
            .rate_limiter
            .consume(Scope::Device, &identity.device_id, 1)
            .allowed
        {
            let _ = close_with(&mut *sender.lock().await, CloseCode::Overloaded).await;
            return;
        }

        let client_id = format!("{}:{}", identity.account_id, identity.device_id);
        let (resume_reply_token, last_seq, replay) = self.resolve_resume(resume_token.as_deref()).await;

        let queue = Arc::new(OutboundQueue::new(self.config.max_queue, self.config.drop_policy));
        let close = CancellationToken::new();
        let handle = Arc::new(ConnectionHandle {
            client_id: client_id.clone(),
            identity: identity.clone(),
            last_server_seq: AtomicU64::new(last_seq),
            queue: queue.clone(),
            pending_tail: Mutex::new(VecDeque::with_capacity(self.config.max_queue.min(256))),
            close: close.clone(),
            requested_close: StdMutex::new(None),
        });

        if let Some((_, previous)) = self.connections.remove(&client_id) {
            debug!(client_id = %redact_for_log(&client_id), "replacing existing connection for client");
            previous.request_close(CloseCode::InternalError);
        }
        self.connections.insert(client_id.clone(), handle.clone());
        metrics::gauge!("hub_connections_active", self.connections.len() as f64);

        for envelope in replay {
            handle.enqueue_envelope(envelope, self.config.max_queue).await;
        }

        {
            let mut guard = sender.lock().await;
            let ack = ServerFrame::ConnectionAck {
                resume_token: resume_reply_token.clone(),
            };
            let _ = send_frame(&mut guard, &ack).await;
        }

        let last_pong = Arc::new(Mutex::new(Instant::now()));

        let send_task = {
            let sender = sender.clone();
            let queue = queue.clone();
            let close = close.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = queue.pop() => {
                            let mut guard = sender.lock().await;
                            if send_frame(&mut guard, &frame).await.is_err() {
                                break;
                            }
                        }
                        _ = close.cancelled() => {
                            let code = handle.requested_close.lock().unwrap().take().unwrap_or(CloseCode::InternalError);
                            let mut guard = sender.lock().await;
                            let _ = close_with(&mut guard, code).await;
                            break;
                        }
                    }
                }
            })
        };

        let heartbeat_task = {
            let sender = sender.clone();
            let close = close.clone();
            let handle = handle.clone();
            let last_pong = last_pong.clone();
            let interval_dur = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(interval_dur);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let ping_ok = {
                                let mut guard = sender.lock().await;
                                guard.send(Message::Ping(Vec::new().into())).await.is_ok()
                            };
                            if !ping_ok {
                                handle.request_close(CloseCode::InternalError);
                                break;
                            }
                            if last_pong.lock().await.elapsed() > interval_dur * 2 {
                                warn!(client_id = %redact_for_log(&handle.client_id), "heartbeat timeout, closing connection");
                                handle.request_close(CloseCode::HeartbeatTimeout);
                                break;
                            }
                        }
                        _ = close.cancelled() => break,
                    }
                }
            })
        };

        let recv_task = {
            let hub = self.clone();
            let handle = handle.clone();
            let queue = queue.clone();
            let close = close.clone();
            let last_pong = last_pong.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = receiver.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    metrics::counter!("hub_frames_in_total", 1);
                                    hub.on_text_frame(&handle, &text, &queue).await;
                                }
                                Some(Ok(Message::Pong(_))) => {
                                    *last_pong.lock().await = Instant::now();
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    debug!(error = %e, client_id = %redact_for_log(&handle.client_id), "websocket recv error");
                                    break;
                                }
                            }
                        }
                        _ = close.cancelled() => break,
                    }
                }
            })
        };

        let mut send_task = send_task;
        let mut heartbeat_task = heartbeat_task;
        let mut recv_task = recv_task;
        tokio::select! {
            _ = &mut send_task => { recv_task.abort(); heartbeat_task.abort(); }
            _ = &mut recv_task => { send_task.abort(); heartbeat_task.abort(); }
            _ = &mut heartbeat_task => { send_task.abort(); recv_task.abort(); }
        }
        close.cancel();

        self.connections.remove(&client_id);
        metrics::gauge!("hub_connections_active", self.connections.len() as f64);

        let pending_tail: Vec<DeliveryEnvelope> = handle.pending_tail.lock().await.iter().cloned().collect();
        let snapshot = ResumeSnapshot {
            account_id: identity.account_id.clone(),
            device_id: identity.device_id.clone(),
            last_server_seq: handle.current_seq(),
            pending_tail,
        };
        self.resume_store.persist(&resume_reply_token, snapshot).await;

        info!(client_id = %redact_for_log(&client_id), "websocket connection closed");
    }

    async fn on_text_frame(&self, handle: &ConnectionHandle, text: &str, queue: &OutboundQueue) {
        match parse_client_frame(text, self.config.message_max_bytes) {
            Ok(ClientFrame::Ping) => queue.push(ServerFrame::Pong).await,
            Ok(ClientFrame::Resume {
                resume_token,
                last_client_seq: _,
            }) => self.handle_resume_frame(handle, queue, &resume_token).await,
            Ok(ClientFrame::Msg { id, payload, size: _ }) => {
                self.handle_msg_frame(handle, queue, id, payload).await
            }
            Err(ParseError::TooLarge) => handle.request_close(CloseCode::MessageTooLarge),
            Err(ParseError::Malformed(reason)) => {
                warn!(client_id = %redact_for_log(&handle.client_id), reason = %reason, "malformed inbound frame");
                handle.request_close(CloseCode::ProtocolError);
            }
        }
    }

    async fn handle_resume_frame(&self, handle: &ConnectionHandle, queue: &OutboundQueue, resume_token: &str) {
        match self.resume_store.load(resume_token).await {
            Some(snapshot) => {
                self.resume_store.drop_token(resume_token).await;
                for envelope in snapshot.pending_tail {
                    handle.enqueue_envelope(envelope, self.config.max_queue).await;
                }
            }
            None => {
                queue
                    .push(ServerFrame::ResumeFailed {
                        reason: "unknown or expired resume token".into(),
                    })
                    .await;
            }
        }
    }

    async fn handle_msg_frame(
        &self,
        handle: &ConnectionHandle,
        queue: &OutboundQueue,
        id: Uuid,
        payload: serde_json::Value,
    ) {
        let check = self.rate_limiter.check_all(&[
            (Scope::Session, handle.identity.session_id.as_str()),
            (Scope::User, handle.identity.account_id.as_str()),
        ]);
        if !check.allowed {
            queue
                .push(ServerFrame::Ack {
                    id,
                    status: AckStatus::Rejected,
                    seq: handle.current_seq(),
                })
                .await;
            handle.request_close(CloseCode::Overloaded);
            return;
        }

        let conversation_id = match payload.get("conversationId").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => {
                queue
                    .push(ServerFrame::Error {
                        code: "validation_error".into(),
                        message: "msg frame missing conversationId".into(),
                    })
                    .await;
                return;
            }
        };

        let ciphertext_b64 = payload.get("ciphertext").and_then(|v| v.as_str()).unwrap_or_default();
        let encrypted_content = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, ciphertext_b64)
            .unwrap_or_default();

        let actor_ref = match self.actors.get_or_spawn(&conversation_id).await {
            Ok(actor_ref) => actor_ref,
            Err(e) => {
                warn!(error = %e, "failed to obtain conversation actor");
                queue
                    .push(ServerFrame::Ack {
                        id,
                        status: AckStatus::Rejected,
                        seq: handle.current_seq(),
                    })
                    .await;
                return;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = actor_ref.cast(ConvoMessage::SendMessage {
            sender_id: handle.identity.account_id.clone(),
            kind: "message".into(),
            encrypted_content,
            metadata: None,
            event_type: "message.sent".into(),
            dedupe_key: Some(id.to_string()),
            reply: reply_tx,
        });

        if sent.is_err() {
            queue
                .push(ServerFrame::Ack {
                    id,
                    status: AckStatus::Rejected,
                    seq: handle.current_seq(),
                })
                .await;
            return;
        }

        let status = match reply_rx.await {
            Ok(Ok(_)) => AckStatus::Accepted,
            _ => AckStatus::Rejected,
        };
        queue
            .push(ServerFrame::Ack {
                id,
                status,
                seq: handle.current_seq(),
            })
            .await;
    }

    async fn resolve_resume(&self, resume_token: Option<&str>) -> (String, u64, Vec<DeliveryEnvelope>) {
        if let Some(token) = resume_token {
            if let Some(snapshot) = self.resume_store.load(token).await {
                self.resume_store.drop_token(token).await;
                return (generate_resume_token(), snapshot.last_server_seq, snapshot.pending_tail);
            }
        }
        (generate_resume_token(), 0, Vec::new())
    }
}

#[async_trait::async_trait]
impl Broadcaster for Hub {
    /// Delivers to every connection matching `partition_key`'s access
    /// policy. A connection whose backlog is already at capacity (frame
    /// count or buffered bytes) is closed rather than enqueued into further;
    /// if enough of the matched connections are in that state, the whole
    /// broadcast is reported `Overloaded` so the consumer backs off instead
    /// of acking a delivery most subscribers never got.
    async fn broadcast(&self, partition_key: &str, envelope: DeliveryEnvelope) -> BroadcastOutcome {
        let mut matched = 0usize;
        let mut overloaded = 0usize;

        for entry in self.connections.iter() {
            let handle = entry.value();
            if !(self.access_policy)(&handle.identity, partition_key) {
                continue;
            }
            matched += 1;

            let queue_len = handle.queue.len().await;
            let buffered_bytes = handle.queue.buffered_bytes();
            if queue_len >= self.config.max_queue || buffered_bytes > self.config.max_buffered_bytes {
                overloaded += 1;
                warn!(client_id = %redact_for_log(&handle.client_id), "connection backlog full, closing overloaded");
                handle.request_close(CloseCode::Overloaded);
                continue;
            }
            handle.enqueue_envelope(envelope.clone(), self.config.max_queue).await;
        }

        if matched > 0 && (overloaded as f64 / matched as f64) >= self.config.backpressure_fraction {
            BroadcastOutcome::Overloaded
        } else {
            BroadcastOutcome::Delivered
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    let result = sink.send(Message::Text(text.into())).await;
    if result.is_ok() {
        metrics::counter!("hub_frames_out_total", 1);
    }
    result
}

async fn close_with(sink: &mut SplitSink<WebSocket, Message>, code: CloseCode) -> Result<(), axum::Error> {
    metrics::counter!("hub_close_total", "code" => code.code().to_string());
    sink.send(Message::Close(Some(CloseFrame {
        code: code.code(),
        reason: code.reason().into(),
    })))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_wire_values_match_spec() {
        assert_eq!(CloseCode::ProtocolError.code(), 1002);
        assert_eq!(CloseCode::MessageTooLarge.code(), 1009);
        assert_eq!(CloseCode::HeartbeatTimeout.code(), 1011);
        assert_eq!(CloseCode::Overloaded.code(), 1013);
        assert_eq!(CloseCode::Unauthorized.code(), 4401);
    }
}
