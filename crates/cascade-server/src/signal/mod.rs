//! The signaling endpoint: WebSocket upgrade per session, JSON-RPC
//! dispatch per peer, and the reverse-proxy path for sessions owned by
//! another node.

mod proxy;
pub mod rpc;

use crate::auth::validate_token;
use crate::config::SignalConfig;
use crate::coordinator::Coordinator;
use crate::error::SignalError;
use crate::metrics::Metrics;
use crate::sfu::{
    Broadcast, Peer, PeerEvent, Session, SessionProvider, WebRtcTransport, BROADCAST_QUEUE,
};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use cascade_protocol::{Join, Negotiation, SessionId, Trickle};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

pub struct SignalServer {
    coordinator: Arc<dyn Coordinator>,
    config: SignalConfig,
    metrics: Arc<Metrics>,
    draining: AtomicBool,
}

/// Hands the coordinator to peers under the narrower capability the sfu
/// layer needs, keeping variant types out of it entirely.
struct ProviderAdapter(Arc<dyn Coordinator>);

#[async_trait]
impl SessionProvider for ProviderAdapter {
    async fn get_session(
        &self,
        sid: &SessionId,
    ) -> (Arc<Session>, Arc<WebRtcTransport>) {
        self.0.get_session(sid).await
    }
}

impl SignalServer {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        config: SignalConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            config,
            metrics,
            draining: AtomicBool::new(false),
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Once draining, new session upgrades are refused while liveness
    /// stays green for the balancer.
    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    pub fn router(server: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(|| async { "OK" }))
            .route("/metrics", get(metrics_handler))
            .route("/session/{id}", get(session_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(server.clone())
    }
}

async fn metrics_handler(State(server): State<Arc<SignalServer>>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        server.metrics.encode(),
    )
        .into_response()
}

async fn session_handler(
    State(server): State<Arc<SignalServer>>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if server.draining.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
    }

    if server.config.auth.enabled {
        let token = query.get("access_token").map(String::as_str).unwrap_or("");
        if let Err(err) = validate_token(&server.config.auth, token, &id) {
            tracing::warn!(session_id = %id, "rejecting upgrade: {err}");
            return (StatusCode::FORBIDDEN, "invalid token").into_response();
        }
    }

    let sid = SessionId::from(id);
    let meta = match server.coordinator.get_or_create_session(&sid).await {
        Ok(meta) => meta,
        Err(err) => {
            tracing::error!(session_id = %sid, "coordinator error: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    if meta.redirect {
        // The client stays connected to us; we splice to the owner.
        let url = format!("{}/session/{}", meta.node_endpoint, sid);
        let metrics = server.metrics.clone();
        return ws.on_upgrade(move |socket| proxy::run(socket, url, metrics));
    }

    ws.on_upgrade(move |socket| handle_peer(socket, server, sid))
}

async fn handle_peer(socket: WebSocket, server: Arc<SignalServer>, sid: SessionId) {
    server.metrics.clients.inc();
    tracing::info!(session_id = %sid, "peer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<PeerEvent>();
    let (bcast_tx, mut bcast_rx) = mpsc::channel::<Broadcast>(BROADCAST_QUEUE);

    let provider = Arc::new(ProviderAdapter(server.coordinator.clone()));
    let peer = Peer::new(provider, events_tx);

    let conn = PeerConnection {
        server: server.clone(),
        peer: peer.clone(),
        out_tx: out_tx.clone(),
        bcast_tx,
    };

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match rpc::RpcRequest::parse(text.as_str()) {
                            Ok(req) => conn.dispatch(req).await,
                            Err(err) => {
                                tracing::warn!(session_id = %sid, "unparseable rpc: {err}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(session_id = %sid, "websocket read: {err}");
                        break;
                    }
                }
            }
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    PeerEvent::Offer(desc) => {
                        conn.notify("offer", &desc);
                    }
                    PeerEvent::IceCandidate(candidate, target) => {
                        conn.notify("trickle", &Trickle { target, candidate });
                    }
                    PeerEvent::IceRestartNeeded => peer.restart_ice(),
                    PeerEvent::IceFailure => {
                        tracing::info!(session_id = %sid, "peer ice failed/closed, closing peer and websocket");
                        break;
                    }
                }
            }
            broadcast = bcast_rx.recv() => {
                let Some(broadcast) = broadcast else { break };
                conn.notify(&broadcast.method, &broadcast.params);
            }
        }
    }

    if let (Some(session), Some(peer_id)) = (peer.session(), peer.id()) {
        session.remove_broadcast_listener(peer_id);
        session.update_presence(peer_id.as_str(), None);
    }
    peer.close().await;
    writer.abort();
    server.metrics.clients.dec();
    tracing::info!(session_id = %sid, "peer disconnected");
}

struct PeerConnection {
    server: Arc<SignalServer>,
    peer: Arc<Peer>,
    out_tx: mpsc::UnboundedSender<String>,
    bcast_tx: mpsc::Sender<Broadcast>,
}

impl PeerConnection {
    fn reply<T: serde::Serialize>(&self, id: &Value, result: &T) {
        let _ = self.out_tx.send(rpc::response(id, result));
    }

    fn reply_error(&self, id: &Value, code: i64, message: &str) {
        let _ = self.out_tx.send(rpc::error_response(id, code, message));
    }

    fn notify<T: serde::Serialize>(&self, method: &str, params: &T) {
        let _ = self.out_tx.send(rpc::notification(method, params));
    }

    /// One request at a time per peer: replies leave in arrival order and
    /// state transitions never interleave.
    async fn dispatch(&self, req: rpc::RpcRequest) {
        let id = req.id.clone().unwrap_or(Value::Null);
        let params = req.params.clone().unwrap_or(Value::Null);

        let result: Result<(), SignalError> = match req.method.as_str() {
            "join" => self.handle_join(&id, params).await,
            "offer" => self.handle_offer(&id, params).await,
            "answer" => self.handle_answer(&id, params).await,
            "trickle" => self.handle_trickle(params).await,
            "presence_set" => self.handle_presence_set(params),
            "ping" => {
                self.reply(&id, &"pong");
                Ok(())
            }
            other => {
                if !req.is_notification() {
                    self.reply_error(&id, rpc::METHOD_NOT_FOUND, &format!("unknown method {other}"));
                }
                Ok(())
            }
        };

        if let Err(err) = result {
            tracing::warn!(method = %req.method, "request failed: {err}");
            if !req.is_notification() {
                self.reply_error(&id, cascade_protocol::ERROR_CODE_INTERNAL, &err.to_string());
            }
        }
    }

    async fn handle_join(&self, id: &Value, params: Value) -> Result<(), SignalError> {
        let join: Join = serde_json::from_value(params)?;

        let meta = self
            .server
            .coordinator
            .get_or_create_session(&join.sid)
            .await?;
        if meta.redirect {
            // Ownership moved between upgrade and join: tell the client
            // where to reconnect.
            let payload = serde_json::to_string(&meta)?;
            self.reply_error(id, cascade_protocol::ERROR_CODE_REDIRECT, &payload);
            return Ok(());
        }

        self.peer.clone().join(join.sid, join.uid).await?;
        let answer = self.peer.answer_publisher(join.offer).await?;

        if let (Some(session), Some(peer_id)) = (self.peer.session(), self.peer.id()) {
            session.add_broadcast_listener(peer_id.clone(), self.bcast_tx.clone());
        }

        self.reply(id, &answer);
        Ok(())
    }

    async fn handle_offer(&self, id: &Value, params: Value) -> Result<(), SignalError> {
        let negotiation: Negotiation = serde_json::from_value(params)?;
        let answer = self.peer.answer_publisher(negotiation.desc).await?;
        self.reply(id, &answer);
        Ok(())
    }

    async fn handle_answer(&self, id: &Value, params: Value) -> Result<(), SignalError> {
        let negotiation: Negotiation = serde_json::from_value(params)?;
        self.peer.set_remote_answer(negotiation.desc).await?;
        self.reply(id, &serde_json::json!({}));
        Ok(())
    }

    async fn handle_trickle(&self, params: Value) -> Result<(), SignalError> {
        let trickle: Trickle = serde_json::from_value(params)?;
        self.peer.trickle(trickle.candidate, trickle.target).await?;
        Ok(())
    }

    /// The params object is the peer's presence meta verbatim.
    fn handle_presence_set(&self, params: Value) -> Result<(), SignalError> {
        let session = self.peer.session().ok_or(SignalError::NotJoined)?;
        let peer_id = self.peer.id().ok_or(SignalError::NotJoined)?;
        let meta = if params.is_null() { None } else { Some(params) };
        session.update_presence(peer_id.as_str(), meta);
        Ok(())
    }
}
