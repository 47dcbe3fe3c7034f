//! Transparent WebSocket reverse proxy.
//!
//! When a client reaches a node that does not own its session, the node
//! dials the owner and splices frames both ways until either side
//! closes. No peer state exists on the proxying node.

use crate::metrics::Metrics;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TMessage;

pub async fn run(socket: WebSocket, upstream_url: String, metrics: Arc<Metrics>) {
    metrics.proxy_clients.inc();
    if let Err(err) = splice(socket, &upstream_url).await {
        tracing::debug!(upstream = %upstream_url, "proxy ended: {err}");
    }
    metrics.proxy_clients.dec();
}

async fn splice(socket: WebSocket, upstream_url: &str) -> anyhow::Result<()> {
    tracing::info!(upstream = %upstream_url, "proxying session websocket");
    let (upstream, _) = connect_async(upstream_url).await?;

    let (mut client_tx, mut client_rx) = socket.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(msg) = client_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(_) => break,
            };
            let forward = match msg {
                WsMessage::Text(t) => TMessage::text(t.to_string()),
                WsMessage::Binary(b) => TMessage::Binary(b),
                WsMessage::Ping(p) => TMessage::Ping(p),
                WsMessage::Pong(p) => TMessage::Pong(p),
                WsMessage::Close(_) => break,
            };
            if upstream_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.send(TMessage::Close(None)).await;
    };

    let upstream_to_client = async {
        while let Some(msg) = upstream_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(_) => break,
            };
            let forward = match msg {
                TMessage::Text(t) => WsMessage::Text(t.to_string().into()),
                TMessage::Binary(b) => WsMessage::Binary(b),
                TMessage::Ping(p) => WsMessage::Ping(p),
                TMessage::Pong(p) => WsMessage::Pong(p),
                TMessage::Close(_) => break,
                TMessage::Frame(_) => continue,
            };
            if client_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = client_tx.send(WsMessage::Close(None)).await;
    };

    // Either direction ending tears the whole splice down.
    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
    Ok(())
}
