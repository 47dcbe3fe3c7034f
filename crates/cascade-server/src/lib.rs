//! Cascade node library.
//!
//! Exposes the server components for embedding and integration tests.

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod sfu;
pub mod signal;
pub mod turn;

use crate::metrics::Metrics;
use crate::sfu::{SessionRegistry, WebRtcTransport};
use crate::signal::SignalServer;
use anyhow::Result;
use std::sync::Arc;

/// Builds a fully wired node: transport, registry, coordinator, and the
/// signal router. The caller binds and serves.
pub async fn create_app(conf: config::Config) -> Result<(axum::Router, Arc<SignalServer>)> {
    let metrics = Arc::new(Metrics::new()?);
    let transport = Arc::new(WebRtcTransport::new(&conf.sfu)?);
    let registry = SessionRegistry::new(transport, metrics.clone());
    let coordinator = coordinator::new(&conf, registry, metrics.clone()).await?;
    let server = SignalServer::new(coordinator, conf.signal.clone(), metrics);
    let router = SignalServer::router(&server);
    Ok((router, server))
}
