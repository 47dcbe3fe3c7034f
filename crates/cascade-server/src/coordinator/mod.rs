//! Session→node ownership.
//!
//! Two backends share one capability: hand back a [`SessionMeta`] for any
//! session id, creating ownership when nobody holds it. The signal
//! endpoint only ever sees the trait object.

mod etcd;
mod local;

use crate::config::Config;
use crate::error::CoordinatorError;
use crate::metrics::Metrics;
use crate::sfu::{SessionProvider, SessionRegistry};
use async_trait::async_trait;
use cascade_protocol::{SessionId, SessionMeta};
use std::sync::Arc;

pub use etcd::EtcdCoordinator;
pub use local::LocalCoordinator;

#[async_trait]
pub trait Coordinator: SessionProvider {
    /// Resolves (or establishes) ownership for a session and reports
    /// whether the caller should redirect.
    async fn get_or_create_session(
        &self,
        sid: &SessionId,
    ) -> Result<SessionMeta, CoordinatorError>;
}

/// Builds the coordinator variant the config asks for.
pub async fn new(
    conf: &Config,
    registry: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
) -> Result<Arc<dyn Coordinator>, CoordinatorError> {
    if let Some(etcd) = &conf.coordinator.etcd {
        let coordinator =
            EtcdCoordinator::new(etcd, conf.endpoint(), registry, metrics).await?;
        return Ok(coordinator);
    }
    if conf.coordinator.local.is_some() {
        return Ok(LocalCoordinator::new(conf.endpoint(), registry));
    }
    Err(CoordinatorError::NotConfigured)
}
