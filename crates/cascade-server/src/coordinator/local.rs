//! Single-node coordinator: every session is owned by this node and no
//! redirect ever happens.

use super::Coordinator;
use crate::error::CoordinatorError;
use crate::sfu::{Session, SessionProvider, SessionRegistry, WebRtcTransport};
use async_trait::async_trait;
use cascade_protocol::{NodeId, SessionId, SessionMeta};
use std::sync::Arc;

pub struct LocalCoordinator {
    node_id: NodeId,
    node_endpoint: String,
    registry: Arc<SessionRegistry>,
}

impl LocalCoordinator {
    pub fn new(node_endpoint: String, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            node_id: NodeId(uuid::Uuid::new_v4().to_string()),
            node_endpoint,
            registry,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

#[async_trait]
impl SessionProvider for LocalCoordinator {
    async fn get_session(&self, sid: &SessionId) -> (Arc<Session>, Arc<WebRtcTransport>) {
        let sid_owned = sid.clone();
        let session = self
            .registry
            .ensure(sid, move || {
                tracing::debug!(session_id = %sid_owned, "local session closed");
            })
            .await;
        (session, self.registry.transport())
    }
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    async fn get_or_create_session(
        &self,
        sid: &SessionId,
    ) -> Result<SessionMeta, CoordinatorError> {
        Ok(SessionMeta {
            session_id: sid.clone(),
            node_id: self.node_id.clone(),
            node_endpoint: self.node_endpoint.clone(),
            redirect: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::metrics::Metrics;

    fn coordinator() -> Arc<LocalCoordinator> {
        let transport =
            Arc::new(WebRtcTransport::new(&SfuConfig::default()).expect("transport"));
        let registry = SessionRegistry::new(transport, Arc::new(Metrics::new().unwrap()));
        LocalCoordinator::new("ws://localhost:7000".to_owned(), registry)
    }

    #[tokio::test]
    async fn always_owns_and_never_redirects() {
        let c = coordinator();
        let meta = c.get_or_create_session(&SessionId::from("room-1")).await.unwrap();
        assert!(!meta.redirect);
        assert_eq!(&meta.node_id, c.node_id());
        assert_eq!(meta.node_endpoint, "ws://localhost:7000");
    }

    #[tokio::test]
    async fn concurrent_calls_agree_on_owner() {
        let c = coordinator();
        let sid = SessionId::from("room-2");
        let metas = futures_util::future::join_all(
            (0..8).map(|_| c.get_or_create_session(&sid)),
        )
        .await;
        let first = metas[0].as_ref().unwrap().node_id.clone();
        for meta in metas {
            assert_eq!(meta.unwrap().node_id, first);
        }
    }

    #[tokio::test]
    async fn get_session_is_idempotent() {
        let c = coordinator();
        let sid = SessionId::from("room-3");
        let (a, _) = c.get_session(&sid).await;
        let (b, _) = c.get_session(&sid).await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
