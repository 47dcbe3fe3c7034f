//! Distributed coordinator over etcd.
//!
//! Ownership is a leased `/session/{sid}` record guarded by etcd's lock
//! primitive. Losing the lease (node crash) frees the session for the
//! next caller; a live local session is never torn down by lease loss.

use super::Coordinator;
use crate::config::EtcdCoordinatorConfig;
use crate::error::CoordinatorError;
use crate::metrics::Metrics;
use crate::sfu::{Session, SessionProvider, SessionRegistry, WebRtcTransport};
use async_trait::async_trait;
use cascade_protocol::{NodeId, NodeRecord, NodeState, SessionId, SessionMeta};
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Bounded wait for the per-session distributed mutex.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// TTL of the lease backing a session record.
const SESSION_LEASE_TTL: i64 = 1;
/// TTL of the lease backing this node's `/node/` record.
const NODE_LEASE_TTL: i64 = 3;
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);
const NODE_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

fn session_key(sid: &SessionId) -> String {
    format!("/session/{sid}")
}

/// The serving node with the lowest session count wins; self wins ties.
/// Draining and unparseable records never receive assignments.
fn pick_least_loaded(
    records: impl Iterator<Item = NodeRecord>,
    self_id: &NodeId,
) -> Option<NodeId> {
    let mut best: Option<NodeRecord> = None;
    for record in records {
        if record.state != NodeState::Serving {
            continue;
        }
        let better = match &best {
            None => true,
            Some(current) => {
                record.session_count < current.session_count
                    || (record.session_count == current.session_count
                        && record.node_id == *self_id
                        && current.node_id != *self_id)
            }
        };
        if better {
            best = Some(record);
        }
    }
    best.map(|r| r.node_id)
}

pub struct EtcdCoordinator {
    node_id: NodeId,
    node_endpoint: String,
    client: Client,
    registry: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
    /// Keepalive task per locally leased session; aborting one lets the
    /// lease expire.
    keepalives: StdMutex<HashMap<SessionId, JoinHandle<()>>>,
    weak_self: Weak<Self>,
}

impl EtcdCoordinator {
    pub async fn new(
        conf: &EtcdCoordinatorConfig,
        node_endpoint: String,
        registry: Arc<SessionRegistry>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, CoordinatorError> {
        tracing::debug!(hosts = ?conf.hosts, "creating etcd client");
        let client = Client::connect(
            &conf.hosts,
            Some(ConnectOptions::new().with_connect_timeout(Duration::from_secs(3))),
        )
        .await?;

        let coordinator = Arc::new_cyclic(|weak| Self {
            node_id: NodeId(uuid::Uuid::new_v4().to_string()),
            node_endpoint,
            client,
            registry,
            metrics,
            keepalives: StdMutex::new(HashMap::new()),
            weak_self: weak.clone(),
        });

        tokio::spawn(Self::publish_node_record(Arc::downgrade(&coordinator)));
        tracing::debug!(node_id = %coordinator.node_id, "created etcd coordinator");
        Ok(coordinator)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Picks the assignment target for a fresh session by consulting the
    /// live `/node/` records.
    async fn pick_node(&self) -> NodeId {
        let mut kv = self.client.kv_client();
        let resp = match kv.get("/node/", Some(GetOptions::new().with_prefix())).await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!("listing node records: {err}");
                return self.node_id.clone();
            }
        };

        let records = resp
            .kvs()
            .iter()
            .filter_map(|kv| serde_json::from_slice::<NodeRecord>(kv.value()).ok());
        pick_least_loaded(records, &self.node_id).unwrap_or_else(|| self.node_id.clone())
    }

    async fn get_or_create_locked(
        &self,
        sid: &SessionId,
    ) -> Result<SessionMeta, CoordinatorError> {
        let key = session_key(sid);
        let mut kv = self.client.kv_client();

        let resp = kv.get(key.as_str(), None).await?;
        if let Some(existing) = resp.kvs().first() {
            let mut meta: SessionMeta = serde_json::from_slice(existing.value())?;
            meta.redirect = meta.node_id != self.node_id;
            if !meta.redirect && !self.holds_lease(sid) {
                // A hand-off hint pointed a session here before we held
                // its lease; adopt it so the record survives.
                self.attach_lease(sid, &meta).await?;
            }
            tracing::debug!(session_id = %sid, node_id = %meta.node_id, redirect = meta.redirect, "found session");
            return Ok(meta);
        }

        let owner = self.pick_node().await;
        if owner != self.node_id {
            // Hand-off: a short-lived record that the chosen node adopts
            // when the proxied client reaches it, or that simply expires.
            let owner_endpoint = self.endpoint_for(&owner).await;
            let meta = SessionMeta {
                session_id: sid.clone(),
                node_id: owner.clone(),
                node_endpoint: owner_endpoint,
                redirect: true,
            };
            let mut lease = self.client.lease_client();
            let granted = lease.grant(SESSION_LEASE_TTL, None).await?;
            kv.put(
                key.as_str(),
                serde_json::to_vec(&meta)?,
                Some(PutOptions::new().with_lease(granted.id())),
            )
            .await?;
            return Ok(meta);
        }

        let meta = SessionMeta {
            session_id: sid.clone(),
            node_id: self.node_id.clone(),
            node_endpoint: self.node_endpoint.clone(),
            redirect: false,
        };
        self.attach_lease(sid, &meta).await?;
        Ok(meta)
    }

    fn holds_lease(&self, sid: &SessionId) -> bool {
        self.keepalives.lock().unwrap().contains_key(sid)
    }

    /// Grants a session lease, waits for the first keepalive ack, writes
    /// the meta under the lease, and records the keepalive cancel handle.
    async fn attach_lease(
        &self,
        sid: &SessionId,
        meta: &SessionMeta,
    ) -> Result<(), CoordinatorError> {
        let mut lease = self.client.lease_client();
        let granted = lease.grant(SESSION_LEASE_TTL, None).await?;
        let lease_id = granted.id();

        let (mut keeper, mut stream) = lease.keep_alive(lease_id).await?;
        keeper.keep_alive().await?;
        stream.message().await?;

        let sid_owned = sid.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(KEEPALIVE_INTERVAL).await;
                if keeper.keep_alive().await.is_err() {
                    tracing::warn!(session_id = %sid_owned, "session lease keepalive lost");
                    return;
                }
                match stream.message().await {
                    Ok(Some(_)) => {}
                    _ => {
                        tracing::warn!(session_id = %sid_owned, "session lease keepalive closed");
                        return;
                    }
                }
            }
        });
        self.keepalives.lock().unwrap().insert(sid.clone(), handle);

        let mut kv = self.client.kv_client();
        kv.put(
            session_key(sid),
            serde_json::to_vec(meta)?,
            Some(PutOptions::new().with_lease(lease_id)),
        )
        .await?;
        Ok(())
    }

    async fn endpoint_for(&self, node: &NodeId) -> String {
        let mut kv = self.client.kv_client();
        if let Ok(resp) = kv.get(format!("/node/{node}"), None).await {
            if let Some(entry) = resp.kvs().first() {
                if let Ok(record) = serde_json::from_slice::<NodeRecord>(entry.value()) {
                    return record.node_endpoint;
                }
            }
        }
        self.node_endpoint.clone()
    }

    /// Cleanup when the local session closes: cancel the keepalive (the
    /// lease expires on its own) and delete the record eagerly.
    async fn on_session_closed(&self, sid: SessionId) {
        let mut lock_client = self.client.lock_client();
        let lock_key = session_key(&sid);
        let lock = match tokio::time::timeout(
            LOCK_TIMEOUT,
            lock_client.lock(lock_key.as_str(), None),
        )
        .await
        {
            Ok(Ok(resp)) => resp.key().to_vec(),
            Ok(Err(err)) => {
                tracing::error!(session_id = %sid, "session close could not lock: {err}");
                return;
            }
            Err(_) => {
                tracing::error!(session_id = %sid, "session close lock timed out");
                return;
            }
        };

        if let Some(handle) = self.keepalives.lock().unwrap().remove(&sid) {
            handle.abort();
        } else {
            tracing::error!(session_id = %sid, "no session lease found on close");
        }

        let mut kv = self.client.kv_client();
        if let Err(err) = kv.delete(session_key(&sid), None).await {
            tracing::error!(session_id = %sid, "deleting session meta: {err}");
        }

        if let Err(err) = lock_client.unlock(lock).await {
            tracing::warn!(session_id = %sid, "unlocking after close: {err}");
        }
        tracing::info!(session_id = %sid, "canceled session lease");
    }

    /// Publishes this node's load record under its own lease, refreshed
    /// every second. Absence of the record excludes the node from
    /// assignment.
    async fn publish_node_record(coordinator: Weak<Self>) {
        loop {
            let Some(this) = coordinator.upgrade() else { return };

            let mut lease = this.client.lease_client();
            let granted = match lease.grant(NODE_LEASE_TTL, None).await {
                Ok(g) => g,
                Err(err) => {
                    tracing::warn!("node record lease grant: {err}");
                    drop(this);
                    tokio::time::sleep(NODE_REFRESH_INTERVAL).await;
                    continue;
                }
            };
            let lease_id = granted.id();
            let Ok((mut keeper, mut stream)) = lease.keep_alive(lease_id).await else {
                drop(this);
                tokio::time::sleep(NODE_REFRESH_INTERVAL).await;
                continue;
            };
            drop(this);

            loop {
                let Some(this) = coordinator.upgrade() else { return };
                let record = NodeRecord {
                    node_id: this.node_id.clone(),
                    node_endpoint: this.node_endpoint.clone(),
                    state: NodeState::Serving,
                    session_count: this.registry.count().await as u64,
                    client_count: this.metrics.active_clients().max(0) as u64,
                };
                let key = format!("/node/{}", this.node_id);
                let payload = match serde_json::to_vec(&record) {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let mut kv = this.client.kv_client();
                if kv
                    .put(key, payload, Some(PutOptions::new().with_lease(lease_id)))
                    .await
                    .is_err()
                {
                    break;
                }
                if keeper.keep_alive().await.is_err() {
                    break;
                }
                if !matches!(stream.message().await, Ok(Some(_))) {
                    break;
                }
                drop(this);
                tokio::time::sleep(NODE_REFRESH_INTERVAL).await;
            }
            tracing::warn!("node record lease lost, re-granting");
        }
    }
}

#[async_trait]
impl SessionProvider for EtcdCoordinator {
    async fn get_session(&self, sid: &SessionId) -> (Arc<Session>, Arc<WebRtcTransport>) {
        // The registry's close callback is where cluster state unwinds:
        // last peer out deletes /session/{sid}.
        let weak = self.weak_self.clone();
        let sid_owned = sid.clone();
        let session = self
            .registry
            .ensure(sid, move || {
                if let Some(coordinator) = weak.upgrade() {
                    tokio::spawn(async move {
                        coordinator.on_session_closed(sid_owned).await;
                    });
                }
            })
            .await;
        (session, self.registry.transport())
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn get_or_create_session(
        &self,
        sid: &SessionId,
    ) -> Result<SessionMeta, CoordinatorError> {
        let lock_key = session_key(sid);
        let mut lock_client = self.client.lock_client();

        let lock = tokio::time::timeout(LOCK_TIMEOUT, lock_client.lock(lock_key.as_str(), None))
            .await
            .map_err(|_| CoordinatorError::LockTimeout)??
            .key()
            .to_vec();

        let result = self.get_or_create_locked(sid).await;

        if let Err(err) = lock_client.unlock(lock).await {
            tracing::warn!(session_id = %sid, "unlocking session: {err}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, state: NodeState, sessions: u64) -> NodeRecord {
        NodeRecord {
            node_id: NodeId(id.to_owned()),
            node_endpoint: format!("ws://{id}:7000"),
            state,
            session_count: sessions,
            client_count: 0,
        }
    }

    #[test]
    fn least_loaded_serving_node_wins() {
        let me = NodeId("n1".to_owned());
        let picked = pick_least_loaded(
            vec![
                record("n1", NodeState::Serving, 5),
                record("n2", NodeState::Serving, 2),
            ]
            .into_iter(),
            &me,
        );
        assert_eq!(picked, Some(NodeId("n2".to_owned())));
    }

    #[test]
    fn self_wins_ties() {
        let me = NodeId("n1".to_owned());
        let picked = pick_least_loaded(
            vec![
                record("n2", NodeState::Serving, 3),
                record("n1", NodeState::Serving, 3),
                record("n3", NodeState::Serving, 3),
            ]
            .into_iter(),
            &me,
        );
        assert_eq!(picked, Some(me));
    }

    #[test]
    fn draining_nodes_are_skipped() {
        let me = NodeId("n1".to_owned());
        let picked = pick_least_loaded(
            vec![
                record("n2", NodeState::Draining, 0),
                record("n3", NodeState::Serving, 9),
            ]
            .into_iter(),
            &me,
        );
        assert_eq!(picked, Some(NodeId("n3".to_owned())));
    }

    #[test]
    fn empty_view_yields_no_pick() {
        let me = NodeId("n1".to_owned());
        assert_eq!(pick_least_loaded(std::iter::empty(), &me), None);
    }
}
