use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier for a logical session (a "room").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        SessionId(s)
    }
}

/// Opaque identifier for a peer inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Identifier of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coordinator record describing where a session lives.
///
/// Persisted under `/session/{sid}` with a TTL lease owned by the hosting
/// node. `redirect` is derived when the record is read back (true iff the
/// owning node is not the reader) and is never persisted as true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(rename = "session_id")]
    pub session_id: SessionId,
    #[serde(rename = "node_id")]
    pub node_id: NodeId,
    #[serde(rename = "node_url")]
    pub node_endpoint: String,
    #[serde(default, skip_serializing)]
    pub redirect: bool,
}

/// Node liveness/load record published under `/node/{node_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub node_endpoint: String,
    pub state: NodeState,
    pub session_count: u64,
    pub client_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Serving,
    Draining,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_meta_never_persists_redirect() {
        let meta = SessionMeta {
            session_id: "room-1".into(),
            node_id: NodeId("n1".to_owned()),
            node_endpoint: "ws://n1:7000".to_owned(),
            redirect: true,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("redirect").is_none());
        assert_eq!(json["session_id"], "room-1");
        assert_eq!(json["node_url"], "ws://n1:7000");
    }

    #[test]
    fn session_meta_redirect_defaults_false_on_read() {
        let meta: SessionMeta = serde_json::from_str(
            r#"{"session_id":"room-1","node_id":"n1","node_url":"ws://n1:7000"}"#,
        )
        .unwrap();
        assert!(!meta.redirect);
    }
}
