use crate::{PeerId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// JSON-RPC error code for a generic server-side failure.
pub const ERROR_CODE_INTERNAL: i64 = 500;

/// JSON-RPC error code carrying a [`crate::SessionMeta`] payload that tells
/// the client to reconnect against the owning node.
pub const ERROR_CODE_REDIRECT: i64 = 302;

/// Which of the peer's two transports a trickle candidate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TrickleTarget {
    Publisher,
    Subscriber,
}

impl From<TrickleTarget> for u8 {
    fn from(t: TrickleTarget) -> u8 {
        match t {
            TrickleTarget::Publisher => 0,
            TrickleTarget::Subscriber => 1,
        }
    }
}

impl TryFrom<u8> for TrickleTarget {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(TrickleTarget::Publisher),
            1 => Ok(TrickleTarget::Subscriber),
            other => Err(format!("invalid trickle target {other}")),
        }
    }
}

/// `join` request parameters, sent once per connection to enter a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Join {
    pub sid: SessionId,
    #[serde(default)]
    pub uid: Option<PeerId>,
    pub offer: RTCSessionDescription,
}

/// Parameters of the `offer`/`answer` renegotiation requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Negotiation {
    pub desc: RTCSessionDescription,
}

/// `trickle` notification parameters, valid in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trickle {
    pub target: TrickleTarget,
    pub candidate: RTCIceCandidateInit,
}

/// Session-wide presence snapshot fanned out to every connected peer.
///
/// `revision` is monotone for the lifetime of the session; receivers may
/// miss intermediate revisions under backpressure but never observe a
/// decrease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub revision: u64,
    pub meta: HashMap<String, Value>,
}
