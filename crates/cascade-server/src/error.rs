use thiserror::Error;

/// Errors surfaced by the coordinator capability.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("timed out acquiring session lock")]
    LockTimeout,

    #[error("kv store error: {0}")]
    Store(#[from] etcd_client::Error),

    #[error("corrupt session meta: {0}")]
    CorruptMeta(#[from] serde_json::Error),

    #[error("no coordinator configured")]
    NotConfigured,
}

/// Errors from the peer transport pair and the forwarding session.
#[derive(Error, Debug)]
pub enum SfuError {
    #[error("rtc transport already exists for this connection")]
    TransportExists,

    #[error("no rtc transport exists for this peer")]
    NoTransportEstablished,

    #[error("offer ignored: signaling state is not stable")]
    OfferIgnored,

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

/// Errors from the signaling endpoint.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("invalid request parameters: {0}")]
    BadParams(#[from] serde_json::Error),

    #[error("peer is not in any session")]
    NotJoined,

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Sfu(#[from] SfuError),
}

/// Token validation failures; all of them gate the upgrade with a 403.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no token")]
    NoToken,

    #[error("token claims invalid: must have sid")]
    MissingSid,

    #[error("token sid does not match session")]
    SidMismatch,

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("invalid token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}
