//! Node-level Prometheus gauges.
//!
//! The same gauges back the `/metrics` exposition and the supervisor's
//! drain loop, which polls [`Metrics::active_clients`] until it reaches
//! zero before shutting down.

use anyhow::Result;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    /// Currently active sessions hosted on this node.
    pub sessions: IntGauge,
    /// Currently active signaling websockets terminated on this node.
    pub clients: IntGauge,
    /// Currently active websockets proxied through this node to an owner.
    pub proxy_clients: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let sessions = IntGauge::new(
            "cascade_sessions",
            "Number of currently active sessions on this node",
        )?;
        let clients = IntGauge::new(
            "cascade_clients",
            "Number of currently active websockets on this node",
        )?;
        let proxy_clients = IntGauge::new(
            "cascade_proxy_clients",
            "Number of currently active proxied websockets on this node",
        )?;
        registry.register(Box::new(sessions.clone()))?;
        registry.register(Box::new(clients.clone()))?;
        registry.register(Box::new(proxy_clients.clone()))?;
        Ok(Self {
            registry,
            sessions,
            clients,
            proxy_clients,
        })
    }

    /// Clients this node is still responsible for: direct plus proxied.
    pub fn active_clients(&self) -> i64 {
        self.clients.get() + self.proxy_clients.get()
    }

    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!("encoding metrics: {err}");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_clients_sums_direct_and_proxied() {
        let m = Metrics::new().unwrap();
        m.clients.inc();
        m.clients.inc();
        m.proxy_clients.inc();
        assert_eq!(m.active_clients(), 3);
        m.clients.dec();
        assert_eq!(m.active_clients(), 2);
    }

    #[test]
    fn exposition_contains_gauges() {
        let m = Metrics::new().unwrap();
        m.sessions.set(4);
        let text = m.encode();
        assert!(text.contains("cascade_sessions 4"));
        assert!(text.contains("cascade_clients 0"));
        assert!(text.contains("cascade_proxy_clients 0"));
    }
}
