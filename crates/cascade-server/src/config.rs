//! Node configuration.
//!
//! Loaded from an optional config file with `CASCADE_*` environment
//! variables layered on top; unknown keys are ignored so configs written
//! for newer nodes keep working on older ones.

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signal: SignalConfig,
    pub coordinator: CoordinatorConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub http_addr: String,
    /// Advertised hostname used to build this node's endpoint. Overridden
    /// by the `CASCADE_HOST` environment variable.
    pub fqdn: Option<String>,
    pub cert: String,
    pub key: String,
    pub auth: AuthConfig,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            http_addr: ":7000".to_owned(),
            fqdn: None,
            cert: String::new(),
            key: String::new(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub key: String,
    pub key_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub local: Option<LocalCoordinatorConfig>,
    pub etcd: Option<EtcdCoordinatorConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            local: Some(LocalCoordinatorConfig {}),
            etcd: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalCoordinatorConfig {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EtcdCoordinatorConfig {
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Heap ballast in MiB allocated at startup.
    pub ballast: usize,
    pub webrtc: WebRtcConfig,
    pub router: RouterConfig,
    pub turn: TurnConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub ice_port_range: Option<PortRange>,
    pub ice_servers: Vec<IceServerConfig>,
    pub candidates: CandidatesConfig,
    pub sdp_semantics: String,
    pub mdns: bool,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CandidatesConfig {
    pub nat1to1: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub disconnected: u64,
    pub failed: u64,
    pub keepalive: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            disconnected: 5,
            failed: 25,
            keepalive: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Interval in milliseconds between audioLevels broadcasts.
    pub audio_level_interval: u64,
    /// Loudness threshold, 0-127, where 0 is loudest.
    pub audio_level_threshold: u8,
    /// Percent of observations inside an interval that must exceed the
    /// threshold for a stream to count as active.
    pub audio_level_filter: u32,
    pub max_packet_track: usize,
    pub max_bandwidth: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            audio_level_interval: 1000,
            audio_level_threshold: 40,
            audio_level_filter: 20,
            max_packet_track: 500,
            max_bandwidth: 1500,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub enabled: bool,
    pub address: String,
    pub public_ip: String,
    pub realm: String,
    /// Static credentials, `user=password` entries.
    pub users: Vec<String>,
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let raw = builder
            .add_source(config::Environment::with_prefix("CASCADE").separator("__"))
            .build()?;
        let conf = raw.try_deserialize()?;
        Ok(conf)
    }

    /// The advertised signaling endpoint other nodes and clients dial.
    pub fn endpoint(&self) -> String {
        let scheme = if self.signal.cert.is_empty() { "ws" } else { "wss" };
        let host = std::env::var("CASCADE_HOST")
            .ok()
            .or_else(|| self.signal.fqdn.clone())
            .unwrap_or_else(|| "localhost".to_owned());
        let addr = &self.signal.http_addr;
        match addr.rsplit_once(':') {
            Some((_, port)) if !port.is_empty() => format!("{scheme}://{host}:{port}"),
            _ => format!("{scheme}://{host}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_single_node_local() {
        let conf = Config::default();
        assert!(conf.coordinator.local.is_some());
        assert!(conf.coordinator.etcd.is_none());
        assert_eq!(conf.sfu.router.audio_level_interval, 1000);
        assert!(!conf.signal.auth.enabled);
    }

    #[test]
    fn endpoint_reflects_tls_and_fqdn() {
        let mut conf = Config::default();
        conf.signal.http_addr = "0.0.0.0:7000".to_owned();
        conf.signal.fqdn = Some("sfu-1.example.com".to_owned());
        assert_eq!(conf.endpoint(), "ws://sfu-1.example.com:7000");

        conf.signal.cert = "/etc/tls/cert.pem".to_owned();
        assert_eq!(conf.endpoint(), "wss://sfu-1.example.com:7000");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[signal]
http_addr = ":7100"
some_future_knob = true

[sfu.router]
audio_level_interval = 250
"#
        )
        .unwrap();
        let conf = Config::load(file.path().to_str()).unwrap();
        assert_eq!(conf.signal.http_addr, ":7100");
        assert_eq!(conf.sfu.router.audio_level_interval, 250);
    }
}
