//! WebRTC API construction shared by every peer connection on the node.
//!
//! The publisher and subscriber roles get separate API objects so their
//! media engines can diverge: the publisher side registers the audio
//! level header extension so receivers can feed the audio observer.

use crate::config::{SfuConfig, WebRtcConfig};
use crate::error::SfuError;
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpHeaderExtensionCapability, RTPCodecType};

/// URI of the ssrc-audio-level RTP header extension.
pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportRole {
    Publisher,
    Subscriber,
}

/// Everything needed to mint peer connections for either role.
pub struct WebRtcTransport {
    publisher_api: API,
    subscriber_api: API,
    configuration: RTCConfiguration,
    pub router: crate::config::RouterConfig,
}

fn build_setting_engine(conf: &WebRtcConfig) -> Result<SettingEngine, SfuError> {
    let mut se = SettingEngine::default();

    if let Some(range) = conf.ice_port_range {
        let ephemeral = EphemeralUDP::new(range.start, range.end).map_err(webrtc::Error::from)?;
        se.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
    }
    if !conf.mdns {
        se.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
    }
    if !conf.candidates.nat1to1.is_empty() {
        se.set_nat_1to1_ips(conf.candidates.nat1to1.clone(), RTCIceCandidateType::Host);
    }
    se.set_ice_timeouts(
        Some(Duration::from_secs(conf.timeouts.disconnected)),
        Some(Duration::from_secs(conf.timeouts.failed)),
        Some(Duration::from_secs(conf.timeouts.keepalive)),
    );
    Ok(se)
}

fn build_media_engine(role: TransportRole) -> Result<MediaEngine, SfuError> {
    let mut me = MediaEngine::default();
    me.register_default_codecs().map_err(webrtc::Error::from)?;
    // The publisher side negotiates the audio level extension so the
    // receiver loop can feed the audio observer.
    if role == TransportRole::Publisher {
        me.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: AUDIO_LEVEL_URI.to_owned(),
            },
            RTPCodecType::Audio,
            None,
        )
        .map_err(webrtc::Error::from)?;
    }
    Ok(me)
}

fn build_api(conf: &WebRtcConfig, role: TransportRole) -> Result<API, SfuError> {
    let mut me = build_media_engine(role)?;
    let registry = register_default_interceptors(Registry::new(), &mut me)
        .map_err(webrtc::Error::from)?;
    Ok(APIBuilder::new()
        .with_media_engine(me)
        .with_setting_engine(build_setting_engine(conf)?)
        .with_interceptor_registry(registry)
        .build())
}

impl WebRtcTransport {
    pub fn new(conf: &SfuConfig) -> Result<Self, SfuError> {
        let ice_servers = conf
            .webrtc
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect();

        let configuration = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        Ok(Self {
            publisher_api: build_api(&conf.webrtc, TransportRole::Publisher)?,
            subscriber_api: build_api(&conf.webrtc, TransportRole::Subscriber)?,
            configuration,
            router: conf.router.clone(),
        })
    }

    pub async fn new_publisher_connection(&self) -> Result<Arc<RTCPeerConnection>, SfuError> {
        let pc = self
            .publisher_api
            .new_peer_connection(self.configuration.clone())
            .await?;
        Ok(Arc::new(pc))
    }

    pub async fn new_subscriber_connection(&self) -> Result<Arc<RTCPeerConnection>, SfuError> {
        let pc = self
            .subscriber_api
            .new_peer_connection(self.configuration.clone())
            .await?;
        Ok(Arc::new(pc))
    }
}
