//! Per-subscriber forwarding track.
//!
//! A `DownTrack` carries one receiver's packets to one subscriber,
//! applying the mute flag and spatial layer selection. It may drop
//! packets but never reorders them; writes happen on the receiver's
//! forward loop, so nothing here takes session-level locks.

use bytes::Bytes;
use cascade_protocol::PeerId;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::source_description::{
    SdesType, SourceDescriptionChunk, SourceDescriptionItem,
};
use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

pub struct DownTrack {
    track_id: String,
    stream_id: String,
    subscriber_id: PeerId,
    kind: RTPCodecType,
    track: Arc<TrackLocalStaticRTP>,
    sender: OnceCell<Arc<RTCRtpSender>>,

    muted: AtomicBool,
    max_spatial_layer: AtomicI32,
    max_temporal_layer: AtomicI32,

    packet_count: AtomicU32,
    octet_count: AtomicU32,
    last_rtp_timestamp: AtomicU32,
}

impl DownTrack {
    pub fn new(
        codec: RTCRtpCodecCapability,
        kind: RTPCodecType,
        track_id: &str,
        stream_id: &str,
        subscriber_id: PeerId,
    ) -> Arc<Self> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            codec,
            format!("{track_id}-{subscriber_id}"),
            stream_id.to_owned(),
        ));
        Arc::new(Self {
            track_id: track_id.to_owned(),
            stream_id: stream_id.to_owned(),
            subscriber_id,
            kind,
            track,
            sender: OnceCell::new(),
            muted: AtomicBool::new(false),
            max_spatial_layer: AtomicI32::new(2),
            max_temporal_layer: AtomicI32::new(2),
            packet_count: AtomicU32::new(0),
            octet_count: AtomicU32::new(0),
            last_rtp_timestamp: AtomicU32::new(0),
        })
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn subscriber_id(&self) -> &PeerId {
        &self.subscriber_id
    }

    pub fn kind(&self) -> RTPCodecType {
        self.kind
    }

    pub fn local(&self) -> Arc<TrackLocalStaticRTP> {
        self.track.clone()
    }

    /// Binds the RTP sender once the track has been added to the
    /// subscriber's peer connection.
    pub fn bind_sender(&self, sender: Arc<RTCRtpSender>) {
        let _ = self.sender.set(sender);
    }

    pub fn sender(&self) -> Option<Arc<RTCRtpSender>> {
        self.sender.get().cloned()
    }

    pub fn mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_max_spatial_layer(&self, layer: i32) {
        self.max_spatial_layer.store(layer, Ordering::Relaxed);
    }

    pub fn max_spatial_layer(&self) -> i32 {
        self.max_spatial_layer.load(Ordering::Relaxed)
    }

    pub fn set_max_temporal_layer(&self, layer: i32) {
        self.max_temporal_layer.store(layer, Ordering::Relaxed);
    }

    pub fn max_temporal_layer(&self) -> i32 {
        self.max_temporal_layer.load(Ordering::Relaxed)
    }

    /// Whether packets arriving on `layer` should be forwarded, given the
    /// layers currently available from the source.
    pub fn selects_layer(&self, layer: usize, top_layer: usize) -> bool {
        if self.is_muted() {
            return false;
        }
        let want = (self.max_spatial_layer() as usize).min(top_layer);
        layer == want
    }

    pub async fn write_rtp(&self, pkt: &rtp::packet::Packet) -> Result<(), webrtc::Error> {
        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.octet_count
            .fetch_add(pkt.payload.len() as u32, Ordering::Relaxed);
        self.last_rtp_timestamp
            .store(pkt.header.timestamp, Ordering::Relaxed);
        self.track.write_rtp(pkt).await.map(|_| ())
    }

    async fn ssrc(&self) -> Option<u32> {
        let sender = self.sender.get()?;
        let params = sender.get_parameters().await;
        params.encodings.first().map(|e| e.ssrc)
    }

    /// Builds a sender report for the subscriber-side periodic RTCP task.
    pub async fn create_sender_report(&self) -> Option<SenderReport> {
        let ssrc = self.ssrc().await?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
        let ntp_secs = now.as_secs() + NTP_UNIX_OFFSET_SECS;
        let ntp_frac = (u64::from(now.subsec_nanos()) << 32) / 1_000_000_000;
        Some(SenderReport {
            ssrc,
            ntp_time: (ntp_secs << 32) | ntp_frac,
            rtp_time: self.last_rtp_timestamp.load(Ordering::Relaxed),
            packet_count: self.packet_count.load(Ordering::Relaxed),
            octet_count: self.octet_count.load(Ordering::Relaxed),
            ..Default::default()
        })
    }

    pub async fn create_source_description_chunk(&self) -> Option<SourceDescriptionChunk> {
        let ssrc = self.ssrc().await?;
        Some(SourceDescriptionChunk {
            source: ssrc,
            items: vec![SourceDescriptionItem {
                sdes_type: SdesType::SdesCname,
                text: Bytes::from(self.stream_id.clone()),
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down_track() -> Arc<DownTrack> {
        DownTrack::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            RTPCodecType::Video,
            "track-a",
            "stream-a",
            PeerId::from("sub-1"),
        )
    }

    #[test]
    fn muted_track_selects_nothing() {
        let dt = down_track();
        dt.mute(true);
        assert!(!dt.selects_layer(0, 2));
        assert!(!dt.selects_layer(2, 2));
        dt.mute(false);
        assert!(dt.selects_layer(2, 2));
    }

    #[test]
    fn layer_selection_clamps_to_available() {
        let dt = down_track();
        dt.set_max_spatial_layer(2);
        // Source only publishes a single layer.
        assert!(dt.selects_layer(0, 0));
        assert!(!dt.selects_layer(1, 0));

        dt.set_max_spatial_layer(1);
        assert!(dt.selects_layer(1, 2));
        assert!(!dt.selects_layer(2, 2));
        assert!(!dt.selects_layer(0, 2));
    }
}
