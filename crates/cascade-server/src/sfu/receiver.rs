//! Publisher-side track ingestion.
//!
//! A `Receiver` owns the forward loops for one published track (one loop
//! per simulcast layer), fanning each packet out to the downtracks that
//! currently select that layer. The forward path touches only this
//! struct's own locks.

use crate::sfu::audio_observer::AudioObserver;
use crate::sfu::down_track::DownTrack;
use cascade_protocol::PeerId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use webrtc::rtcp;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Unmarshal;

pub type RtcpWriter = mpsc::UnboundedSender<Box<dyn rtcp::packet::Packet + Send + Sync>>;

pub struct Receiver {
    peer_id: PeerId,
    track_id: String,
    stream_id: String,
    kind: RTPCodecType,
    codec: RTCRtpCodecCapability,
    rtcp_tx: RtcpWriter,

    /// rid → layer index; a lone entry with an empty rid is layer 0.
    layer_rids: Mutex<Vec<String>>,
    layer_ssrcs: Mutex<Vec<u32>>,
    live_layers: AtomicUsize,
    top_layer: AtomicUsize,

    down_tracks: RwLock<Vec<Arc<DownTrack>>>,
    audio_observer: Option<Arc<AudioObserver>>,
    closed: AtomicBool,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    weak_self: std::sync::Weak<Self>,
}

impl Receiver {
    pub fn new(
        peer_id: PeerId,
        track: &TrackRemote,
        rtcp_tx: RtcpWriter,
        audio_observer: Option<Arc<AudioObserver>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            peer_id,
            track_id: track.id(),
            stream_id: track.stream_id(),
            kind: track.kind(),
            codec: track.codec().capability,
            rtcp_tx,
            layer_rids: Mutex::new(Vec::new()),
            layer_ssrcs: Mutex::new(Vec::new()),
            live_layers: AtomicUsize::new(0),
            top_layer: AtomicUsize::new(0),
            down_tracks: RwLock::new(Vec::new()),
            audio_observer,
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> RTPCodecType {
        self.kind
    }

    pub fn codec(&self) -> RTCRtpCodecCapability {
        self.codec.clone()
    }

    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_close.lock().unwrap() = Some(Box::new(f));
    }

    /// Registers one simulcast layer (or the only layer for plain tracks)
    /// and spawns its forward loop.
    pub fn add_layer(
        &self,
        track: Arc<TrackRemote>,
        audio_level_ext_id: Option<u8>,
    ) -> usize {
        let layer = {
            let mut rids = self.layer_rids.lock().unwrap();
            let rid = track.rid().to_string();
            if let Some(idx) = rids.iter().position(|r| *r == rid) {
                idx
            } else {
                rids.push(rid);
                rids.len() - 1
            }
        };
        {
            let mut ssrcs = self.layer_ssrcs.lock().unwrap();
            if ssrcs.len() <= layer {
                ssrcs.resize(layer + 1, 0);
            }
            ssrcs[layer] = u32::from(track.ssrc());
        }
        self.live_layers.fetch_add(1, Ordering::SeqCst);
        self.top_layer.fetch_max(layer, Ordering::SeqCst);

        if let Some(receiver) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                receiver.forward_loop(track, layer, audio_level_ext_id).await;
            });
        }
        layer
    }

    pub fn top_layer(&self) -> usize {
        self.top_layer.load(Ordering::SeqCst)
    }

    async fn forward_loop(
        self: Arc<Self>,
        track: Arc<TrackRemote>,
        layer: usize,
        audio_level_ext_id: Option<u8>,
    ) {
        tracing::debug!(
            peer_id = %self.peer_id,
            track_id = %self.track_id,
            layer,
            "starting rtp forward loop"
        );

        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let (pkt, _attributes) = match track.read_rtp().await {
                Ok(v) => v,
                Err(err) => {
                    tracing::debug!(
                        track_id = %self.track_id,
                        layer,
                        "rtp read ended: {err}"
                    );
                    break;
                }
            };

            if let (Some(observer), Some(ext_id)) = (&self.audio_observer, audio_level_ext_id) {
                if let Some(buf) = pkt.header.get_extension(ext_id) {
                    let mut buf = buf;
                    if let Ok(ext) =
                        webrtc::rtp::extension::audio_level_extension::AudioLevelExtension::unmarshal(
                            &mut buf,
                        )
                    {
                        observer.observe(&self.stream_id, ext.level);
                    }
                }
            }

            let top = self.top_layer();
            let down_tracks = self.down_tracks.read().await;
            for dt in down_tracks.iter() {
                if !dt.selects_layer(layer, top) {
                    continue;
                }
                if let Err(err) = dt.write_rtp(&pkt).await {
                    // The affected downtrack alone is at fault; the rest of
                    // the fan-out continues.
                    tracing::debug!(
                        subscriber_id = %dt.subscriber_id(),
                        track_id = %self.track_id,
                        "downtrack write failed: {err}"
                    );
                }
            }
        }

        if self.live_layers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close();
        }
    }

    /// Attaches a downtrack and asks the publisher for a keyframe so the
    /// new subscriber does not wait for the next natural one.
    pub async fn add_down_track(&self, dt: Arc<DownTrack>) {
        self.down_tracks.write().await.push(dt);
        if self.kind == RTPCodecType::Video {
            self.request_key_frame();
        }
    }

    pub async fn remove_down_tracks_for(&self, subscriber_id: &PeerId) -> Vec<Arc<DownTrack>> {
        let mut down_tracks = self.down_tracks.write().await;
        let mut removed = Vec::new();
        let mut i = 0;
        while i < down_tracks.len() {
            if down_tracks[i].subscriber_id() == subscriber_id {
                removed.push(down_tracks.swap_remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    pub async fn down_tracks(&self) -> Vec<Arc<DownTrack>> {
        self.down_tracks.read().await.clone()
    }

    pub fn request_key_frame(&self) {
        let media_ssrc = {
            let ssrcs = self.layer_ssrcs.lock().unwrap();
            let top = self.top_layer().min(ssrcs.len().saturating_sub(1));
            match ssrcs.get(top) {
                Some(ssrc) => *ssrc,
                None => return,
            }
        };
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        if self.rtcp_tx.send(Box::new(pli)).is_err() {
            tracing::debug!(track_id = %self.track_id, "rtcp writer gone");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(observer) = &self.audio_observer {
            observer.remove_stream(&self.stream_id);
        }
        if let Some(f) = self.on_close.lock().unwrap().take() {
            f();
        }
    }
}
