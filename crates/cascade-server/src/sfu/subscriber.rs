//! Server-offered half of the peer transport pair.
//!
//! Holds the downtrack and datachannel registries for one peer, debounces
//! negotiation requests, and runs the periodic downtrack report task.

use crate::error::SfuError;
use crate::sfu::down_track::DownTrack;
use crate::sfu::media::WebRtcTransport;
use crate::sfu::peer::PeerEvent;
use cascade_protocol::{PeerId, TrickleTarget};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp;

const NEGOTIATION_DEBOUNCE: Duration = Duration::from_millis(200);
const REPORT_INTERVAL: Duration = Duration::from_secs(5);
/// Source-description chunks per compound RTCP packet.
const SDES_BATCH: usize = 15;

pub struct Subscriber {
    id: PeerId,
    pc: Arc<RTCPeerConnection>,
    tracks: RwLock<HashMap<String, Vec<Arc<DownTrack>>>>,
    channels: RwLock<HashMap<String, Arc<RTCDataChannel>>>,
    candidates: Mutex<Vec<RTCIceCandidateInit>>,
    negotiation_needed: OnceCell<Box<dyn Fn() + Send + Sync>>,
    gathering_complete: OnceCell<Box<dyn Fn() + Send + Sync>>,
    debounce_gen: AtomicU64,
    closed: AtomicBool,
    weak_self: std::sync::Weak<Self>,
}

impl Subscriber {
    pub async fn new(
        id: PeerId,
        transport: &WebRtcTransport,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<Self>, SfuError> {
        let pc = transport.new_subscriber_connection().await?;

        let subscriber = Arc::new_cyclic(|weak| Self {
            id,
            pc: pc.clone(),
            tracks: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            candidates: Mutex::new(Vec::new()),
            negotiation_needed: OnceCell::new(),
            gathering_complete: OnceCell::new(),
            debounce_gen: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            weak_self: weak.clone(),
        });

        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events
                                .send(PeerEvent::IceCandidate(init, TrickleTarget::Subscriber));
                        }
                        Err(err) => {
                            tracing::warn!("serializing subscriber candidate: {err}");
                        }
                    }
                })
            }));
        }

        pc.on_ice_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            Box::pin(async move {
                tracing::debug!(?state, "subscriber ice connection state");
                match state {
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Closed => {
                        let _ = events.send(PeerEvent::IceFailure);
                    }
                    RTCIceConnectionState::Disconnected => {
                        let _ = events.send(PeerEvent::IceRestartNeeded);
                    }
                    _ => {}
                }
            })
        }));

        {
            let weak = Arc::downgrade(&subscriber);
            pc.on_ice_gathering_state_change(Box::new(move |state| {
                let weak = weak.clone();
                Box::pin(async move {
                    if state != RTCIceGathererState::Complete {
                        return;
                    }
                    if let Some(subscriber) = weak.upgrade() {
                        if let Some(f) = subscriber.gathering_complete.get() {
                            f();
                        }
                    }
                })
            }));
        }

        tokio::spawn(subscriber.clone().down_track_reports());

        Ok(subscriber)
    }

    pub fn pc(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Installs the (already state-machine-aware) negotiation callback.
    pub fn on_negotiation_needed(&self, f: impl Fn() + Send + Sync + 'static) {
        let _ = self.negotiation_needed.set(Box::new(f));
    }

    pub fn on_gathering_complete(&self, f: impl Fn() + Send + Sync + 'static) {
        let _ = self.gathering_complete.set(Box::new(f));
    }

    pub fn ice_gathering_in_progress(&self) -> bool {
        self.pc.ice_gathering_state() == RTCIceGatheringState::Gathering
    }

    /// Debounced request to renegotiate; bursts of track and channel
    /// changes collapse into one offer.
    pub fn negotiate(&self) {
        let generation = self.debounce_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(subscriber) = self.weak_self.upgrade() else { return };
        tokio::spawn(async move {
            tokio::time::sleep(NEGOTIATION_DEBOUNCE).await;
            if subscriber.debounce_gen.load(Ordering::SeqCst) != generation {
                return;
            }
            if subscriber.closed.load(Ordering::SeqCst) {
                return;
            }
            if let Some(f) = subscriber.negotiation_needed.get() {
                f();
            }
        });
    }

    pub async fn create_offer(
        &self,
        ice_restart: bool,
    ) -> Result<RTCSessionDescription, SfuError> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Applies the client's answer and drains candidates that arrived
    /// before the remote description.
    pub async fn set_remote_description(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<(), SfuError> {
        self.pc.set_remote_description(desc).await?;

        let buffered: Vec<_> = self.candidates.lock().await.drain(..).collect();
        for candidate in buffered {
            if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!(peer_id = %self.id, "buffered subscriber candidate: {err}");
            }
        }
        Ok(())
    }

    /// Re-applies the current remote description, fast-forwarding a
    /// negotiation that an ICE restart is about to supersede.
    pub async fn fast_forward_remote(&self) -> Result<(), SfuError> {
        if let Some(remote) = self.pc.remote_description().await {
            self.pc.set_remote_description(remote).await?;
        }
        Ok(())
    }

    pub async fn add_ice_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), SfuError> {
        if self.pc.remote_description().await.is_some() {
            self.pc.add_ice_candidate(candidate).await?;
            return Ok(());
        }
        self.candidates.lock().await.push(candidate);
        Ok(())
    }

    pub async fn add_down_track(&self, stream_id: &str, down_track: Arc<DownTrack>) {
        self.tracks
            .write()
            .await
            .entry(stream_id.to_owned())
            .or_default()
            .push(down_track);
    }

    pub async fn remove_down_track(&self, stream_id: &str, down_track: &Arc<DownTrack>) {
        let mut tracks = self.tracks.write().await;
        if let Some(list) = tracks.get_mut(stream_id) {
            if let Some(idx) = list.iter().position(|dt| Arc::ptr_eq(dt, down_track)) {
                list.swap_remove(idx);
            }
            if list.is_empty() {
                tracks.remove(stream_id);
            }
        }
    }

    pub async fn get_down_tracks(&self, stream_id: &str) -> Vec<Arc<DownTrack>> {
        self.tracks
            .read()
            .await
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn down_tracks(&self) -> Vec<Arc<DownTrack>> {
        self.tracks
            .read()
            .await
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub async fn register_datachannel(&self, label: &str, dc: Arc<RTCDataChannel>) {
        self.channels.write().await.insert(label.to_owned(), dc);
    }

    pub async fn data_channel(&self, label: &str) -> Option<Arc<RTCDataChannel>> {
        self.channels.read().await.get(label).cloned()
    }

    /// Returns the channel for `label`, creating it on the peer
    /// connection when absent.
    pub async fn add_data_channel(&self, label: &str) -> Result<Arc<RTCDataChannel>, SfuError> {
        if let Some(dc) = self.data_channel(label).await {
            return Ok(dc);
        }
        let dc = self.pc.create_data_channel(label, None).await?;
        self.register_datachannel(label, dc.clone()).await;
        Ok(dc)
    }

    async fn down_track_reports(self: Arc<Self>) {
        loop {
            tokio::time::sleep(REPORT_INTERVAL).await;
            if self.closed.load(Ordering::SeqCst)
                || self.pc.connection_state() == RTCPeerConnectionState::Closed
            {
                return;
            }

            let mut packets: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = Vec::new();
            let mut chunks = Vec::new();
            for dt in self.down_tracks().await {
                if let Some(sr) = dt.create_sender_report().await {
                    packets.push(Box::new(sr));
                }
                if let Some(chunk) = dt.create_source_description_chunk().await {
                    chunks.push(chunk);
                }
            }
            if packets.is_empty() && chunks.is_empty() {
                continue;
            }

            for batch in chunks.chunks(SDES_BATCH) {
                packets.push(Box::new(rtcp::source_description::SourceDescription {
                    chunks: batch.to_vec(),
                }));
            }
            if let Err(err) = self.pc.write_rtcp(&packets).await {
                tracing::debug!(peer_id = %self.id, "downtrack reports: {err}");
                return;
            }
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            tracing::warn!(peer_id = %self.id, "closing subscriber transport: {err}");
        }
    }
}
