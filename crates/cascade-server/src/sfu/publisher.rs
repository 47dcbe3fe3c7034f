//! Client-offered half of the peer transport pair.
//!
//! The publisher answers the client's offers, ingests remote tracks into
//! receivers, and hands inbound datachannels to the session fan-out.

use crate::error::SfuError;
use crate::sfu::media::{WebRtcTransport, AUDIO_LEVEL_URI};
use crate::sfu::peer::PeerEvent;
use crate::sfu::receiver::{Receiver, RtcpWriter};
use crate::sfu::session::{Session, API_CHANNEL_LABEL};
use cascade_protocol::{PeerId, TrickleTarget};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

pub struct Publisher {
    id: PeerId,
    pc: Arc<RTCPeerConnection>,
    session: Weak<Session>,
    receivers: Mutex<HashMap<String, Arc<Receiver>>>,
    candidates: Mutex<Vec<RTCIceCandidateInit>>,
    rtcp_tx: RtcpWriter,
    closed: AtomicBool,
}

impl Publisher {
    pub async fn new(
        id: PeerId,
        session: &Arc<Session>,
        transport: &WebRtcTransport,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<Self>, SfuError> {
        let pc = transport.new_publisher_connection().await?;

        let (rtcp_tx, mut rtcp_rx) = mpsc::unbounded_channel();
        {
            // Writer task owning the only RTCP write path toward the client.
            let pc = pc.clone();
            tokio::spawn(async move {
                while let Some(pkt) = rtcp_rx.recv().await {
                    if pc.write_rtcp(&[pkt]).await.is_err() {
                        return;
                    }
                }
            });
        }

        let publisher = Arc::new(Self {
            id,
            pc: pc.clone(),
            session: Arc::downgrade(session),
            receivers: Mutex::new(HashMap::new()),
            candidates: Mutex::new(Vec::new()),
            rtcp_tx,
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&publisher);
        pc.on_track(Box::new(move |track, rtp_receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(publisher) = weak.upgrade() {
                    publisher.handle_track(track, rtp_receiver).await;
                }
            })
        }));

        let weak = Arc::downgrade(&publisher);
        pc.on_data_channel(Box::new(move |dc| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(publisher) = weak.upgrade() else {
                    return;
                };
                if dc.label() == API_CHANNEL_LABEL {
                    // The server opens its own API channel on the
                    // subscriber side; a client-created one is dropped.
                    return;
                }
                if let Some(session) = publisher.session.upgrade() {
                    session.add_datachannel(publisher.id.clone(), dc).await;
                }
            })
        }));

        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events
                                .send(PeerEvent::IceCandidate(init, TrickleTarget::Publisher));
                        }
                        Err(err) => {
                            tracing::warn!("serializing publisher candidate: {err}");
                        }
                    }
                })
            }));
        }

        pc.on_ice_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            Box::pin(async move {
                tracing::debug!(?state, "publisher ice connection state");
                if matches!(
                    state,
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Closed
                ) {
                    let _ = events.send(PeerEvent::IceFailure);
                }
            })
        }));

        Ok(publisher)
    }

    async fn handle_track(
        &self,
        track: Arc<webrtc::track::track_remote::TrackRemote>,
        rtp_receiver: Arc<webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver>,
    ) {
        tracing::info!(
            peer_id = %self.id,
            track_id = %track.id(),
            stream_id = %track.stream_id(),
            rid = %track.rid(),
            "publisher track"
        );

        let Some(session) = self.session.upgrade() else {
            return;
        };

        let audio_level_ext_id = if track.kind() == RTPCodecType::Audio {
            rtp_receiver
                .get_parameters()
                .await
                .header_extensions
                .iter()
                .find(|e| e.uri == AUDIO_LEVEL_URI)
                .map(|e| e.id as u8)
        } else {
            None
        };

        let observer = (track.kind() == RTPCodecType::Audio)
            .then(|| session.audio_observer().clone());

        let (receiver, is_new) = {
            let mut receivers = self.receivers.lock().await;
            match receivers.get(&track.id()) {
                Some(r) => (r.clone(), false),
                None => {
                    let r = Receiver::new(
                        self.id.clone(),
                        &track,
                        self.rtcp_tx.clone(),
                        observer.clone(),
                    );
                    receivers.insert(track.id(), r.clone());
                    (r, true)
                }
            }
        };

        receiver.add_layer(track.clone(), audio_level_ext_id);

        if is_new {
            if let Some(observer) = observer {
                observer.add_stream(&track.stream_id());
            }

            let session_weak = self.session.clone();
            let unpublish = receiver.clone();
            receiver.on_close(move || {
                if let Some(session) = session_weak.upgrade() {
                    tokio::spawn(async move {
                        session.unpublish(&unpublish).await;
                    });
                }
            });

            session.publish(&self.id, receiver).await;
        }
    }

    /// Answers a publisher offer: set remote, drain buffered candidates,
    /// create and apply the answer. Only legal in stable signaling state.
    pub async fn answer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, SfuError> {
        if self.pc.signaling_state() != RTCSignalingState::Stable {
            return Err(SfuError::OfferIgnored);
        }
        self.pc.set_remote_description(offer).await?;

        let buffered: Vec<_> = self.candidates.lock().await.drain(..).collect();
        for candidate in buffered {
            if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!(peer_id = %self.id, "buffered publisher candidate: {err}");
            }
        }

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer)
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

    pub async fn receivers(&self) -> Vec<Arc<Receiver>> {
        self.receivers.lock().await.values().cloned().collect()
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for receiver in self.receivers().await {
            receiver.close();
        }
        if let Err(err) = self.pc.close().await {
            tracing::warn!(peer_id = %self.id, "closing publisher transport: {err}");
        }
    }
}
