//! A connected participant: one publisher and one subscriber transport.
//!
//! The subscriber's renegotiation logic is an explicit three-state
//! machine rather than callback flags, so every transition is a pure
//! function that can be tested on its own.

use crate::error::SfuError;
use crate::sfu::publisher::Publisher;
use crate::sfu::session::{Session, SessionProvider, API_CHANNEL_LABEL};
use crate::sfu::subscriber::Subscriber;
use cascade_protocol::{PeerId, SessionId, TrickleTarget};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Signals surfaced from the transports to the signaling connection.
#[derive(Debug)]
pub enum PeerEvent {
    /// A new subscriber-side local offer that must reach the client.
    Offer(RTCSessionDescription),
    /// A trickle candidate for one of the two transports.
    IceCandidate(RTCIceCandidateInit, TrickleTarget),
    /// ICE reached failed/closed; the peer and its socket must go.
    IceFailure,
    /// The subscriber transport degraded and wants an ICE restart.
    IceRestartNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No offer in flight.
    Idle,
    /// A local offer was sent; the client's answer is pending.
    AwaitingClient,
    /// Something changed while awaiting the answer; renegotiate after it
    /// lands.
    RetryQueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationInput {
    Needed,
    RemoteAnswer,
    IceRestartReq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationAction {
    None,
    /// Create and send a fresh offer.
    SendOffer,
    /// Re-apply the current remote description, then offer with ICE
    /// restart.
    FastForwardRestart,
    /// Immediately feed another `Needed` (a retry was queued).
    Renegotiate,
}

pub(crate) fn negotiation_transition(
    state: NegotiationState,
    input: NegotiationInput,
) -> (NegotiationState, NegotiationAction) {
    use NegotiationAction as A;
    use NegotiationInput as I;
    use NegotiationState as S;

    match (state, input) {
        (S::Idle, I::Needed) => (S::AwaitingClient, A::SendOffer),
        (S::AwaitingClient, I::Needed) => (S::RetryQueued, A::None),
        (S::RetryQueued, I::Needed) => (S::RetryQueued, A::None),

        (S::Idle, I::RemoteAnswer) => (S::Idle, A::None),
        (S::AwaitingClient, I::RemoteAnswer) => (S::Idle, A::None),
        (S::RetryQueued, I::RemoteAnswer) => (S::Idle, A::Renegotiate),

        (S::Idle, I::IceRestartReq) => (S::AwaitingClient, A::SendOffer),
        (S::AwaitingClient, I::IceRestartReq) | (S::RetryQueued, I::IceRestartReq) => {
            (S::AwaitingClient, A::FastForwardRestart)
        }
    }
}

struct Joined {
    id: PeerId,
    session_id: SessionId,
    session: Weak<Session>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    api_channel: Arc<RTCDataChannel>,
}

pub struct Peer {
    provider: Arc<dyn SessionProvider>,
    events: mpsc::UnboundedSender<PeerEvent>,
    joined: OnceCell<Joined>,
    negotiation: Mutex<NegotiationState>,
    /// An ICE restart was requested while gathering was in progress.
    pending_restart: AtomicBool,
    closed: AtomicBool,
    weak_self: Weak<Self>,
}

impl Peer {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            provider,
            events,
            joined: OnceCell::new(),
            negotiation: Mutex::new(NegotiationState::Idle),
            pending_restart: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn id(&self) -> Option<&PeerId> {
        self.joined.get().map(|j| &j.id)
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.joined.get().map(|j| &j.session_id)
    }

    pub fn publisher(&self) -> Option<&Arc<Publisher>> {
        self.joined.get().map(|j| &j.publisher)
    }

    pub fn subscriber(&self) -> Option<&Arc<Subscriber>> {
        self.joined.get().map(|j| &j.subscriber)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.joined.get().and_then(|j| j.session.upgrade())
    }

    pub fn api_channel(&self) -> Option<&Arc<RTCDataChannel>> {
        self.joined.get().map(|j| &j.api_channel)
    }

    /// Creates both transports and enters the session. Fails when the
    /// peer already joined once; the roles of the two transports are
    /// fixed for the peer's lifetime.
    pub async fn join(
        self: Arc<Self>,
        sid: SessionId,
        uid: Option<PeerId>,
    ) -> Result<(), SfuError> {
        if self.joined.get().is_some() {
            return Err(SfuError::TransportExists);
        }

        let (session, transport) = self.provider.get_session(&sid).await;
        let id = uid.unwrap_or_else(|| PeerId(uuid::Uuid::new_v4().to_string()));

        let subscriber = Subscriber::new(id.clone(), &transport, self.events.clone()).await?;
        let publisher =
            Publisher::new(id.clone(), &session, &transport, self.events.clone()).await?;

        let api_channel = subscriber
            .pc()
            .create_data_channel(API_CHANNEL_LABEL, None)
            .await?;
        subscriber
            .register_datachannel(API_CHANNEL_LABEL, api_channel.clone())
            .await;
        {
            let weak = self.weak_self.clone();
            api_channel.on_message(Box::new(move |msg| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(peer) = weak.upgrade() {
                        peer.handle_api_message(&msg.data).await;
                    }
                })
            }));
        }

        {
            let weak = self.weak_self.clone();
            subscriber.on_negotiation_needed(move || {
                if let Some(peer) = weak.upgrade() {
                    peer.apply_negotiation_input(NegotiationInput::Needed);
                }
            });
        }
        {
            let weak = self.weak_self.clone();
            subscriber.on_gathering_complete(move || {
                if let Some(peer) = weak.upgrade() {
                    if peer.pending_restart.swap(false, Ordering::SeqCst) {
                        peer.apply_negotiation_input(NegotiationInput::IceRestartReq);
                    }
                }
            });
        }

        self.joined
            .set(Joined {
                id,
                session_id: sid,
                session: Arc::downgrade(&session),
                publisher,
                subscriber,
                api_channel,
            })
            .map_err(|_| SfuError::TransportExists)?;

        session.add_peer(self.clone()).await;
        session.subscribe(self.clone()).await;
        Ok(())
    }

    /// Answers an offer on the publisher transport.
    pub async fn answer_publisher(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, SfuError> {
        let joined = self.joined.get().ok_or(SfuError::NoTransportEstablished)?;
        joined.publisher.answer(offer).await
    }

    /// Applies the client's answer to the subscriber transport and, when
    /// a retry was queued during the round trip, immediately offers again.
    pub async fn set_remote_answer(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<(), SfuError> {
        let joined = self.joined.get().ok_or(SfuError::NoTransportEstablished)?;
        joined.subscriber.set_remote_description(desc).await?;
        self.apply_negotiation_input(NegotiationInput::RemoteAnswer);
        Ok(())
    }

    pub async fn trickle(
        &self,
        candidate: RTCIceCandidateInit,
        target: TrickleTarget,
    ) -> Result<(), SfuError> {
        let joined = self.joined.get().ok_or(SfuError::NoTransportEstablished)?;
        match target {
            TrickleTarget::Publisher => joined.publisher.add_ice_candidate(candidate).await,
            TrickleTarget::Subscriber => joined.subscriber.add_ice_candidate(candidate).await,
        }
    }

    /// Requests a debounced subscriber renegotiation.
    pub fn request_negotiate(&self) {
        if let Some(joined) = self.joined.get() {
            joined.subscriber.negotiate();
        }
    }

    /// Requests an ICE restart, deferring while gathering is in progress.
    pub fn restart_ice(&self) {
        let Some(joined) = self.joined.get() else { return };
        if joined.subscriber.ice_gathering_in_progress() {
            self.pending_restart.store(true, Ordering::SeqCst);
            return;
        }
        self.apply_negotiation_input(NegotiationInput::IceRestartReq);
    }

    fn apply_negotiation_input(&self, input: NegotiationInput) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let action = {
            let mut state = self.negotiation.lock().unwrap();
            let (next, action) = negotiation_transition(*state, input);
            *state = next;
            action
        };
        match action {
            NegotiationAction::None => {}
            NegotiationAction::SendOffer => {
                self.spawn_offer(input == NegotiationInput::IceRestartReq, false)
            }
            NegotiationAction::FastForwardRestart => self.spawn_offer(true, true),
            NegotiationAction::Renegotiate => {
                self.apply_negotiation_input(NegotiationInput::Needed)
            }
        }
    }

    fn spawn_offer(&self, ice_restart: bool, fast_forward: bool) {
        let Some(peer) = self.weak_self.upgrade() else { return };
        tokio::spawn(async move {
            let Some(joined) = peer.joined.get() else { return };
            if fast_forward {
                if let Err(err) = joined.subscriber.fast_forward_remote().await {
                    tracing::warn!(peer_id = %joined.id, "fast-forward before restart: {err}");
                }
            }
            match joined.subscriber.create_offer(ice_restart).await {
                Ok(offer) => {
                    if !peer.closed.load(Ordering::SeqCst) {
                        tracing::debug!(peer_id = %joined.id, ice_restart, "sending subscriber offer");
                        let _ = peer.events.send(PeerEvent::Offer(offer));
                    }
                }
                Err(err) => {
                    tracing::error!(peer_id = %joined.id, "creating subscriber offer: {err}");
                    *peer.negotiation.lock().unwrap() = NegotiationState::Idle;
                }
            }
        });
    }

    async fn handle_api_message(&self, data: &[u8]) {
        let Ok(control) = serde_json::from_slice::<SetRemoteMedia>(data) else {
            return;
        };
        let Some(subscriber) = self.subscriber() else { return };

        for dt in subscriber.get_down_tracks(&control.stream_id).await {
            match dt.kind() {
                RTPCodecType::Audio => dt.mute(!control.audio),
                RTPCodecType::Video => {
                    match control.video.as_str() {
                        "high" => {
                            dt.mute(false);
                            dt.set_max_spatial_layer(2);
                        }
                        "medium" => {
                            dt.mute(false);
                            dt.set_max_spatial_layer(1);
                        }
                        "low" => {
                            dt.mute(false);
                            dt.set_max_spatial_layer(0);
                        }
                        "none" => dt.mute(true),
                        _ => {}
                    }
                    match control.framerate.as_str() {
                        "high" => dt.set_max_temporal_layer(2),
                        "medium" => dt.set_max_temporal_layer(1),
                        "low" => dt.set_max_temporal_layer(0),
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tears the peer down; safe to call any number of times.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(joined) = self.joined.get() else { return };
        if let Some(session) = joined.session.upgrade() {
            session.remove_peer(&joined.id).await;
        }
        joined.publisher.close().await;
        joined.subscriber.close().await;
    }
}

/// Subscriber-side media control message arriving on the API channel.
#[derive(Debug, Deserialize)]
struct SetRemoteMedia {
    #[serde(rename = "streamId")]
    stream_id: String,
    #[serde(default)]
    video: String,
    #[serde(default)]
    framerate: String,
    #[serde(default)]
    audio: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use NegotiationAction as A;
    use NegotiationInput as I;
    use NegotiationState as S;

    #[test]
    fn needed_from_idle_sends_offer() {
        assert_eq!(
            negotiation_transition(S::Idle, I::Needed),
            (S::AwaitingClient, A::SendOffer)
        );
    }

    #[test]
    fn needed_while_awaiting_queues_retry() {
        assert_eq!(
            negotiation_transition(S::AwaitingClient, I::Needed),
            (S::RetryQueued, A::None)
        );
        assert_eq!(
            negotiation_transition(S::RetryQueued, I::Needed),
            (S::RetryQueued, A::None)
        );
    }

    #[test]
    fn answer_resets_and_replays_queued_retry() {
        assert_eq!(
            negotiation_transition(S::AwaitingClient, I::RemoteAnswer),
            (S::Idle, A::None)
        );
        assert_eq!(
            negotiation_transition(S::RetryQueued, I::RemoteAnswer),
            (S::Idle, A::Renegotiate)
        );
    }

    #[test]
    fn restart_fast_forwards_when_an_answer_is_pending() {
        assert_eq!(
            negotiation_transition(S::Idle, I::IceRestartReq),
            (S::AwaitingClient, A::SendOffer)
        );
        assert_eq!(
            negotiation_transition(S::AwaitingClient, I::IceRestartReq),
            (S::AwaitingClient, A::FastForwardRestart)
        );
        assert_eq!(
            negotiation_transition(S::RetryQueued, I::IceRestartReq),
            (S::AwaitingClient, A::FastForwardRestart)
        );
    }

    #[test]
    fn spurious_answer_in_idle_is_ignored() {
        assert_eq!(
            negotiation_transition(S::Idle, I::RemoteAnswer),
            (S::Idle, A::None)
        );
    }
}
