//! Per-node registry of live sessions and the session itself: peer
//! membership, publish/subscribe fan-out, the datachannel broadcast bus,
//! presence, and the audio-level pump.

use crate::error::SfuError;
use crate::metrics::Metrics;
use crate::sfu::audio_observer::AudioObserver;
use crate::sfu::down_track::DownTrack;
use crate::sfu::media::WebRtcTransport;
use crate::sfu::peer::Peer;
use crate::sfu::receiver::Receiver;
use async_trait::async_trait;
use cascade_protocol::{PeerId, Presence, SessionId};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::track::track_local::TrackLocal;

/// Reserved label of the server-opened control channel.
pub const API_CHANNEL_LABEL: &str = "cascade-api";

/// Depth of each peer's broadcast queue; a peer that falls this far
/// behind is dropped from the broadcast set.
pub const BROADCAST_QUEUE: usize = 32;

/// A server→client notification fanned out to every member's signaling
/// connection.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub method: String,
    pub params: Value,
}

/// Envelope for messages the server writes on the API datachannel.
#[derive(Debug, Serialize)]
pub struct ChannelApiMessage<T: Serialize> {
    pub method: &'static str,
    pub params: T,
}

/// Hands out the session and transport configuration for a given id;
/// implemented by both coordinator variants.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_session(&self, sid: &SessionId) -> (Arc<Session>, Arc<WebRtcTransport>);
}

#[derive(Default)]
struct PresenceState {
    revision: u64,
    entries: HashMap<String, Value>,
}

pub struct Session {
    id: SessionId,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    fanout_labels: StdMutex<Vec<String>>,
    presence: StdMutex<PresenceState>,
    listeners: StdMutex<HashMap<PeerId, mpsc::Sender<Broadcast>>>,
    audio_observer: Arc<AudioObserver>,
    closed: AtomicBool,
    on_close: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
    pump: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    weak_self: Weak<Self>,
}

impl Session {
    fn new(id: SessionId, transport: &WebRtcTransport) -> Arc<Self> {
        let router = &transport.router;
        let session = Arc::new_cyclic(|weak| Self {
            id,
            peers: RwLock::new(HashMap::new()),
            fanout_labels: StdMutex::new(Vec::new()),
            presence: StdMutex::new(PresenceState::default()),
            listeners: StdMutex::new(HashMap::new()),
            audio_observer: Arc::new(AudioObserver::new(
                router.audio_level_threshold,
                router.audio_level_filter,
            )),
            closed: AtomicBool::new(false),
            on_close: StdMutex::new(None),
            pump: StdMutex::new(None),
            weak_self: weak.clone(),
        });

        let interval = if router.audio_level_interval == 0 {
            1000
        } else {
            router.audio_level_interval
        };
        let handle = tokio::spawn(session.clone().audio_level_loop(interval));
        *session.pump.lock().unwrap() = Some(handle);

        session
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn audio_observer(&self) -> &Arc<AudioObserver> {
        &self.audio_observer
    }

    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_close.lock().unwrap() = Some(Box::new(f));
    }

    pub async fn add_peer(&self, peer: Arc<Peer>) {
        let Some(id) = peer.id().cloned() else { return };
        self.peers.write().await.insert(id, peer);
    }

    pub async fn get_peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Drops a member. The last peer out closes the session.
    pub async fn remove_peer(&self, peer_id: &PeerId) {
        let remaining = {
            let mut peers = self.peers.write().await;
            peers.remove(peer_id);
            peers.len()
        };
        tracing::info!(session_id = %self.id, peer_id = %peer_id, remaining, "peer removed");

        // Detach the leaving subscriber from every remaining receiver.
        for other in self.peers().await {
            if let Some(publisher) = other.publisher() {
                for receiver in publisher.receivers().await {
                    receiver.remove_down_tracks_for(peer_id).await;
                }
            }
        }
        self.remove_broadcast_listener(peer_id);

        if remaining == 0 {
            self.close();
        }
    }

    /// Fans a new receiver out to every other member's subscriber.
    pub async fn publish(&self, publisher_id: &PeerId, receiver: Arc<Receiver>) {
        for peer in self.peers().await {
            match peer.id() {
                Some(id) if id != publisher_id => {}
                _ => continue,
            }
            if peer.subscriber().is_none() {
                continue;
            }
            tracing::info!(
                session_id = %self.id,
                peer_id = %peer.id().map(|p| p.to_string()).unwrap_or_default(),
                track_id = %receiver.track_id(),
                "publishing track to peer"
            );
            if let Err(err) = self.attach_down_track(&peer, &receiver).await {
                tracing::error!(session_id = %self.id, "attaching downtrack: {err}");
                continue;
            }
            peer.request_negotiate();
        }
    }

    /// Wires a joining peer into everything the session already carries:
    /// fan-out datachannels and every live published track.
    pub async fn subscribe(&self, peer: Arc<Peer>) {
        let labels: Vec<String> = self.fanout_labels.lock().unwrap().clone();
        let Some(peer_id) = peer.id().cloned() else { return };

        if let Some(subscriber) = peer.subscriber() {
            for label in labels {
                match subscriber.add_data_channel(&label).await {
                    Ok(dc) => self.wire_fanout(peer_id.clone(), &label, &dc),
                    Err(err) => {
                        tracing::error!(session_id = %self.id, label, "adding datachannel: {err}");
                    }
                }
            }
        }

        for other in self.peers().await {
            match other.id() {
                Some(id) if *id != peer_id => {}
                _ => continue,
            }
            let Some(publisher) = other.publisher() else { continue };
            for receiver in publisher.receivers().await {
                if receiver.is_closed() {
                    continue;
                }
                if let Err(err) = self.attach_down_track(&peer, &receiver).await {
                    tracing::error!(session_id = %self.id, "subscribing to track: {err}");
                }
            }
        }
        peer.request_negotiate();
    }

    async fn attach_down_track(
        &self,
        peer: &Arc<Peer>,
        receiver: &Arc<Receiver>,
    ) -> Result<(), SfuError> {
        let subscriber = peer
            .subscriber()
            .ok_or(SfuError::NoTransportEstablished)?;
        let peer_id = peer.id().ok_or(SfuError::NoTransportEstablished)?;

        let dt = DownTrack::new(
            receiver.codec(),
            receiver.kind(),
            receiver.track_id(),
            receiver.stream_id(),
            peer_id.clone(),
        );

        let local: Arc<dyn TrackLocal + Send + Sync> = dt.local();
        let sender = subscriber.pc().add_track(local).await?;
        dt.bind_sender(sender.clone());

        // Drain sender RTCP so the underlying stack never blocks.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut buf).await {}
        });

        receiver.add_down_track(dt.clone()).await;
        subscriber.add_down_track(receiver.stream_id(), dt).await;
        Ok(())
    }

    /// Tears a closed receiver's downtracks out of every subscriber.
    pub async fn unpublish(&self, receiver: &Arc<Receiver>) {
        for peer in self.peers().await {
            if peer.id() == Some(receiver.peer_id()) {
                continue;
            }
            let Some(subscriber) = peer.subscriber() else { continue };
            let mut changed = false;
            for dt in subscriber.get_down_tracks(receiver.stream_id()).await {
                if dt.track_id() != receiver.track_id() {
                    continue;
                }
                if let Some(sender) = dt.sender() {
                    if let Err(err) = subscriber.pc().remove_track(&sender).await {
                        tracing::debug!(session_id = %self.id, "removing track: {err}");
                    }
                }
                subscriber.remove_down_track(receiver.stream_id(), &dt).await;
                changed = true;
            }
            if changed {
                peer.request_negotiate();
            }
        }
    }

    fn wire_fanout(&self, origin: PeerId, label: &str, dc: &Arc<RTCDataChannel>) {
        let weak = self.weak_self.clone();
        let label = label.to_owned();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let weak = weak.clone();
            let origin = origin.clone();
            let label = label.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.fan_out_message(&origin, &label, msg).await;
                }
            })
        }));
    }

    /// Registers a client-opened datachannel for session-wide fan-out.
    /// The first sighting of a label opens a matching channel on every
    /// other member.
    pub async fn add_datachannel(&self, owner: PeerId, dc: Arc<RTCDataChannel>) {
        let label = dc.label().to_owned();

        let known = {
            let mut labels = self.fanout_labels.lock().unwrap();
            if labels.iter().any(|l| *l == label) {
                true
            } else {
                labels.push(label.clone());
                false
            }
        };

        self.wire_fanout(owner.clone(), &label, &dc);
        if known {
            return;
        }

        if let Some(owner_peer) = self.get_peer(&owner).await {
            if let Some(subscriber) = owner_peer.subscriber() {
                subscriber.register_datachannel(&label, dc).await;
            }
        }

        for peer in self.peers().await {
            let Some(peer_id) = peer.id().cloned() else { continue };
            if peer_id == owner {
                continue;
            }
            let Some(subscriber) = peer.subscriber() else { continue };
            match subscriber.add_data_channel(&label).await {
                Ok(ndc) => {
                    self.wire_fanout(peer_id, &label, &ndc);
                    peer.request_negotiate();
                }
                Err(err) => {
                    tracing::error!(session_id = %self.id, label, "adding datachannel: {err}");
                }
            }
        }
    }

    /// Broadcasts one datachannel message to every other member's open
    /// channel with the same label.
    pub async fn fan_out_message(&self, origin: &PeerId, label: &str, msg: DataChannelMessage) {
        for dc in self.data_channels(Some(origin), label).await {
            let result = if msg.is_string {
                match std::str::from_utf8(&msg.data) {
                    Ok(text) => dc.send_text(text.to_owned()).await.map(|_| ()),
                    Err(_) => continue,
                }
            } else {
                dc.send(&msg.data).await.map(|_| ())
            };
            if let Err(err) = result {
                tracing::error!(session_id = %self.id, label, "datachannel send: {err}");
            }
        }
    }

    /// Open channels carrying `label`, excluding `except` when given.
    pub async fn data_channels(
        &self,
        except: Option<&PeerId>,
        label: &str,
    ) -> Vec<Arc<RTCDataChannel>> {
        let mut out = Vec::new();
        for peer in self.peers().await {
            if peer.id() == except {
                continue;
            }
            let Some(subscriber) = peer.subscriber() else { continue };
            if let Some(dc) = subscriber.data_channel(label).await {
                if dc.ready_state() == RTCDataChannelState::Open {
                    out.push(dc);
                }
            }
        }
        out
    }

    /// Bumps the presence revision, stores or deletes the entry, and
    /// fans the new snapshot out. A peer whose queue is full is dropped
    /// from the broadcast set.
    pub fn update_presence(&self, peer_id: &str, meta: Option<Value>) {
        // The broadcast happens under the same lock that assigned the
        // revision, so deliveries are revision-ascending per listener.
        let mut presence = self.presence.lock().unwrap();
        presence.revision += 1;
        match meta {
            Some(meta) => {
                presence.entries.insert(peer_id.to_owned(), meta);
            }
            None => {
                presence.entries.remove(peer_id);
            }
        }
        self.broadcast(Broadcast {
            method: "presence".to_owned(),
            params: serde_json::to_value(Presence {
                revision: presence.revision,
                meta: presence.entries.clone(),
            })
            .unwrap_or(Value::Null),
        });
    }

    pub fn presence_revision(&self) -> u64 {
        self.presence.lock().unwrap().revision
    }

    /// Registers a listener and immediately hands it the current
    /// presence snapshot so a late joiner does not wait for the next
    /// update.
    pub fn add_broadcast_listener(&self, peer_id: PeerId, tx: mpsc::Sender<Broadcast>) {
        let snapshot = {
            let presence = self.presence.lock().unwrap();
            (presence.revision > 0).then(|| Broadcast {
                method: "presence".to_owned(),
                params: serde_json::to_value(Presence {
                    revision: presence.revision,
                    meta: presence.entries.clone(),
                })
                .unwrap_or(Value::Null),
            })
        };
        if let Some(snapshot) = snapshot {
            let _ = tx.try_send(snapshot);
        }
        self.listeners.lock().unwrap().insert(peer_id, tx);
    }

    pub fn remove_broadcast_listener(&self, peer_id: &PeerId) {
        self.listeners.lock().unwrap().remove(peer_id);
    }

    /// Best-effort delivery to every listener.
    pub fn broadcast(&self, msg: Broadcast) {
        let mut dead = Vec::new();
        {
            let listeners = self.listeners.lock().unwrap();
            for (id, tx) in listeners.iter() {
                if tx.try_send(msg.clone()).is_err() {
                    tracing::error!(
                        session_id = %self.id,
                        peer_id = %id,
                        "broadcast queue full, dropping listener"
                    );
                    dead.push(id.clone());
                }
            }
        }
        if !dead.is_empty() {
            let mut listeners = self.listeners.lock().unwrap();
            for id in dead {
                listeners.remove(&id);
            }
        }
    }

    async fn audio_level_loop(self: Arc<Self>, interval_ms: u64) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let Some(levels) = self.audio_observer.calc() else {
                continue;
            };
            let msg = ChannelApiMessage {
                method: "audioLevels",
                params: levels,
            };
            let payload = match serde_json::to_string(&msg) {
                Ok(p) => p,
                Err(err) => {
                    tracing::error!("marshaling audio levels: {err}");
                    continue;
                }
            };
            for dc in self.data_channels(None, API_CHANNEL_LABEL).await {
                if let Err(err) = dc.send_text(payload.clone()).await {
                    tracing::error!(session_id = %self.id, "sending audio levels: {err}");
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent close; fires the registered close callback once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session_id = %self.id, "session closed");
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
        if let Some(f) = self.on_close.lock().unwrap().take() {
            f();
        }
    }
}

/// Process-wide map of live sessions on this node.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    transport: Arc<WebRtcTransport>,
    metrics: Arc<Metrics>,
    weak_self: Weak<Self>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<WebRtcTransport>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sessions: Mutex::new(HashMap::new()),
            transport,
            metrics,
            weak_self: weak.clone(),
        })
    }

    pub fn transport(&self) -> Arc<WebRtcTransport> {
        self.transport.clone()
    }

    /// Returns the existing session or creates one whose close callback
    /// unregisters it (and then runs `on_close`, which the coordinator
    /// uses to delete cluster state).
    pub async fn ensure(
        &self,
        sid: &SessionId,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(sid) {
            return session.clone();
        }

        let session = Session::new(sid.clone(), &self.transport);
        let registry = self.weak_self.clone();
        let close_sid = sid.clone();
        session.on_close(move || {
            if let Some(registry) = registry.upgrade() {
                registry.metrics.sessions.dec();
                let sid = close_sid.clone();
                tokio::spawn(async move {
                    registry.sessions.lock().await.remove(&sid);
                });
            }
            on_close();
        });

        sessions.insert(sid.clone(), session.clone());
        self.metrics.sessions.inc();
        tracing::info!(session_id = %sid, "session created");
        session
    }

    pub async fn get(&self, sid: &SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(sid).cloned()
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
