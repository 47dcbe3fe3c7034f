//! The forwarding core: sessions, peers, and the RTP fan-out path.

mod audio_observer;
mod down_track;
mod media;
mod peer;
mod publisher;
mod receiver;
mod session;
mod subscriber;

pub use audio_observer::{AudioLevel, AudioObserver};
pub use down_track::DownTrack;
pub use media::WebRtcTransport;
pub use peer::{Peer, PeerEvent};
pub use receiver::Receiver;
pub use session::{
    Broadcast, Session, SessionProvider, SessionRegistry, API_CHANNEL_LABEL, BROADCAST_QUEUE,
};
