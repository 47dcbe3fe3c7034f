//! Wire types shared between cascade nodes and clients.
//!
//! Everything that crosses a process boundary lives here: the JSON-RPC
//! payloads exchanged over the signaling WebSocket, the records the
//! coordinator persists in etcd, and the id newtypes used on both sides.

mod messages;
mod types;

pub use messages::*;
pub use types::*;
