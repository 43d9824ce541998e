//! Provider-facing half of the relay: ephemeral credential minting,
//! the realtime WebSocket link, and wire-event translation.

pub mod credentials;
pub mod events;
pub mod link;
