//! peerlink: relay-signaled peer connections and chunked file transfer.
//!
//! A [`core::node::PeerNode`] owns one user's view of the world: the relay
//! channel it signals over, the per-peer sessions it negotiates, and the
//! transfers running on each session's data channel.

pub mod core;
pub mod utils;
