//! WebRTC transport backed by webrtc-rs.
//!
//! # Protocol Overview
//!
//! - One ordered, reliable data channel, opened by the initiator before the
//!   offer is produced so it is usable the moment ICE connects
//! - Trickle ICE: every gathered candidate is emitted as soon as it exists;
//!   descriptions are sent without waiting for gathering to complete
//! - Session descriptions and candidates travel as the JSON webrtc-rs
//!   serializes them (`RTCSessionDescription`, `RTCIceCandidateInit`)
//! - ICE connection state drives session connectivity; no ICE restarts

mod channel;
mod initializer;
mod transport;

pub use channel::WebRtcDataChannel;
pub use initializer::WebRtcTransportFactory;
pub use transport::WebRtcTransport;
