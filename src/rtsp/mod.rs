//! RTSP protocol implementation
//!
//! [`session::RtspSession`] is the per-connection state machine; the rest of
//! the module is its toolbox: request/response text handling, the frame
//! splitter that separates RTSP from interleaved RTP, SDP track extraction,
//! Basic/Digest authentication, transport negotiation, the RTSP-backed
//! media source, the shared multicaster and the HTTP tunnel pairing map.

pub mod auth;
pub mod message;
pub mod multicast;
pub mod sdp;
pub mod session;
pub mod source;
pub mod splitter;
pub mod transport;
pub mod tunnel;
