//! RTSP server engine
//!
//! This crate implements the protocol core of a streaming-media server:
//! RTSP control sessions for publishers (ANNOUNCE/RECORD) and players
//! (DESCRIBE/PLAY), a process-wide media source registry that decouples
//! ingest from egress, and the RTP/RTCP plumbing between them.
//!
//! # Architecture
//!
//! ```text
//!   pusher ──ANNOUNCE/RECORD──► RtspSession ──on_write──► RtspMediaSource
//!                                                              │ ring
//!   player ──DESCRIBE/PLAY────► RtspSession ◄──rtp batches─────┘
//!                                    │
//!                          MediaRegistry (schema→vhost→app→stream, weak)
//! ```
//!
//! Sessions run one tokio task each; all their mutable state is owned by
//! that task. The registry and the HTTP-tunnel map are the only shared
//! structures and are mutex-guarded with listener callbacks emitted outside
//! the lock.
//!
//! Application policy (authentication, pull-on-demand, flow accounting) is
//! injected through the [`hooks::MediaHooks`] trait, mirroring how the
//! server is generic over a handler rather than hard-coding behaviour.

pub mod error;
pub mod hooks;
pub mod media;
pub mod rtp;
pub mod rtsp;
pub mod server;

pub use error::{Error, ProtocolError, Result};
pub use hooks::MediaHooks;
pub use media::info::{MediaInfo, MediaTuple, DEFAULT_VHOST};
pub use media::registry::MediaRegistry;
pub use server::config::ServerConfig;
pub use server::listener::RtspServer;

/// Server identification string carried in the `Server` response header and
/// the RTCP SDES CNAME chunk.
pub const SERVER_NAME: &str = concat!("rtsp-engine/", env!("CARGO_PKG_VERSION"));
