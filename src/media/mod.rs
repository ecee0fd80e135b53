//! Media model: stream identity, the source registry, and source plumbing
//!
//! A [`source::MediaSource`] is the in-process handle for one live stream.
//! Sources register themselves in the [`registry::MediaRegistry`] under
//! `(schema, vhost, app, stream)` and fan RTP out to readers through a
//! [`ring::RtpRing`]. The registry stores weak references only; ownership
//! stays with whichever protocol session or reader created the source.

pub mod config;
pub mod event;
pub mod flush;
pub mod info;
pub mod registry;
pub mod ring;
pub mod source;

/// Track kind, also the index into per-track arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackType {
    Video,
    Audio,
}

impl TrackType {
    pub fn index(self) -> usize {
        match self {
            TrackType::Video => 0,
            TrackType::Audio => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(TrackType::Video),
            1 => Some(TrackType::Audio),
            _ => None,
        }
    }

    /// SDP media name (`m=<name> ...`)
    pub fn from_sdp(name: &str) -> Option<Self> {
        match name {
            "video" => Some(TrackType::Video),
            "audio" => Some(TrackType::Audio),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackType::Video => "video",
            TrackType::Audio => "audio",
        }
    }
}

impl std::fmt::Display for TrackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
