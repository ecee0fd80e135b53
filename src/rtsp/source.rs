//! RTSP media source
//!
//! The concrete source a pusher session (or the VOD factory) creates. It
//! keeps the stream's SDP, per-track ssrc/seq/stamp for RTP-Info, and runs
//! incoming RTP through the merge-write flush policy into the fan-out ring.
//!
//! Dropping the last strong reference unregisters the source from the
//! registry.

use std::any::Any;
use std::sync::{Arc, Mutex, RwLock, Weak};

use rand::Rng;

use crate::hooks::PublishOption;
use crate::media::flush::FlushPolicy;
use crate::media::info::{schema, MediaTuple, DEFAULT_VHOST};
use crate::media::registry::{MediaRegistry, RegistryError};
use crate::media::ring::{RingReader, RtpBatch, RtpRing};
use crate::media::source::{MediaSource, Ownership, SourceState};
use crate::media::TrackType;
use crate::rtp::packet::RtpPacket;

/// Per-track wire state mirrored from the RTP flow
#[derive(Debug, Clone, Copy)]
pub struct TrackStamp {
    pub ssrc: u32,
    pub seq: u16,
    pub stamp_ms: u32,
}

struct Pending {
    policy: FlushPolicy,
    packets: Vec<RtpPacket>,
    key_pos: bool,
}

/// A live RTSP stream
pub struct RtspMediaSource {
    tuple: MediaTuple,
    state: SourceState,
    sdp: RwLock<String>,
    option: Mutex<PublishOption>,
    tracks: Mutex<[TrackStamp; 2]>,
    ring: Arc<RtpRing>,
    pending: Mutex<Pending>,
    merge_write_ms: u64,
}

impl RtspMediaSource {
    pub fn new(registry: &Arc<MediaRegistry>, mut tuple: MediaTuple, sdp: String, option: PublishOption) -> Arc<Self> {
        let config = registry.config();
        if !config.enable_vhost || tuple.vhost.is_empty() {
            tuple.vhost = DEFAULT_VHOST.to_string();
        }
        let mut rng = rand::thread_rng();
        let tracks = [
            TrackStamp { ssrc: rng.gen(), seq: 0, stamp_ms: 0 },
            TrackStamp { ssrc: rng.gen(), seq: 0, stamp_ms: 0 },
        ];
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let state = SourceState::new(registry);
            state.set_weak_self(weak.clone() as Weak<dyn MediaSource>);
            Self {
                tuple,
                state,
                sdp: RwLock::new(sdp),
                option: Mutex::new(option),
                tracks: Mutex::new(tracks),
                ring: Arc::new(RtpRing::new(config.broadcast_capacity, config.max_gop_cache)),
                pending: Mutex::new(Pending {
                    policy: FlushPolicy::default(),
                    packets: Vec::new(),
                    key_pos: false,
                }),
                merge_write_ms: config.merge_write_ms,
            }
        })
    }

    /// Expose this source in the registry
    pub fn register(self: &Arc<Self>) -> Result<(), RegistryError> {
        let registry = self
            .state
            .registry()
            .expect("registry outlives the sources it spawned");
        let as_dyn: Arc<dyn MediaSource> = self.clone();
        registry.register(&as_dyn)
    }

    pub fn ownership(&self) -> Option<Ownership> {
        self.state.acquire_ownership()
    }

    pub fn sdp(&self) -> String {
        self.sdp.read().unwrap().clone()
    }

    /// Replace the SDP, as a reconnecting pusher does
    pub fn set_sdp(&self, sdp: String) {
        *self.sdp.write().unwrap() = sdp;
    }

    pub fn option(&self) -> PublishOption {
        self.option.lock().unwrap().clone()
    }

    pub fn set_option(&self, option: PublishOption) {
        *self.option.lock().unwrap() = option;
    }

    pub fn track_stamp(&self, track: TrackType) -> TrackStamp {
        self.tracks.lock().unwrap()[track.index()]
    }

    /// Newest stamp across tracks, the `Range` reply position
    pub fn stamp_ms(&self) -> u32 {
        let tracks = self.tracks.lock().unwrap();
        tracks[0].stamp_ms.max(tracks[1].stamp_ms)
    }

    /// Ingest one sorted RTP packet. `key_pos` marks a video key frame.
    /// The flush policy decides when the pending batch reaches the ring.
    pub fn on_write(&self, rtp: RtpPacket, key_pos: bool) {
        let track = rtp.track_type;
        {
            let mut tracks = self.tracks.lock().unwrap();
            let slot = &mut tracks[track.index()];
            slot.ssrc = rtp.ssrc();
            slot.seq = rtp.seq();
            slot.stamp_ms = rtp.stamp_ms() as u32;
        }
        self.state.add_bytes(track, rtp.rtp_size() as u64);

        let mut pending = self.pending.lock().unwrap();
        let cache_size = pending.packets.len();
        let flush = pending.policy.is_flushable(
            track == TrackType::Video,
            key_pos,
            rtp.stamp_ms(),
            cache_size,
            self.merge_write_ms,
        );
        if flush {
            self.flush_locked(&mut pending);
        }
        if pending.packets.is_empty() {
            pending.key_pos = key_pos;
        }
        pending.packets.push(rtp);
    }

    /// Push whatever is pending out to the readers now
    pub fn flush(&self) {
        let mut pending = self.pending.lock().unwrap();
        self.flush_locked(&mut pending);
    }

    fn flush_locked(&self, pending: &mut Pending) {
        if pending.packets.is_empty() {
            return;
        }
        let batch: RtpBatch = Arc::new(std::mem::take(&mut pending.packets));
        self.ring.write(batch, pending.key_pos);
        pending.key_pos = false;
    }

    /// Attach a player's cursor. `use_gop` replays the cached GOP.
    pub fn attach_reader(&self, use_gop: bool) -> RingReader {
        self.ring.attach(use_gop, self.state.weak_self())
    }

    /// Owning downcast from a registry result
    pub fn from_dyn(src: &Arc<dyn MediaSource>) -> Option<Arc<Self>> {
        src.clone().as_any_arc().downcast::<Self>().ok()
    }
}

impl MediaSource for RtspMediaSource {
    fn schema(&self) -> &str {
        schema::RTSP
    }

    fn tuple(&self) -> &MediaTuple {
        &self.tuple
    }

    fn state(&self) -> &SourceState {
        &self.state
    }

    fn reader_count(&self) -> usize {
        self.ring.reader_count()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for RtspMediaSource {
    fn drop(&mut self) {
        if let Some(timer) = self.state.none_reader_timer.lock().unwrap().take() {
            timer.abort();
        }
        if let Some(registry) = self.state.registry() {
            registry.unregister(self);
        }
    }
}
