//! Media sources
//!
//! A [`MediaSource`] is the abstract handle for one live stream. Concrete
//! sources (RTSP push, MP4 on-demand, …) embed a [`SourceState`] carrying
//! the shared bookkeeping: identity counter, creation stamp, monotonic alive
//! ticker, per-track byte rates, the single-holder ownership flag and the
//! weak listener link.
//!
//! Most operations a source exposes are delegated to its listener, the
//! session or muxer that drives it; the delegation helpers live on
//! `impl dyn MediaSource` so they are callable on any trait object.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::hooks::SessionInfo;
use crate::media::event::{default_reader_policy, DynHandle, MediaSourceEvent, MuxerHandle, RecordType, SendRtpArgs, SendRtpCallback, TrackDescriptor};
use crate::media::info::MediaTuple;
use crate::media::registry::MediaRegistry;
use crate::media::TrackType;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Where a source's media originally comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaOriginType {
    Unknown,
    RtmpPush,
    RtspPush,
    RtpPush,
    Pull,
    FfmpegPull,
    Mp4Vod,
    DeviceChannel,
    RtcPush,
    SrtPush,
}

impl fmt::Display for MediaOriginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaOriginType::Unknown => "unknown",
            MediaOriginType::RtmpPush => "rtmp_push",
            MediaOriginType::RtspPush => "rtsp_push",
            MediaOriginType::RtpPush => "rtp_push",
            MediaOriginType::Pull => "pull",
            MediaOriginType::FfmpegPull => "ffmpeg_pull",
            MediaOriginType::Mp4Vod => "mp4_vod",
            MediaOriginType::DeviceChannel => "device_chn",
            MediaOriginType::RtcPush => "rtc_push",
            MediaOriginType::SrtPush => "srt_push",
        };
        f.write_str(name)
    }
}

/// Scoped ownership of a source
///
/// At most one holder exists per source at any instant; dropping the guard
/// releases the claim, error paths included.
pub struct Ownership {
    flag: Weak<AtomicBool>,
}

impl Drop for Ownership {
    fn drop(&mut self) {
        if let Some(flag) = self.flag.upgrade() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ownership")
    }
}

/// Byte counter with a speed window
#[derive(Debug, Default)]
pub struct RateCounter {
    total: AtomicU64,
    window: Mutex<Option<(Instant, u64)>>,
}

impl RateCounter {
    pub fn add(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Bytes per second since the previous call, minimum window 1s
    pub fn speed(&self) -> u64 {
        let total = self.total();
        let mut window = self.window.lock().unwrap();
        match *window {
            Some((start, base)) => {
                let elapsed = start.elapsed();
                if elapsed.as_millis() < 1000 {
                    return 0;
                }
                *window = Some((Instant::now(), total));
                (total - base) * 1000 / elapsed.as_millis() as u64
            }
            None => {
                *window = Some((Instant::now(), total));
                0
            }
        }
    }
}

/// Bookkeeping shared by every concrete source
pub struct SourceState {
    source_id: u64,
    create_stamp: u64,
    alive: Instant,
    rate: [RateCounter; 2],
    owned: Arc<AtomicBool>,
    listener: Mutex<Weak<dyn MediaSourceEvent>>,
    weak_self: Mutex<Weak<dyn MediaSource>>,
    registry: Weak<MediaRegistry>,
    pub(crate) none_reader_timer: Mutex<Option<tokio::task::AbortHandle>>,
}

impl SourceState {
    pub fn new(registry: &Arc<MediaRegistry>) -> Self {
        Self {
            source_id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            create_stamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            alive: Instant::now(),
            rate: [RateCounter::default(), RateCounter::default()],
            owned: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(Weak::<NullListener>::new() as Weak<dyn MediaSourceEvent>),
            weak_self: Mutex::new(Weak::<NullSource>::new() as Weak<dyn MediaSource>),
            registry: Arc::downgrade(registry),
            none_reader_timer: Mutex::new(None),
        }
    }

    /// Process-unique identity, used by the registry to ensure a source can
    /// only displace itself
    pub fn source_id(&self) -> u64 {
        self.source_id
    }

    /// Creation time, unix seconds
    pub fn create_stamp(&self) -> u64 {
        self.create_stamp
    }

    /// Seconds alive; monotonic, immune to wall-clock changes
    pub fn alive_secs(&self) -> u64 {
        self.alive.elapsed().as_secs()
    }

    pub fn registry(&self) -> Option<Arc<MediaRegistry>> {
        self.registry.upgrade()
    }

    /// Claim exclusive ownership. The first caller gets a guard; everyone
    /// else gets `None` until that guard drops.
    pub fn acquire_ownership(&self) -> Option<Ownership> {
        self.owned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Ownership { flag: Arc::downgrade(&self.owned) })
    }

    pub fn add_bytes(&self, track: TrackType, bytes: u64) {
        self.rate[track.index()].add(bytes);
    }

    /// Total bytes for one track, or both when `track` is `None`
    pub fn total_bytes(&self, track: Option<TrackType>) -> u64 {
        match track {
            Some(track) => self.rate[track.index()].total(),
            None => self.rate[0].total() + self.rate[1].total(),
        }
    }

    pub fn bytes_speed(&self, track: Option<TrackType>) -> u64 {
        match track {
            Some(track) => self.rate[track.index()].speed(),
            None => self.rate[0].speed() + self.rate[1].speed(),
        }
    }

    pub fn set_listener(&self, listener: Weak<dyn MediaSourceEvent>) {
        *self.listener.lock().unwrap() = listener;
    }

    pub fn listener(&self) -> Option<Arc<dyn MediaSourceEvent>> {
        self.listener.lock().unwrap().upgrade()
    }

    pub(crate) fn set_weak_self(&self, weak: Weak<dyn MediaSource>) {
        *self.weak_self.lock().unwrap() = weak;
    }

    pub(crate) fn weak_self(&self) -> Weak<dyn MediaSource> {
        self.weak_self.lock().unwrap().clone()
    }
}

struct NullListener;
impl MediaSourceEvent for NullListener {}

struct NullSource;
impl MediaSource for NullSource {
    fn schema(&self) -> &str {
        ""
    }
    fn tuple(&self) -> &MediaTuple {
        unreachable!("null source has no identity")
    }
    fn state(&self) -> &SourceState {
        unreachable!("null source has no state")
    }
    fn reader_count(&self) -> usize {
        0
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Abstract handle for a live stream
pub trait MediaSource: Send + Sync + 'static {
    /// Registry schema this source lives under, e.g. `rtsp`
    fn schema(&self) -> &str;

    fn tuple(&self) -> &MediaTuple;

    fn state(&self) -> &SourceState;

    /// Readers attached to this source directly
    fn reader_count(&self) -> usize;

    /// Downcast seam for protocol-specific sources
    fn as_any(&self) -> &dyn Any;

    /// Owning-downcast seam; implementations return `self`
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl dyn MediaSource {
    pub fn url(&self) -> String {
        format!("{}://{}", self.schema(), self.tuple().short_url())
    }

    /// Readers across every representation of the stream, per the listener;
    /// falls back to the direct count
    pub fn total_reader_count(&self) -> usize {
        match self.state().listener() {
            Some(listener) => listener.total_reader_count(self),
            None => self.reader_count(),
        }
    }

    pub fn origin_type(&self) -> MediaOriginType {
        self.state()
            .listener()
            .map(|l| l.origin_type(self))
            .unwrap_or(MediaOriginType::Unknown)
    }

    pub fn origin_url(&self) -> String {
        match self.state().listener() {
            Some(listener) => {
                let url = listener.origin_url(self);
                if url.is_empty() {
                    self.url()
                } else {
                    url
                }
            }
            None => self.url(),
        }
    }

    pub fn origin_sock(&self) -> Option<SessionInfo> {
        self.state().listener().and_then(|l| l.origin_sock(self))
    }

    pub fn seek_to(&self, stamp_ms: u32) -> bool {
        self.state().listener().map(|l| l.seek_to(self, stamp_ms)).unwrap_or(false)
    }

    pub fn pause(&self, paused: bool) -> bool {
        self.state().listener().map(|l| l.pause(self, paused)).unwrap_or(false)
    }

    pub fn speed(&self, speed: f32) -> bool {
        self.state().listener().map(|l| l.speed(self, speed)).unwrap_or(false)
    }

    /// Ask the owner to close the stream. `force` closes even while readers
    /// are attached.
    pub fn close(&self, force: bool) -> bool {
        let listener = match self.state().listener() {
            Some(listener) => listener,
            None => return false,
        };
        if !force && self.total_reader_count() > 0 {
            return false;
        }
        listener.close(self)
    }

    pub fn loss_rate(&self, track: TrackType) -> Option<f32> {
        self.state().listener().and_then(|l| l.loss_rate(self, track))
    }

    pub fn get_muxer(&self) -> Option<MuxerHandle> {
        self.state().listener().and_then(|l| l.get_muxer(self))
    }

    pub fn get_rtp_process(&self) -> Option<DynHandle> {
        self.state().listener().and_then(|l| l.get_rtp_process(self))
    }

    pub fn media_tracks(&self, ready_only: bool) -> Vec<TrackDescriptor> {
        self.state()
            .listener()
            .map(|l| l.media_tracks(self, ready_only))
            .unwrap_or_default()
    }

    pub fn setup_record(&self, kind: RecordType, start: bool, path: &str, max_secs: usize) -> bool {
        match self.state().listener() {
            Some(listener) => listener.setup_record(self, kind, start, path, max_secs),
            None => {
                tracing::warn!(url = %self.url(), "setup_record without listener");
                false
            }
        }
    }

    pub fn is_recording(&self, kind: RecordType) -> bool {
        self.state().listener().map(|l| l.is_recording(self, kind)).unwrap_or(false)
    }

    pub fn start_send_rtp(&self, args: SendRtpArgs, cb: SendRtpCallback) {
        match self.state().listener() {
            Some(listener) => listener.start_send_rtp(self, args, cb),
            None => cb(Err(Error::Internal("event listener not set yet".into()))),
        }
    }

    pub fn stop_send_rtp(&self, ssrc: &str) -> bool {
        self.state().listener().map(|l| l.stop_send_rtp(self, ssrc)).unwrap_or(false)
    }

    /// Owner task handle; must be implemented by the listener
    pub fn owner_poller(&self) -> Result<tokio::runtime::Handle> {
        match self.state().listener() {
            Some(listener) => listener.owner_poller(self),
            None => Err(Error::NotImplemented("owner_poller")),
        }
    }

    /// Reader count changed by `size`; routes through the listener so owners
    /// can veto or augment the default auto-close policy
    pub fn on_reader_changed(&self, size: usize) {
        match self.state().listener() {
            Some(listener) => listener.on_reader_changed(self, size),
            None => default_reader_policy(self, size),
        }
    }
}
