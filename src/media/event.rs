//! Source event listeners
//!
//! [`MediaSourceEvent`] is the capability set a source delegates to its
//! owner: the pusher session, an MP4 reader, a muxer. Every method takes the
//! source by reference and has a default body returning a sentinel, so
//! owners implement only what they support.
//!
//! [`EventInterceptor`] decorates a listener: it forwards each call to an
//! inner delegate when one is alive and falls back to the defaults
//! otherwise.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::hooks::SessionInfo;
use crate::media::source::{MediaOriginType, MediaSource};
use crate::media::TrackType;

/// Opaque handle to an out-of-scope collaborator
pub type DynHandle = Arc<dyn Any + Send + Sync>;

/// The slice of the owning muxer the core consumes
#[derive(Debug, Clone, Copy)]
pub struct MuxerHandle {
    /// Close the source automatically once unwatched
    pub auto_close: bool,
}

/// Recording sink kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Hls,
    Mp4,
}

/// Track description as reported to external callers
#[derive(Debug, Clone)]
pub struct TrackDescriptor {
    pub track_type: TrackType,
    pub codec: String,
    pub sample_rate: u32,
    pub ready: bool,
}

/// Arguments for forwarding a stream as raw RTP
#[derive(Debug, Clone)]
pub struct SendRtpArgs {
    pub dst_url: String,
    pub dst_port: u16,
    pub ssrc: String,
    pub is_udp: bool,
}

/// Completion callback for [`MediaSourceEvent::start_send_rtp`]; resolves
/// with the local port on success
pub type SendRtpCallback = Box<dyn FnOnce(Result<u16>) + Send>;

/// Capability set a source delegates to its owner
pub trait MediaSourceEvent: Send + Sync + 'static {
    fn origin_type(&self, sender: &dyn MediaSource) -> MediaOriginType {
        let _ = sender;
        MediaOriginType::Unknown
    }

    fn origin_url(&self, sender: &dyn MediaSource) -> String {
        sender.url()
    }

    fn origin_sock(&self, sender: &dyn MediaSource) -> Option<SessionInfo> {
        let _ = sender;
        None
    }

    /// Seek to an absolute position, milliseconds. `true` when a seek
    /// actually happened.
    fn seek_to(&self, sender: &dyn MediaSource, stamp_ms: u32) -> bool {
        let _ = (sender, stamp_ms);
        false
    }

    fn pause(&self, sender: &dyn MediaSource, paused: bool) -> bool {
        let _ = (sender, paused);
        false
    }

    fn speed(&self, sender: &dyn MediaSource, speed: f32) -> bool {
        let _ = (sender, speed);
        false
    }

    /// Tear the stream down. `true` when the owner accepted.
    fn close(&self, sender: &dyn MediaSource) -> bool {
        let _ = sender;
        false
    }

    fn total_reader_count(&self, sender: &dyn MediaSource) -> usize {
        sender.reader_count()
    }

    fn on_reader_changed(&self, sender: &dyn MediaSource, size: usize) {
        default_reader_policy(sender, size)
    }

    fn on_regist(&self, sender: &dyn MediaSource, regist: bool) {
        let _ = (sender, regist);
    }

    fn loss_rate(&self, sender: &dyn MediaSource, track: TrackType) -> Option<f32> {
        let _ = (sender, track);
        None
    }

    /// Task handle of the owning context. Must be implemented; the default
    /// fails.
    fn owner_poller(&self, sender: &dyn MediaSource) -> Result<tokio::runtime::Handle> {
        let _ = sender;
        Err(Error::NotImplemented("owner_poller"))
    }

    fn get_muxer(&self, sender: &dyn MediaSource) -> Option<MuxerHandle> {
        let _ = sender;
        None
    }

    fn get_rtp_process(&self, sender: &dyn MediaSource) -> Option<DynHandle> {
        let _ = sender;
        None
    }

    fn setup_record(&self, sender: &dyn MediaSource, kind: RecordType, start: bool, path: &str, max_secs: usize) -> bool {
        let _ = (sender, kind, start, path, max_secs);
        false
    }

    fn is_recording(&self, sender: &dyn MediaSource, kind: RecordType) -> bool {
        let _ = (sender, kind);
        false
    }

    fn media_tracks(&self, sender: &dyn MediaSource, ready_only: bool) -> Vec<TrackDescriptor> {
        let _ = (sender, ready_only);
        Vec::new()
    }

    fn start_send_rtp(&self, sender: &dyn MediaSource, args: SendRtpArgs, cb: SendRtpCallback) {
        let _ = (sender, args);
        cb(Err(Error::NotImplemented("start_send_rtp")));
    }

    fn stop_send_rtp(&self, sender: &dyn MediaSource, ssrc: &str) -> bool {
        let _ = (sender, ssrc);
        false
    }
}

/// No-reader policy used when the listener does not override
/// `on_reader_changed`
///
/// When the count hits zero, arm a one-shot re-check after the configured
/// delay. MP4 on-demand sources close unconditionally; live sources close if
/// their muxer opted into auto-close, otherwise the decision is handed to
/// the hooks. Any reader arriving before the timer fires disarms it.
pub(crate) fn default_reader_policy(sender: &dyn MediaSource, size: usize) {
    let registry = match sender.state().registry() {
        Some(registry) => registry,
        None => return,
    };
    let total = sender.total_reader_count();
    registry.hooks().on_player_count_changed(sender.tuple(), total);

    if size > 0 || total > 0 {
        if let Some(timer) = sender.state().none_reader_timer.lock().unwrap().take() {
            timer.abort();
        }
        return;
    }

    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => return,
    };

    let weak = sender.state().weak_self();
    let is_vod = sender.tuple().app == registry.config().record_app;
    let delay = registry.config().stream_none_reader_delay;
    let registry = Arc::downgrade(&registry);

    let task = runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        let source = match weak.upgrade() {
            Some(source) => source,
            None => return,
        };
        let source: &dyn MediaSource = &*source;
        if source.total_reader_count() > 0 {
            return;
        }
        if is_vod {
            tracing::warn!(url = %source.url(), "on-demand source unwatched, closing");
            source.close(false);
            return;
        }
        if source.get_muxer().map(|muxer| muxer.auto_close).unwrap_or(false) {
            tracing::warn!(url = %source.url(), "auto-close stream with no readers");
            source.close(false);
        } else if let Some(registry) = registry.upgrade() {
            registry.hooks().on_stream_none_reader(source);
        }
    });
    *sender.state().none_reader_timer.lock().unwrap() = Some(task.abort_handle());
}

/// Decorator forwarding to an inner listener when present
pub struct EventInterceptor {
    delegate: Mutex<Weak<dyn MediaSourceEvent>>,
}

impl Default for EventInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventInterceptor {
    pub fn new() -> Self {
        Self {
            delegate: Mutex::new(Weak::<NullDelegate>::new() as Weak<dyn MediaSourceEvent>),
        }
    }

    /// Install the inner listener. Delegating to oneself is rejected.
    pub fn set_delegate(&self, listener: Weak<dyn MediaSourceEvent>) -> Result<()> {
        if let Some(strong) = listener.upgrade() {
            let target = Arc::as_ptr(&strong) as *const ();
            if std::ptr::eq(target, self as *const Self as *const ()) {
                return Err(Error::InvalidArgument("can not set self as a delegate".into()));
            }
        }
        *self.delegate.lock().unwrap() = listener;
        Ok(())
    }

    pub fn delegate(&self) -> Option<Arc<dyn MediaSourceEvent>> {
        self.delegate.lock().unwrap().upgrade()
    }
}

struct NullDelegate;
impl MediaSourceEvent for NullDelegate {}

impl MediaSourceEvent for EventInterceptor {
    fn origin_type(&self, sender: &dyn MediaSource) -> MediaOriginType {
        match self.delegate() {
            Some(inner) => inner.origin_type(sender),
            None => MediaOriginType::Unknown,
        }
    }

    fn origin_url(&self, sender: &dyn MediaSource) -> String {
        match self.delegate() {
            Some(inner) => {
                let url = inner.origin_url(sender);
                if url.is_empty() {
                    sender.url()
                } else {
                    url
                }
            }
            None => sender.url(),
        }
    }

    fn origin_sock(&self, sender: &dyn MediaSource) -> Option<SessionInfo> {
        self.delegate().and_then(|inner| inner.origin_sock(sender))
    }

    fn seek_to(&self, sender: &dyn MediaSource, stamp_ms: u32) -> bool {
        self.delegate().map(|inner| inner.seek_to(sender, stamp_ms)).unwrap_or(false)
    }

    fn pause(&self, sender: &dyn MediaSource, paused: bool) -> bool {
        self.delegate().map(|inner| inner.pause(sender, paused)).unwrap_or(false)
    }

    fn speed(&self, sender: &dyn MediaSource, speed: f32) -> bool {
        self.delegate().map(|inner| inner.speed(sender, speed)).unwrap_or(false)
    }

    fn close(&self, sender: &dyn MediaSource) -> bool {
        self.delegate().map(|inner| inner.close(sender)).unwrap_or(false)
    }

    fn total_reader_count(&self, sender: &dyn MediaSource) -> usize {
        match self.delegate() {
            Some(inner) => inner.total_reader_count(sender),
            None => sender.reader_count(),
        }
    }

    fn on_reader_changed(&self, sender: &dyn MediaSource, size: usize) {
        match self.delegate() {
            Some(inner) => inner.on_reader_changed(sender, size),
            None => default_reader_policy(sender, size),
        }
    }

    fn on_regist(&self, sender: &dyn MediaSource, regist: bool) {
        if let Some(inner) = self.delegate() {
            inner.on_regist(sender, regist);
        }
    }

    fn loss_rate(&self, sender: &dyn MediaSource, track: TrackType) -> Option<f32> {
        self.delegate().and_then(|inner| inner.loss_rate(sender, track))
    }

    fn owner_poller(&self, sender: &dyn MediaSource) -> Result<tokio::runtime::Handle> {
        match self.delegate() {
            Some(inner) => inner.owner_poller(sender),
            None => Err(Error::NotImplemented("owner_poller")),
        }
    }

    fn get_muxer(&self, sender: &dyn MediaSource) -> Option<MuxerHandle> {
        self.delegate().and_then(|inner| inner.get_muxer(sender))
    }

    fn get_rtp_process(&self, sender: &dyn MediaSource) -> Option<DynHandle> {
        self.delegate().and_then(|inner| inner.get_rtp_process(sender))
    }

    fn setup_record(&self, sender: &dyn MediaSource, kind: RecordType, start: bool, path: &str, max_secs: usize) -> bool {
        self.delegate()
            .map(|inner| inner.setup_record(sender, kind, start, path, max_secs))
            .unwrap_or(false)
    }

    fn is_recording(&self, sender: &dyn MediaSource, kind: RecordType) -> bool {
        self.delegate().map(|inner| inner.is_recording(sender, kind)).unwrap_or(false)
    }

    fn media_tracks(&self, sender: &dyn MediaSource, ready_only: bool) -> Vec<TrackDescriptor> {
        self.delegate()
            .map(|inner| inner.media_tracks(sender, ready_only))
            .unwrap_or_default()
    }

    fn start_send_rtp(&self, sender: &dyn MediaSource, args: SendRtpArgs, cb: SendRtpCallback) {
        match self.delegate() {
            Some(inner) => inner.start_send_rtp(sender, args, cb),
            None => cb(Err(Error::NotImplemented("start_send_rtp"))),
        }
    }

    fn stop_send_rtp(&self, sender: &dyn MediaSource, ssrc: &str) -> bool {
        self.delegate().map(|inner| inner.stop_send_rtp(sender, ssrc)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interceptor_rejects_self_delegation() {
        let interceptor = Arc::new(EventInterceptor::new());
        let interceptor_dyn: Arc<dyn MediaSourceEvent> = interceptor.clone();
        let weak: Weak<dyn MediaSourceEvent> = Arc::downgrade(&interceptor_dyn);
        let err = interceptor.set_delegate(weak).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn interceptor_forwards_to_delegate() {
        struct Closer;
        impl MediaSourceEvent for Closer {
            fn close(&self, _sender: &dyn MediaSource) -> bool {
                true
            }
        }

        let interceptor = EventInterceptor::new();
        let closer: Arc<dyn MediaSourceEvent> = Arc::new(Closer);
        interceptor.set_delegate(Arc::downgrade(&closer)).unwrap();

        // A sender is needed only for the call shape
        let registry = crate::media::registry::MediaRegistry::new(
            crate::media::config::RegistryConfig::default(),
            Arc::new(crate::hooks::DefaultHooks),
        );
        let source = crate::rtsp::source::RtspMediaSource::new(
            &registry,
            crate::media::info::MediaTuple::new("vh", "live", "cam"),
            String::new(),
            crate::hooks::PublishOption::default(),
        );
        let sender: &dyn MediaSource = &*source;
        assert!(interceptor.close(sender));

        drop(closer);
        assert!(!interceptor.close(sender));
    }
}
