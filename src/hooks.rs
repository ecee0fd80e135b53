//! Application hooks
//!
//! The engine is generic over a [`MediaHooks`] implementation the same way
//! the server core is generic over its connection handler: protocol flow is
//! fixed, policy is injected. Authentication-flavoured hooks return a boxed
//! future so an implementation can consult an external service; the default
//! bodies resolve immediately with "allow".
//!
//! Contract notes:
//! - publish/play hooks resolve with `Err(reason)` to reject; an empty-handed
//!   `Ok` allows.
//! - [`MediaHooks::on_rtsp_auth`] resolving to `None` means nobody services
//!   credential lookup; the session logs a warning and lets the peer in, so a
//!   half-configured deployment fails open rather than dead.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::media::info::{MediaInfo, MediaTuple};
use crate::media::source::{MediaOriginType, MediaSource};

/// Boxed future returned by asynchronous hooks
pub type HookFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Wrap an already-known value for a hook return
pub fn resolved<T: Send + 'static>(value: T) -> HookFuture<T> {
    Box::pin(std::future::ready(value))
}

/// Identity of the session a hook fires for
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: u64,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Per-publish options resolved by the publish hook
#[derive(Debug, Clone)]
pub struct PublishOption {
    /// Grace window after a non-clean pusher disconnect during which the
    /// source stays registered and ownership can be re-acquired
    pub continue_push_ms: u64,
    /// Close the source automatically once its last reader detaches
    pub auto_close: bool,
}

impl Default for PublishOption {
    fn default() -> Self {
        Self { continue_push_ms: 15_000, auto_close: false }
    }
}

/// Credential material resolved by the auth hook
///
/// `encrypted` means the password is already `MD5(user:realm:pwd)`; digest
/// verification uses it as HA1 directly. Basic verification requires
/// cleartext and rejects encrypted material.
#[derive(Debug, Clone)]
pub struct AuthPassword {
    pub encrypted: bool,
    pub password: String,
}

impl AuthPassword {
    pub fn cleartext(password: impl Into<String>) -> Self {
        Self { encrypted: false, password: password.into() }
    }
}

/// Handle given to [`MediaHooks::on_not_found_stream`]
///
/// Calling [`close`](Self::close) aborts the wait and fails the pending
/// request immediately instead of letting it run out the wait window.
#[derive(Clone)]
pub struct CloseHandle {
    notify: Arc<Notify>,
}

impl CloseHandle {
    pub(crate) fn new() -> (Self, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        (Self { notify: notify.clone() }, notify)
    }

    pub fn close(&self) {
        // notify_one stores a permit, so closing before the waiter is parked
        // still aborts the wait
        self.notify.notify_one();
    }
}

/// Policy surface of the engine
///
/// All methods have defaults; a unit struct is a valid do-nothing
/// implementation.
pub trait MediaHooks: Send + Sync + 'static {
    /// RTSP-specific authentication realm for this stream. `None` or an
    /// empty realm falls through to the generic play hook.
    fn on_get_rtsp_realm(&self, info: &MediaInfo, session: &SessionInfo) -> HookFuture<Option<String>> {
        let _ = (info, session);
        resolved(None)
    }

    /// Look up the password for `user` under `realm`. `needs_cleartext` is
    /// set for Basic authentication, where a pre-hashed password cannot be
    /// compared.
    fn on_rtsp_auth(
        &self,
        info: &MediaInfo,
        realm: &str,
        user: &str,
        needs_cleartext: bool,
        session: &SessionInfo,
    ) -> HookFuture<Option<AuthPassword>> {
        let _ = (info, realm, user, needs_cleartext, session);
        resolved(None)
    }

    /// A pusher wants to publish. Resolve `Err(reason)` to reject.
    fn on_media_publish(
        &self,
        origin: MediaOriginType,
        info: &MediaInfo,
        session: &SessionInfo,
    ) -> HookFuture<std::result::Result<PublishOption, String>> {
        let _ = (origin, info, session);
        resolved(Ok(PublishOption::default()))
    }

    /// A player passed the realm gate (or no realm was configured). Resolve
    /// `Err(reason)` to reject.
    fn on_media_played(&self, info: &MediaInfo, session: &SessionInfo) -> HookFuture<std::result::Result<(), String>> {
        let _ = (info, session);
        resolved(Ok(()))
    }

    /// A source appeared in or vanished from the registry.
    fn on_media_changed(&self, regist: bool, source: &dyn MediaSource) {
        let _ = (regist, source);
    }

    /// A request referenced a stream nobody publishes. An implementation may
    /// start pulling the stream (the pending wait resolves through the
    /// registry event) or call `close.close()` to fail the request now.
    fn on_not_found_stream(&self, info: &MediaInfo, session: &SessionInfo, close: CloseHandle) {
        let _ = (info, session, close);
    }

    /// A live source has had zero readers for the configured delay and its
    /// owner did not opt into auto-close.
    fn on_stream_none_reader(&self, source: &dyn MediaSource) {
        let _ = source;
    }

    /// Reader count of a source changed.
    fn on_player_count_changed(&self, tuple: &MediaTuple, count: usize) {
        let _ = (tuple, count);
    }

    /// Session closed after moving at least the configured traffic volume.
    fn on_flow_report(&self, info: &MediaInfo, bytes: u64, duration_secs: u64, is_player: bool, session: &SessionInfo) {
        let _ = (info, bytes, duration_secs, is_player, session);
    }
}

/// Hooks implementation that accepts everything and observes nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl MediaHooks for DefaultHooks {}
