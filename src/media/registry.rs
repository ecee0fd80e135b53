//! Media source registry
//!
//! A process-wide directory of live streams keyed by
//! `schema → vhost → app → stream`, holding weak references only. Sources
//! register on creation and unregister (or are swept as expired) on drop;
//! lookups never keep a stream alive.
//!
//! One mutex guards the whole structure. Critical sections only walk the
//! map; listener callbacks, hook invocations and the `MediaChanged`
//! broadcast all run after the lock is released, strictly after the
//! mutation is visible.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::hooks::{CloseHandle, MediaHooks, SessionInfo};
use crate::media::config::RegistryConfig;
use crate::media::info::{schema as schemas, MediaInfo, MediaTuple, DEFAULT_VHOST};
use crate::media::source::MediaSource;

/// Registry failure modes
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("media source already existed: {url}")]
    AlreadyExists { url: String },
}

/// Registration change, broadcast to waiters after the map mutation
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub regist: bool,
    pub schema: String,
    pub tuple: MediaTuple,
}

/// On-demand factory: build (and register) a source for a missing stream
pub type VodFactory = Arc<dyn Fn(&str, &MediaTuple) -> Option<Arc<dyn MediaSource>> + Send + Sync>;

struct Leaf {
    source_id: u64,
    source: Weak<dyn MediaSource>,
}

type StreamMap = HashMap<String, Leaf>;
type AppMap = HashMap<String, StreamMap>;
type VhostMap = HashMap<String, AppMap>;
type SchemaMap = HashMap<String, VhostMap>;

/// The directory itself; create once at server start
pub struct MediaRegistry {
    config: RegistryConfig,
    hooks: Arc<dyn MediaHooks>,
    map: Mutex<SchemaMap>,
    events: broadcast::Sender<RegistryEvent>,
    vod_factory: Mutex<Option<VodFactory>>,
}

impl MediaRegistry {
    pub fn new(config: RegistryConfig, hooks: Arc<dyn MediaHooks>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            hooks,
            map: Mutex::new(HashMap::new()),
            events,
            vod_factory: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<dyn MediaHooks> {
        &self.hooks
    }

    /// Subscribe to registration changes
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Install the MP4 on-demand factory consulted by `find` misses
    pub fn set_vod_factory(&self, factory: VodFactory) {
        *self.vod_factory.lock().unwrap() = Some(factory);
    }

    /// Expose a source under its `(schema, vhost, app, stream)` key.
    ///
    /// Idempotent for the same instance. Fails when a distinct live source
    /// already owns the slot; an expired slot is silently reclaimed.
    pub fn register(&self, source: &Arc<dyn MediaSource>) -> Result<(), RegistryError> {
        let id = source.state().source_id();
        let tuple = source.tuple();
        {
            let mut map = self.map.lock().unwrap();
            let leaf = map
                .entry(source.schema().to_string())
                .or_default()
                .entry(tuple.vhost.clone())
                .or_default()
                .entry(tuple.app.clone())
                .or_default()
                .entry(tuple.stream.clone());
            match leaf {
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    if let Some(live) = slot.get().source.upgrade() {
                        if live.state().source_id() == id {
                            return Ok(());
                        }
                        return Err(RegistryError::AlreadyExists {
                            url: (&**source).url(),
                        });
                    }
                    slot.insert(Leaf { source_id: id, source: Arc::downgrade(source) });
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(Leaf { source_id: id, source: Arc::downgrade(source) });
                }
            }
        }
        source.state().set_weak_self(Arc::downgrade(source));
        self.emit(true, &**source);
        Ok(())
    }

    /// Remove a source's leaf, but never a replacement that took the slot
    /// after this instance. Empty parent maps are pruned bottom-up.
    pub fn unregister(&self, source: &dyn MediaSource) -> bool {
        let id = source.state().source_id();
        let tuple = source.tuple();
        let removed = {
            let mut map = self.map.lock().unwrap();
            remove_leaf(&mut map, source.schema(), tuple, id)
        };
        if removed {
            self.emit(false, source);
        }
        removed
    }

    fn emit(&self, regist: bool, source: &dyn MediaSource) {
        if let Some(listener) = source.state().listener() {
            listener.on_regist(source, regist);
        }
        self.hooks.on_media_changed(regist, source);
        let _ = self.events.send(RegistryEvent {
            regist,
            schema: source.schema().to_string(),
            tuple: source.tuple().clone(),
        });
        tracing::info!(url = %source.url(), regist, "media registry changed");
    }

    /// Exact lookup. `from_mp4` consults the on-demand factory on a miss
    /// (never for HLS).
    pub fn find(&self, schema: &str, vhost: &str, app: &str, stream: &str, from_mp4: bool) -> Option<Arc<dyn MediaSource>> {
        let vhost = self.normalize_vhost(vhost);
        if app.is_empty() || stream.is_empty() {
            // Without a full key this would be traversal, not lookup
            return None;
        }

        let found = {
            let map = self.map.lock().unwrap();
            map.get(schema)
                .and_then(|vm| vm.get(vhost.as_ref()))
                .and_then(|am| am.get(app))
                .and_then(|sm| sm.get(stream))
                .and_then(|leaf| leaf.source.upgrade())
        };
        if found.is_some() || !from_mp4 || schema == schemas::HLS {
            return found;
        }
        let tuple = MediaTuple::new(vhost.into_owned(), app, stream);
        let factory = self.vod_factory.lock().unwrap().clone();
        let built = factory.and_then(|factory| factory(schema, &tuple));
        match built {
            // The factory registers the source itself; `_built` must stay
            // alive through the second lookup or the weak ref expires
            Some(_built) => self.find(schema, &tuple.vhost, app, stream, false),
            None => None,
        }
    }

    /// Schema-less lookup, fanning out in the well-known schema order
    pub fn find_any_schema(&self, vhost: &str, app: &str, stream: &str, from_mp4: bool) -> Option<Arc<dyn MediaSource>> {
        schemas::ALL
            .iter()
            .find_map(|schema| self.find(schema, vhost, app, stream, from_mp4))
    }

    /// Visit live sources. Empty keys match every entry at that level.
    /// Matches are collected under the lock and visited outside it.
    pub fn for_each<F>(&self, schema: &str, vhost: &str, app: &str, stream: &str, mut cb: F)
    where
        F: FnMut(Arc<dyn MediaSource>),
    {
        let matched: Vec<Arc<dyn MediaSource>> = {
            let map = self.map.lock().unwrap();
            let mut out = Vec::new();
            for (_, vhosts) in map.iter().filter(|(k, _)| key_matches(k, schema)) {
                for (_, apps) in vhosts.iter().filter(|(k, _)| key_matches(k, vhost)) {
                    for (_, streams) in apps.iter().filter(|(k, _)| key_matches(k, app)) {
                        for (_, leaf) in streams.iter().filter(|(k, _)| key_matches(k, stream)) {
                            if let Some(src) = leaf.source.upgrade() {
                                out.push(src);
                            }
                        }
                    }
                }
            }
            out
        };
        for src in matched {
            cb(src);
        }
    }

    /// As `find`, but when the stream is absent, wait up to the configured
    /// window for it to register. Exactly one outcome is produced, whichever
    /// of registration, external close or timeout comes first.
    ///
    /// The not-found hook fires once, giving the application the chance to
    /// start pulling the stream or to abort the wait.
    pub async fn find_async(self: &Arc<Self>, info: &MediaInfo, session: &SessionInfo) -> Option<Arc<dyn MediaSource>> {
        let tuple = &info.tuple;
        if let Some(src) = self.find(&info.schema, &tuple.vhost, &tuple.app, &tuple.stream, true) {
            return Some(src);
        }

        let mut events = self.subscribe();
        let (close_handle, closed) = CloseHandle::new();
        self.hooks.on_not_found_stream(info, session, close_handle);

        // The hook may have published synchronously; re-check now that the
        // subscription is live, so nothing can slip between the two
        if let Some(src) = self.find(&info.schema, &tuple.vhost, &tuple.app, &tuple.stream, true) {
            return Some(src);
        }

        let deadline = tokio::time::sleep(self.config.max_stream_wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::debug!(url = %info.short_url(), "wait for stream timed out");
                    return None;
                }
                _ = closed.notified() => {
                    tracing::debug!(url = %info.short_url(), "wait for stream closed externally");
                    return None;
                }
                event = events.recv() => match event {
                    Ok(event) if event.regist
                        && event.schema == info.schema
                        && tuple_matches(&event.tuple, tuple) =>
                    {
                        tracing::debug!(url = %info.short_url(), "stream registered while waiting");
                        return self.find(&info.schema, &tuple.vhost, &tuple.app, &tuple.stream, true);
                    }
                    Ok(_) => continue,
                    // Missed events: the one we want may be among them
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(src) = self.find(&info.schema, &tuple.vhost, &tuple.app, &tuple.stream, true) {
                            return Some(src);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    fn normalize_vhost<'a>(&self, vhost: &'a str) -> std::borrow::Cow<'a, str> {
        if vhost.is_empty() || !self.config.enable_vhost {
            std::borrow::Cow::Borrowed(DEFAULT_VHOST)
        } else {
            std::borrow::Cow::Borrowed(vhost)
        }
    }
}

fn key_matches(key: &str, filter: &str) -> bool {
    filter.is_empty() || key == filter
}

/// Identity match ignoring the query-string params
fn tuple_matches(a: &MediaTuple, b: &MediaTuple) -> bool {
    a.vhost == b.vhost && a.app == b.app && a.stream == b.stream
}

fn remove_leaf(map: &mut SchemaMap, schema: &str, tuple: &MediaTuple, id: u64) -> bool {
    let Some(vhosts) = map.get_mut(schema) else { return false };
    let Some(apps) = vhosts.get_mut(&tuple.vhost) else { return false };
    let Some(streams) = apps.get_mut(&tuple.app) else { return false };

    let mut hit = false;
    if let Some(leaf) = streams.get(&tuple.stream) {
        // Expired or self: removable. A live replacement is never yanked.
        let removable = match leaf.source.upgrade() {
            Some(live) => live.state().source_id() == id,
            None => true,
        };
        if removable {
            streams.remove(&tuple.stream);
            hit = true;
        }
    }
    if streams.is_empty() {
        apps.remove(&tuple.app);
    }
    if apps.is_empty() {
        vhosts.remove(&tuple.vhost);
    }
    if vhosts.is_empty() {
        map.remove(schema);
    }
    hit
}

/// Delay-drop holder used for the pusher reconnect grace window: keeps the
/// source (and its registration) alive for `grace`, then lets it go unless
/// a reconnecting pusher took ownership in the meantime.
pub fn delayed_release(source: Arc<dyn MediaSource>, grace: Duration) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            drop(source);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{DefaultHooks, PublishOption};
    use crate::rtsp::source::RtspMediaSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> Arc<MediaRegistry> {
        MediaRegistry::new(RegistryConfig::default(), Arc::new(DefaultHooks))
    }

    fn make_source(registry: &Arc<MediaRegistry>, stream: &str) -> Arc<RtspMediaSource> {
        RtspMediaSource::new(
            registry,
            MediaTuple::new(DEFAULT_VHOST, "live", stream),
            "v=0\r\n".to_string(),
            PublishOption::default(),
        )
    }

    fn session_info() -> SessionInfo {
        SessionInfo {
            session_id: 7,
            peer_addr: "10.0.0.2:40000".parse().unwrap(),
            local_addr: "10.0.0.1:554".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn register_then_find() {
        let registry = registry();
        let src = make_source(&registry, "cam");
        let dyn_src: Arc<dyn MediaSource> = src.clone();
        registry.register(&dyn_src).unwrap();

        let found = registry.find("rtsp", DEFAULT_VHOST, "live", "cam", false);
        assert!(found.is_some());
        assert_eq!(found.unwrap().state().source_id(), src.state().source_id());
    }

    #[tokio::test]
    async fn register_is_idempotent_but_exclusive() {
        let registry = registry();
        let first = make_source(&registry, "cam");
        let first_dyn: Arc<dyn MediaSource> = first.clone();
        registry.register(&first_dyn).unwrap();
        registry.register(&first_dyn).unwrap();

        let second = make_source(&registry, "cam");
        let second_dyn: Arc<dyn MediaSource> = second;
        assert!(matches!(
            registry.register(&second_dyn),
            Err(RegistryError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn expired_slot_is_reclaimed() {
        let registry = registry();
        {
            let src = make_source(&registry, "cam");
            let dyn_src: Arc<dyn MediaSource> = src;
            registry.register(&dyn_src).unwrap();
        }
        // First source is gone; same key registers cleanly
        let src = make_source(&registry, "cam");
        let dyn_src: Arc<dyn MediaSource> = src;
        registry.register(&dyn_src).unwrap();
    }

    #[tokio::test]
    async fn unregister_prunes_empty_parents() {
        let registry = registry();
        let src = make_source(&registry, "cam");
        let dyn_src: Arc<dyn MediaSource> = src.clone();
        registry.register(&dyn_src).unwrap();
        assert!(registry.unregister(&*dyn_src));

        let mut seen = 0;
        registry.for_each("", "", "", "", |_| seen += 1);
        assert_eq!(seen, 0);
        // Internal maps fully pruned
        assert!(registry.map.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregister_never_yanks_replacement() {
        let registry = registry();
        let first = make_source(&registry, "cam");
        let first_dyn: Arc<dyn MediaSource> = first.clone();
        registry.register(&first_dyn).unwrap();

        // The slot moves on: first is dropped from the map, second takes it
        assert!(registry.unregister(&*first_dyn));
        let second = make_source(&registry, "cam");
        let second_dyn: Arc<dyn MediaSource> = second.clone();
        registry.register(&second_dyn).unwrap();

        // A late unregister from the first instance must not remove second
        assert!(!registry.unregister(&*first_dyn));
        assert!(registry.find("rtsp", DEFAULT_VHOST, "live", "cam", false).is_some());
    }

    #[tokio::test]
    async fn drop_unregisters() {
        let registry = registry();
        {
            let src = make_source(&registry, "cam");
            let dyn_src: Arc<dyn MediaSource> = src;
            registry.register(&dyn_src).unwrap();
        }
        assert!(registry.find("rtsp", DEFAULT_VHOST, "live", "cam", false).is_none());
    }

    #[tokio::test]
    async fn for_each_prefix_traversal() {
        let registry = registry();
        let cam1 = make_source(&registry, "cam1");
        let cam1_dyn: Arc<dyn MediaSource> = cam1.clone();
        registry.register(&cam1_dyn).unwrap();
        let cam2 = make_source(&registry, "cam2");
        let cam2_dyn: Arc<dyn MediaSource> = cam2.clone();
        registry.register(&cam2_dyn).unwrap();

        let mut streams = Vec::new();
        registry.for_each("rtsp", "", "live", "", |src| streams.push(src.tuple().stream.clone()));
        streams.sort();
        assert_eq!(streams, vec!["cam1", "cam2"]);

        let mut count = 0;
        registry.for_each("rtmp", "", "", "", |_| count += 1);
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn find_async_resolves_existing() {
        let registry = registry();
        let src = make_source(&registry, "cam");
        let dyn_src: Arc<dyn MediaSource> = src.clone();
        registry.register(&dyn_src).unwrap();

        let mut info = MediaInfo::parse("rtsp://127.0.0.1/live/cam", false);
        info.schema = "rtsp".to_string();
        let found = registry.find_async(&info, &session_info()).await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn find_async_waits_for_registration() {
        let registry = registry();
        let mut info = MediaInfo::parse("rtsp://127.0.0.1/live/cam", false);
        info.schema = "rtsp".to_string();

        let registry_clone = registry.clone();
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let src = make_source(&registry_clone, "cam");
            let dyn_src: Arc<dyn MediaSource> = src.clone();
            registry_clone.register(&dyn_src).unwrap();
            // Keep the source alive past the waiter's lookup
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(src);
        });

        let found = registry.find_async(&info, &session_info()).await;
        assert!(found.is_some());
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn find_async_times_out() {
        let config = RegistryConfig::default().max_stream_wait(Duration::from_millis(50));
        let registry = MediaRegistry::new(config, Arc::new(DefaultHooks));
        let mut info = MediaInfo::parse("rtsp://127.0.0.1/live/nope", false);
        info.schema = "rtsp".to_string();

        let found = registry.find_async(&info, &session_info()).await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn find_async_close_handle_aborts() {
        struct CloseImmediately;
        impl MediaHooks for CloseImmediately {
            fn on_not_found_stream(&self, _info: &MediaInfo, _session: &SessionInfo, close: CloseHandle) {
                close.close();
            }
        }

        let config = RegistryConfig::default().max_stream_wait(Duration::from_secs(30));
        let registry = MediaRegistry::new(config, Arc::new(CloseImmediately));
        let mut info = MediaInfo::parse("rtsp://127.0.0.1/live/nope", false);
        info.schema = "rtsp".to_string();

        let started = std::time::Instant::now();
        let found = registry.find_async(&info, &session_info()).await;
        assert!(found.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn vod_factory_consulted_on_miss() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry();
        let factory_registry = Arc::downgrade(&registry);
        let factory_calls = calls.clone();
        registry.set_vod_factory(Arc::new(move |schema, tuple| {
            factory_calls.fetch_add(1, Ordering::SeqCst);
            let registry = factory_registry.upgrade()?;
            let src = RtspMediaSource::new(&registry, tuple.clone(), String::new(), PublishOption::default());
            let dyn_src: Arc<dyn MediaSource> = src;
            registry.register(&dyn_src).ok()?;
            let _ = schema;
            Some(dyn_src)
        }));

        // Whether a recording exists is the factory's call, not the app
        // name's: any app consults it on a miss
        assert!(registry.find("rtsp", DEFAULT_VHOST, "live", "vodfile", true).is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.find("rtsp", DEFAULT_VHOST, "record", "vodfile2", true).is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Plain lookups never trigger on-demand
        assert!(registry.find("rtsp", DEFAULT_VHOST, "live", "vodfile3", false).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Neither does HLS, even with from_mp4 set
        assert!(registry.find("hls", DEFAULT_VHOST, "record", "vodfile4", true).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
