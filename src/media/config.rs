//! Registry configuration

use std::time::Duration;

/// Tunables for the media registry and source lifecycle
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a waiting request (player before pusher) may block before
    /// resolving empty
    pub max_stream_wait: Duration,

    /// Delay between the last reader detaching and the no-reader decision
    pub stream_none_reader_delay: Duration,

    /// Default grace window for pusher reconnect; per-publish hooks may
    /// override it
    pub continue_push: Duration,

    /// Resolve vhosts from URLs; off collapses everything to the default
    /// vhost
    pub enable_vhost: bool,

    /// App name reserved for MP4 on-demand; sources under it close
    /// unconditionally once unwatched
    pub record_app: String,

    /// Capacity of the per-source fan-out channel, in RTP batches
    pub broadcast_capacity: usize,

    /// Byte cap of the per-source GOP cache
    pub max_gop_cache: usize,

    /// Merge-write window in milliseconds; 0 flushes on every stamp change
    pub merge_write_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_stream_wait: Duration::from_secs(15),
            stream_none_reader_delay: Duration::from_secs(20),
            continue_push: Duration::from_secs(15),
            enable_vhost: false,
            record_app: "record".to_string(),
            broadcast_capacity: 256,
            max_gop_cache: 4 * 1024 * 1024,
            merge_write_ms: 0,
        }
    }
}

impl RegistryConfig {
    /// Set the maximum wait-for-stream window
    pub fn max_stream_wait(mut self, wait: Duration) -> Self {
        self.max_stream_wait = wait;
        self
    }

    /// Set the no-reader close delay
    pub fn stream_none_reader_delay(mut self, delay: Duration) -> Self {
        self.stream_none_reader_delay = delay;
        self
    }

    /// Set the default pusher reconnect grace window
    pub fn continue_push(mut self, grace: Duration) -> Self {
        self.continue_push = grace;
        self
    }

    /// Enable virtual hosting
    pub fn enable_vhost(mut self, enable: bool) -> Self {
        self.enable_vhost = enable;
        self
    }

    /// Set the merge-write window
    pub fn merge_write_ms(mut self, window: u64) -> Self {
        self.merge_write_ms = window;
        self
    }
}
