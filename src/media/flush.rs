//! Merge-write flush policy
//!
//! Decides when the RTP accumulated for a stream is handed to the ring (and
//! ultimately the socket). Batching amortises syscalls; the rules below cap
//! how long data may sit in the batch.

/// Stateful flush decider, one per source
///
/// Tracks the stamp of the last flush separately for video and audio.
#[derive(Debug, Default)]
pub struct FlushPolicy {
    last_stamp: [u64; 2],
}

/// Packets per batch cap; sendmsg-style interfaces top out around this many
const MAX_CACHE_SIZE: usize = 1024;

impl FlushPolicy {
    /// Should the pending batch (of `cache_size` packets, about to include a
    /// packet stamped `new_stamp` ms) be flushed first?
    ///
    /// - a video key frame always flushes, so each GOP starts a batch;
    /// - a stamp rollback beyond 500 ms flushes (seek);
    /// - with merge-write off (`merge_write_ms == 0`), any stamp change
    ///   flushes;
    /// - with merge-write on, exceeding the window flushes;
    /// - a full cache always flushes.
    pub fn is_flushable(&mut self, is_video: bool, is_key: bool, new_stamp: u64, cache_size: usize, merge_write_ms: u64) -> bool {
        let idx = usize::from(is_video);
        let last_stamp = self.last_stamp[idx];

        let flush = if is_key && is_video {
            true
        } else if new_stamp + 500 < last_stamp {
            // Stamp rollback beyond PTS wobble, likely a seek
            true
        } else if merge_write_ms == 0 {
            last_stamp != new_stamp || cache_size >= MAX_CACHE_SIZE
        } else {
            new_stamp > last_stamp + merge_write_ms || cache_size >= MAX_CACHE_SIZE
        };

        if flush {
            self.last_stamp[idx] = new_stamp;
        }
        flush
    }
}
