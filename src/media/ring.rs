//! RTP fan-out ring
//!
//! Each source owns one [`RtpRing`]. The pusher side writes batches of RTP;
//! every attached [`RingReader`] receives them in FIFO order through a
//! broadcast channel, so all readers share the same allocation. A bounded
//! GOP cache keeps the batches since the last key frame for late joiners.
//!
//! Readers hold only a weak link back to the source; when the source drops,
//! the channel closes and [`RingReader::recv`] reports detachment so the
//! owning session can shut down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::broadcast;

use crate::media::source::MediaSource;
use crate::rtp::packet::RtpPacket;

/// One flush unit: the RTP packets between two flush decisions
pub type RtpBatch = Arc<Vec<RtpPacket>>;

/// Reader-side terminal condition
#[derive(Debug, PartialEq, Eq)]
pub struct RingDetached;

struct GopCache {
    batches: VecDeque<RtpBatch>,
    bytes: usize,
    max_bytes: usize,
}

impl GopCache {
    fn push(&mut self, batch: &RtpBatch, key_pos: bool) {
        if key_pos {
            self.batches.clear();
            self.bytes = 0;
        }
        let size: usize = batch.iter().map(|rtp| rtp.size()).sum();
        self.batches.push_back(batch.clone());
        self.bytes += size;
        while self.bytes > self.max_bytes {
            match self.batches.pop_front() {
                Some(old) => self.bytes -= old.iter().map(|rtp| rtp.size()).sum::<usize>(),
                None => break,
            }
        }
    }
}

/// Bounded multi-reader RTP ring with GOP catch-up
pub struct RtpRing {
    tx: broadcast::Sender<RtpBatch>,
    gop: Mutex<GopCache>,
    readers: AtomicUsize,
}

impl RtpRing {
    pub fn new(capacity: usize, max_gop_bytes: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            gop: Mutex::new(GopCache {
                batches: VecDeque::new(),
                bytes: 0,
                max_bytes: max_gop_bytes,
            }),
            readers: AtomicUsize::new(0),
        }
    }

    /// Publish one batch to every reader. `key_pos` marks a batch opening
    /// with a video key frame; it restarts the GOP cache.
    pub fn write(&self, batch: RtpBatch, key_pos: bool) {
        // The cache lock also serializes send against attach, so a late
        // joiner sees each batch exactly once: in the snapshot or live
        let mut gop = self.gop.lock().unwrap();
        gop.push(&batch, key_pos);
        let _ = self.tx.send(batch);
    }

    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Attach a reader. `use_gop` replays the cached GOP before live data.
    pub fn attach(self: &Arc<Self>, use_gop: bool, source: Weak<dyn MediaSource>) -> RingReader {
        let (rx, catchup) = {
            let gop = self.gop.lock().unwrap();
            let rx = self.tx.subscribe();
            let catchup = if use_gop {
                gop.batches.iter().cloned().collect()
            } else {
                VecDeque::new()
            };
            (rx, catchup)
        };
        let count = self.readers.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(src) = source.upgrade() {
            let src: &dyn MediaSource = &*src;
            src.on_reader_changed(count);
        }
        RingReader {
            // Weak, so a lingering reader cannot keep a dropped source's
            // channel open and mask its own detachment
            ring: Arc::downgrade(self),
            rx,
            catchup,
            source,
        }
    }
}

/// Per-subscriber cursor into a ring
pub struct RingReader {
    ring: Weak<RtpRing>,
    rx: broadcast::Receiver<RtpBatch>,
    catchup: VecDeque<RtpBatch>,
    source: Weak<dyn MediaSource>,
}

impl RingReader {
    /// Next batch in order; cached GOP first, then live. Slow readers that
    /// fall off the channel skip ahead rather than detach.
    pub async fn recv(&mut self) -> std::result::Result<RtpBatch, RingDetached> {
        if let Some(batch) = self.catchup.pop_front() {
            return Ok(batch);
        }
        loop {
            match self.rx.recv().await {
                Ok(batch) => return Ok(batch),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "rtp reader lagging, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(RingDetached),
            }
        }
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        let count = match self.ring.upgrade() {
            Some(ring) => ring.readers.fetch_sub(1, Ordering::AcqRel) - 1,
            None => return,
        };
        if let Some(src) = self.source.upgrade() {
            let src: &dyn MediaSource = &*src;
            src.on_reader_changed(count);
        }
    }
}
