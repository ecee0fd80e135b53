//! HTTP tunnel pairing
//!
//! RTSP-over-HTTP splits one logical session across two TCP connections: a
//! GET that carries every reply plus the RTP, and a POST whose base64 body
//! is the client's request stream. The `x-sessioncookie` header binds them.
//!
//! This map holds the GET side's injection channel until the POST shows up
//! and claims it.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;

struct TunnelEntry {
    session_id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// `sessioncookie → GET session` index; one per server
#[derive(Default)]
pub struct TunnelMap {
    map: Mutex<HashMap<String, TunnelEntry>>,
}

impl TunnelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a GET session waiting for its poster
    pub fn register(&self, cookie: &str, session_id: u64, tx: mpsc::UnboundedSender<Bytes>) {
        self.map
            .lock()
            .unwrap()
            .insert(cookie.to_string(), TunnelEntry { session_id, tx });
    }

    /// Claim the GET side for a POST. The entry is consumed; a second POST
    /// with the same cookie fails.
    pub fn take(&self, cookie: &str) -> Option<mpsc::UnboundedSender<Bytes>> {
        self.map.lock().unwrap().remove(cookie).map(|entry| entry.tx)
    }

    /// Drop a GET session's entry on its way out. Only the registering
    /// session may remove it; a newer GET reusing the cookie is left alone.
    pub fn remove(&self, cookie: &str, session_id: u64) {
        let mut map = self.map.lock().unwrap();
        if map.get(cookie).map(|entry| entry.session_id) == Some(session_id) {
            map.remove(cookie);
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
