//! Shared RTP multicast
//!
//! Multicast playback shares one sender per stream: the first SETUP creates
//! a multicaster that attaches a ring reader and forwards every batch to
//! the group address; later sessions just subscribe. Sessions register a
//! detach callback so a dying stream tears them down, and a peer-keyed
//! RTCP dispatch keeps their liveness tickers fed from the shared RTCP
//! sockets.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::media::TrackType;
use crate::rtsp::source::RtspMediaSource;
use crate::rtsp::transport::make_udp_pair;

/// Datagram callback for shared-socket RTCP: `(interleaved, data, peer)`
pub type PeerUdpCallback = Arc<dyn Fn(u8, Bytes, SocketAddr) + Send + Sync>;

/// One stream's multicast sender
pub struct RtpMulticaster {
    group_ip: Ipv4Addr,
    rtp_ports: [u16; 2],
    rtcp_ports: [u16; 2],
    detach_cbs: Mutex<HashMap<u64, Box<dyn Fn() + Send + Sync>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RtpMulticaster {
    pub fn ip(&self) -> Ipv4Addr {
        self.group_ip
    }

    pub fn rtp_port(&self, track: TrackType) -> u16 {
        self.rtp_ports[track.index()]
    }

    pub fn rtcp_port(&self, track: TrackType) -> u16 {
        self.rtcp_ports[track.index()]
    }

    /// Called when the stream's ring detaches; tears the subscriber down
    pub fn set_detach_cb(&self, session_id: u64, cb: Box<dyn Fn() + Send + Sync>) {
        self.detach_cbs.lock().unwrap().insert(session_id, cb);
    }

    pub fn remove_detach_cb(&self, session_id: u64) {
        self.detach_cbs.lock().unwrap().remove(&session_id);
    }

    fn fire_detach(&self) {
        let cbs = self.detach_cbs.lock().unwrap();
        for cb in cbs.values() {
            cb();
        }
    }
}

impl Drop for RtpMulticaster {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Process-wide multicaster directory plus the shared-RTCP peer dispatch
pub struct MulticastManager {
    ttl: u32,
    range_start: u32,
    range_len: u32,
    next_offset: Mutex<u32>,
    casters: Mutex<HashMap<String, Weak<RtpMulticaster>>>,
    peer_readers: Mutex<HashMap<IpAddr, HashMap<u64, PeerUdpCallback>>>,
}

impl MulticastManager {
    pub fn new(ttl: u32, range_start: Ipv4Addr, range_end: Ipv4Addr) -> Arc<Self> {
        let start = u32::from(range_start);
        let end = u32::from(range_end).max(start);
        Arc::new(Self {
            ttl,
            range_start: start,
            range_len: end - start + 1,
            next_offset: Mutex::new(0),
            casters: Mutex::new(HashMap::new()),
            peer_readers: Mutex::new(HashMap::new()),
        })
    }

    fn next_group_ip(&self) -> Ipv4Addr {
        let mut offset = self.next_offset.lock().unwrap();
        let ip = Ipv4Addr::from(self.range_start + *offset % self.range_len);
        *offset = offset.wrapping_add(1);
        ip
    }

    /// Multicaster for a stream, shared across its subscribers
    pub async fn get(self: &Arc<Self>, local_ip: IpAddr, source: &Arc<RtspMediaSource>) -> Option<Arc<RtpMulticaster>> {
        let key = {
            let source: &dyn crate::media::source::MediaSource = &**source;
            source.url()
        };
        if let Some(live) = self.casters.lock().unwrap().get(&key).and_then(Weak::upgrade) {
            return Some(live);
        }

        let caster = self.build(local_ip, source).await?;
        let mut casters = self.casters.lock().unwrap();
        match casters.get(&key).and_then(Weak::upgrade) {
            // Someone else built one while we were binding sockets
            Some(live) => Some(live),
            None => {
                casters.insert(key, Arc::downgrade(&caster));
                Some(caster)
            }
        }
    }

    async fn build(self: &Arc<Self>, local_ip: IpAddr, source: &Arc<RtspMediaSource>) -> Option<Arc<RtpMulticaster>> {
        let group_ip = self.next_group_ip();

        let mut rtp_socks = Vec::with_capacity(2);
        let mut rtcp_socks = Vec::with_capacity(2);
        let mut rtp_ports = [0u16; 2];
        let mut rtcp_ports = [0u16; 2];
        for idx in 0..2 {
            let (rtp, rtcp) = match make_udp_pair(local_ip).await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "multicast socket pair allocation failed");
                    return None;
                }
            };
            let _ = rtp.set_multicast_ttl_v4(self.ttl);
            rtp_ports[idx] = rtp.local_addr().ok()?.port();
            rtcp_ports[idx] = rtcp.local_addr().ok()?.port();
            rtp_socks.push(Arc::new(rtp));
            rtcp_socks.push(Arc::new(rtcp));
        }

        let caster = Arc::new(RtpMulticaster {
            group_ip,
            rtp_ports,
            rtcp_ports,
            detach_cbs: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        // Forward the ring into the group
        let mut reader = source.attach_reader(true);
        let forward = {
            let caster = caster.clone();
            let rtp_socks: [Arc<UdpSocket>; 2] = [rtp_socks[0].clone(), rtp_socks[1].clone()];
            tokio::spawn(async move {
                loop {
                    match reader.recv().await {
                        Ok(batch) => {
                            for rtp in batch.iter() {
                                let idx = rtp.track_type.index();
                                let dst = (caster.group_ip, caster.rtp_ports[idx]);
                                if let Err(err) = rtp_socks[idx].send_to(rtp.rtp(), dst).await {
                                    tracing::debug!(error = %err, "multicast send failed");
                                }
                            }
                        }
                        Err(_) => {
                            tracing::info!(group = %caster.group_ip, "multicast source detached");
                            caster.fire_detach();
                            return;
                        }
                    }
                }
            })
        };

        // Shared RTCP intake, dispatched to subscribers by peer address
        let mut tasks = vec![forward];
        for (idx, sock) in rtcp_socks.into_iter().enumerate() {
            let manager = Arc::downgrade(self);
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                loop {
                    let (len, peer) = match sock.recv_from(&mut buf).await {
                        Ok(received) => received,
                        Err(_) => return,
                    };
                    let Some(manager) = manager.upgrade() else { return };
                    manager.dispatch_peer(2 * idx as u8 + 1, Bytes::copy_from_slice(&buf[..len]), peer);
                }
            }));
        }
        *caster.tasks.lock().unwrap() = tasks;
        Some(caster)
    }

    /// Route shared-socket datagrams from `peer_ip` to a session
    pub fn listen_peer(&self, peer_ip: IpAddr, session_id: u64, cb: PeerUdpCallback) {
        self.peer_readers
            .lock()
            .unwrap()
            .entry(peer_ip)
            .or_default()
            .insert(session_id, cb);
    }

    /// Stop routing to a session; empty peer slots are pruned
    pub fn stop_listen_peer(&self, peer_ip: IpAddr, session_id: u64) {
        let mut readers = self.peer_readers.lock().unwrap();
        if let Some(sessions) = readers.get_mut(&peer_ip) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                readers.remove(&peer_ip);
            }
        }
    }

    fn dispatch_peer(&self, interleaved: u8, data: Bytes, peer: SocketAddr) {
        let callbacks: Vec<PeerUdpCallback> = {
            let readers = self.peer_readers.lock().unwrap();
            match readers.get(&peer.ip()) {
                Some(sessions) => sessions.values().cloned().collect(),
                None => return,
            }
        };
        for cb in callbacks {
            cb(interleaved, data.clone(), peer);
        }
    }
}
