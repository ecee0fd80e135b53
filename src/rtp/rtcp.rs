//! RTCP statistics and report generation (RFC 3550)
//!
//! One context per track. The receive flavour tracks loss and interarrival
//! jitter for pusher traffic and emits receiver reports; the send flavour
//! counts what went out to a player and emits sender reports. Both absorb
//! incoming RTCP to keep the NTP correspondence used for A/V sync.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

/// Seconds between the NTP epoch (1900) and the unix epoch (1970)
pub const NTP_UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

pub const RTCP_SR: u8 = 200;
pub const RTCP_RR: u8 = 201;
pub const RTCP_SDES: u8 = 202;
pub const RTCP_BYE: u8 = 203;
pub const RTCP_APP: u8 = 204;

/// One RTCP record, header included
#[derive(Debug, Clone)]
pub struct RtcpPacket {
    pub pt: u8,
    pub data: Bytes,
}

/// Split a compound RTCP datagram into records. Malformed tails are
/// discarded silently; RTCP is advisory.
pub fn parse_packets(data: &[u8]) -> Vec<RtcpPacket> {
    let mut out = Vec::new();
    let mut rest = data;
    while rest.len() >= 4 {
        if rest[0] >> 6 != 2 {
            break;
        }
        let length = 4 * (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1);
        if length > rest.len() {
            break;
        }
        out.push(RtcpPacket {
            pt: rest[1],
            data: Bytes::copy_from_slice(&rest[..length]),
        });
        rest = &rest[length..];
    }
    out
}

/// Parsed sender report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_sec: u32,
    pub ntp_frac: u32,
    pub rtp_ts: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub fn parse(packet: &RtcpPacket) -> Option<Self> {
        if packet.pt != RTCP_SR || packet.data.len() < 28 {
            return None;
        }
        let d = &packet.data;
        let be = |o: usize| u32::from_be_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]]);
        Some(Self {
            ssrc: be(4),
            ntp_sec: be(8),
            ntp_frac: be(12),
            rtp_ts: be(16),
            packet_count: be(20),
            octet_count: be(24),
        })
    }

    /// NTP stamp as unix milliseconds
    pub fn ntp_unix_ms(&self) -> u64 {
        let secs = (self.ntp_sec as u64).saturating_sub(NTP_UNIX_EPOCH_OFFSET);
        secs * 1000 + (self.ntp_frac as u64 * 1000 >> 32)
    }

    /// Middle 32 bits of the NTP stamp, the LSR form report blocks carry
    pub fn lsr(&self) -> u32 {
        (self.ntp_sec << 16) | (self.ntp_frac >> 16)
    }

    pub fn build(ssrc: u32, ntp_unix_ms: u64, rtp_ts: u32, packet_count: u32, octet_count: u32) -> Bytes {
        let ntp_sec = (ntp_unix_ms / 1000 + NTP_UNIX_EPOCH_OFFSET) as u32;
        let ntp_frac = (((ntp_unix_ms % 1000) << 32) / 1000) as u32;
        let mut buf = BytesMut::with_capacity(28);
        buf.put_u8(0x80);
        buf.put_u8(RTCP_SR);
        buf.put_u16(6);
        buf.put_u32(ssrc);
        buf.put_u32(ntp_sec);
        buf.put_u32(ntp_frac);
        buf.put_u32(rtp_ts);
        buf.put_u32(packet_count);
        buf.put_u32(octet_count);
        buf.freeze()
    }
}

/// One report block of a receiver report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    pub reportee_ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub lsr: u32,
    pub dlsr: u32,
}

/// Parsed receiver report
#[derive(Debug, Clone)]
pub struct ReceiverReport {
    pub reporter_ssrc: u32,
    pub blocks: Vec<ReportBlock>,
}

impl ReceiverReport {
    pub fn parse(packet: &RtcpPacket) -> Option<Self> {
        if packet.pt != RTCP_RR || packet.data.len() < 8 {
            return None;
        }
        let d = &packet.data;
        let be = |o: usize| u32::from_be_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]]);
        let count = (d[0] & 0x1f) as usize;
        let mut blocks = Vec::with_capacity(count);
        for i in 0..count {
            let o = 8 + i * 24;
            if o + 24 > d.len() {
                break;
            }
            blocks.push(ReportBlock {
                reportee_ssrc: be(o),
                fraction_lost: d[o + 4],
                cumulative_lost: be(o + 4) & 0x00ff_ffff,
                highest_seq: be(o + 8),
                jitter: be(o + 12),
                lsr: be(o + 16),
                dlsr: be(o + 20),
            });
        }
        Some(Self { reporter_ssrc: be(4), blocks })
    }

    pub fn build(reporter_ssrc: u32, block: ReportBlock) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(0x81);
        buf.put_u8(RTCP_RR);
        buf.put_u16(7);
        buf.put_u32(reporter_ssrc);
        buf.put_u32(block.reportee_ssrc);
        buf.put_u32(((block.fraction_lost as u32) << 24) | (block.cumulative_lost & 0x00ff_ffff));
        buf.put_u32(block.highest_seq);
        buf.put_u32(block.jitter);
        buf.put_u32(block.lsr);
        buf.put_u32(block.dlsr);
        buf.freeze()
    }
}

/// SDES with a single CNAME chunk
pub fn build_sdes_cname(ssrc: u32, cname: &str) -> Bytes {
    let text = cname.as_bytes();
    let text_len = text.len().min(255);
    // chunk: ssrc + item header + text + terminating zero, padded to 32 bits
    let item_len = 4 + 2 + text_len + 1;
    let padded = (item_len + 3) & !3;
    let mut buf = BytesMut::with_capacity(4 + padded);
    buf.put_u8(0x81);
    buf.put_u8(RTCP_SDES);
    buf.put_u16((padded / 4) as u16);
    buf.put_u32(ssrc);
    buf.put_u8(1); // CNAME
    buf.put_u8(text_len as u8);
    buf.put_slice(&text[..text_len]);
    for _ in 0..padded - item_len + 1 {
        buf.put_u8(0);
    }
    buf.freeze()
}

/// Send-direction statistics: what this server transmitted on a track
#[derive(Debug)]
pub struct RtcpContextForSend {
    packets: u32,
    octets: u32,
    last_rtp_stamp: u32,
    sample_rate: u32,
    last_rtp_at: Option<Instant>,
}

impl RtcpContextForSend {
    pub fn new() -> Self {
        Self {
            packets: 0,
            octets: 0,
            last_rtp_stamp: 0,
            sample_rate: 0,
            last_rtp_at: None,
        }
    }

    pub fn on_rtp(&mut self, stamp: u32, sample_rate: u32, size: usize) {
        self.packets = self.packets.wrapping_add(1);
        self.octets = self.octets.wrapping_add(size as u32);
        self.last_rtp_stamp = stamp;
        self.sample_rate = sample_rate;
        self.last_rtp_at = Some(Instant::now());
    }

    /// Wire-ready SR. RTP timestamp extrapolates the last seen stamp to now.
    pub fn create_sr(&self, ssrc: u32) -> Bytes {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let advance = match (self.last_rtp_at, self.sample_rate) {
            (Some(at), rate) if rate > 0 => (at.elapsed().as_millis() as u64 * rate as u64 / 1000) as u32,
            _ => 0,
        };
        SenderReport::build(
            ssrc,
            now_ms,
            self.last_rtp_stamp.wrapping_add(advance),
            self.packets,
            self.octets,
        )
    }
}

impl Default for RtcpContextForSend {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive-direction statistics: loss, jitter and SR correspondence
#[derive(Debug)]
pub struct RtcpContextForRecv {
    started: bool,
    base_seq: u16,
    max_seq: u16,
    cycles: u32,
    received: u32,
    expected_prior: u32,
    received_prior: u32,
    /// Jitter estimate scaled by 16, per the RFC 3550 reference code
    jitter_scaled: i64,
    last_transit: Option<i64>,
    epoch: Instant,
    lsr: u32,
    last_sr_at: Option<Instant>,
}

impl RtcpContextForRecv {
    pub fn new() -> Self {
        Self {
            started: false,
            base_seq: 0,
            max_seq: 0,
            cycles: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            jitter_scaled: 0,
            last_transit: None,
            epoch: Instant::now(),
            lsr: 0,
            last_sr_at: None,
        }
    }

    pub fn on_rtp(&mut self, seq: u16, stamp: u32, sample_rate: u32, _size: usize) {
        if !self.started {
            self.started = true;
            self.base_seq = seq;
            self.max_seq = seq;
        } else {
            let delta = seq.wrapping_sub(self.max_seq) as i16;
            if delta > 0 {
                if seq < self.max_seq {
                    self.cycles += 1 << 16;
                }
                self.max_seq = seq;
            }
        }
        self.received = self.received.wrapping_add(1);

        if sample_rate > 0 {
            let arrival = (self.epoch.elapsed().as_millis() as u64 * sample_rate as u64 / 1000) as i64;
            let transit = arrival - stamp as i64;
            if let Some(last) = self.last_transit {
                let d = (transit - last).abs();
                self.jitter_scaled += d - ((self.jitter_scaled + 8) >> 4);
                if self.jitter_scaled < 0 {
                    self.jitter_scaled = 0;
                }
            }
            self.last_transit = Some(transit);
        }
    }

    /// Absorb an incoming SR, keeping the LSR material for report blocks
    pub fn on_sr(&mut self, sr: &SenderReport) {
        self.lsr = sr.lsr();
        self.last_sr_at = Some(Instant::now());
    }

    fn expected(&self) -> u32 {
        self.cycles + self.max_seq as u32 - self.base_seq as u32 + 1
    }

    /// Overall loss rate since the start of the stream
    pub fn loss_rate(&self) -> Option<f32> {
        if !self.started {
            return None;
        }
        let expected = self.expected();
        if expected == 0 {
            return None;
        }
        let lost = expected.saturating_sub(self.received);
        Some(lost as f32 / expected as f32)
    }

    /// Wire-ready RR with one report block. Updates the interval counters.
    pub fn create_rr(&mut self, reporter_ssrc: u32, reportee_ssrc: u32) -> Bytes {
        let expected = self.expected();
        let lost = expected.saturating_sub(self.received);

        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64) as u8
        };

        let dlsr = self
            .last_sr_at
            .map(|at| (at.elapsed().as_secs_f64() * 65536.0) as u32)
            .unwrap_or(0);

        ReceiverReport::build(
            reporter_ssrc,
            ReportBlock {
                reportee_ssrc,
                fraction_lost,
                cumulative_lost: lost & 0x00ff_ffff,
                highest_seq: self.cycles | self.max_seq as u32,
                jitter: (self.jitter_scaled >> 4) as u32,
                lsr: self.lsr,
                dlsr,
            },
        )
    }
}

impl Default for RtcpContextForRecv {
    fn default() -> Self {
        Self::new()
    }
}

/// Direction-tagged context held per track by a session
#[derive(Debug)]
pub enum RtcpContext {
    Send(RtcpContextForSend),
    Recv(RtcpContextForRecv),
}

impl RtcpContext {
    pub fn new_send() -> Self {
        RtcpContext::Send(RtcpContextForSend::new())
    }

    pub fn new_recv() -> Self {
        RtcpContext::Recv(RtcpContextForRecv::new())
    }

    pub fn on_rtp(&mut self, seq: u16, stamp: u32, sample_rate: u32, size: usize) {
        match self {
            RtcpContext::Send(ctx) => ctx.on_rtp(stamp, sample_rate, size),
            RtcpContext::Recv(ctx) => ctx.on_rtp(seq, stamp, sample_rate, size),
        }
    }

    pub fn on_sr(&mut self, sr: &SenderReport) {
        if let RtcpContext::Recv(ctx) = self {
            ctx.on_sr(sr);
        }
    }

    pub fn create_sr(&self, ssrc: u32) -> Option<Bytes> {
        match self {
            RtcpContext::Send(ctx) => Some(ctx.create_sr(ssrc)),
            RtcpContext::Recv(_) => None,
        }
    }

    pub fn create_rr(&mut self, reporter_ssrc: u32, reportee_ssrc: u32) -> Option<Bytes> {
        match self {
            RtcpContext::Recv(ctx) => Some(ctx.create_rr(reporter_ssrc, reportee_ssrc)),
            RtcpContext::Send(_) => None,
        }
    }

    pub fn loss_rate(&self) -> Option<f32> {
        match self {
            RtcpContext::Recv(ctx) => ctx.loss_rate(),
            RtcpContext::Send(_) => None,
        }
    }
}
