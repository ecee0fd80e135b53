//! RTP packets
//!
//! Packets are stored with the interleaved framing prefix
//! (`'$' <channel> <len16be>`) already in place. Interleaved TCP sends the
//! buffer as-is; UDP sends from byte 4. The prefix channel is always
//! `2 * track_type`, the server-side channel convention for distribution.

use bytes::{BufMut, Bytes, BytesMut};

use crate::media::TrackType;

/// Fixed RTP header length (no CSRC, no extension)
pub const RTP_HEADER_SIZE: usize = 12;

/// Interleaved framing prefix length
pub const RTP_TCP_HEADER_SIZE: usize = 4;

/// One RTP packet plus its delivery metadata
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub track_type: TrackType,
    /// RTP clock rate of the track, Hz
    pub sample_rate: u32,
    /// Wall-clock mapping of [`stamp`](Self::stamp), unix milliseconds;
    /// zero until an RTCP SR provided the correspondence
    pub ntp_stamp_ms: u64,
    data: Bytes,
}

impl RtpPacket {
    /// Wrap raw RTP from the wire, prefixing the interleaved header.
    /// `None` when shorter than an RTP header.
    pub fn from_wire(track_type: TrackType, sample_rate: u32, ntp_stamp_ms: u64, rtp: &[u8]) -> Option<Self> {
        if rtp.len() < RTP_HEADER_SIZE || sample_rate == 0 {
            return None;
        }
        let channel = 2 * track_type.index() as u8;
        let mut data = BytesMut::with_capacity(RTP_TCP_HEADER_SIZE + rtp.len());
        data.put_u8(b'$');
        data.put_u8(channel);
        data.put_u16(rtp.len() as u16);
        data.put_slice(rtp);
        Some(Self {
            track_type,
            sample_rate,
            ntp_stamp_ms,
            data: data.freeze(),
        })
    }

    /// Assemble a packet from parts; test and tooling constructor
    pub fn build(
        track_type: TrackType,
        sample_rate: u32,
        ntp_stamp_ms: u64,
        seq: u16,
        stamp: u32,
        ssrc: u32,
        payload: &[u8],
    ) -> Self {
        let len = RTP_HEADER_SIZE + payload.len();
        let mut data = BytesMut::with_capacity(RTP_TCP_HEADER_SIZE + len);
        data.put_u8(b'$');
        data.put_u8(2 * track_type.index() as u8);
        data.put_u16(len as u16);
        data.put_u8(0x80);
        data.put_u8(96);
        data.put_u16(seq);
        data.put_u32(stamp);
        data.put_u32(ssrc);
        data.put_slice(payload);
        Self {
            track_type,
            sample_rate,
            ntp_stamp_ms,
            data: data.freeze(),
        }
    }

    /// Whole buffer including the interleaved prefix
    pub fn full(&self) -> &[u8] {
        &self.data
    }

    /// RTP data without the interleaved prefix
    pub fn rtp(&self) -> &[u8] {
        &self.data[RTP_TCP_HEADER_SIZE..]
    }

    /// Payload past the fixed RTP header
    pub fn payload(&self) -> &[u8] {
        &self.data[RTP_TCP_HEADER_SIZE + RTP_HEADER_SIZE..]
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// RTP size without the prefix, the figure RTCP octet counters want
    pub fn rtp_size(&self) -> usize {
        self.data.len() - RTP_TCP_HEADER_SIZE
    }

    pub fn channel(&self) -> u8 {
        self.data[1]
    }

    pub fn payload_type(&self) -> u8 {
        self.rtp()[1] & 0x7f
    }

    pub fn marker(&self) -> bool {
        self.rtp()[1] & 0x80 != 0
    }

    pub fn seq(&self) -> u16 {
        u16::from_be_bytes([self.rtp()[2], self.rtp()[3]])
    }

    /// Raw RTP timestamp, clock-rate units
    pub fn stamp(&self) -> u32 {
        u32::from_be_bytes([self.rtp()[4], self.rtp()[5], self.rtp()[6], self.rtp()[7]])
    }

    /// Timestamp scaled to milliseconds
    pub fn stamp_ms(&self) -> u64 {
        self.stamp() as u64 * 1000 / self.sample_rate as u64
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.rtp()[8], self.rtp()[9], self.rtp()[10], self.rtp()[11]])
    }
}

/// Interleaved prefix for an RTCP payload on `channel`
pub fn make_interleaved_prefix(len: u16, channel: u8) -> [u8; 4] {
    let len_bytes = len.to_be_bytes();
    [b'$', channel, len_bytes[0], len_bytes[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_accessors() {
        let rtp = RtpPacket::build(TrackType::Video, 90_000, 0, 42, 180_000, 0xdead_beef, &[1, 2, 3]);

        assert_eq!(rtp.full()[0], b'$');
        assert_eq!(rtp.channel(), 0);
        assert_eq!(rtp.seq(), 42);
        assert_eq!(rtp.stamp(), 180_000);
        assert_eq!(rtp.stamp_ms(), 2_000);
        assert_eq!(rtp.ssrc(), 0xdead_beef);
        assert_eq!(rtp.payload(), &[1, 2, 3]);
        assert_eq!(rtp.rtp_size(), RTP_HEADER_SIZE + 3);
        assert_eq!(rtp.size(), RTP_TCP_HEADER_SIZE + RTP_HEADER_SIZE + 3);
    }

    #[test]
    fn audio_channel_is_two() {
        let rtp = RtpPacket::build(TrackType::Audio, 8_000, 0, 1, 8_000, 1, &[]);
        assert_eq!(rtp.channel(), 2);
        assert_eq!(rtp.stamp_ms(), 1_000);
    }

    #[test]
    fn from_wire_roundtrip() {
        let built = RtpPacket::build(TrackType::Video, 90_000, 0, 7, 900, 5, &[9, 9]);
        let wire = built.rtp().to_vec();

        let parsed = RtpPacket::from_wire(TrackType::Video, 90_000, 123, &wire).unwrap();
        assert_eq!(parsed.seq(), 7);
        assert_eq!(parsed.ssrc(), 5);
        assert_eq!(parsed.ntp_stamp_ms, 123);
        assert_eq!(parsed.full(), built.full());
    }

    #[test]
    fn from_wire_rejects_runt() {
        assert!(RtpPacket::from_wire(TrackType::Video, 90_000, 0, &[0u8; 11]).is_none());
    }

    #[test]
    fn interleaved_prefix_layout() {
        let prefix = make_interleaved_prefix(0x0102, 3);
        assert_eq!(prefix, [b'$', 3, 0x01, 0x02]);
    }
}
