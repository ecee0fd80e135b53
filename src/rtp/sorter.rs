//! RTP jitter sorter
//!
//! UDP (and occasionally interleaved) input arrives out of order. One sorter
//! per track buffers ahead-of-sequence packets and releases runs in order.
//! Stale duplicates are dropped. When the reorder buffer grows past its cap
//! the sorter gives up on the gap and drains what it has, so a single lost
//! packet cannot dam the stream.

use std::collections::BTreeMap;

use crate::rtp::packet::RtpPacket;

/// Max packets parked while waiting for a gap to fill
const MAX_BUFFERED: usize = 64;

/// Beyond this forward jump the stream is considered restarted
const MAX_JUMP: u16 = 1024;

#[derive(Debug, Default)]
pub struct RtpSorter {
    expected: Option<u16>,
    pending: BTreeMap<u16, RtpPacket>,
}

impl RtpSorter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet; returns the packets now deliverable, in order.
    pub fn sort(&mut self, rtp: RtpPacket) -> Vec<RtpPacket> {
        let mut out = Vec::new();
        let seq = rtp.seq();

        let expected = match self.expected {
            None => {
                self.expected = Some(seq.wrapping_add(1));
                out.push(rtp);
                return out;
            }
            Some(expected) => expected,
        };

        let distance = seq.wrapping_sub(expected) as i16;
        if distance < 0 {
            // Behind the replay point: late retransmit or duplicate
            return out;
        }
        if distance == 0 {
            self.expected = Some(seq.wrapping_add(1));
            out.push(rtp);
            self.drain_contiguous(&mut out);
            return out;
        }

        if distance as u16 > MAX_JUMP {
            tracing::warn!(seq, expected, "rtp sequence jumped, resetting sorter");
            self.pending.clear();
            self.expected = Some(seq.wrapping_add(1));
            out.push(rtp);
            return out;
        }

        self.pending.insert(seq, rtp);
        if self.pending.len() > MAX_BUFFERED {
            self.flush(&mut out);
        }
        out
    }

    /// Abandon the current gap and release everything buffered, in sequence
    /// order relative to the replay point.
    pub fn flush(&mut self, out: &mut Vec<RtpPacket>) {
        let expected = match self.expected {
            Some(expected) => expected,
            None => return,
        };
        let mut keys: Vec<u16> = self.pending.keys().copied().collect();
        keys.sort_by_key(|seq| seq.wrapping_sub(expected));
        for seq in keys {
            if let Some(rtp) = self.pending.remove(&seq) {
                self.expected = Some(seq.wrapping_add(1));
                out.push(rtp);
            }
        }
    }

    fn drain_contiguous(&mut self, out: &mut Vec<RtpPacket>) {
        while let Some(expected) = self.expected {
            match self.pending.remove(&expected) {
                Some(rtp) => {
                    self.expected = Some(expected.wrapping_add(1));
                    out.push(rtp);
                }
                None => break,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackType;

    fn pkt(seq: u16) -> RtpPacket {
        RtpPacket::build(TrackType::Video, 90_000, 0, seq, seq as u32 * 3600, 1, &[])
    }

    fn seqs(packets: &[RtpPacket]) -> Vec<u16> {
        packets.iter().map(|p| p.seq()).collect()
    }

    #[test]
    fn in_order_passthrough() {
        let mut sorter = RtpSorter::new();
        assert_eq!(seqs(&sorter.sort(pkt(10))), [10]);
        assert_eq!(seqs(&sorter.sort(pkt(11))), [11]);
        assert_eq!(seqs(&sorter.sort(pkt(12))), [12]);
    }

    #[test]
    fn reorders_swapped_pair() {
        let mut sorter = RtpSorter::new();
        sorter.sort(pkt(10));
        assert!(sorter.sort(pkt(12)).is_empty());
        assert_eq!(seqs(&sorter.sort(pkt(11))), [11, 12]);
    }

    #[test]
    fn drops_duplicates_and_stale() {
        let mut sorter = RtpSorter::new();
        sorter.sort(pkt(10));
        sorter.sort(pkt(11));
        assert!(sorter.sort(pkt(11)).is_empty());
        assert!(sorter.sort(pkt(3)).is_empty());
    }

    #[test]
    fn wraparound_ordering() {
        let mut sorter = RtpSorter::new();
        assert_eq!(seqs(&sorter.sort(pkt(65_534))), [65_534]);
        assert_eq!(seqs(&sorter.sort(pkt(65_535))), [65_535]);
        assert!(sorter.sort(pkt(1)).is_empty());
        assert_eq!(seqs(&sorter.sort(pkt(0))), [0, 1]);
    }

    #[test]
    fn overflow_flushes_past_gap() {
        let mut sorter = RtpSorter::new();
        sorter.sort(pkt(0));
        // Packet 1 never arrives
        for seq in 2..(2 + MAX_BUFFERED as u16) {
            assert!(sorter.sort(pkt(seq)).is_empty());
        }
        let released = sorter.sort(pkt(2 + MAX_BUFFERED as u16));
        assert!(!released.is_empty());
        assert_eq!(released.first().unwrap().seq(), 2);
        assert_eq!(sorter.pending(), 0);
    }

    #[test]
    fn big_jump_resets() {
        let mut sorter = RtpSorter::new();
        sorter.sort(pkt(10));
        assert_eq!(seqs(&sorter.sort(pkt(20_000))), [20_000]);
        assert_eq!(seqs(&sorter.sort(pkt(20_001))), [20_001]);
    }
}
