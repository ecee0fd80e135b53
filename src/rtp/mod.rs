//! RTP and RTCP plumbing
//!
//! [`packet::RtpPacket`] keeps the 4-byte interleaved prefix in front of the
//! RTP data so the TCP send path is a straight copy; UDP strips it. The
//! [`sorter::RtpSorter`] reorders pusher input per track before it reaches
//! the source, and [`rtcp`] holds the per-track statistics contexts that
//! produce sender/receiver reports.

pub mod packet;
pub mod rtcp;
pub mod sorter;
