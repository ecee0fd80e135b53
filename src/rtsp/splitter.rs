//! Frame splitter
//!
//! The TCP byte stream carries three things: RTSP requests, interleaved
//! RTP/RTCP frames (`'$' <channel> <len16be>` once a transport is set up),
//! and, on an HTTP tunnel POST, an endless base64 body. The splitter owns
//! the receive buffer and hands the session whole frames.
//!
//! A POST switches the splitter into streaming mode: its "body" is all
//! remaining bytes, emitted as they arrive, so the tunnel payload is
//! drained continuously instead of waiting for a length that never comes.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::Error;
use crate::rtsp::message::RtspRequest;

/// One complete frame out of the stream
#[derive(Debug)]
pub enum RtspFrame {
    /// Fully assembled request, body included
    Packet(RtspRequest),
    /// Interleaved frame, prefix included
    Rtp(Bytes),
    /// Tunnel payload after a POST head
    PostData(Bytes),
}

#[derive(Debug, Default)]
pub struct RtspSplitter {
    buf: BytesMut,
    recv_rtp: bool,
    streaming_post: bool,
}

/// Upper bound on a head section; beyond this the peer is not speaking RTSP
const MAX_HEAD: usize = 64 * 1024;

impl RtspSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `$`-framed interleaved data (after SETUP over TCP)
    pub fn enable_recv_rtp(&mut self, enable: bool) {
        self.recv_rtp = enable;
    }

    /// Feed raw bytes, collect whole frames
    pub fn input(&mut self, data: &[u8]) -> Result<Vec<RtspFrame>, Error> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if self.streaming_post {
                if !self.buf.is_empty() {
                    frames.push(RtspFrame::PostData(self.buf.split().freeze()));
                }
                return Ok(frames);
            }
            if self.buf.is_empty() {
                return Ok(frames);
            }

            if self.recv_rtp && self.buf[0] == b'$' {
                if self.buf.len() < 4 {
                    return Ok(frames);
                }
                let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
                if self.buf.len() < 4 + len {
                    return Ok(frames);
                }
                frames.push(RtspFrame::Rtp(self.buf.split_to(4 + len).freeze()));
                continue;
            }

            let head_end = match find_head_end(&self.buf) {
                Some(end) => end,
                None => {
                    if self.buf.len() > MAX_HEAD {
                        return Err(Error::Parse("rtsp head too large".into()));
                    }
                    return Ok(frames);
                }
            };

            let head = std::str::from_utf8(&self.buf[..head_end])
                .map_err(|_| Error::Parse("rtsp head is not utf-8".into()))?;
            let mut request = RtspRequest::parse_head(head)?;

            if request.method == "POST" {
                // Tunnel poster: everything after the head is payload
                self.buf.advance(head_end);
                let body = self.buf.split().freeze();
                request.body = body;
                frames.push(RtspFrame::Packet(request));
                self.streaming_post = true;
                continue;
            }

            let content_length = request.content_length();
            if self.buf.len() < head_end + content_length {
                return Ok(frames);
            }
            self.buf.advance(head_end);
            request.body = self.buf.split_to(content_length).freeze();
            frames.push(RtspFrame::Packet(request));
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}
