//! SDP track extraction
//!
//! Full SDP handling lives outside the engine; sessions only need the
//! per-track facts to negotiate transports and build RTP-Info: media type,
//! payload type, clock rate and the control URL. This parser pulls exactly
//! those out of an ANNOUNCE body or a source's stored SDP.

use crate::media::TrackType;

/// Negotiation state for one SDP media section
#[derive(Debug, Clone)]
pub struct SdpTrack {
    pub track_type: TrackType,
    pub codec: String,
    /// RTP payload type from the m= line
    pub pt: u8,
    /// RTP clock rate, Hz
    pub sample_rate: u32,
    /// Raw `a=control` value, absolute or relative
    pub control: String,
    /// Interleaved RTP channel once set up (RTCP is `+1`)
    pub interleaved: u8,
    pub ssrc: u32,
    pub seq: u16,
    /// Last RTP timestamp, milliseconds
    pub stamp_ms: u32,
    /// A track may be SETUP exactly once
    pub inited: bool,
}

impl SdpTrack {
    fn new(track_type: TrackType, pt: u8) -> Self {
        let sample_rate = match track_type {
            TrackType::Video => 90_000,
            TrackType::Audio => 8_000,
        };
        Self {
            track_type,
            codec: String::new(),
            pt,
            sample_rate,
            control: String::new(),
            interleaved: 0,
            ssrc: 0,
            seq: 0,
            stamp_ms: 0,
            inited: false,
        }
    }

    /// Absolute control URL for SETUP matching and RTP-Info
    pub fn control_url(&self, content_base: &str) -> String {
        if self.control.starts_with("rtsp://") || self.control.starts_with("rtsps://") {
            return self.control.clone();
        }
        let base = content_base.trim_end_matches('/');
        if self.control.is_empty() {
            return base.to_string();
        }
        format!("{}/{}", base, self.control)
    }

    /// `rtptime` units for the last stamp, per the track clock
    pub fn rtptime(&self) -> i64 {
        self.stamp_ms as i64 * (self.sample_rate as i64 / 1000)
    }
}

/// Extract the usable audio/video tracks of an SDP body. Sections with an
/// unknown media kind (`application`, …) are skipped.
pub fn parse_tracks(sdp: &str) -> Vec<SdpTrack> {
    let mut tracks: Vec<SdpTrack> = Vec::new();
    let mut current: Option<SdpTrack> = None;

    for line in sdp.lines() {
        let line = line.trim_end();
        if let Some(media) = line.strip_prefix("m=") {
            if let Some(track) = current.take() {
                tracks.push(track);
            }
            // m=<media> <port> <proto> <fmt ...>
            let mut fields = media.split_whitespace();
            let kind = fields.next().unwrap_or_default();
            let pt = fields.nth(2).and_then(|fmt| fmt.parse().ok()).unwrap_or(96);
            current = TrackType::from_sdp(kind).map(|track_type| SdpTrack::new(track_type, pt));
            continue;
        }
        let Some(track) = current.as_mut() else { continue };

        if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
            // a=rtpmap:<pt> <codec>/<clock>[/<channels>]
            let mut fields = rtpmap.split_whitespace();
            let pt: Option<u8> = fields.next().and_then(|pt| pt.parse().ok());
            if pt == Some(track.pt) {
                if let Some(encoding) = fields.next() {
                    let mut parts = encoding.split('/');
                    track.codec = parts.next().unwrap_or_default().to_string();
                    if let Some(rate) = parts.next().and_then(|rate| rate.parse().ok()) {
                        track.sample_rate = rate;
                    }
                }
            }
        } else if let Some(control) = line.strip_prefix("a=control:") {
            track.control = control.trim().to_string();
        }
    }
    if let Some(track) = current.take() {
        tracks.push(track);
    }
    tracks
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 0.0.0.0\r\n\
        s=Streamed by rtsp-engine\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:trackID=0\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 MPEG4-GENERIC/44100/2\r\n\
        a=control:trackID=1\r\n";

    #[test]
    fn extracts_both_tracks() {
        let tracks = parse_tracks(SDP);
        assert_eq!(tracks.len(), 2);

        assert_eq!(tracks[0].track_type, TrackType::Video);
        assert_eq!(tracks[0].pt, 96);
        assert_eq!(tracks[0].codec, "H264");
        assert_eq!(tracks[0].sample_rate, 90_000);
        assert_eq!(tracks[0].control, "trackID=0");

        assert_eq!(tracks[1].track_type, TrackType::Audio);
        assert_eq!(tracks[1].sample_rate, 44_100);
        assert_eq!(tracks[1].codec, "MPEG4-GENERIC");
    }

    #[test]
    fn skips_unknown_media() {
        let sdp = "m=application 0 RTP/AVP 99\r\na=control:trackID=5\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H265/90000\r\n";
        let tracks = parse_tracks(sdp);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].codec, "H265");
    }

    #[test]
    fn empty_sdp_has_no_tracks() {
        assert!(parse_tracks("v=0\r\n").is_empty());
    }

    #[test]
    fn control_url_joining() {
        let mut track = SdpTrack::new(TrackType::Video, 96);
        track.control = "trackID=0".to_string();
        assert_eq!(track.control_url("rtsp://h/app/stream"), "rtsp://h/app/stream/trackID=0");
        assert_eq!(track.control_url("rtsp://h/app/stream/"), "rtsp://h/app/stream/trackID=0");

        track.control = "rtsp://h/app/stream/trackID=0".to_string();
        assert_eq!(track.control_url("rtsp://other/"), "rtsp://h/app/stream/trackID=0");
    }

    #[test]
    fn rtptime_scaling() {
        let mut track = SdpTrack::new(TrackType::Video, 96);
        track.stamp_ms = 2_000;
        assert_eq!(track.rtptime(), 2_000 * 90);
    }

    #[test]
    fn default_rates_when_rtpmap_missing() {
        let tracks = parse_tracks("m=video 0 RTP/AVP 96\r\nm=audio 0 RTP/AVP 0\r\n");
        assert_eq!(tracks[0].sample_rate, 90_000);
        assert_eq!(tracks[1].sample_rate, 8_000);
        assert_eq!(tracks[1].pt, 0);
    }
}
