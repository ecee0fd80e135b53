//! RTSP request parsing and response building
//!
//! Requests follow HTTP/1.1 syntax (RFC 2326 §6): request line, headers,
//! blank line, optional body. Header lookup is case-insensitive. Responses
//! use a builder; the session stamps the always-present headers (CSeq,
//! Session, Server, Date) before serializing.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::error::Error;

/// A parsed RTSP (or tunneled HTTP) request
#[derive(Debug, Clone)]
pub struct RtspRequest {
    /// OPTIONS, DESCRIBE, SETUP, … or GET/POST for the HTTP tunnel
    pub method: String,
    pub uri: String,
    /// `RTSP/1.0` or `HTTP/1.x`
    pub version: String,
    headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RtspRequest {
    /// Parse the head (request line + headers) of a request. The body is
    /// attached by the splitter once `Content-Length` bytes arrived.
    pub fn parse_head(raw: &str) -> Result<Self, Error> {
        let mut lines = raw.split("\r\n");

        let request_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| Error::Parse("empty request".into()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let uri = parts.next().unwrap_or_default().to_string();
        let version = parts.next().unwrap_or_default().to_string();
        if method.is_empty() || uri.is_empty() || version.is_empty() {
            return Err(Error::Parse(format!("invalid request line: {request_line:?}")));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Parse(format!("invalid header line: {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method,
            uri,
            version,
            headers,
            body: Bytes::new(),
        })
    }

    /// Case-insensitive header lookup (RFC 2326 §4.2)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Header value or the empty string
    pub fn header_or_empty(&self, name: &str) -> &str {
        self.header(name).unwrap_or("")
    }

    pub fn cseq(&self) -> u32 {
        self.header("CSeq")
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Response under construction
#[derive(Debug)]
pub struct RtspResponse {
    /// Status line payload, e.g. `200 OK`
    pub status: String,
    /// `RTSP/1.0`, or `HTTP/1.0` on the tunnel
    pub protocol: &'static str,
    headers: Vec<(String, String)>,
    pub body: String,
}

impl RtspResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            protocol: "RTSP/1.0",
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn http(status: impl Into<String>) -> Self {
        Self {
            protocol: "HTTP/1.0",
            ..Self::new(status)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.headers.push((name.into(), value.to_string()));
        self
    }

    /// Set a header unless one with the same name is already present
    pub fn header_once(mut self, name: &str, value: impl ToString) -> Self {
        if !self.headers.iter().any(|(key, _)| key.eq_ignore_ascii_case(name)) {
            self.headers.push((name.to_string(), value.to_string()));
        }
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Wire form. `Content-Length`/`Content-Type` are appended when a body
    /// is present and not already set.
    pub fn serialize(mut self) -> String {
        if !self.body.is_empty() {
            let body_len = self.body.len();
            self = self
                .header_once("Content-Length", body_len)
                .header_once("Content-Type", "application/sdp");
        }
        let mut out = format!("{} {}\r\n", self.protocol, self.status);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Current time as an RFC 1123 date, always GMT
pub fn rfc1123_date() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format_rfc1123(secs)
}

fn format_rfc1123(unix_secs: u64) -> String {
    let days = (unix_secs / 86_400) as i64;
    let rem = unix_secs % 86_400;
    let (hour, minute, second) = (rem / 3600, rem % 3600 / 60, rem % 60);
    let weekday = ((days + 4) % 7) as usize; // 1970-01-01 was a Thursday

    // Civil-from-days (Howard Hinnant's algorithm)
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        DAY_NAMES[weekday],
        day,
        MONTH_NAMES[(month - 1) as usize],
        year,
        hour,
        minute,
        second
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_request() {
        let req = RtspRequest::parse_head("OPTIONS rtsp://host/app/stream RTSP/1.0\r\nCSeq: 1\r\n\r\n").unwrap();
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.uri, "rtsp://host/app/stream");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), 1);
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let req = RtspRequest::parse_head("SETUP rtsp://h/a/s RTSP/1.0\r\ncseq: 42\r\nTRANSPORT: RTP/AVP\r\n\r\n").unwrap();
        assert_eq!(req.header("CSeq"), Some("42"));
        assert_eq!(req.header("transport"), Some("RTP/AVP"));
        assert_eq!(req.header_or_empty("Missing"), "");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(RtspRequest::parse_head("").is_err());
        assert!(RtspRequest::parse_head("JUST_A_METHOD\r\n\r\n").is_err());
        assert!(RtspRequest::parse_head("OPTIONS rtsp://h RTSP/1.0\r\nno-colon-here\r\n\r\n").is_err());
    }

    #[test]
    fn parse_serialize_canonical_form() {
        let raw = "DESCRIBE rtsp://h/a/s RTSP/1.0\r\nCSEQ:  2 \r\nAccept:   application/sdp\r\n\r\n";
        let req = RtspRequest::parse_head(raw).unwrap();
        // Semantic values survive folding and case differences
        assert_eq!(req.cseq(), 2);
        assert_eq!(req.header("accept"), Some("application/sdp"));
    }

    #[test]
    fn response_serialization() {
        let out = RtspResponse::new("200 OK")
            .header("CSeq", 3)
            .header("Public", "OPTIONS, DESCRIBE")
            .serialize();
        assert!(out.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(out.contains("CSeq: 3\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_with_body_gets_length() {
        let out = RtspResponse::new("200 OK").header("CSeq", 4).body("v=0\r\n").serialize();
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.contains("Content-Type: application/sdp\r\n"));
        assert!(out.ends_with("v=0\r\n"));
    }

    #[test]
    fn http_protocol_line() {
        let out = RtspResponse::http("200 OK").serialize();
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
    }

    #[test]
    fn rfc1123_known_dates() {
        assert_eq!(format_rfc1123(0), "Thu, 01 Jan 1970 00:00:00 GMT");
        assert_eq!(format_rfc1123(784_887_151), "Tue, 15 Nov 1994 08:12:31 GMT");
        assert_eq!(format_rfc1123(1_700_000_000), "Tue, 14 Nov 2023 22:13:20 GMT");
    }
}
