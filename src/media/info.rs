//! Stream identity
//!
//! A stream is addressed as `schema://host[:port]/app/stream[?k=v]`. The
//! `(vhost, app, stream)` triple plus the schema is the registry key; the
//! rest of the URL is kept for hooks and logging.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Virtual host used when virtual hosting is disabled or unresolvable
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

/// Query-string key that overrides the host-derived vhost
pub const VHOST_KEY: &str = "vhost";

/// Well-known schemas, in the order the schema-less lookup fans out
pub mod schema {
    pub const RTMP: &str = "rtmp";
    pub const RTSP: &str = "rtsp";
    pub const TS: &str = "ts";
    pub const FMP4: &str = "fmp4";
    pub const HLS: &str = "hls";
    pub const HLS_FMP4: &str = "hls-fmp4";

    /// Lookup order for [`crate::media::registry::MediaRegistry::find_any_schema`]
    pub const ALL: [&str; 6] = [RTMP, RTSP, TS, FMP4, HLS, HLS_FMP4];
}

/// Identity of a stream within a schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MediaTuple {
    pub vhost: String,
    pub app: String,
    pub stream: String,
    /// Raw query string from the originating URL
    pub params: String,
}

impl MediaTuple {
    pub fn new(vhost: impl Into<String>, app: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            vhost: vhost.into(),
            app: app.into(),
            stream: stream.into(),
            params: String::new(),
        }
    }

    /// `vhost/app/stream`, the log-friendly form
    pub fn short_url(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

impl fmt::Display for MediaTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

/// Fully parsed request URL
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    /// Registry schema, e.g. `rtsp`; set by the owning session, not the URL
    pub schema: String,
    /// Wire protocol, e.g. `rtsp` or `rtsps`
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub full_url: String,
    pub tuple: MediaTuple,
}

impl MediaInfo {
    /// Parse `schema://host[:port]/app/stream…?k=v`.
    ///
    /// The stream id may itself contain `/`; everything after the app level
    /// joins into it. A `vhost` query parameter overrides the host-derived
    /// vhost; numeric IPs and `localhost` collapse to [`DEFAULT_VHOST`], as
    /// does everything when `enable_vhost` is off.
    pub fn parse(url: &str, enable_vhost: bool) -> Self {
        let mut info = MediaInfo {
            full_url: url.to_string(),
            ..Default::default()
        };

        let (mut rest, params) = match url.split_once('?') {
            Some((head, query)) => (head, query),
            None => (url, ""),
        };
        info.tuple.params = params.to_string();

        if let Some((schema, tail)) = rest.split_once("://") {
            info.protocol = schema.to_string();
            rest = tail;
        }

        let mut parts = rest.split('/');
        if let Some(authority) = parts.next() {
            let (host, port) = split_host_port(authority);
            info.host = host.to_string();
            info.port = port;
            info.tuple.vhost = if host == "localhost" || host.parse::<IpAddr>().is_ok() {
                DEFAULT_VHOST.to_string()
            } else {
                host.to_string()
            };
        }
        if let Some(app) = parts.next() {
            info.tuple.app = app.to_string();
        }
        let stream: Vec<&str> = parts.filter(|seg| !seg.is_empty()).collect();
        info.tuple.stream = stream.join("/");

        if let Some(vhost) = parse_query(params).get(VHOST_KEY) {
            info.tuple.vhost = vhost.clone();
        }
        if !enable_vhost || info.tuple.vhost.is_empty() {
            info.tuple.vhost = DEFAULT_VHOST.to_string();
        }
        info
    }

    pub fn short_url(&self) -> String {
        self.tuple.short_url()
    }
}

fn split_host_port(authority: &str) -> (&str, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (authority, 0),
        },
        None => (authority, 0),
    }
}

/// Split a query string into a key/value map. Later keys win.
pub fn parse_query(params: &str) -> HashMap<String, String> {
    params
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (kv.to_string(), String::new()),
        })
        .collect()
}
