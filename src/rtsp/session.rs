//! RTSP session
//!
//! One task per accepted connection. The task owns every piece of mutable
//! session state; sockets, ring readers and tunnel peers talk to it through
//! its event channel, so no per-session locking exists.
//!
//! A pusher walks `ANNOUNCE → SETUP×N → RECORD`, feeding RTP through the
//! jitter sorter into its owned [`RtspMediaSource`]. A player walks
//! `DESCRIBE → SETUP×N → PLAY`, attaching a ring reader whose batches are
//! relayed over interleaved TCP or per-track UDP sockets. The HTTP tunnel
//! (GET/POST pairing) and UDP multicast ride the same state machine.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::error::{Error, ProtocolError, Result, Status};
use crate::hooks::{PublishOption, SessionInfo};
use crate::media::event::{MediaSourceEvent, MuxerHandle};
use crate::media::info::MediaInfo;
use crate::media::registry::delayed_release;
use crate::media::ring::RtpBatch;
use crate::media::source::{MediaOriginType, MediaSource, Ownership};
use crate::media::TrackType;
use crate::rtp::packet::{make_interleaved_prefix, RtpPacket, RTP_HEADER_SIZE};
use crate::rtp::rtcp::{self, RtcpContext, SenderReport};
use crate::rtp::sorter::RtpSorter;
use crate::rtsp::auth;
use crate::rtsp::message::{rfc1123_date, RtspRequest, RtspResponse};
use crate::rtsp::multicast::RtpMulticaster;
use crate::rtsp::sdp::{parse_tracks, SdpTrack};
use crate::rtsp::source::RtspMediaSource;
use crate::rtsp::splitter::{RtspFrame, RtspSplitter};
use crate::rtsp::transport::{make_udp_pair, RtpTransport, TransportHeader};
use crate::server::ServerContext;

const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, TEARDOWN, PLAY, PAUSE, ANNOUNCE, RECORD, SET_PARAMETER, GET_PARAMETER";

const RTCP_SEND_INTERVAL: Duration = Duration::from_secs(5);

const MANAGER_TICK: Duration = Duration::from_secs(2);

/// Everything the session task reacts to
pub(crate) enum SessionEvent {
    /// Bytes from the TCP control connection
    Sock(Bytes),
    /// Datagram from a per-track UDP socket or the shared multicast RTCP
    PeerUdp { interleaved: u8, data: Bytes, peer: SocketAddr },
    /// A batch from the attached ring reader
    RtpBatch(RtpBatch),
    /// The ring went away underneath the reader
    RingDetached,
    /// Decoded tunnel bytes injected by the paired POST session
    TunnelRecv(Bytes),
    /// The peer closed or broke the TCP stream on its side
    PeerClosed(String),
    /// Cross-task shutdown request
    Close(String),
}

/// Shareable face of a session: the listener its push source holds, and the
/// address other tasks use to shut it down
pub struct SessionHandle {
    session_id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    runtime: tokio::runtime::Handle,
    tx: mpsc::UnboundedSender<SessionEvent>,
    media_info: Mutex<MediaInfo>,
    push_src: Mutex<Weak<RtspMediaSource>>,
    option: Mutex<PublishOption>,
}

impl SessionHandle {
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.tx.send(SessionEvent::Close(reason.into()));
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id,
            peer_addr: self.peer_addr,
            local_addr: self.local_addr,
        }
    }

    fn set_media_info(&self, info: MediaInfo) {
        *self.media_info.lock().unwrap() = info;
    }

    fn set_push_src(&self, src: Weak<RtspMediaSource>, option: PublishOption) {
        *self.push_src.lock().unwrap() = src;
        *self.option.lock().unwrap() = option;
    }
}

impl MediaSourceEvent for SessionHandle {
    fn origin_type(&self, _sender: &dyn MediaSource) -> MediaOriginType {
        MediaOriginType::RtspPush
    }

    fn origin_url(&self, _sender: &dyn MediaSource) -> String {
        self.media_info.lock().unwrap().full_url.clone()
    }

    fn origin_sock(&self, _sender: &dyn MediaSource) -> Option<SessionInfo> {
        Some(self.info())
    }

    fn close(&self, sender: &dyn MediaSource) -> bool {
        self.close(format!("close media: {}", sender.url()));
        true
    }

    fn total_reader_count(&self, sender: &dyn MediaSource) -> usize {
        match self.push_src.lock().unwrap().upgrade() {
            Some(src) => src.reader_count(),
            None => sender.reader_count(),
        }
    }

    fn owner_poller(&self, _sender: &dyn MediaSource) -> Result<tokio::runtime::Handle> {
        Ok(self.runtime.clone())
    }

    fn get_muxer(&self, _sender: &dyn MediaSource) -> Option<MuxerHandle> {
        Some(MuxerHandle {
            auto_close: self.option.lock().unwrap().auto_close,
        })
    }
}

/// RTP timestamp → wall clock correspondence learned from RTCP SR
#[derive(Debug, Default, Clone, Copy)]
struct NtpStamp {
    rtp_ts: u32,
    ntp_ms: u64,
}

impl NtpStamp {
    fn set(&mut self, rtp_ts: u32, ntp_ms: u64) {
        self.rtp_ts = rtp_ts;
        self.ntp_ms = ntp_ms;
    }

    fn map(&self, stamp: u32, sample_rate: u32) -> u64 {
        if self.ntp_ms == 0 || sample_rate == 0 {
            return 0;
        }
        let delta = stamp.wrapping_sub(self.rtp_ts) as i32 as i64;
        self.ntp_ms.saturating_add_signed(delta * 1000 / sample_rate as i64)
    }
}

/// Buffering writer over the control connection
///
/// With the flush flag off, sends accumulate until `flush_all`, the
/// merge-write behaviour around an RTP batch.
struct SessionWriter {
    half: OwnedWriteHalf,
    buf: BytesMut,
    autoflush: bool,
    bytes_sent: u64,
}

/// Backstop so a long batch cannot grow the buffer unbounded
const WRITER_HIGH_WATER: usize = 256 * 1024;

impl SessionWriter {
    fn new(half: OwnedWriteHalf) -> Self {
        Self {
            half,
            buf: BytesMut::new(),
            autoflush: true,
            bytes_sent: 0,
        }
    }

    fn set_flush_flag(&mut self, autoflush: bool) {
        self.autoflush = autoflush;
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.bytes_sent += data.len() as u64;
        self.buf.extend_from_slice(data);
        if self.autoflush || self.buf.len() >= WRITER_HIGH_WATER {
            self.flush_all().await?;
        }
        Ok(())
    }

    async fn flush_all(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let pending = self.buf.split();
            self.half.write_all(&pending).await?;
        }
        Ok(())
    }
}

/// Per-connection protocol state machine
pub struct RtspSession {
    id: u64,
    ctx: Arc<ServerContext>,
    handle: Arc<SessionHandle>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    writer: SessionWriter,
    splitter: RtspSplitter,
    peer_addr: SocketAddr,

    cseq: u32,
    content_base: String,
    media_info: MediaInfo,
    session_id: String,
    rtp_type: Option<RtpTransport>,
    tracks: Vec<SdpTrack>,

    rtcp: Vec<RtcpContext>,
    rtcp_tickers: Vec<Instant>,
    send_sr_first: Vec<bool>,
    /// ssrc of a due report, set by `update_rtcp_context`, sent by
    /// `flush_pending_rtcp`
    pending_rtcp: Vec<Option<u32>>,
    ntp: Vec<NtpStamp>,
    sorters: Vec<RtpSorter>,

    rtp_socks: Vec<Option<Arc<UdpSocket>>>,
    rtcp_socks: Vec<Option<Arc<UdpSocket>>>,
    rtp_peer: Vec<Option<SocketAddr>>,
    rtcp_peer: Vec<Option<SocketAddr>>,
    udp_connected: HashSet<u8>,

    push_src: Option<Arc<RtspMediaSource>>,
    push_ownership: Option<Ownership>,
    play_src: Weak<dyn MediaSource>,
    play_attached: bool,
    target_play_track: Option<TrackType>,

    continue_push_ms: u64,
    emit_on_play: bool,
    realm: Option<String>,
    auth_nonce: String,

    tunnel_cookie: String,
    poster_tx: Option<mpsc::UnboundedSender<Bytes>>,
    b64_carry: Vec<u8>,

    multicaster: Option<Arc<RtpMulticaster>>,

    aux_tasks: Vec<tokio::task::JoinHandle<()>>,

    created: Instant,
    alive: Instant,
    bytes_received: u64,
}

impl RtspSession {
    /// Drive one connection to completion
    pub async fn run(id: u64, socket: TcpStream, peer_addr: SocketAddr, ctx: Arc<ServerContext>) {
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                tracing::debug!(error = %err, "no local address, dropping connection");
                return;
            }
        };
        let (mut read_half, write_half) = socket.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = Arc::new(SessionHandle {
            session_id: id,
            peer_addr,
            local_addr,
            runtime: tokio::runtime::Handle::current(),
            tx: tx.clone(),
            media_info: Mutex::new(MediaInfo::default()),
            push_src: Mutex::new(Weak::new()),
            option: Mutex::new(PublishOption::default()),
        });

        let reader_tx = tx.clone();
        let read_task = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(16 * 1024);
            loop {
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => {
                        let _ = reader_tx.send(SessionEvent::PeerClosed("end of file".into()));
                        return;
                    }
                    Ok(_) => {
                        if reader_tx.send(SessionEvent::Sock(buf.split().freeze())).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = reader_tx.send(SessionEvent::PeerClosed(err.to_string()));
                        return;
                    }
                }
            }
        });

        let mut session = RtspSession {
            id,
            ctx,
            handle,
            tx,
            writer: SessionWriter::new(write_half),
            splitter: RtspSplitter::new(),
            peer_addr,
            cseq: 0,
            content_base: String::new(),
            media_info: MediaInfo::default(),
            session_id: String::new(),
            rtp_type: None,
            tracks: Vec::new(),
            rtcp: Vec::new(),
            rtcp_tickers: Vec::new(),
            send_sr_first: Vec::new(),
            pending_rtcp: Vec::new(),
            ntp: Vec::new(),
            sorters: Vec::new(),
            rtp_socks: Vec::new(),
            rtcp_socks: Vec::new(),
            rtp_peer: Vec::new(),
            rtcp_peer: Vec::new(),
            udp_connected: HashSet::new(),
            push_src: None,
            push_ownership: None,
            play_src: Weak::<RtspMediaSource>::new() as Weak<dyn MediaSource>,
            play_attached: false,
            target_play_track: None,
            continue_push_ms: 0,
            emit_on_play: false,
            realm: None,
            auth_nonce: String::new(),
            tunnel_cookie: String::new(),
            poster_tx: None,
            b64_carry: Vec::new(),
            multicaster: None,
            aux_tasks: Vec::new(),
            created: Instant::now(),
            alive: Instant::now(),
            bytes_received: 0,
        };

        let mut tick = tokio::time::interval(MANAGER_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let result = loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(err) = session.on_event(event).await {
                            break err;
                        }
                    }
                    None => break Error::Internal("event channel closed".into()),
                },
                _ = tick.tick() => {
                    if let Err(err) = session.on_manager() {
                        break err;
                    }
                }
            }
        };

        session.on_error(&result).await;
        read_task.abort();
    }

    async fn on_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Sock(data) => {
                self.alive = Instant::now();
                self.bytes_received += data.len() as u64;
                self.on_data(&data).await
            }
            SessionEvent::TunnelRecv(data) => {
                self.alive = Instant::now();
                self.bytes_received += data.len() as u64;
                self.on_data(&data).await
            }
            SessionEvent::PeerUdp { interleaved, data, peer } => self.on_rcv_peer_udp(interleaved, &data, peer).await,
            SessionEvent::RtpBatch(batch) => self.send_rtp_batch(&batch).await,
            SessionEvent::RingDetached => Err(Error::Shutdown("rtsp ring buffer detached".into())),
            SessionEvent::PeerClosed(reason) => Err(Error::PeerShutdown(reason)),
            SessionEvent::Close(reason) => Err(Error::Shutdown(reason)),
        }
    }

    async fn on_data(&mut self, data: &[u8]) -> Result<()> {
        let frames = self.splitter.input(data)?;
        for frame in frames {
            match frame {
                RtspFrame::Packet(req) => self.on_whole_rtsp_packet(req).await?,
                RtspFrame::Rtp(frame) => self.on_rtp_packet(&frame).await?,
                RtspFrame::PostData(data) => self.on_post_data(&data)?,
            }
        }
        Ok(())
    }

    async fn on_whole_rtsp_packet(&mut self, req: RtspRequest) -> Result<()> {
        self.cseq = req.cseq();
        if self.content_base.is_empty() && req.method != "GET" && req.method != "POST" {
            self.content_base = req.uri.split('?').next().unwrap_or_default().to_string();
            self.parse_media_info(&req.uri);
        }

        let result = match req.method.as_str() {
            "OPTIONS" => self.handle_options(&req).await,
            "DESCRIBE" => self.handle_describe(&req).await,
            "ANNOUNCE" => self.handle_announce(&req).await,
            "SETUP" => self.handle_setup(&req).await,
            "RECORD" => self.handle_record(&req).await,
            "PLAY" => self.handle_play(&req).await,
            "PAUSE" => self.handle_pause(&req).await,
            "TEARDOWN" => self.handle_teardown(&req).await,
            "GET" => self.handle_get(&req).await,
            "POST" => self.handle_post(&req).await,
            "SET_PARAMETER" | "GET_PARAMETER" => self.handle_parameter(&req).await,
            other => {
                self.reply(RtspResponse::new("403 Forbidden")).await?;
                return Err(Error::Shutdown(format!("403 Forbidden: {other}")));
            }
        };

        match result {
            Err(Error::Protocol(err)) => {
                let mut resp = RtspResponse::new(err.status.to_string());
                if err.fatal {
                    resp = resp.header("Connection", "Close");
                }
                let carries_body = matches!(err.status, Status::Forbidden | Status::Unauthorized | Status::NotAcceptable);
                if carries_body && !err.detail.is_empty() {
                    resp = resp.header("Content-Type", "text/plain").body(err.detail.clone());
                }
                self.reply(resp).await?;
                if err.fatal {
                    Err(Error::Shutdown(err.to_string()))
                } else {
                    Ok(())
                }
            }
            other => other,
        }
    }

    fn parse_media_info(&mut self, url: &str) {
        let mut info = MediaInfo::parse(url, self.ctx.registry.config().enable_vhost);
        info.schema = crate::media::info::schema::RTSP.to_string();
        info.protocol = crate::media::info::schema::RTSP.to_string();
        self.media_info = info.clone();
        self.handle.set_media_info(info);
    }

    fn session_info(&self) -> SessionInfo {
        self.handle.info()
    }

    async fn reply(&mut self, response: RtspResponse) -> Result<()> {
        let mut response = response.header("CSeq", self.cseq);
        if !self.session_id.is_empty() {
            response = response.header_once("Session", &self.session_id);
        }
        response = response
            .header_once("Server", crate::SERVER_NAME)
            .header_once("Date", rfc1123_date());
        self.writer.send(response.serialize().as_bytes()).await
    }

    // ---------------------------------------------------------------- OPTIONS

    async fn handle_options(&mut self, _req: &RtspRequest) -> Result<()> {
        self.reply(RtspResponse::new("200 OK").header("Public", PUBLIC_METHODS)).await
    }

    // ---------------------------------------------------------------- ANNOUNCE

    async fn handle_announce(&mut self, req: &RtspRequest) -> Result<()> {
        let mut full_url = req.uri.clone();
        self.content_base = full_url.clone();
        if full_url.ends_with(".sdp") {
            // Some pushers force a .sdp suffix onto the URL; it is not part
            // of the stream id
            full_url.truncate(full_url.len() - 4);
            self.parse_media_info(&full_url);
        }

        if self.media_info.tuple.app.is_empty() || self.media_info.tuple.stream.is_empty() {
            return Err(ProtocolError::forbidden(
                "illegal rtsp push url, at least two path levels required (rtsp://host/app/stream)",
            )
            .into());
        }

        let option = self
            .ctx
            .hooks
            .on_media_publish(MediaOriginType::RtspPush, &self.media_info, &self.session_info())
            .await
            .map_err(|err| ProtocolError {
                status: Status::Unauthorized,
                detail: err,
                fatal: true,
            })?;

        // A live source under this key may be a dropped pusher inside its
        // reconnect window; only then may this session take it over
        let tuple = self.media_info.tuple.clone();
        let registry = self.ctx.registry.clone();
        let mut reclaimed = None;
        if let Some(existing) = registry.find(&self.media_info.schema, &tuple.vhost, &tuple.app, &tuple.stream, false) {
            let rtsp_src = RtspMediaSource::from_dyn(&existing);
            let ownership = rtsp_src.as_ref().and_then(|src| src.ownership());
            match (rtsp_src, ownership) {
                (Some(src), Some(ownership)) => reclaimed = Some((src, ownership)),
                _ => {
                    return Err(ProtocolError::not_acceptable("Already publishing.").into());
                }
            }
        }

        let sdp = req.body_text();
        let tracks = parse_tracks(&sdp);
        if tracks.is_empty() {
            return Err(ProtocolError::forbidden("No valid track in SDP").into());
        }
        self.session_id = auth::make_session_id();
        self.tracks = tracks;
        self.init_track_state(true);

        let (src, ownership) = match reclaimed {
            Some((src, ownership)) => {
                src.set_sdp(sdp);
                src.set_option(option.clone());
                (src, ownership)
            }
            None => {
                let src = RtspMediaSource::new(&registry, tuple, sdp, option.clone());
                let ownership = src.ownership().expect("fresh source has no owner");
                if let Err(err) = src.register() {
                    return Err(ProtocolError::not_acceptable(err.to_string()).into());
                }
                (src, ownership)
            }
        };

        src.state()
            .set_listener(Arc::downgrade(&self.handle) as Weak<dyn MediaSourceEvent>);
        self.handle.set_push_src(Arc::downgrade(&src), option.clone());
        self.continue_push_ms = option.continue_push_ms;
        self.push_src = Some(src);
        self.push_ownership = Some(ownership);

        self.reply(RtspResponse::new("200 OK")).await
    }

    // ---------------------------------------------------------------- RECORD

    async fn handle_record(&mut self, req: &RtspRequest) -> Result<()> {
        if self.tracks.is_empty() || req.header_or_empty("Session") != self.session_id {
            return Err(ProtocolError::session_not_found(if self.tracks.is_empty() {
                "no available track when record"
            } else {
                "session not found when record"
            })
            .into());
        }
        if self.tracks.iter().any(|track| !track.inited) {
            return Err(Error::Shutdown("track not setuped".into()));
        }

        let rtp_info = self
            .tracks
            .iter()
            .map(|track| format!("url={}", track.control_url(&self.content_base)))
            .collect::<Vec<_>>()
            .join(",");
        self.reply(RtspResponse::new("200 OK").header("RTP-Info", rtp_info)).await
    }

    // ---------------------------------------------------------------- DESCRIBE & auth

    async fn handle_describe(&mut self, req: &RtspRequest) -> Result<()> {
        let authorization = req.header_or_empty("Authorization").to_string();

        let realm = match &self.realm {
            Some(realm) => realm.clone(),
            None => {
                let realm = self
                    .ctx
                    .hooks
                    .on_get_rtsp_realm(&self.media_info, &self.session_info())
                    .await
                    .unwrap_or_default();
                if !realm.is_empty() {
                    self.realm = Some(realm.clone());
                }
                realm
            }
        };

        if realm.is_empty() {
            // No RTSP-specific auth; the generic play gate decides
            return self.emit_on_play().await;
        }
        self.on_auth_user(&realm, &authorization).await
    }

    async fn emit_on_play(&mut self) -> Result<()> {
        if !self.emit_on_play {
            self.emit_on_play = true;
            if let Err(err) = self.ctx.hooks.on_media_played(&self.media_info, &self.session_info()).await {
                return Err(ProtocolError {
                    status: Status::Unauthorized,
                    detail: err,
                    fatal: true,
                }
                .into());
            }
        }
        self.on_auth_success().await
    }

    async fn on_auth_user(&mut self, realm: &str, authorization: &str) -> Result<()> {
        if authorization.is_empty() {
            return self.send_auth_challenge(realm).await;
        }
        let Some((scheme, rest)) = auth::split_auth_header(authorization) else {
            tracing::debug!("malformed authorization header");
            return self.send_auth_challenge(realm).await;
        };
        match scheme {
            "Basic" => self.on_auth_basic(realm, rest).await,
            "Digest" => self.on_auth_digest(realm, rest).await,
            other => {
                tracing::debug!(scheme = other, "unsupported auth scheme");
                self.send_auth_challenge(realm).await
            }
        }
    }

    async fn on_auth_basic(&mut self, realm: &str, encoded: &str) -> Result<()> {
        let Some((user, password)) = auth::basic_credentials(encoded) else {
            return self.send_auth_challenge(realm).await;
        };
        let stored = self
            .ctx
            .hooks
            .on_rtsp_auth(&self.media_info, realm, &user, true, &self.session_info())
            .await;
        let Some(stored) = stored else {
            // Realm configured but nobody answers credential lookups; let
            // the peer in rather than dead-ending the stream
            tracing::warn!(user, "auth requested but no credential hook serviced it");
            return self.on_auth_success().await;
        };
        if !stored.encrypted && stored.password == password {
            return self.on_auth_success().await;
        }
        tracing::debug!(user, "basic auth mismatch");
        self.send_auth_challenge(realm).await
    }

    async fn on_auth_digest(&mut self, realm: &str, fields: &str) -> Result<()> {
        let fields = auth::parse_digest_fields(fields);
        let empty = String::new();
        let client_realm = fields.get("realm").unwrap_or(&empty);
        if client_realm != realm {
            tracing::debug!(client_realm = %client_realm, "digest realm mismatch");
            return self.send_auth_challenge(realm).await;
        }
        let nonce = fields.get("nonce").unwrap_or(&empty);
        if nonce != &self.auth_nonce {
            tracing::debug!("digest nonce mismatch");
            return self.send_auth_challenge(realm).await;
        }
        let (user, uri, response) = (
            fields.get("username").unwrap_or(&empty).clone(),
            fields.get("uri").unwrap_or(&empty).clone(),
            fields.get("response").unwrap_or(&empty).clone(),
        );
        if user.is_empty() || uri.is_empty() || response.is_empty() {
            return self.send_auth_challenge(realm).await;
        }

        let stored = self
            .ctx
            .hooks
            .on_rtsp_auth(&self.media_info, realm, &user, false, &self.session_info())
            .await;
        let Some(stored) = stored else {
            tracing::warn!(user, "auth requested but no credential hook serviced it");
            return self.on_auth_success().await;
        };
        let nonce = nonce.clone();
        if auth::check_digest(
            &user,
            realm,
            &stored.password,
            stored.encrypted,
            &nonce,
            "DESCRIBE",
            &uri,
            &response,
        ) {
            self.on_auth_success().await
        } else {
            tracing::debug!(user, "digest auth mismatch");
            self.send_auth_challenge(realm).await
        }
    }

    async fn send_auth_challenge(&mut self, realm: &str) -> Result<()> {
        let challenge = if self.ctx.config.auth_basic {
            format!("Basic realm=\"{realm}\"")
        } else {
            // Digest first; the nonce must match on the follow-up
            self.auth_nonce = auth::make_nonce();
            format!("Digest realm=\"{realm}\",nonce=\"{}\"", self.auth_nonce)
        };
        self.reply(RtspResponse::new("401 Unauthorized").header("WWW-Authenticate", challenge))
            .await
    }

    async fn on_auth_success(&mut self) -> Result<()> {
        let info = self.media_info.clone();
        let session = self.session_info();
        let found = self.ctx.registry.clone().find_async(&info, &session).await;

        let Some(src) = found else {
            return Err(ProtocolError::stream_not_found(format!("no such stream: {}", info.short_url())).into());
        };
        let Some(rtsp_src) = RtspMediaSource::from_dyn(&src) else {
            return Err(ProtocolError::stream_not_found(format!("no such rtsp stream: {}", info.short_url())).into());
        };

        let sdp = rtsp_src.sdp();
        self.tracks = parse_tracks(&sdp);
        if self.tracks.is_empty() {
            tracing::warn!(url = %info.short_url(), "stream has no usable track in sdp");
            return Err(ProtocolError::stream_not_found("no available track in sdp").into());
        }
        self.init_track_state(false);
        self.session_id = auth::make_session_id();
        for track in &mut self.tracks {
            let stamp = rtsp_src.track_stamp(track.track_type);
            track.ssrc = stamp.ssrc;
            track.seq = stamp.seq;
            track.stamp_ms = stamp.stamp_ms;
        }
        self.play_src = {
            let as_dyn: Arc<dyn MediaSource> = rtsp_src;
            Arc::downgrade(&as_dyn)
        };

        self.reply(
            RtspResponse::new("200 OK")
                .header("Content-Base", format!("{}/", self.content_base))
                .header("x-Accept-Retransmit", "our-retransmit")
                .header("x-Accept-Dynamic-Rate", "1")
                .body(sdp),
        )
        .await
    }

    // ---------------------------------------------------------------- SETUP

    async fn handle_setup(&mut self, req: &RtspRequest) -> Result<()> {
        let track_idx = self.track_index_by_control_url(&req.uri)?;
        if self.tracks[track_idx].inited {
            return Err(Error::Shutdown("can not setup one track twice".into()));
        }

        let transport = TransportHeader::parse(req.header_or_empty("Transport"));
        if self.rtp_type.is_none() {
            let requested = transport.rtp_transport();
            if let Some(forced) = self.ctx.config.rtp_transport {
                if forced != requested {
                    tracing::warn!(requested = %requested, forced = %forced, "transport pinned by config");
                    return Err(ProtocolError::unsupported_transport(format!(
                        "config forces {forced}, client asked {requested}"
                    ))
                    .into());
                }
            }
            self.rtp_type = Some(requested);
        }
        let rtp_type = self.rtp_type.expect("set above");

        self.tracks[track_idx].inited = true;
        self.splitter.enable_recv_rtp(rtp_type == RtpTransport::Tcp);

        match rtp_type {
            RtpTransport::Tcp => self.setup_tcp(track_idx, &transport).await,
            RtpTransport::Udp => self.setup_udp(track_idx, &transport).await,
            RtpTransport::Multicast => self.setup_multicast(track_idx).await,
        }
    }

    async fn setup_tcp(&mut self, track_idx: usize, transport: &TransportHeader) -> Result<()> {
        let interleaved = if self.push_src.is_some() {
            // The pusher picks its channels
            match transport.interleaved {
                Some((rtp, _)) => rtp,
                None => return Err(Error::Shutdown("can not find interleaved in setup of rtp over tcp".into())),
            }
        } else {
            // Players share distributed data, the server picks
            2 * self.tracks[track_idx].track_type.index() as u8
        };
        self.tracks[track_idx].interleaved = interleaved;

        let ssrc = self.tracks[track_idx].ssrc;
        self.reply(
            RtspResponse::new("200 OK")
                .header(
                    "Transport",
                    format!(
                        "RTP/AVP/TCP;unicast;interleaved={}-{};ssrc={:08x}",
                        interleaved,
                        interleaved + 1,
                        ssrc
                    ),
                )
                .header("x-Transport-Options", "late-tolerance=1.400000")
                .header("x-Dynamic-Rate", "1"),
        )
        .await
    }

    async fn setup_udp(&mut self, track_idx: usize, transport: &TransportHeader) -> Result<()> {
        let local_ip = self.handle.local_addr.ip();
        let (rtp_sock, rtcp_sock) = match make_udp_pair(local_ip).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "udp port pair allocation failed");
                return Err(ProtocolError::not_acceptable("udp port allocation failed").into());
            }
        };

        let (client_rtp, client_rtcp) = transport.client_port.unwrap_or((0, 0));
        let peer_ip = self.peer_addr.ip();
        self.rtp_peer[track_idx] = Some(SocketAddr::new(peer_ip, client_rtp));
        self.rtcp_peer[track_idx] = Some(SocketAddr::new(peer_ip, client_rtcp));

        let server_rtp = rtp_sock.local_addr()?.port();
        let server_rtcp = rtcp_sock.local_addr()?.port();
        let rtp_sock = Arc::new(rtp_sock);
        let rtcp_sock = Arc::new(rtcp_sock);
        self.start_udp_reader(rtp_sock.clone(), 2 * track_idx as u8);
        self.start_udp_reader(rtcp_sock.clone(), 2 * track_idx as u8 + 1);
        self.rtp_socks[track_idx] = Some(rtp_sock);
        self.rtcp_socks[track_idx] = Some(rtcp_sock);

        let ssrc = self.tracks[track_idx].ssrc;
        self.reply(
            RtspResponse::new("200 OK").header(
                "Transport",
                format!(
                    "RTP/AVP/UDP;unicast;client_port={}-{};server_port={}-{};ssrc={:08x}",
                    client_rtp, client_rtcp, server_rtp, server_rtcp, ssrc
                ),
            ),
        )
        .await
    }

    async fn setup_multicast(&mut self, track_idx: usize) -> Result<()> {
        if self.multicaster.is_none() {
            let Some(play_src) = self.play_src.upgrade() else {
                return Err(ProtocolError::stream_not_found("rtsp stream released").into());
            };
            let Some(rtsp_src) = RtspMediaSource::from_dyn(&play_src) else {
                return Err(ProtocolError::not_acceptable("not an rtsp stream").into());
            };
            let local_ip = self.handle.local_addr.ip();
            let Some(caster) = self.ctx.multicast.get(local_ip, &rtsp_src).await else {
                return Err(ProtocolError::not_acceptable("no available udp multicast socket").into());
            };

            let handle = self.handle.clone();
            caster.set_detach_cb(
                self.id,
                Box::new(move || handle.close("multicast ring buffer detached")),
            );

            // Shared-socket RTCP from this peer keeps the liveness ticker fed
            let tx = self.tx.clone();
            self.ctx.multicast.listen_peer(
                self.peer_addr.ip(),
                self.id,
                Arc::new(move |interleaved, data, peer| {
                    let _ = tx.send(SessionEvent::PeerUdp { interleaved, data, peer });
                }),
            );
            self.multicaster = Some(caster);
        }

        let caster = self.multicaster.clone().expect("set above");
        let track_type = self.tracks[track_idx].track_type;
        let ssrc = self.tracks[track_idx].ssrc;
        self.reply(
            RtspResponse::new("200 OK").header(
                "Transport",
                format!(
                    "RTP/AVP;multicast;destination={};source={};port={}-{};ttl={};ssrc={:08x}",
                    caster.ip(),
                    self.handle.local_addr.ip(),
                    caster.rtp_port(track_type),
                    caster.rtcp_port(track_type),
                    self.ctx.config.udp_ttl,
                    ssrc
                ),
            ),
        )
        .await
    }

    fn start_udp_reader(&mut self, sock: Arc<UdpSocket>, interleaved: u8) {
        let tx = self.tx.clone();
        let expected_ip = self.peer_addr.ip();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (len, peer) = match sock.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(_) => return,
                };
                if peer.ip() != expected_ip {
                    tracing::warn!(interleaved, peer = %peer, "udp data from unexpected address");
                    continue;
                }
                let event = SessionEvent::PeerUdp {
                    interleaved,
                    data: Bytes::copy_from_slice(&buf[..len]),
                    peer,
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
        });
        self.aux_tasks.push(task);
    }

    // ---------------------------------------------------------------- PLAY / PAUSE

    async fn handle_play(&mut self, req: &RtspRequest) -> Result<()> {
        if self.tracks.is_empty() || req.header_or_empty("Session") != self.session_id {
            return Err(ProtocolError::session_not_found(if self.tracks.is_empty() {
                "no available track when play"
            } else {
                "session not found when play"
            })
            .into());
        }
        let Some(play_src) = self.play_src.upgrade() else {
            return Err(ProtocolError::stream_not_found("rtsp stream released").into());
        };
        let Some(rtsp_src) = RtspMediaSource::from_dyn(&play_src) else {
            return Err(ProtocolError::stream_not_found("rtsp stream released").into());
        };
        let src: &dyn MediaSource = &*play_src;

        let mut resp = RtspResponse::new("200 OK");
        let mut use_gop = true;

        let scale = req.header_or_empty("Scale").to_string();
        if !scale.is_empty() {
            resp = resp.header("Scale", &scale);
            if let Ok(speed) = scale.trim().parse::<f32>() {
                src.speed(speed);
                tracing::info!(speed, "rtsp set play speed");
            }
        }
        let range = req.header_or_empty("Range").to_string();
        if !range.is_empty() {
            resp = resp.header("Range", &range);
            let start = parse_npt_start_ms(&range);
            // When the seek actually moved the stream the GOP cache is stale
            use_gop = !src.seek_to(start);
            tracing::info!(start_ms = start, "rtsp seek");
        }

        let mut inited_tracks = Vec::new();
        let mut rtp_info = Vec::new();
        for track in &mut self.tracks {
            if !track.inited {
                // Single-track players never set up the others
                continue;
            }
            let stamp = rtsp_src.track_stamp(track.track_type);
            track.ssrc = stamp.ssrc;
            track.seq = stamp.seq;
            track.stamp_ms = stamp.stamp_ms;
            inited_tracks.push(track.track_type);
            rtp_info.push(format!(
                "url={};seq={};rtptime={}",
                track.control_url(&self.content_base),
                track.seq,
                track.rtptime()
            ));
        }

        resp = resp.header("RTP-Info", rtp_info.join(","));
        resp = resp.header_once("Range", format!("npt={:.2}", rtsp_src.stamp_ms() as f64 / 1000.0));
        self.reply(resp).await?;

        if inited_tracks.len() == 1 {
            self.target_play_track = Some(inited_tracks[0]);
            tracing::info!(track = %inited_tracks[0], "single-track playback");
        }

        src.pause(false);

        if !self.play_attached && self.rtp_type != Some(RtpTransport::Multicast) {
            for first in &mut self.send_sr_first {
                *first = true;
            }
            let mut reader = rtsp_src.attach_reader(use_gop);
            let tx = self.tx.clone();
            let task = tokio::spawn(async move {
                loop {
                    match reader.recv().await {
                        Ok(batch) => {
                            if tx.send(SessionEvent::RtpBatch(batch)).is_err() {
                                return;
                            }
                        }
                        Err(_) => {
                            let _ = tx.send(SessionEvent::RingDetached);
                            return;
                        }
                    }
                }
            });
            self.aux_tasks.push(task);
            self.play_attached = true;
        }
        Ok(())
    }

    async fn handle_pause(&mut self, req: &RtspRequest) -> Result<()> {
        if req.header_or_empty("Session") != self.session_id {
            return Err(ProtocolError::session_not_found("session not found when pause").into());
        }
        self.reply(RtspResponse::new("200 OK")).await?;
        if let Some(src) = self.play_src.upgrade() {
            let src: &dyn MediaSource = &*src;
            src.pause(true);
        }
        Ok(())
    }

    async fn handle_teardown(&mut self, _req: &RtspRequest) -> Result<()> {
        // Clear the push source first: the reply may hit a broken pipe whose
        // error path would otherwise start the reconnect grace window
        self.push_src = None;
        self.push_ownership = None;
        self.reply(RtspResponse::new("200 OK")).await?;
        Err(Error::Shutdown("recv teardown request".into()))
    }

    // ---------------------------------------------------------------- HTTP tunnel

    async fn handle_get(&mut self, req: &RtspRequest) -> Result<()> {
        self.tunnel_cookie = req.header_or_empty("x-sessioncookie").to_string();
        self.reply(
            RtspResponse::http("200 OK")
                .header("Cache-Control", "no-store")
                .header("Pragma", "no-store")
                .header("Content-Type", "application/x-rtsp-tunnelled"),
        )
        .await?;

        // Hand the poster an injection channel into this session
        let (tunnel_tx, mut tunnel_rx) = mpsc::unbounded_channel::<Bytes>();
        self.ctx.tunnels.register(&self.tunnel_cookie, self.id, tunnel_tx);
        let tx = self.tx.clone();
        self.aux_tasks.push(tokio::spawn(async move {
            while let Some(data) = tunnel_rx.recv().await {
                if tx.send(SessionEvent::TunnelRecv(data)).is_err() {
                    return;
                }
            }
        }));
        Ok(())
    }

    async fn handle_post(&mut self, req: &RtspRequest) -> Result<()> {
        let cookie = req.header_or_empty("x-sessioncookie");
        let Some(getter) = self.ctx.tunnels.take(cookie) else {
            return Err(Error::Shutdown("can not find http getter by x-sessioncookie".into()));
        };
        self.poster_tx = Some(getter);

        if !req.body.is_empty() {
            let body = req.body.clone();
            self.on_post_data(&body)?;
        }

        self.reply(
            RtspResponse::http("200 OK")
                .header("Cache-Control", "no-store")
                .header("Pragma", "no-store")
                .header("Content-Type", "application/x-rtsp-tunnelled"),
        )
        .await
    }

    /// Base64 tunnel payload from the poster; decoded in 4-byte groups, the
    /// tail carried to the next buffer
    fn on_post_data(&mut self, data: &[u8]) -> Result<()> {
        self.b64_carry.extend(data.iter().copied().filter(|b| !b.is_ascii_whitespace()));
        let usable = self.b64_carry.len() - self.b64_carry.len() % 4;
        if usable == 0 {
            return Ok(());
        }
        let chunk: Vec<u8> = self.b64_carry.drain(..usable).collect();
        let decoded = BASE64
            .decode(&chunk)
            .map_err(|err| Error::Parse(format!("bad base64 in http tunnel: {err}")))?;
        let getter = self.poster_tx.as_ref().ok_or_else(|| Error::Internal("poster without getter".into()))?;
        getter
            .send(Bytes::from(decoded))
            .map_err(|_| Error::Shutdown("http getter released".into()))
    }

    // ---------------------------------------------------------------- parameters

    async fn handle_parameter(&mut self, _req: &RtspRequest) -> Result<()> {
        // ACK only; bodies are accepted and ignored
        self.reply(RtspResponse::new("200 OK")).await
    }

    // ---------------------------------------------------------------- RTP/RTCP input

    async fn on_rtp_packet(&mut self, frame: &Bytes) -> Result<()> {
        let interleaved = frame[1];
        let payload = &frame[4..];
        if interleaved % 2 == 0 {
            if payload.len() <= RTP_HEADER_SIZE {
                return Err(Error::Parse("runt interleaved rtp".into()));
            }
            let pt = payload[1] & 0x7f;
            let track_idx = self.track_index_by_pt(pt)?;
            self.handle_one_rtp(track_idx, payload).await
        } else {
            let track_idx = self.track_index_by_interleaved(interleaved - 1)?;
            self.on_rtcp_input(track_idx, payload);
            Ok(())
        }
    }

    async fn on_rcv_peer_udp(&mut self, interleaved: u8, data: &Bytes, peer: SocketAddr) -> Result<()> {
        // Any peer datagram, RTCP heartbeats included, proves liveness
        self.alive = Instant::now();
        self.bytes_received += data.len() as u64;

        let track_idx = (interleaved / 2) as usize;
        if interleaved % 2 == 0 {
            if self.push_src.is_some() {
                if track_idx >= self.tracks.len() {
                    return Ok(());
                }
                return self.handle_one_rtp(track_idx, data).await;
            }
            // A player's first RTP datagram is the NAT hole punch; aim the
            // track's RTP socket at the observed address
            if self.udp_connected.insert(interleaved) {
                if let Some(slot) = self.rtp_peer.get_mut(track_idx) {
                    tracing::debug!(track_idx, peer = %peer, "rtp peer rebound by probe");
                    *slot = Some(peer);
                }
            }
            Ok(())
        } else {
            if self.udp_connected.insert(interleaved) {
                if let Some(slot) = self.rtcp_peer.get_mut(track_idx) {
                    *slot = Some(peer);
                }
            }
            if track_idx < self.tracks.len() {
                self.on_rtcp_input(track_idx, data);
            }
            Ok(())
        }
    }

    fn on_rtcp_input(&mut self, track_idx: usize, data: &[u8]) {
        for packet in rtcp::parse_packets(data) {
            if packet.pt == rtcp::RTCP_SR {
                if let Some(sr) = SenderReport::parse(&packet) {
                    self.rtcp[track_idx].on_sr(&sr);
                    // The SR's pairing of RTP and wall clock drives A/V sync
                    self.ntp[track_idx].set(sr.rtp_ts, sr.ntp_unix_ms());
                }
            }
        }
    }

    async fn handle_one_rtp(&mut self, track_idx: usize, raw: &[u8]) -> Result<()> {
        if raw.len() < RTP_HEADER_SIZE {
            return Err(Error::Parse("runt rtp".into()));
        }
        let (track_type, sample_rate) = {
            let track = &self.tracks[track_idx];
            (track.track_type, track.sample_rate)
        };
        let stamp = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let ntp_ms = self.ntp[track_idx].map(stamp, sample_rate);
        let Some(rtp) = RtpPacket::from_wire(track_type, sample_rate, ntp_ms, raw) else {
            return Err(Error::Parse("malformed rtp".into()));
        };

        self.update_rtcp_context(track_idx, &rtp);
        self.flush_pending_rtcp(track_idx).await?;
        for sorted in self.sorters[track_idx].sort(rtp) {
            self.on_rtp_sorted(sorted);
        }
        Ok(())
    }

    fn on_rtp_sorted(&mut self, rtp: RtpPacket) {
        match &self.push_src {
            Some(src) => src.on_write(rtp, false),
            None => tracing::warn!("rtp input on a session that is not pushing"),
        }
    }

    // ---------------------------------------------------------------- RTP/RTCP output

    async fn send_rtp_batch(&mut self, batch: &RtpBatch) -> Result<()> {
        match self.rtp_type {
            Some(RtpTransport::Tcp) => {
                self.writer.set_flush_flag(false);
                for rtp in batch.iter() {
                    if self.skip_for_target(rtp) {
                        continue;
                    }
                    if let Some(track_idx) = self.track_index_by_type(rtp.track_type) {
                        self.update_rtcp_context(track_idx, rtp);
                        self.flush_pending_rtcp(track_idx).await?;
                    }
                    self.writer.send(rtp.full()).await?;
                }
                self.writer.flush_all().await?;
                self.writer.set_flush_flag(true);
            }
            Some(RtpTransport::Udp) => {
                for rtp in batch.iter() {
                    if self.skip_for_target(rtp) {
                        continue;
                    }
                    let Some(track_idx) = self.track_index_by_type(rtp.track_type) else {
                        continue;
                    };
                    self.update_rtcp_context(track_idx, rtp);
                    self.flush_pending_rtcp(track_idx).await?;
                    let (sock, peer) = match (&self.rtp_socks[track_idx], self.rtp_peer[track_idx]) {
                        (Some(sock), Some(peer)) => (sock.clone(), peer),
                        _ => return Err(Error::Shutdown("udp sock not opened yet".into())),
                    };
                    if let Err(err) = sock.send_to(rtp.rtp(), peer).await {
                        tracing::debug!(error = %err, "udp rtp send failed");
                    } else {
                        self.writer.bytes_sent += rtp.rtp_size() as u64;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Track the RTP in its RTCP context and queue a report when due
    fn update_rtcp_context(&mut self, track_idx: usize, rtp: &RtpPacket) {
        self.rtcp[track_idx].on_rtp(rtp.seq(), rtp.stamp(), rtp.sample_rate, rtp.rtp_size());
        if rtp.ntp_stamp_ms == 0 && rtp.stamp() == 0 {
            // Unsynchronized zero stamps carry nothing worth reporting
            return;
        }
        let is_pusher = self.push_src.is_some();
        let due = self.rtcp_tickers[track_idx].elapsed() >= RTCP_SEND_INTERVAL
            || (self.send_sr_first[track_idx] && !is_pusher);
        if !due {
            return;
        }
        self.rtcp_tickers[track_idx] = Instant::now();
        self.send_sr_first[track_idx] = false;
        self.pending_rtcp[track_idx] = Some(rtp.ssrc());
    }

    /// Emit the RR/SR plus SDES queued by `update_rtcp_context`
    async fn flush_pending_rtcp(&mut self, track_idx: usize) -> Result<()> {
        let Some(ssrc) = self.pending_rtcp[track_idx].take() else {
            return Ok(());
        };
        let is_pusher = self.push_src.is_some();
        let report = if is_pusher {
            // Reporter ssrc is conventionally distinct from the reportee's
            self.rtcp[track_idx].create_rr(ssrc.wrapping_add(1), ssrc)
        } else {
            self.rtcp[track_idx].create_sr(ssrc)
        };
        let Some(report) = report else { return Ok(()) };
        let sdes = rtcp::build_sdes_cname(ssrc, crate::SERVER_NAME);
        self.send_rtcp(track_idx, &report).await?;
        self.send_rtcp(track_idx, &sdes).await
    }

    async fn send_rtcp(&mut self, track_idx: usize, payload: &[u8]) -> Result<()> {
        match self.rtp_type {
            Some(RtpTransport::Tcp) => {
                let channel = self.tracks[track_idx].interleaved + 1;
                let prefix = make_interleaved_prefix(payload.len() as u16, channel);
                self.writer.send(&prefix).await?;
                self.writer.send(payload).await
            }
            Some(RtpTransport::Udp) => {
                if let (Some(sock), Some(peer)) = (&self.rtcp_socks[track_idx], self.rtcp_peer[track_idx]) {
                    if let Err(err) = sock.send_to(payload, peer).await {
                        tracing::debug!(error = %err, "udp rtcp send failed");
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn skip_for_target(&self, rtp: &RtpPacket) -> bool {
        matches!(self.target_play_track, Some(target) if target != rtp.track_type)
    }

    // ---------------------------------------------------------------- track lookup

    fn init_track_state(&mut self, pusher: bool) {
        let n = self.tracks.len();
        self.rtcp = (0..n)
            .map(|_| if pusher { RtcpContext::new_recv() } else { RtcpContext::new_send() })
            .collect();
        self.rtcp_tickers = vec![Instant::now(); n];
        self.send_sr_first = vec![true; n];
        self.ntp = vec![NtpStamp::default(); n];
        self.sorters = (0..n).map(|_| RtpSorter::new()).collect();
        self.rtp_socks = vec![None; n];
        self.rtcp_socks = vec![None; n];
        self.rtp_peer = vec![None; n];
        self.rtcp_peer = vec![None; n];
        self.pending_rtcp = vec![None; n];
    }

    fn track_index_by_pt(&self, pt: u8) -> Result<usize> {
        match self.tracks.iter().position(|track| track.pt == pt) {
            Some(idx) => Ok(idx),
            None if self.tracks.len() == 1 => Ok(0),
            None => Err(Error::Shutdown(format!("no such track with pt: {pt}"))),
        }
    }

    fn track_index_by_type(&self, track_type: TrackType) -> Option<usize> {
        match self.tracks.iter().position(|track| track.track_type == track_type) {
            Some(idx) => Some(idx),
            None if self.tracks.len() == 1 => Some(0),
            None => None,
        }
    }

    fn track_index_by_interleaved(&self, interleaved: u8) -> Result<usize> {
        match self.tracks.iter().position(|track| track.interleaved == interleaved) {
            Some(idx) => Ok(idx),
            None if self.tracks.len() == 1 => Ok(0),
            None => Err(Error::Shutdown(format!("no such track with interleaved: {interleaved}"))),
        }
    }

    fn track_index_by_control_url(&self, url: &str) -> Result<usize> {
        let matched = self
            .tracks
            .iter()
            .position(|track| url.starts_with(&track.control_url(&self.content_base)));
        match matched {
            Some(idx) => Ok(idx),
            None if self.tracks.len() == 1 => Ok(0),
            None => Err(Error::Shutdown(format!("no such track with control url: {url}"))),
        }
    }

    // ---------------------------------------------------------------- liveness & teardown

    fn on_manager(&mut self) -> Result<()> {
        let config = &self.ctx.config;
        if self.session_id.is_empty() && self.created.elapsed() > config.handshake_timeout {
            return Err(Error::Timeout("illegal connection".into()));
        }
        if self.push_src.is_some() && self.alive.elapsed() > config.keep_alive_timeout {
            return Err(Error::Timeout("pusher session timeout".into()));
        }
        if self.push_src.is_none()
            && self.rtp_type == Some(RtpTransport::Udp)
            && self.alive.elapsed() > 4 * config.keep_alive_timeout
        {
            // TCP players are covered by TCP keepalive; UDP needs its own
            return Err(Error::Timeout("rtp over udp player timeout".into()));
        }
        Ok(())
    }

    /// The single exit path: flow accounting, tunnel/multicast cleanup and
    /// the pusher reconnect grace window
    async fn on_error(&mut self, err: &Error) {
        let is_player = self.push_ownership.is_none();
        let duration = self.created.elapsed().as_secs();
        tracing::warn!(
            kind = if is_player { "player" } else { "pusher" },
            url = %self.media_info.short_url(),
            error = %err,
            duration_secs = duration,
            "rtsp session closed"
        );

        let _ = self.writer.flush_all().await;

        if let Some(caster) = self.multicaster.take() {
            caster.remove_detach_cb(self.id);
            self.ctx.multicast.stop_listen_peer(self.peer_addr.ip(), self.id);
        }
        if !self.tunnel_cookie.is_empty() {
            self.ctx.tunnels.remove(&self.tunnel_cookie, self.id);
        }

        let bytes_usage = self.bytes_received + self.writer.bytes_sent;
        if bytes_usage >= self.ctx.config.flow_threshold_kb * 1024 {
            self.ctx
                .hooks
                .on_flow_report(&self.media_info, bytes_usage, duration, is_player, &self.session_info());
        }

        // A pusher that vanished without TEARDOWN keeps its source alive and
        // registered for the grace window; ownership is released immediately
        // so a reconnecting pusher can claim it
        if let Some(src) = self.push_src.take() {
            src.flush();
            self.push_ownership = None;
            if self.continue_push_ms > 0 && !matches!(err, Error::Shutdown(_)) {
                let as_dyn: Arc<dyn MediaSource> = src;
                delayed_release(as_dyn, Duration::from_millis(self.continue_push_ms));
            }
        }

        for task in self.aux_tasks.drain(..) {
            task.abort();
        }
    }
}

/// `Range: npt=<start>-…`; `now` plays from the live point
fn parse_npt_start_ms(range: &str) -> u32 {
    let Some(start) = range.split("npt=").nth(1) else { return 0 };
    let start = start.split('-').next().unwrap_or_default().trim();
    if start == "now" || start.is_empty() {
        return 0;
    }
    (start.parse::<f64>().unwrap_or(0.0) * 1000.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{resolved, AuthPassword, DefaultHooks, HookFuture, MediaHooks};
    use crate::media::config::RegistryConfig;
    use crate::media::info::MediaTuple;
    use crate::server::config::ServerConfig;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 0.0.0.0\r\n\
        s=cam\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:trackID=0\r\n";

    static NEXT_TEST_SESSION: AtomicU64 = AtomicU64::new(1);

    fn ctx_with(config: ServerConfig, registry_config: RegistryConfig, hooks: Arc<dyn MediaHooks>) -> Arc<ServerContext> {
        ServerContext::new(config, registry_config, hooks)
    }

    fn default_ctx() -> Arc<ServerContext> {
        ctx_with(
            ServerConfig::default(),
            RegistryConfig::default().max_stream_wait(Duration::from_millis(200)),
            Arc::new(DefaultHooks),
        )
    }

    /// Client side of a freshly spawned session
    struct TestClient {
        stream: TcpStream,
        buf: Vec<u8>,
    }

    impl TestClient {
        async fn connect(ctx: &Arc<ServerContext>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let stream = TcpStream::connect(addr).await.unwrap();
            let (server_sock, peer) = listener.accept().await.unwrap();
            let ctx = ctx.clone();
            let id = NEXT_TEST_SESSION.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move { RtspSession::run(id, server_sock, peer, ctx).await });
            Self { stream, buf: Vec::new() }
        }

        async fn fill(&mut self) {
            let mut tmp = [0u8; 4096];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut tmp))
                .await
                .expect("read timed out")
                .expect("read failed");
            assert!(n > 0, "peer closed while a reply was expected");
            self.buf.extend_from_slice(&tmp[..n]);
        }

        async fn request(&mut self, request: &str) -> String {
            self.stream.write_all(request.as_bytes()).await.unwrap();
            self.read_reply().await
        }

        /// Next textual reply; interleaved frames arriving first are skipped
        async fn read_reply(&mut self) -> String {
            loop {
                while !self.buf.is_empty() && self.buf[0] == b'$' {
                    if let Some(frame) = self.try_take_frame() {
                        drop(frame);
                        continue;
                    }
                    break;
                }
                if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head_end = pos + 4;
                    let head = String::from_utf8_lossy(&self.buf[..head_end]).into_owned();
                    let body_len = head
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if self.buf.len() >= head_end + body_len {
                        let reply: Vec<u8> = self.buf.drain(..head_end + body_len).collect();
                        return String::from_utf8_lossy(&reply).into_owned();
                    }
                }
                self.fill().await;
            }
        }

        fn try_take_frame(&mut self) -> Option<Vec<u8>> {
            if self.buf.len() < 4 || self.buf[0] != b'$' {
                return None;
            }
            let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            if self.buf.len() < 4 + len {
                return None;
            }
            Some(self.buf.drain(..4 + len).collect())
        }

        /// Next interleaved frame, reading as needed
        async fn read_frame(&mut self) -> Vec<u8> {
            loop {
                if let Some(frame) = self.try_take_frame() {
                    return frame;
                }
                assert!(self.buf.is_empty() || self.buf[0] == b'$', "expected interleaved data");
                self.fill().await;
            }
        }

        async fn expect_eof(&mut self) {
            let mut tmp = [0u8; 64];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut tmp))
                .await
                .expect("read timed out")
                .expect("read failed");
            assert_eq!(n, 0, "expected the server to close the connection");
        }
    }

    fn header_value<'a>(reply: &'a str, name: &str) -> Option<&'a str> {
        reply.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    fn publish_source(ctx: &Arc<ServerContext>, stream: &str) -> Arc<RtspMediaSource> {
        let src = RtspMediaSource::new(
            &ctx.registry,
            MediaTuple::new("", "live", stream),
            SDP.to_string(),
            PublishOption::default(),
        );
        src.register().unwrap();
        src
    }

    #[tokio::test]
    async fn options_echoes_cseq_and_public() {
        let ctx = default_ctx();
        let mut client = TestClient::connect(&ctx).await;

        let reply = client.request("OPTIONS rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"));
        assert_eq!(header_value(&reply, "CSeq"), Some("1"));
        assert_eq!(header_value(&reply, "Public"), Some(PUBLIC_METHODS));
        assert!(header_value(&reply, "Server").unwrap().starts_with("rtsp-engine/"));
        assert!(header_value(&reply, "Date").unwrap().ends_with("GMT"));
    }

    #[tokio::test]
    async fn unknown_method_is_forbidden_and_fatal() {
        let ctx = default_ctx();
        let mut client = TestClient::connect(&ctx).await;

        let reply = client.request("BREW rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 2\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 403 Forbidden"));
        client.expect_eof().await;
    }

    #[tokio::test]
    async fn describe_missing_stream_is_404() {
        let ctx = default_ctx();
        let mut client = TestClient::connect(&ctx).await;

        let reply = client.request("DESCRIBE rtsp://127.0.0.1/live/ghost RTSP/1.0\r\nCSeq: 1\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 404 Stream Not Found"), "got: {reply}");
        client.expect_eof().await;
    }

    #[tokio::test]
    async fn describe_existing_stream_returns_sdp() {
        let ctx = default_ctx();
        let _src = publish_source(&ctx, "cam");
        let mut client = TestClient::connect(&ctx).await;

        let reply = client.request("DESCRIBE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 2\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 200 OK"), "got: {reply}");
        assert_eq!(
            header_value(&reply, "Content-Base"),
            Some("rtsp://127.0.0.1/live/cam/")
        );
        assert_eq!(header_value(&reply, "x-Accept-Dynamic-Rate"), Some("1"));
        assert!(reply.contains("m=video"));
        // A negotiated session id is 12 random characters
        assert_eq!(header_value(&reply, "Session").unwrap().len(), 12);
    }

    struct AuthHooks;
    impl MediaHooks for AuthHooks {
        fn on_get_rtsp_realm(&self, _info: &MediaInfo, _session: &SessionInfo) -> HookFuture<Option<String>> {
            resolved(Some("studio".to_string()))
        }
        fn on_rtsp_auth(
            &self,
            _info: &MediaInfo,
            _realm: &str,
            user: &str,
            _needs_cleartext: bool,
            _session: &SessionInfo,
        ) -> HookFuture<Option<AuthPassword>> {
            let known = user == "alice";
            resolved(known.then(|| AuthPassword::cleartext("secret")))
        }
    }

    #[tokio::test]
    async fn digest_challenge_then_success() {
        let ctx = ctx_with(ServerConfig::default(), RegistryConfig::default(), Arc::new(AuthHooks));
        let _src = publish_source(&ctx, "cam");
        let mut client = TestClient::connect(&ctx).await;

        let challenge = client.request("DESCRIBE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 2\r\n\r\n").await;
        assert!(challenge.starts_with("RTSP/1.0 401 Unauthorized"), "got: {challenge}");
        let www = header_value(&challenge, "WWW-Authenticate").unwrap();
        assert!(www.starts_with("Digest realm=\"studio\""));
        let nonce_at = www.find("nonce=\"").unwrap() + 7;
        let nonce = &www[nonce_at..nonce_at + 32];

        let uri = "rtsp://127.0.0.1/live/cam";
        let response = auth::digest_response(&auth::ha1("alice", "studio", "secret"), nonce, "DESCRIBE", uri);
        let authorized = client
            .request(&format!(
                "DESCRIBE {uri} RTSP/1.0\r\nCSeq: 3\r\nAuthorization: Digest username=\"alice\", realm=\"studio\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\"\r\n\r\n"
            ))
            .await;
        assert!(authorized.starts_with("RTSP/1.0 200 OK"), "got: {authorized}");
        assert!(authorized.contains("m=video"));
    }

    #[tokio::test]
    async fn digest_wrong_password_rechallenges() {
        let ctx = ctx_with(ServerConfig::default(), RegistryConfig::default(), Arc::new(AuthHooks));
        let _src = publish_source(&ctx, "cam");
        let mut client = TestClient::connect(&ctx).await;

        let challenge = client.request("DESCRIBE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 2\r\n\r\n").await;
        let www = header_value(&challenge, "WWW-Authenticate").unwrap();
        let nonce_at = www.find("nonce=\"").unwrap() + 7;
        let nonce = &www[nonce_at..nonce_at + 32];

        let uri = "rtsp://127.0.0.1/live/cam";
        let response = auth::digest_response(&auth::ha1("alice", "studio", "wrong"), nonce, "DESCRIBE", uri);
        let retry = client
            .request(&format!(
                "DESCRIBE {uri} RTSP/1.0\r\nCSeq: 3\r\nAuthorization: Digest username=\"alice\", realm=\"studio\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\"\r\n\r\n"
            ))
            .await;
        // Wrong password: challenged again, connection stays up
        assert!(retry.starts_with("RTSP/1.0 401 Unauthorized"), "got: {retry}");
        assert!(header_value(&retry, "WWW-Authenticate").is_some());
    }

    #[tokio::test]
    async fn basic_challenge_when_configured() {
        let ctx = ctx_with(
            ServerConfig::default().auth_basic(true),
            RegistryConfig::default(),
            Arc::new(AuthHooks),
        );
        let _src = publish_source(&ctx, "cam");
        let mut client = TestClient::connect(&ctx).await;

        let challenge = client.request("DESCRIBE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n").await;
        assert_eq!(header_value(&challenge, "WWW-Authenticate"), Some("Basic realm=\"studio\""));

        let credentials = base64::engine::general_purpose::STANDARD.encode("alice:secret");
        let authorized = client
            .request(&format!(
                "DESCRIBE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 2\r\nAuthorization: Basic {credentials}\r\n\r\n"
            ))
            .await;
        assert!(authorized.starts_with("RTSP/1.0 200 OK"), "got: {authorized}");
    }

    #[tokio::test]
    async fn transport_mismatch_replies_461() {
        let ctx = ctx_with(
            ServerConfig::default().rtp_transport(RtpTransport::Tcp),
            RegistryConfig::default(),
            Arc::new(DefaultHooks),
        );
        let mut client = TestClient::connect(&ctx).await;

        let reply = client
            .request(&format!(
                "ANNOUNCE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
                SDP.len(),
                SDP
            ))
            .await;
        assert!(reply.starts_with("RTSP/1.0 200 OK"), "got: {reply}");

        let reply = client
            .request(
                "SETUP rtsp://127.0.0.1/live/cam/trackID=0 RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n",
            )
            .await;
        assert!(reply.starts_with("RTSP/1.0 461 Unsupported Transport"), "got: {reply}");
    }

    #[tokio::test]
    async fn pusher_announce_setup_record_flow() {
        let ctx = default_ctx();
        let mut client = TestClient::connect(&ctx).await;

        let reply = client
            .request(&format!(
                "ANNOUNCE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
                SDP.len(),
                SDP
            ))
            .await;
        assert!(reply.starts_with("RTSP/1.0 200 OK"), "got: {reply}");
        let session = header_value(&reply, "Session").unwrap().to_string();

        let reply = client
            .request(&format!(
                "SETUP rtsp://127.0.0.1/live/cam/trackID=0 RTSP/1.0\r\nCSeq: 2\r\nSession: {session}\r\nTransport: RTP/AVP/TCP;unicast;interleaved=4-5\r\n\r\n"
            ))
            .await;
        assert!(reply.starts_with("RTSP/1.0 200 OK"), "got: {reply}");
        let transport = header_value(&reply, "Transport").unwrap();
        // The pusher's interleaved pick is honored
        assert!(transport.contains("interleaved=4-5"), "got: {transport}");
        assert_eq!(header_value(&reply, "x-Dynamic-Rate"), Some("1"));
        assert_eq!(header_value(&reply, "x-Transport-Options"), Some("late-tolerance=1.400000"));

        let reply = client
            .request(&format!("RECORD rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 3\r\nSession: {session}\r\nRange: npt=0.000-\r\n\r\n"))
            .await;
        assert!(reply.starts_with("RTSP/1.0 200 OK"), "got: {reply}");
        assert!(header_value(&reply, "RTP-Info").unwrap().contains("url=rtsp://127.0.0.1/live/cam/trackID=0"));

        // The source is up and findable
        let found = ctx.registry.find("rtsp", crate::media::info::DEFAULT_VHOST, "live", "cam", false);
        let src = RtspMediaSource::from_dyn(&found.unwrap()).unwrap();

        // Push one interleaved RTP packet through and watch it land
        let rtp = RtpPacket::build(TrackType::Video, 90_000, 0, 42, 90_000, 0x1234, &[1, 2, 3]);
        let mut wire = Vec::new();
        wire.push(b'$');
        wire.push(4);
        wire.extend_from_slice(&(rtp.rtp_size() as u16).to_be_bytes());
        wire.extend_from_slice(rtp.rtp());
        client.stream.write_all(&wire).await.unwrap();

        timeout(Duration::from_secs(5), async {
            loop {
                if src.track_stamp(TrackType::Video).seq == 42 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pushed rtp reached the source");
    }

    #[tokio::test]
    async fn second_pusher_gets_406() {
        let ctx = default_ctx();
        let mut first = TestClient::connect(&ctx).await;
        let announce = format!(
            "ANNOUNCE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
            SDP.len(),
            SDP
        );
        assert!(first.request(&announce).await.starts_with("RTSP/1.0 200 OK"));

        let mut second = TestClient::connect(&ctx).await;
        let conflict = second.request(&announce).await;
        assert!(conflict.starts_with("RTSP/1.0 406 Not Acceptable"), "got: {conflict}");
        assert!(conflict.contains("Already publishing."));
        second.expect_eof().await;
    }

    struct GraceHooks;
    impl MediaHooks for GraceHooks {
        fn on_media_publish(
            &self,
            _origin: MediaOriginType,
            _info: &MediaInfo,
            _session: &SessionInfo,
        ) -> HookFuture<std::result::Result<PublishOption, String>> {
            resolved(Ok(PublishOption {
                continue_push_ms: 400,
                auto_close: false,
            }))
        }
    }

    #[tokio::test]
    async fn pusher_reconnect_within_grace_window() {
        let ctx = ctx_with(ServerConfig::default(), RegistryConfig::default(), Arc::new(GraceHooks));
        let announce = format!(
            "ANNOUNCE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
            SDP.len(),
            SDP
        );

        let mut first = TestClient::connect(&ctx).await;
        assert!(first.request(&announce).await.starts_with("RTSP/1.0 200 OK"));

        // Non-clean disconnect: just drop the TCP connection
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Within the window the source is still registered and re-ownable
        assert!(ctx.registry.find("rtsp", crate::media::info::DEFAULT_VHOST, "live", "cam", false).is_some());
        let mut second = TestClient::connect(&ctx).await;
        let reply = second.request(&announce).await;
        assert!(reply.starts_with("RTSP/1.0 200 OK"), "got: {reply}");
    }

    #[tokio::test]
    async fn grace_window_expires_without_reconnect() {
        let ctx = ctx_with(ServerConfig::default(), RegistryConfig::default(), Arc::new(GraceHooks));
        let announce = format!(
            "ANNOUNCE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
            SDP.len(),
            SDP
        );

        let mut first = TestClient::connect(&ctx).await;
        assert!(first.request(&announce).await.starts_with("RTSP/1.0 200 OK"));
        drop(first);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ctx.registry.find("rtsp", crate::media::info::DEFAULT_VHOST, "live", "cam", false).is_some());

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(ctx.registry.find("rtsp", crate::media::info::DEFAULT_VHOST, "live", "cam", false).is_none());
    }

    #[tokio::test]
    async fn teardown_replies_then_closes() {
        let ctx = default_ctx();
        let mut client = TestClient::connect(&ctx).await;

        let reply = client.request("TEARDOWN rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 9\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 200 OK"));
        client.expect_eof().await;
    }

    #[tokio::test]
    async fn set_parameter_acks() {
        let ctx = default_ctx();
        let mut client = TestClient::connect(&ctx).await;

        let reply = client.request("SET_PARAMETER rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 4\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 200 OK"));
        let reply = client.request("GET_PARAMETER rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 5\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 200 OK"));
    }

    #[tokio::test]
    async fn player_play_receives_interleaved_rtp() {
        let ctx = default_ctx();
        let src = publish_source(&ctx, "cam");
        let mut client = TestClient::connect(&ctx).await;

        let describe = client.request("DESCRIBE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n").await;
        assert!(describe.starts_with("RTSP/1.0 200 OK"), "got: {describe}");
        let session = header_value(&describe, "Session").unwrap().to_string();

        let setup = client
            .request(&format!(
                "SETUP rtsp://127.0.0.1/live/cam/trackID=0 RTSP/1.0\r\nCSeq: 2\r\nSession: {session}\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
            ))
            .await;
        assert!(setup.starts_with("RTSP/1.0 200 OK"), "got: {setup}");
        // Players get server-assigned channels: video on 0
        assert!(header_value(&setup, "Transport").unwrap().contains("interleaved=0-1"));

        let play = client
            .request(&format!("PLAY rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 3\r\nSession: {session}\r\n\r\n"))
            .await;
        assert!(play.starts_with("RTSP/1.0 200 OK"), "got: {play}");
        let rtp_info = header_value(&play, "RTP-Info").unwrap();
        assert!(rtp_info.contains("url=rtsp://127.0.0.1/live/cam/trackID=0"));
        assert!(rtp_info.contains("seq="));
        assert!(rtp_info.contains("rtptime="));
        assert!(header_value(&play, "Range").unwrap().starts_with("npt="));

        // Publish a packet; stamp is non-zero so RTCP priming also fires
        let rtp = RtpPacket::build(TrackType::Video, 90_000, 0, 77, 90_000, 0xfeed, &[9, 9, 9, 9]);
        src.on_write(rtp, false);
        src.flush();

        // Expect the SR+SDES priming on channel 1, then the RTP on channel 0
        let mut got_rtcp = false;
        let frame = loop {
            let frame = client.read_frame().await;
            if frame[1] == 1 {
                got_rtcp = true;
                continue;
            }
            break frame;
        };
        assert!(got_rtcp, "a sender report precedes the first rtp");
        assert_eq!(frame[0], b'$');
        assert_eq!(frame[1], 0);
        let seq = u16::from_be_bytes([frame[4 + 2], frame[4 + 3]]);
        assert_eq!(seq, 77);
    }

    #[tokio::test]
    async fn play_with_wrong_session_is_454() {
        let ctx = default_ctx();
        let _src = publish_source(&ctx, "cam");
        let mut client = TestClient::connect(&ctx).await;

        let describe = client.request("DESCRIBE rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n").await;
        assert!(describe.starts_with("RTSP/1.0 200 OK"));

        let reply = client
            .request("PLAY rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 2\r\nSession: notthesession\r\n\r\n")
            .await;
        assert!(reply.starts_with("RTSP/1.0 454 Session Not Found"), "got: {reply}");
        client.expect_eof().await;
    }

    #[tokio::test]
    async fn http_tunnel_pairs_get_and_post() {
        let ctx = default_ctx();
        let mut getter = TestClient::connect(&ctx).await;

        let get_reply = getter
            .request("GET /live/cam HTTP/1.0\r\nx-sessioncookie: cookie-42\r\nAccept: application/x-rtsp-tunnelled\r\n\r\n")
            .await;
        assert!(get_reply.starts_with("HTTP/1.0 200 OK"), "got: {get_reply}");
        assert_eq!(header_value(&get_reply, "Content-Type"), Some("application/x-rtsp-tunnelled"));
        assert_eq!(header_value(&get_reply, "Cache-Control"), Some("no-store"));

        let tunneled = base64::engine::general_purpose::STANDARD
            .encode("OPTIONS rtsp://127.0.0.1/live/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        let mut poster = TestClient::connect(&ctx).await;
        let post_reply = poster
            .request(&format!(
                "POST /live/cam HTTP/1.0\r\nx-sessioncookie: cookie-42\r\nContent-Length: 32767\r\n\r\n{tunneled}"
            ))
            .await;
        assert!(post_reply.starts_with("HTTP/1.0 200 OK"), "got: {post_reply}");

        // The RTSP reply comes out of the GET channel
        let rtsp_reply = getter.read_reply().await;
        assert!(rtsp_reply.starts_with("RTSP/1.0 200 OK"), "got: {rtsp_reply}");
        assert_eq!(header_value(&rtsp_reply, "CSeq"), Some("1"));
        assert!(header_value(&rtsp_reply, "Public").is_some());
    }

    #[tokio::test]
    async fn post_without_getter_fails() {
        let ctx = default_ctx();
        let mut poster = TestClient::connect(&ctx).await;
        poster
            .stream
            .write_all(b"POST /live/cam HTTP/1.0\r\nx-sessioncookie: unknown\r\n\r\n")
            .await
            .unwrap();
        poster.expect_eof().await;
    }
}
