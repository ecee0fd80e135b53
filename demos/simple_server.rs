//! Minimal RTSP server
//!
//! Accepts pushers (`ffmpeg -re -i input.mp4 -c copy -f rtsp
//! rtsp://127.0.0.1:8554/live/test`) and players (`ffplay
//! rtsp://127.0.0.1:8554/live/test`), logging the lifecycle hooks.

use std::sync::Arc;

use rtsp_engine::hooks::{resolved, HookFuture, MediaHooks, PublishOption, SessionInfo};
use rtsp_engine::media::source::{MediaOriginType, MediaSource};
use rtsp_engine::{MediaInfo, RtspServer, ServerConfig};

struct LoggingHooks;

impl MediaHooks for LoggingHooks {
    fn on_media_publish(
        &self,
        origin: MediaOriginType,
        info: &MediaInfo,
        session: &SessionInfo,
    ) -> HookFuture<Result<PublishOption, String>> {
        tracing::info!(origin = %origin, url = %info.short_url(), peer = %session.peer_addr, "publish");
        resolved(Ok(PublishOption::default()))
    }

    fn on_media_played(&self, info: &MediaInfo, session: &SessionInfo) -> HookFuture<Result<(), String>> {
        tracing::info!(url = %info.short_url(), peer = %session.peer_addr, "play");
        resolved(Ok(()))
    }

    fn on_media_changed(&self, regist: bool, source: &dyn MediaSource) {
        tracing::info!(url = %source.url(), regist, "stream changed");
    }

    fn on_flow_report(&self, info: &MediaInfo, bytes: u64, duration_secs: u64, is_player: bool, _session: &SessionInfo) {
        tracing::info!(
            url = %info.short_url(),
            bytes,
            duration_secs,
            is_player,
            "flow report"
        );
    }
}

#[tokio::main]
async fn main() -> rtsp_engine::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rtsp_engine=debug".into()),
        )
        .init();

    let config = ServerConfig::with_addr("0.0.0.0:8554".parse().unwrap());
    let server = RtspServer::new(config, LoggingHooks);

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
