//! RTSP server listener
//!
//! Handles the TCP accept loop and spawns one session task per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::hooks::MediaHooks;
use crate::media::config::RegistryConfig;
use crate::media::registry::MediaRegistry;
use crate::rtsp::session::RtspSession;
use crate::server::config::ServerConfig;
use crate::server::ServerContext;

/// RTSP server
pub struct RtspServer {
    ctx: Arc<ServerContext>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl RtspServer {
    /// Create a new server with the given configuration and hooks
    pub fn new<H: MediaHooks>(config: ServerConfig, hooks: H) -> Self {
        Self::with_registry_config(config, hooks, RegistryConfig::default())
    }

    /// Create a new server with custom registry configuration
    pub fn with_registry_config<H: MediaHooks>(config: ServerConfig, hooks: H, registry_config: RegistryConfig) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };
        let ctx = ServerContext::new(config, registry_config, Arc::new(hooks));

        Self {
            ctx,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    /// Get a reference to the media registry
    pub fn registry(&self) -> &Arc<MediaRegistry> {
        &self.ctx.registry
    }

    /// Shared state as handed to sessions
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.ctx.config.bind_addr).await?;
        tracing::info!(addr = %self.ctx.config.bind_addr, "RTSP server listening");
        self.accept_loop(&listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.ctx.config.bind_addr).await?;
        tracing::info!(addr = %self.ctx.config.bind_addr, "RTSP server listening");

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        if self.ctx.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let _permit = permit;
            RtspSession::run(session_id, socket, peer_addr, ctx).await;
            tracing::debug!(session_id = session_id, "Connection closed");
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.ctx.config.bind_addr
    }
}
