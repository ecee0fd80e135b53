//! Server assembly
//!
//! [`listener::RtspServer`] owns the accept loop; [`ServerContext`] bundles
//! the long-lived shared components every session needs: configuration, the
//! media registry, the application hooks, the HTTP-tunnel map and the
//! multicast manager. All of them are constructed at server start and torn
//! down with it; nothing here is an implicit singleton.

pub mod config;
pub mod listener;

use std::sync::Arc;

use crate::hooks::MediaHooks;
use crate::media::config::RegistryConfig;
use crate::media::registry::MediaRegistry;
use crate::rtsp::multicast::MulticastManager;
use crate::rtsp::tunnel::TunnelMap;
use config::ServerConfig;

/// Shared state handed to every session
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: Arc<MediaRegistry>,
    pub hooks: Arc<dyn MediaHooks>,
    pub tunnels: TunnelMap,
    pub multicast: Arc<MulticastManager>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, registry_config: RegistryConfig, hooks: Arc<dyn MediaHooks>) -> Arc<Self> {
        let registry = MediaRegistry::new(registry_config, hooks.clone());
        let multicast = MulticastManager::new(config.udp_ttl, config.multicast_range.0, config.multicast_range.1);
        Arc::new(Self {
            config,
            registry,
            hooks,
            tunnels: TunnelMap::new(),
            multicast,
        })
    }
}
