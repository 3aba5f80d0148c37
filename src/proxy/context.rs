//! Collaborators shared by every connection task

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::crypto::StreamCipher;
use crate::registry::ConnectionRegistry;
use crate::relay::{ChannelLease, RelayClient, RelayEngine};
use crate::stats::RelayMetrics;

/// Injected dependencies of the front-end handlers
///
/// Per-connection state travels through function arguments and the registry;
/// nothing here changes after construction.
pub struct ProxyContext {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub client: Arc<dyn RelayClient>,
    pub metrics: Arc<RelayMetrics>,
    pub engine: RelayEngine,
}

impl ProxyContext {
    pub fn new(
        config: Arc<RelayConfig>,
        client: Arc<dyn RelayClient>,
        cipher: Arc<dyn StreamCipher>,
        metrics: Arc<RelayMetrics>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        let engine = RelayEngine::new(cipher, metrics.clone(), registry.clone(), config.buffer_size);
        Self {
            config,
            registry,
            client,
            metrics,
            engine,
        }
    }

    /// Release a channel that never reached the engine
    pub(crate) fn release_unused(&self, lease: ChannelLease) {
        if lease.release() {
            self.metrics.channel_released();
        }
    }
}
