use std::sync::Arc;

use channel_transport::Transport;
use tracing::info;

use crate::cache::{ResourceCache, ResourceSource};
use crate::config::RegistryConfig;
use crate::multiplexer::ChannelMultiplexer;
use crate::sink::StateSink;

/// Channel registry and resource cache wired together, so update events on
/// any channel invalidate the resources they name.
#[derive(Clone)]
pub struct RealtimeSession {
    channels: ChannelMultiplexer,
    resources: ResourceCache,
}

impl RealtimeSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn StateSink>,
        source: Arc<dyn ResourceSource>,
        config: &RegistryConfig,
    ) -> Self {
        let channels = ChannelMultiplexer::new(transport, Arc::clone(&sink), config);
        let resources = ResourceCache::new(source, sink, config);
        channels.set_change_listener(Arc::new(resources.clone()));
        Self {
            channels,
            resources,
        }
    }

    pub fn channels(&self) -> &ChannelMultiplexer {
        &self.channels
    }

    pub fn resources(&self) -> &ResourceCache {
        &self.resources
    }

    /// Leaves every channel and empties the cache.
    pub fn destroy(&self) {
        self.channels.destroy();
        self.resources.clear();
        info!(target: "realtime.session", "realtime session destroyed");
    }
}
