use crate::bridge::{SessionBridge, SessionRegistry};
use crate::upstream::UpstreamConnector;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Bridge over the process-wide session registry
    pub bridge: SessionBridge,

    /// Capacity of each client's outbound frame queue
    pub frame_capacity: usize,
}

impl AppState {
    pub fn new(connector: Arc<dyn UpstreamConnector>, frame_capacity: usize) -> Self {
        Self::with_registry(Arc::new(SessionRegistry::new()), connector, frame_capacity)
    }

    /// Build state around an existing registry (tests inspect it directly)
    pub fn with_registry(
        registry: Arc<SessionRegistry>,
        connector: Arc<dyn UpstreamConnector>,
        frame_capacity: usize,
    ) -> Self {
        Self {
            bridge: SessionBridge::new(registry, connector),
            frame_capacity: frame_capacity.max(1),
        }
    }
}
