use crate::config::AppConfig;
use crate::ws::events::EventBroadcaster;
use recovery_core::{MemoryLiveData, RecoveryService};
use std::sync::Arc;

pub struct AppState {
    pub service: RecoveryService,
    pub live: Arc<MemoryLiveData>,
    pub config: AppConfig,
    pub events: EventBroadcaster,
}

impl AppState {
    pub fn new(service: RecoveryService, live: Arc<MemoryLiveData>, config: AppConfig) -> Self {
        Self {
            service,
            live,
            config,
            events: EventBroadcaster::new(),
        }
    }
}
