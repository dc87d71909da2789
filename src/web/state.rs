//! Shared service state for the HTTP layer.

use std::sync::Arc;

use crate::channels::ChannelSet;
use crate::config::GatewayConfig;
use crate::epg::EpgOrchestrator;
use crate::store::ProgramStore;
use crate::tuner::{SessionRegistry, TunerArbiter};

/// The explicitly constructed service value handed to request handlers.
#[derive(Clone)]
pub struct Service {
    pub config: Arc<GatewayConfig>,
    pub channels: Arc<ChannelSet>,
    pub arbiter: Arc<TunerArbiter>,
    pub store: Arc<dyn ProgramStore>,
    pub epg: Arc<EpgOrchestrator>,
    pub sessions: Arc<SessionRegistry>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("channels", &self.channels.len())
            .field("tuners", &self.arbiter.tuner_count())
            .finish_non_exhaustive()
    }
}
