use std::sync::Arc;

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::profile::UserProfiles;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub profiles: Arc<UserProfiles>,
    pub config: Config,
}
