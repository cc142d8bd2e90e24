//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::sync::BattleRegistry;

/// Shared application state.
///
/// The composition root: every service is constructed exactly once here and
/// passed by reference to its consumers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub battles: Arc<BattleRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        // Initialize the battle room registry
        let battles = Arc::new(BattleRegistry::new());

        Self { config, battles }
    }
}
