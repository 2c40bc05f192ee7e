//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use w2x_core::{Coordinator, SharedConfig, SqliteStore};

use crate::config::Config;

#[derive(Clone, Debug)]
pub struct AppState {
    /// Env-derived process configuration.
    pub config: Arc<Config>,
    /// Hot-reloadable core settings.
    pub settings: Arc<SharedConfig>,
    pub coordinator: Coordinator<SqliteStore>,
}
