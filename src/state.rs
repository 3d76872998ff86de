//! Shared application state.

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::lifecycle::LifecycleManager;
use crate::presence::Presence;
use crate::runtime::SandboxRuntime;
use crate::terminal::{PtyBackend, TerminalMultiplexer};
use std::sync::Arc;

/// Everything a request handler or connection task needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lifecycle: Arc<LifecycleManager>,
    pub terminals: Arc<TerminalMultiplexer>,
    pub presence: Arc<Presence>,
}

impl AppState {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        credentials: Arc<dyn CredentialStore>,
        pty: Arc<dyn PtyBackend>,
        config: Config,
    ) -> Self {
        let config = Arc::new(config);
        let terminals = Arc::new(TerminalMultiplexer::new(pty));
        let lifecycle = Arc::new(LifecycleManager::new(
            runtime,
            credentials,
            terminals.clone(),
            config.clone(),
        ));
        Self {
            presence: Arc::new(Presence::new(config.outbound_queue)),
            config,
            lifecycle,
            terminals,
        }
    }
}
