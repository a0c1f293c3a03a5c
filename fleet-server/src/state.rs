//! # Shared Application State
//!
//! Wires the component graph and holds the handles every request handler
//! needs. Cloned per handler; everything inside is `Arc`-shared.
//!
//! The orchestrator ↔ connection-manager cycle is broken here: the
//! orchestrator is built first without a dispatcher, then the concrete
//! [`AgentCommandDispatcher`] is wired in once the registry exists.

use std::sync::Arc;

use crate::agents::heartbeat::HeartbeatThrottle;
use crate::agents::{AgentRegistry, AgentSessionManager};
use crate::cache::StateCache;
use crate::clients::WebClientSessionManager;
use crate::config::Config;
use crate::crypto::SecretVault;
use crate::dispatch::AgentCommandDispatcher;
use crate::error::ServerResult;
use crate::events::EventBus;
use crate::jobs::JobOrchestrator;
use crate::store::Store;
use crate::terminal::TerminalService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub cache: Arc<StateCache>,
    pub bus: EventBus,
    pub vault: Arc<SecretVault>,
    pub terminal: Arc<TerminalService>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub agents: Arc<AgentSessionManager>,
    pub clients: Arc<WebClientSessionManager>,
}

impl AppState {
    /// Builds and wires the full component graph, warming the cache from
    /// the store.
    pub async fn build(config: Config, store: Arc<dyn Store>) -> ServerResult<Self> {
        let cache = Arc::new(StateCache::new());
        cache.warm(store.as_ref()).await?;

        let bus = EventBus::new();
        let vault = Arc::new(SecretVault::new(&config.master_secret));
        let terminal = Arc::new(TerminalService::new(
            config.session_token_secret.clone(),
            store.clone(),
            bus.clone(),
        ));
        let orchestrator = Arc::new(JobOrchestrator::new(
            store.clone(),
            cache.clone(),
            bus.clone(),
            config.dispatch_grace,
            config.job_max_concurrency,
        ));

        let registry = Arc::new(AgentRegistry::new());
        let agents = Arc::new(AgentSessionManager::new(
            registry.clone(),
            store.clone(),
            cache.clone(),
            bus.clone(),
            vault.clone(),
            terminal.clone(),
            orchestrator.clone(),
            HeartbeatThrottle::new(config.heartbeat),
        ));

        orchestrator.set_dispatcher(Arc::new(AgentCommandDispatcher::new(
            registry.clone(),
            terminal.clone(),
            vault.clone(),
            store.clone(),
        )));

        let clients = Arc::new(WebClientSessionManager::new(
            registry,
            terminal.clone(),
            vault.clone(),
            cache.clone(),
            bus.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            cache,
            bus,
            vault,
            terminal,
            orchestrator,
            agents,
            clients,
        })
    }
}
