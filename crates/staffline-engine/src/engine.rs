use std::sync::Arc;

use tracing::info;

use staffline_core::config::AppConfig;
use staffline_core::error::Result;
use staffline_core::event::EventBus;
use staffline_core::traits::{Clock, SystemClock};
use staffline_store::SqliteStore;

use crate::audit_log::AuditLogger;
use crate::dispatcher::{Dispatcher, ProviderMap};
use crate::exceptions::ExceptionTracker;
use crate::manager::InstanceManager;
use crate::sweeper::Sweeper;
use crate::templates::TemplateStore;

/// The workflow engine: one store, one event bus, and the components that
/// share them.
pub struct Engine {
    config: Arc<AppConfig>,
    store: Arc<SqliteStore>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    templates: TemplateStore,
    instances: InstanceManager,
    exceptions: ExceptionTracker,
    dispatcher: Arc<Dispatcher>,
}

impl Engine {
    pub fn new(
        config: AppConfig,
        store: Arc<SqliteStore>,
        providers: ProviderMap,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = Arc::new(config);
        let event_bus = Arc::new(EventBus::default());
        let retries = config.engine.conflict_retries;

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            event_bus.clone(),
            clock.clone(),
            providers,
            config.retry.clone(),
            retries,
        ));
        let templates = TemplateStore::new(store.clone(), clock.clone(), retries);
        let exceptions =
            ExceptionTracker::new(store.clone(), event_bus.clone(), clock.clone(), retries);
        let instances = InstanceManager::new(
            store.clone(),
            event_bus.clone(),
            clock.clone(),
            config.clone(),
            dispatcher.clone(),
        );

        Self {
            config,
            store,
            event_bus,
            clock,
            templates,
            instances,
            exceptions,
            dispatcher,
        }
    }

    /// Open the configured database with the wall clock.
    pub fn open(config: AppConfig, providers: ProviderMap) -> Result<Self> {
        let path = config.database_path();
        let store = Arc::new(SqliteStore::open(&path)?);
        info!(database = %path.display(), providers = providers.len(), "Engine ready");
        Ok(Self::new(config, store, providers, Arc::new(SystemClock)))
    }

    /// Engine over an in-memory database.
    pub fn in_memory(config: AppConfig, providers: ProviderMap, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Arc::new(SqliteStore::in_memory()?);
        Ok(Self::new(config, store, providers, clock))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    pub fn exceptions(&self) -> &ExceptionTracker {
        &self.exceptions
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.store.clone(),
            self.event_bus.clone(),
            self.clock.clone(),
            self.dispatcher.clone(),
            self.config.sweeper.clone(),
            self.config.engine.conflict_retries,
        )
    }

    /// The audit logger, when an enabled `[audit]` section is configured.
    pub fn audit_logger(&self) -> Option<AuditLogger> {
        self.config
            .audit
            .as_ref()
            .filter(|a| a.enabled)
            .map(|a| AuditLogger::new(self.config.audit_dir(), a.level))
    }
}
