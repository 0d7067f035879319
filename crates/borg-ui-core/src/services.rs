//! The collaborators the supervisor drives, wired from an [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheService, RedisConnector};
use crate::config::AppConfig;
use crate::dispatch::CommandDispatcher;
use crate::error::Result;
use crate::housekeeping::{Housekeeper, Housekeeping};
use crate::io::ensure_dir;
use crate::paths;
use crate::probe::{OsProbe, SystemProbe};
use crate::reconcile::OrphanReconciler;
use crate::registry::{RedbRegistry, Registry};
use crate::scheduler::Dispatcher;
use crate::settings::{FileSettingsStore, SettingsStore, SystemSettings};

#[derive(Clone)]
pub struct Services {
    pub registry: Arc<dyn Registry>,
    pub settings: Arc<dyn SettingsStore>,
    pub probe: Arc<dyn OsProbe>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub cache: Arc<CacheService>,
    pub housekeeping: Arc<dyn Housekeeping>,
}

impl Services {
    /// Open the on-disk stores under `config.data_dir` and build the default
    /// implementation of every collaborator. The cache starts on its
    /// in-process backend; nothing here touches the network.
    pub fn open(config: &AppConfig, admin_password: Option<String>) -> Result<Self> {
        ensure_dir(&config.data_dir)?;
        let registry = Arc::new(RedbRegistry::open(&paths::registry_path(
            &config.data_dir,
        ))?);

        let connector = Arc::new(RedisConnector::new(
            config.cache.key_prefix.clone(),
            config.connect_timeout(),
        ));
        let initial_bound = SystemSettings::default().cache_config().max_bytes();
        let cache = Arc::new(CacheService::with_connector(initial_bound, connector));

        let dispatcher = CommandDispatcher::new(registry.clone(), config.dispatch.clone())
            .with_log_dir(config.log_dir());
        let housekeeper = Housekeeper::new(config, registry.clone(), cache.clone())
            .with_admin_password(admin_password);

        Ok(Self {
            registry,
            settings: Arc::new(FileSettingsStore::new(paths::settings_path(
                &config.data_dir,
            ))),
            probe: Arc::new(SystemProbe::new(
                config.processes.owned_names.clone(),
                config.command_timeout(),
            )),
            dispatcher: Arc::new(dispatcher),
            cache,
            housekeeping: Arc::new(housekeeper),
        })
    }

    pub fn reconciler(&self, attempts: u32, delay: Duration) -> OrphanReconciler {
        OrphanReconciler::new(self.registry.clone(), self.probe.clone())
            .with_verification(attempts, delay)
    }
}
