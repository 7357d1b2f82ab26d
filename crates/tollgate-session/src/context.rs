//! Session context
//!
//! Wires configuration and platform bindings into one set of components.
//! Each execution context builds its own; nothing is global.

use crate::bus::StateBus;
use crate::commands::SessionCommands;
use crate::config::SessionConfig;
use crate::host::{HostError, SessionHost};
use crate::keystore::KeyStore;
use crate::prefs::{JsonPrefStore, PrefStore};
use crate::settings::{RoutingStore, TunSettingsFile, TunSettingsSource};
use crate::state::{PermissionProbe, SessionStateMachine, spawn_replicator};
use crate::supervisor::ProcessSupervisor;
use crate::tunnel::{TunPlatform, TunnelEngine, TunnelOrchestrator};
use crate::vault::CredentialVault;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Platform-provided pieces
#[derive(Clone)]
pub struct PlatformBindings {
    pub tun: Arc<dyn TunPlatform>,
    pub engine: Arc<dyn TunnelEngine>,
    pub permission: Arc<dyn PermissionProbe>,
    pub keystore: Arc<dyn KeyStore>,
}

/// Stores backing a context
#[derive(Clone)]
pub struct Stores {
    pub prefs: Arc<dyn PrefStore>,
    pub credentials: Arc<dyn PrefStore>,
    pub tun_settings: Arc<dyn TunSettingsSource>,
}

impl Stores {
    /// File-backed stores under the configured data directory
    pub fn open(config: &SessionConfig) -> Result<Self, HostError> {
        std::fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            prefs: Arc::new(JsonPrefStore::open(config.prefs_path())?),
            credentials: Arc::new(JsonPrefStore::open(config.credentials_path())?),
            tun_settings: Arc::new(TunSettingsFile::new(config.tun_settings_path())),
        })
    }
}

/// All session components for one execution context
pub struct SessionContext {
    pub config: SessionConfig,
    pub state: Arc<SessionStateMachine>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub tunnel: Arc<TunnelOrchestrator>,
    pub host: Arc<SessionHost>,
    stores: Stores,
}

impl SessionContext {
    /// Validate `config` and open file-backed stores
    pub fn open(config: SessionConfig, platform: PlatformBindings) -> Result<Self, HostError> {
        config.validate()?;
        let stores = Stores::open(&config)?;
        Ok(Self::assemble(config, platform, stores))
    }

    /// Build from already opened stores
    pub fn assemble(config: SessionConfig, platform: PlatformBindings, stores: Stores) -> Self {
        let state = Arc::new(SessionStateMachine::new(platform.permission.clone()));
        let supervisor = Arc::new(ProcessSupervisor::from_config(&config));
        let vault = CredentialVault::new(platform.keystore.clone(), stores.credentials.clone());

        let tunnel = Arc::new(TunnelOrchestrator::new(
            platform.tun.clone(),
            platform.engine.clone(),
            stores.tun_settings.clone(),
            RoutingStore::new(stores.prefs.clone()),
            state.clone(),
            config.session_name.clone(),
            config.settings_timeout(),
            config.status_refresh(),
        ));

        let host = Arc::new(SessionHost::new(
            config.clone(),
            supervisor.clone(),
            vault,
            tunnel.clone(),
            state.clone(),
        ));

        info!("Session context ready at {}", config.data_dir.display());
        Self {
            config,
            state,
            supervisor,
            tunnel,
            host,
            stores,
        }
    }

    /// Command surface over this context
    pub fn commands(&self) -> SessionCommands {
        SessionCommands::new(
            self.host.clone(),
            self.state.clone(),
            self.stores.tun_settings.clone(),
            self.stores.prefs.clone(),
        )
        .with_timeouts(
            self.config.settings_timeout(),
            crate::commands::DEFAULT_LONG_TIMEOUT,
        )
    }

    pub fn prefs(&self) -> &Arc<dyn PrefStore> {
        &self.stores.prefs
    }

    pub fn tun_settings(&self) -> &Arc<dyn TunSettingsSource> {
        &self.stores.tun_settings
    }

    /// Join the cross-context bus: announce local changes, replay remote ones
    pub fn join_bus(&self, bus: &StateBus) -> JoinHandle<()> {
        self.state.attach_bus(bus.clone());
        spawn_replicator(bus, self.state.clone())
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
