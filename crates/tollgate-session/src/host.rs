//! Host Facade
//!
//! The only surface the engine uses to reach platform capabilities. The
//! engine holds one [`BridgeHost`] for its whole lifetime; the method set is
//! fixed and versioned by [`FACADE_VERSION`].

use crate::config::{ConfigError, SessionConfig};
use crate::prefs::PrefsError;
use crate::state::SessionStateMachine;
use crate::supervisor::ProcessSupervisor;
use crate::tunnel::TunnelOrchestrator;
use crate::vault::CredentialVault;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Version of the facade method set
pub const FACADE_VERSION: u32 = 1;

/// Platform capabilities exposed to the engine
#[async_trait]
pub trait BridgeHost: Send + Sync {
    fn version(&self) -> u32 {
        FACADE_VERSION
    }

    async fn core_start(&self) -> bool;
    async fn core_stop(&self) -> bool;
    fn core_is_running(&self) -> bool;
    fn core_controller_url(&self) -> Option<String>;

    fn credential_get(&self, service: &str, key: &str) -> Option<String>;
    fn credential_set(&self, service: &str, key: &str, value: &str) -> bool;
    fn credential_delete(&self, service: &str, key: &str) -> bool;

    fn data_dir(&self) -> Option<PathBuf>;
    fn cache_dir(&self) -> Option<PathBuf>;

    /// Start the engine, then establish the tunnel
    async fn vpn_start(&self) -> bool;

    /// Tear the tunnel down, then stop the engine; true only if both succeed
    async fn vpn_stop(&self) -> bool;
    fn vpn_is_running(&self) -> bool;

    async fn tun_set_enabled(&self, enabled: bool) -> bool {
        if enabled {
            self.vpn_start().await
        } else {
            self.vpn_stop().await
        }
    }

    fn tun_is_enabled(&self) -> bool {
        self.vpn_is_running()
    }
}

/// [`BridgeHost`] over the session components
pub struct SessionHost {
    config: SessionConfig,
    supervisor: Arc<ProcessSupervisor>,
    vault: CredentialVault,
    tunnel: Arc<TunnelOrchestrator>,
    state: Arc<SessionStateMachine>,
}

impl SessionHost {
    pub fn new(
        config: SessionConfig,
        supervisor: Arc<ProcessSupervisor>,
        vault: CredentialVault,
        tunnel: Arc<TunnelOrchestrator>,
        state: Arc<SessionStateMachine>,
    ) -> Self {
        Self {
            config,
            supervisor,
            vault,
            tunnel,
            state,
        }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }
}

#[async_trait]
impl BridgeHost for SessionHost {
    async fn core_start(&self) -> bool {
        let supervisor = self.supervisor.clone();
        let started = tokio::task::spawn_blocking(move || match supervisor.ensure_config_file() {
            Ok(config_path) => supervisor.start(&config_path),
            Err(e) => {
                error!("Failed to write engine config: {}", e);
                false
            }
        })
        .await
        .unwrap_or_else(|e| {
            error!("Engine start task failed: {}", e);
            false
        });

        self.state.set_core_running(started);
        started
    }

    async fn core_stop(&self) -> bool {
        let supervisor = self.supervisor.clone();
        let stopped = tokio::task::spawn_blocking(move || supervisor.stop())
            .await
            .unwrap_or_else(|e| {
                error!("Engine stop task failed: {}", e);
                false
            });

        self.state.set_core_running(self.supervisor.is_running());
        stopped
    }

    fn core_is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    fn core_controller_url(&self) -> Option<String> {
        Some(self.config.controller_url())
    }

    fn credential_get(&self, service: &str, key: &str) -> Option<String> {
        self.vault.get(service, key)
    }

    fn credential_set(&self, service: &str, key: &str, value: &str) -> bool {
        self.vault.set(service, key, value)
    }

    fn credential_delete(&self, service: &str, key: &str) -> bool {
        self.vault.delete(service, key)
    }

    fn data_dir(&self) -> Option<PathBuf> {
        Some(self.config.data_dir.clone())
    }

    fn cache_dir(&self) -> Option<PathBuf> {
        Some(self.config.cache_dir.clone())
    }

    async fn vpn_start(&self) -> bool {
        let pending = self.state.begin_starting();
        if !self.core_start().await {
            error!("Engine did not start, tunnel not established");
            pending.failed("Engine failed to start");
            return false;
        }
        self.tunnel.establish().await.is_ok()
    }

    async fn vpn_stop(&self) -> bool {
        let _pending = self.state.begin_stopping();
        let tunnel_down = self.tunnel.teardown().await.is_ok();
        let core_down = self.core_stop().await;
        info!("Session stopped (tunnel: {}, engine: {})", tunnel_down, core_down);
        tunnel_down && core_down
    }

    fn vpn_is_running(&self) -> bool {
        self.tunnel.is_active()
    }
}

impl std::fmt::Debug for SessionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHost")
            .field("data_dir", &self.config.data_dir)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

/// Errors assembling a host
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Prefs(#[from] PrefsError),

    #[error("Host I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::commands::{CommandError, SessionCommands};
    use crate::keystore::SoftwareKeyStore;
    use crate::prefs::MemoryPrefStore;
    use crate::settings::{RoutingStore, TunSettings};
    use crate::state::SessionState;
    use crate::state::tests::{FixedPermission, assert_resolved, drain, record_transitions};
    use crate::test_util::{TempDir, spawn_guard, temp_dir, write_script};
    use crate::tunnel::tests::{
        EstablishOutcome, RecordingEngine, RecordingPlatform, StaticSettings,
    };
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        _dir: TempDir,
        platform: Arc<RecordingPlatform>,
        engine: Arc<RecordingEngine>,
        prefs: Arc<MemoryPrefStore>,
        state: Arc<SessionStateMachine>,
        host: Arc<SessionHost>,
    }

    fn harness_with(script: Option<&str>, crash_window: Duration) -> Harness {
        let dir = temp_dir("host");
        let mut config = SessionConfig::new(dir.path().join("data"));
        config.engine_binary = match script {
            Some(body) => write_script(dir.path(), body),
            None => dir.path().join("missing-engine"),
        };

        let state = Arc::new(SessionStateMachine::new(FixedPermission::granted()));
        let platform = RecordingPlatform::new();
        let engine = Arc::new(RecordingEngine::default());
        let prefs = Arc::new(MemoryPrefStore::new());
        let tunnel = Arc::new(TunnelOrchestrator::new(
            platform.clone(),
            engine.clone(),
            StaticSettings::new(TunSettings::default()),
            RoutingStore::new(prefs.clone()),
            state.clone(),
            "Tollgate",
            Duration::from_secs(1),
            Duration::from_secs(2),
        ));
        let supervisor =
            Arc::new(ProcessSupervisor::from_config(&config).with_crash_window(crash_window));
        let vault = CredentialVault::new(Arc::new(SoftwareKeyStore::new()), prefs.clone());

        Harness {
            _dir: dir,
            platform,
            engine,
            prefs,
            state: state.clone(),
            host: Arc::new(SessionHost::new(config, supervisor, vault, tunnel, state)),
        }
    }

    fn harness(script: Option<&str>) -> Harness {
        harness_with(script, Duration::from_millis(100))
    }

    fn commands(h: &Harness, long_timeout: Duration) -> SessionCommands {
        SessionCommands::new(
            h.host.clone(),
            h.state.clone(),
            StaticSettings::new(TunSettings::default()),
            h.prefs.clone(),
        )
        .with_timeouts(Duration::from_secs(1), long_timeout)
    }

    #[tokio::test]
    async fn test_vpn_start_stop() {
        let _guard = spawn_guard();
        let h = harness(Some("exec sleep 30"));
        let seen = record_transitions(&h.state);

        assert!(h.host.vpn_start().await);
        assert!(h.host.vpn_is_running());
        assert!(h.host.core_is_running());
        assert!(h.state.core_running());
        assert_eq!(h.state.current_state(), SessionState::Running);

        assert!(h.host.vpn_stop().await);
        assert!(!h.host.vpn_is_running());
        assert!(!h.host.core_is_running());
        assert!(!h.state.core_running());
        assert_eq!(h.state.current_state(), SessionState::Stopped);

        let states = drain(&seen);
        assert_eq!(
            states,
            vec![
                SessionState::Starting,
                SessionState::Running,
                SessionState::Stopping,
                SessionState::Stopped,
            ]
        );
        assert_resolved(&states);
    }

    #[tokio::test]
    async fn test_vpn_start_without_engine() {
        let h = harness(None);
        let seen = record_transitions(&h.state);

        assert!(!h.host.vpn_start().await);
        assert!(!h.host.vpn_is_running());
        assert!(!h.state.core_running());
        assert!(h.engine.started.lock().unwrap().is_empty());
        assert_eq!(
            drain(&seen),
            vec![
                SessionState::Starting,
                SessionState::Error("Engine failed to start".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_vpn_start_failures_resolve_once() {
        let _guard = spawn_guard();
        let declined = harness(Some("exec sleep 30"));
        *declined.platform.outcome.lock().unwrap() = EstablishOutcome::Declined;
        let engine_failure = harness(Some("exec sleep 30"));
        engine_failure.engine.fail_start.store(true, Ordering::SeqCst);
        let address_failure = harness(Some("exec sleep 30"));
        address_failure
            .platform
            .failing
            .lock()
            .unwrap()
            .insert("address".into());

        for h in [declined, engine_failure, address_failure] {
            let seen = record_transitions(&h.state);
            assert!(!h.host.vpn_start().await);

            let states = drain(&seen);
            assert_eq!(states.len(), 2, "{:?}", states);
            assert_eq!(states[0], SessionState::Starting);
            assert!(states[1].is_error());
            assert_resolved(&states);
            assert!(!h.host.vpn_is_running());
            assert!(h.host.vpn_stop().await);
        }
    }

    #[tokio::test]
    async fn test_engine_panic_through_facade_ends_in_error() {
        let _guard = spawn_guard();
        let h = harness(Some("exec sleep 30"));
        h.engine.panic_start.store(true, Ordering::SeqCst);
        let seen = record_transitions(&h.state);

        let host = h.host.clone();
        let joined = tokio::spawn(async move { host.vpn_start().await }).await;

        assert!(joined.is_err());
        assert_eq!(
            h.state.current_state(),
            SessionState::Error("Session start did not complete".into())
        );
        assert_resolved(&drain(&seen));
        // The engine did start; the flag says so
        assert!(h.state.core_running());
        assert!(h.host.core_is_running());

        assert!(h.host.vpn_stop().await);
        assert!(!h.state.core_running());
    }

    #[tokio::test]
    async fn test_vpn_stop_reports_tunnel_failure() {
        let _guard = spawn_guard();
        let h = harness(Some("exec sleep 30"));
        assert!(h.host.vpn_start().await);
        let seen = record_transitions(&h.state);

        h.engine.fail_stop.store(true, Ordering::SeqCst);
        assert!(!h.host.vpn_stop().await);
        // Engine is still stopped even though the tunnel step failed
        assert!(!h.host.core_is_running());
        assert_eq!(h.state.current_state(), SessionState::Stopped);
        assert_eq!(
            drain(&seen),
            vec![SessionState::Stopping, SessionState::Stopped]
        );
    }

    #[tokio::test]
    async fn test_commands_over_host_transitions() {
        let _guard = spawn_guard();
        let h = harness(Some("exec sleep 30"));
        let commands = commands(&h, Duration::from_secs(5));
        let seen = record_transitions(&h.state);

        commands.session_start().await.unwrap();
        commands.session_stop().await.unwrap();

        let states = drain(&seen);
        assert_eq!(
            states,
            vec![
                SessionState::Starting,
                SessionState::Running,
                SessionState::Stopping,
                SessionState::Stopped,
            ]
        );
        assert_resolved(&states);
    }

    #[tokio::test]
    async fn test_start_timeout_leaves_no_engine_behind() {
        let _guard = spawn_guard();
        let h = harness_with(Some("exec sleep 30"), Duration::from_millis(500));
        let commands = commands(&h, Duration::from_millis(100));
        let seen = record_transitions(&h.state);

        assert_eq!(commands.session_start().await, Err(CommandError::TimedOut));
        assert!(h.state.current_state().is_error());

        for _ in 0..100 {
            if h.state.current_state() == SessionState::Stopped && !h.state.core_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(h.state.current_state(), SessionState::Stopped);
        assert!(!h.host.core_is_running());
        assert!(!h.state.core_running());
        assert!(!h.host.vpn_is_running());
        assert_eq!(
            h.platform.closed.load(Ordering::SeqCst),
            h.engine.started.lock().unwrap().len()
        );
        assert_resolved(&drain(&seen));
    }

    #[tokio::test]
    async fn test_tun_toggle() {
        let _guard = spawn_guard();
        let h = harness(Some("exec sleep 30"));

        assert!(h.host.tun_set_enabled(true).await);
        assert!(h.host.tun_is_enabled());
        assert!(h.host.tun_set_enabled(false).await);
        assert!(!h.host.tun_is_enabled());
    }

    #[tokio::test]
    async fn test_static_surface() {
        let h = harness(None);

        assert_eq!(h.host.version(), FACADE_VERSION);
        assert_eq!(
            h.host.core_controller_url().as_deref(),
            Some("http://127.0.0.1:9090")
        );
        assert!(h.host.data_dir().unwrap().ends_with("data"));
        assert!(h.host.cache_dir().unwrap().ends_with("cache"));
    }

    #[tokio::test]
    async fn test_credentials_delegate_to_vault() {
        let h = harness(None);

        assert!(h.host.credential_set("webdav", "password", "s3cret"));
        assert_eq!(
            h.host.credential_get("webdav", "password").as_deref(),
            Some("s3cret")
        );
        assert!(h.host.credential_delete("webdav", "password"));
        assert!(h.host.credential_get("webdav", "password").is_none());
    }
}
