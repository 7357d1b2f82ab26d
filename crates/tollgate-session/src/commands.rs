//! Command Surface
//!
//! Operations called by UI and automation layers: session start/stop,
//! status and permission queries, tunnel settings, per-app routing, the
//! quick-settings toggle and boot restore.
//!
//! Every start or stop holds a [`PendingTransition`](crate::state::PendingTransition)
//! for its whole duration, so a failed, timed-out or panicking call never
//! leaves the session in `Starting` or `Stopping`.
//!
//! Host calls run on their own task under one lifecycle lock and are never
//! dropped half way. When a start outlives its deadline the caller gets
//! [`CommandError::TimedOut`] and the late start is rolled back with a
//! stop once it completes.

use crate::host::BridgeHost;
use crate::prefs::{PrefStore, PrefsError};
use crate::settings::{
    RoutingMode, RoutingSelection, RoutingStore, SettingsError, TunSettings, TunSettingsPatch,
    TunSettingsSource,
};
use crate::state::{PermissionState, SessionSnapshot, SessionState, SessionStateMachine};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Deadline for bounded queries to the engine side
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(8);

/// Deadline for whole start/stop operations
pub const DEFAULT_LONG_TIMEOUT: Duration = Duration::from_secs(20);

/// Preference key remembering whether the session should be up after boot
pub const PREF_SESSION_DESIRED: &str = "session_desired";

/// What a quick toggle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// The session was running and a stop was issued
    Stopping,
    /// The session was down and a start was issued
    Starting,
    /// Tunnel consent is missing; the caller must run the consent flow
    NeedsPermission,
    /// An operation is already in flight
    Ignored,
}

/// Command surface over a host, state machine and settings
#[derive(Clone)]
pub struct SessionCommands {
    host: Arc<dyn BridgeHost>,
    state: Arc<SessionStateMachine>,
    settings: Arc<dyn TunSettingsSource>,
    routing: RoutingStore,
    prefs: Arc<dyn PrefStore>,
    lifecycle: Arc<Mutex<()>>,
    query_timeout: Duration,
    long_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Start,
    Stop,
}

impl SessionCommands {
    pub fn new(
        host: Arc<dyn BridgeHost>,
        state: Arc<SessionStateMachine>,
        settings: Arc<dyn TunSettingsSource>,
        prefs: Arc<dyn PrefStore>,
    ) -> Self {
        Self {
            host,
            state,
            settings,
            routing: RoutingStore::new(prefs.clone()),
            prefs,
            lifecycle: Arc::new(Mutex::new(())),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            long_timeout: DEFAULT_LONG_TIMEOUT,
        }
    }

    /// Override both deadlines
    pub fn with_timeouts(mut self, query: Duration, long: Duration) -> Self {
        self.query_timeout = query;
        self.long_timeout = long;
        self
    }

    /// Start the engine and the tunnel
    pub async fn session_start(&self) -> Result<(), CommandError> {
        if !self.state.check_permission() {
            warn!("Session start refused: tunnel permission missing");
            return Err(CommandError::PermissionRequired);
        }

        let deadline = Instant::now() + self.long_timeout;
        let serial = self.lock_lifecycle(deadline).await?;
        let pending = self.state.begin_starting();
        self.remember_desired(true);

        let started = self.drive(Lifecycle::Start, serial, deadline).await?;
        if started {
            info!("Session started");
            return Ok(());
        }

        // Hosts resolve their own failures; this covers one that did not
        if self.state.current_state().is_transient() {
            pending.failed("Engine failed to start");
        }
        Err(CommandError::StartFailed(self.failure_reason()))
    }

    /// Tear the tunnel down and stop the engine
    pub async fn session_stop(&self) -> Result<(), CommandError> {
        let deadline = Instant::now() + self.long_timeout;
        let serial = self.lock_lifecycle(deadline).await?;
        let pending = self.state.begin_stopping();
        self.remember_desired(false);

        let stopped = self.drive(Lifecycle::Stop, serial, deadline).await?;
        if self.state.current_state().is_transient() {
            pending.stopped();
        }

        if stopped {
            info!("Session stopped");
            Ok(())
        } else {
            Err(CommandError::StopFailed(
                "Engine or tunnel did not shut down cleanly".into(),
            ))
        }
    }

    pub fn session_status(&self) -> SessionState {
        self.state.current_state()
    }

    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.state.snapshot()
    }

    /// Re-query tunnel consent
    pub fn check_permission(&self) -> PermissionState {
        self.state.check_permission();
        self.state.permission()
    }

    pub async fn tunnel_settings_get(&self) -> Result<TunSettings, CommandError> {
        Ok(bounded(self.query_timeout, self.settings.load()).await??)
    }

    /// Apply a partial update; takes effect on the next establish
    pub async fn tunnel_settings_patch(
        &self,
        patch: TunSettingsPatch,
    ) -> Result<TunSettings, CommandError> {
        patch.validate()?;
        Ok(bounded(self.query_timeout, self.settings.save(&patch)).await??)
    }

    pub fn routing_mode_set(&self, mode: RoutingMode) -> Result<(), CommandError> {
        Ok(self.routing.set_mode(mode)?)
    }

    /// Flip a package in the selection; returns true if now selected
    pub fn routing_toggle(&self, package: &str) -> Result<bool, CommandError> {
        if package.trim().is_empty() {
            return Err(SettingsError::Invalid("Empty package identifier".into()).into());
        }
        Ok(self.routing.toggle(package)?)
    }

    pub fn routing_selection(&self) -> RoutingSelection {
        self.routing.load()
    }

    /// Single-tap toggle: stop a running session, start a stopped one
    pub async fn quick_toggle(&self) -> ToggleOutcome {
        match self.state.current_state() {
            SessionState::Running => {
                if let Err(e) = self.session_stop().await {
                    warn!("Quick toggle stop: {}", e);
                }
                ToggleOutcome::Stopping
            }
            SessionState::Stopped | SessionState::Error(_) => {
                if !self.state.check_permission() {
                    return ToggleOutcome::NeedsPermission;
                }
                if let Err(e) = self.session_start().await {
                    warn!("Quick toggle start: {}", e);
                }
                ToggleOutcome::Starting
            }
            SessionState::Starting | SessionState::Stopping => ToggleOutcome::Ignored,
        }
    }

    /// Restore a session that was up before shutdown
    ///
    /// Returns true if a session was started.
    pub async fn on_boot(&self) -> bool {
        if self.prefs.get_bool(PREF_SESSION_DESIRED) != Some(true) {
            info!("Session was not running before shutdown, skipping");
            return false;
        }

        if !self.state.check_permission() {
            warn!("Cannot restore session: tunnel permission missing");
            return false;
        }

        info!("Session was running before shutdown, restarting");
        match self.session_start().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Session restore failed: {}", e);
                false
            }
        }
    }

    async fn lock_lifecycle(&self, deadline: Instant) -> Result<OwnedMutexGuard<()>, CommandError> {
        tokio::time::timeout_at(deadline, self.lifecycle.clone().lock_owned())
            .await
            .map_err(|_| CommandError::TimedOut)
    }

    /// Run one host lifecycle call to completion on its own task
    ///
    /// The task keeps the lifecycle lock until the call and any rollback
    /// finish, whether or not the caller is still waiting.
    async fn drive(
        &self,
        op: Lifecycle,
        serial: OwnedMutexGuard<()>,
        deadline: Instant,
    ) -> Result<bool, CommandError> {
        let host = self.host.clone();
        let settled = Arc::new(AtomicBool::new(false));
        let task_settled = settled.clone();

        let mut task = tokio::spawn(async move {
            let _serial = serial;
            let done = match op {
                Lifecycle::Start => host.vpn_start().await,
                Lifecycle::Stop => host.vpn_stop().await,
            };
            if task_settled.swap(true, Ordering::SeqCst) {
                match op {
                    Lifecycle::Start if done => {
                        warn!("Session start completed after its deadline, rolling back");
                        host.vpn_stop().await;
                    }
                    Lifecycle::Start => {}
                    Lifecycle::Stop => info!("Session stop completed after its deadline"),
                }
            }
            done
        });

        let joined = match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(joined) => joined,
            // Finished right at the deadline; its result is still ours
            Err(_) if settled.swap(true, Ordering::SeqCst) => task.await,
            Err(_) => return Err(CommandError::TimedOut),
        };
        Ok(joined.unwrap_or_else(|e| {
            error!("Session {:?} task failed: {}", op, e);
            false
        }))
    }

    fn remember_desired(&self, desired: bool) {
        if let Err(e) = self.prefs.put_bool(PREF_SESSION_DESIRED, desired) {
            warn!("Failed to persist session flag: {}", e);
        }
    }

    fn failure_reason(&self) -> String {
        self.state
            .snapshot()
            .error_message
            .unwrap_or_else(|| "Session failed to start".into())
    }
}

impl std::fmt::Debug for SessionCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCommands")
            .field("query_timeout", &self.query_timeout)
            .field("long_timeout", &self.long_timeout)
            .finish_non_exhaustive()
    }
}

async fn bounded<T>(limit: Duration, fut: impl Future<Output = T>) -> Result<T, CommandError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| CommandError::TimedOut)
}

/// Command errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Tunnel permission required")]
    PermissionRequired,

    #[error("Request timed out")]
    TimedOut,

    #[error("Start failed: {0}")]
    StartFailed(String),

    #[error("Stop failed: {0}")]
    StopFailed(String),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("Preference error: {0}")]
    Prefs(String),
}

impl From<PrefsError> for CommandError {
    fn from(e: PrefsError) -> Self {
        CommandError::Prefs(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::MemoryPrefStore;
    use crate::state::tests::{FixedPermission, assert_resolved, drain, record_transitions};
    use crate::tunnel::tests::StaticSettings;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Host fake that drives the state machine the way the real one does
    struct ScriptedHost {
        state: Arc<SessionStateMachine>,
        core_ok: AtomicBool,
        tunnel_ok: AtomicBool,
        hang: AtomicBool,
        slow: AtomicBool,
        up: AtomicBool,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl ScriptedHost {
        fn new(state: Arc<SessionStateMachine>) -> Arc<Self> {
            Arc::new(Self {
                state,
                core_ok: AtomicBool::new(true),
                tunnel_ok: AtomicBool::new(true),
                hang: AtomicBool::new(false),
                slow: AtomicBool::new(false),
                up: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BridgeHost for ScriptedHost {
        async fn core_start(&self) -> bool {
            self.core_ok.load(Ordering::SeqCst)
        }

        async fn core_stop(&self) -> bool {
            true
        }

        fn core_is_running(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn core_controller_url(&self) -> Option<String> {
            None
        }

        fn credential_get(&self, _service: &str, _key: &str) -> Option<String> {
            None
        }

        fn credential_set(&self, _service: &str, _key: &str, _value: &str) -> bool {
            false
        }

        fn credential_delete(&self, _service: &str, _key: &str) -> bool {
            false
        }

        fn data_dir(&self) -> Option<PathBuf> {
            None
        }

        fn cache_dir(&self) -> Option<PathBuf> {
            None
        }

        async fn vpn_start(&self) -> bool {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let pending = self.state.begin_starting();
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            if !self.core_start().await {
                pending.failed("Engine failed to start");
                return false;
            }
            if self.tunnel_ok.load(Ordering::SeqCst) {
                self.up.store(true, Ordering::SeqCst);
                pending.running();
                true
            } else {
                pending.failed("Failed to establish VPN interface");
                false
            }
        }

        async fn vpn_stop(&self) -> bool {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.up.store(false, Ordering::SeqCst);
            self.state.begin_stopping().stopped();
            true
        }

        fn vpn_is_running(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        probe: Arc<FixedPermission>,
        host: Arc<ScriptedHost>,
        prefs: Arc<MemoryPrefStore>,
        state: Arc<SessionStateMachine>,
        commands: SessionCommands,
    }

    fn harness() -> Harness {
        let probe = FixedPermission::granted();
        let state = Arc::new(SessionStateMachine::new(probe.clone()));
        let host = ScriptedHost::new(state.clone());
        let prefs = Arc::new(MemoryPrefStore::new());
        let commands = SessionCommands::new(
            host.clone(),
            state.clone(),
            StaticSettings::new(TunSettings::default()),
            prefs.clone(),
        )
        .with_timeouts(Duration::from_millis(100), Duration::from_millis(200));

        Harness {
            probe,
            host,
            prefs,
            state,
            commands,
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let h = harness();

        h.commands.session_start().await.unwrap();
        assert_eq!(h.commands.session_status(), SessionState::Running);
        assert_eq!(h.prefs.get_bool(PREF_SESSION_DESIRED), Some(true));

        h.commands.session_stop().await.unwrap();
        assert_eq!(h.commands.session_status(), SessionState::Stopped);
        assert_eq!(h.prefs.get_bool(PREF_SESSION_DESIRED), Some(false));
    }

    #[tokio::test]
    async fn test_start_without_permission() {
        let h = harness();
        h.probe.0.store(false, Ordering::SeqCst);

        assert_eq!(
            h.commands.session_start().await,
            Err(CommandError::PermissionRequired)
        );
        assert_eq!(h.commands.session_status(), SessionState::Stopped);
        assert_eq!(h.host.starts.load(Ordering::SeqCst), 0);
        assert_eq!(h.commands.check_permission(), PermissionState::Denied);
    }

    #[tokio::test]
    async fn test_engine_failure_ends_in_error() {
        let h = harness();
        h.host.core_ok.store(false, Ordering::SeqCst);

        let result = h.commands.session_start().await;

        assert_eq!(
            result,
            Err(CommandError::StartFailed("Engine failed to start".into()))
        );
        assert!(h.commands.session_status().is_error());
    }

    #[tokio::test]
    async fn test_tunnel_failure_keeps_orchestrator_reason() {
        let h = harness();
        h.host.tunnel_ok.store(false, Ordering::SeqCst);

        let result = h.commands.session_start().await;

        assert_eq!(
            result,
            Err(CommandError::StartFailed(
                "Failed to establish VPN interface".into()
            ))
        );
    }

    #[tokio::test]
    async fn test_hung_start_times_out_into_error() {
        let h = harness();
        h.host.hang.store(true, Ordering::SeqCst);

        assert_eq!(
            h.commands.session_start().await,
            Err(CommandError::TimedOut)
        );
        assert!(h.commands.session_status().is_error());
    }

    #[tokio::test]
    async fn test_start_and_stop_transitions() {
        let h = harness();
        let seen = record_transitions(&h.state);

        h.commands.session_start().await.unwrap();
        h.commands.session_stop().await.unwrap();

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
    async fn test_late_start_is_rolled_back() {
        let h = harness();
        h.host.slow.store(true, Ordering::SeqCst);
        let seen = record_transitions(&h.state);

        assert_eq!(
            h.commands.session_start().await,
            Err(CommandError::TimedOut)
        );
        assert_eq!(
            h.commands.session_status(),
            SessionState::Error("Session start did not complete".into())
        );

        for _ in 0..50 {
            if h.host.stops.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.host.stops.load(Ordering::SeqCst), 1);
        assert!(!h.host.vpn_is_running());
        assert_eq!(h.commands.session_status(), SessionState::Stopped);
        assert_resolved(&drain(&seen));
    }

    #[tokio::test]
    async fn test_stop_waits_for_start_in_flight() {
        let h = harness();
        h.host.slow.store(true, Ordering::SeqCst);
        let commands = h.commands.clone().with_timeouts(
            Duration::from_millis(100),
            Duration::from_secs(2),
        );

        let starter = commands.clone();
        let start = tokio::spawn(async move { starter.session_start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        commands.session_stop().await.unwrap();
        assert_eq!(start.await.unwrap(), Ok(()));
        assert!(!h.host.vpn_is_running());
        assert_eq!(h.commands.session_status(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_settings_get_and_patch() {
        let h = harness();

        let patched = h
            .commands
            .tunnel_settings_patch(TunSettingsPatch {
                mtu: Some(1400),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(patched.mtu, Some(1400));
        assert_eq!(h.commands.tunnel_settings_get().await.unwrap().mtu, Some(1400));

        let invalid = h
            .commands
            .tunnel_settings_patch(TunSettingsPatch {
                mtu: Some(0),
                ..Default::default()
            })
            .await;
        assert!(matches!(invalid, Err(CommandError::Settings(_))));
    }

    #[tokio::test]
    async fn test_settings_query_times_out() {
        let probe = FixedPermission::granted();
        let state = Arc::new(SessionStateMachine::new(probe));
        let slow = Arc::new(StaticSettings {
            settings: std::sync::Mutex::new(TunSettings::default()),
            delay: Duration::from_secs(5),
        });
        let commands = SessionCommands::new(
            ScriptedHost::new(state.clone()),
            state,
            slow,
            Arc::new(MemoryPrefStore::new()),
        )
        .with_timeouts(Duration::from_millis(50), Duration::from_millis(50));

        let err = commands.tunnel_settings_get().await.unwrap_err();
        assert_eq!(err, CommandError::TimedOut);
        assert_eq!(err.to_string(), "Request timed out");
    }

    #[test]
    fn test_routing_commands() {
        let h = harness();

        h.commands
            .routing_mode_set(RoutingMode::BypassSelected)
            .unwrap();
        assert!(h.commands.routing_toggle("com.example").unwrap());
        assert!(h.commands.routing_toggle("  ").is_err());

        let selection = h.commands.routing_selection();
        assert_eq!(selection.mode, RoutingMode::BypassSelected);
        assert!(selection.packages.contains("com.example"));
    }

    #[tokio::test]
    async fn test_quick_toggle() {
        let h = harness();

        assert_eq!(h.commands.quick_toggle().await, ToggleOutcome::Starting);
        assert_eq!(h.commands.session_status(), SessionState::Running);

        assert_eq!(h.commands.quick_toggle().await, ToggleOutcome::Stopping);
        assert_eq!(h.commands.session_status(), SessionState::Stopped);

        h.state.transition_to_starting();
        assert_eq!(h.commands.quick_toggle().await, ToggleOutcome::Ignored);
        h.state.transition_to_error("stuck");

        h.probe.0.store(false, Ordering::SeqCst);
        assert_eq!(
            h.commands.quick_toggle().await,
            ToggleOutcome::NeedsPermission
        );
    }

    #[tokio::test]
    async fn test_on_boot() {
        let h = harness();

        assert!(!h.commands.on_boot().await);
        assert_eq!(h.host.starts.load(Ordering::SeqCst), 0);

        h.prefs.put_bool(PREF_SESSION_DESIRED, true).unwrap();
        h.probe.0.store(false, Ordering::SeqCst);
        assert!(!h.commands.on_boot().await);

        h.probe.0.store(true, Ordering::SeqCst);
        assert!(h.commands.on_boot().await);
        assert_eq!(h.commands.session_status(), SessionState::Running);
    }
}
