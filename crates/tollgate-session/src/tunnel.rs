//! Tunnel Orchestrator
//!
//! Builds the OS virtual network interface from persisted settings and
//! hands its file descriptor to the engine.
//!
//! # Interface Layout
//!
//! ```text
//! address  172.19.0.1/30               always
//! route    0.0.0.0/0                   auto_route
//! address  fd00:fd00:fd00::1/126       auto_route + ipv6
//! route    ::/0                        auto_route + ipv6
//! dns      filtered IP literals        per entry, failures skipped
//! apps     allow or deny list          per routing mode, failures skipped
//! ```
//!
//! The platform side is abstracted by [`TunPlatform`] and [`TunBuilder`],
//! the engine side by [`TunnelEngine`]. Establish and teardown are
//! serialized by one async lock.

use crate::settings::{RoutingMode, RoutingSelection, RoutingStore, TunSettings, TunSettingsSource};
use crate::state::{PendingTransition, SessionSnapshot, SessionStateMachine};
use crate::ticker::Ticker;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// MTU used when settings leave it unset or invalid
pub const DEFAULT_MTU: u32 = 1500;

/// Point-to-point IPv4 address of the interface
pub const TUN_ADDRESS_V4: Ipv4Addr = Ipv4Addr::new(172, 19, 0, 1);
pub const TUN_PREFIX_V4: u8 = 30;

/// Unique-local IPv6 address of the interface
pub const TUN_ADDRESS_V6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0xfd00, 0xfd00, 0, 0, 0, 0, 1);
pub const TUN_PREFIX_V6: u8 = 126;

/// An established virtual interface
pub trait TunInterface: Send {
    /// Raw descriptor handed to the engine
    fn fd(&self) -> i32;

    fn close(self: Box<Self>) -> Result<(), TunnelError>;
}

/// Platform builder for a virtual interface
pub trait TunBuilder: Send {
    fn set_mtu(&mut self, mtu: u32) -> Result<(), TunnelError>;
    fn add_address(&mut self, address: IpAddr, prefix: u8) -> Result<(), TunnelError>;
    fn add_route(&mut self, address: IpAddr, prefix: u8) -> Result<(), TunnelError>;
    fn add_dns_server(&mut self, server: &str) -> Result<(), TunnelError>;
    fn add_allowed_application(&mut self, package: &str) -> Result<(), TunnelError>;
    fn add_disallowed_application(&mut self, package: &str) -> Result<(), TunnelError>;
    fn set_session(&mut self, name: &str);

    /// Create the interface; `None` when the platform declines
    fn establish(self: Box<Self>) -> Result<Option<Box<dyn TunInterface>>, TunnelError>;
}

/// Host service owning the interface
pub trait TunPlatform: Send + Sync {
    fn new_builder(&self) -> Box<dyn TunBuilder>;

    /// Terminate the hosting service after an unrecoverable failure
    fn stop_self(&self);

    /// Periodic status refresh while the tunnel is up
    fn refresh_notification(&self, _snapshot: &SessionSnapshot) {}
}

/// Engine-side tunnel hooks
pub trait TunnelEngine: Send + Sync {
    fn start_tunnel(&self, fd: i32) -> Result<(), TunnelError>;
    fn stop_tunnel(&self) -> Result<(), TunnelError>;
}

struct ActiveTunnel {
    interface: Box<dyn TunInterface>,
    refresher: Ticker,
}

/// Tunnel orchestrator
pub struct TunnelOrchestrator {
    platform: Arc<dyn TunPlatform>,
    engine: Arc<dyn TunnelEngine>,
    settings: Arc<dyn TunSettingsSource>,
    routing: RoutingStore,
    state: Arc<SessionStateMachine>,
    session_name: String,
    settings_timeout: Duration,
    refresh_period: Duration,
    active: Mutex<Option<ActiveTunnel>>,
    up: AtomicBool,
}

impl TunnelOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn TunPlatform>,
        engine: Arc<dyn TunnelEngine>,
        settings: Arc<dyn TunSettingsSource>,
        routing: RoutingStore,
        state: Arc<SessionStateMachine>,
        session_name: impl Into<String>,
        settings_timeout: Duration,
        refresh_period: Duration,
    ) -> Self {
        Self {
            platform,
            engine,
            settings,
            routing,
            state,
            session_name: session_name.into(),
            settings_timeout,
            refresh_period,
            active: Mutex::new(None),
            up: AtomicBool::new(false),
        }
    }

    /// Check whether an interface is held (never blocks)
    pub fn is_active(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Bring the interface up and hand it to the engine
    ///
    /// Any failure moves the session to `Error` and stops the hosting
    /// service. A panic from the platform or the engine also lands in
    /// `Error`. Not cancel-safe: dropping the future while the builder runs
    /// discards the new interface unclosed, so deadlines belong around a
    /// spawned task.
    pub async fn establish(&self) -> Result<(), TunnelError> {
        let mut active = self.active.lock().await;
        let pending = self.state.begin_starting();

        if active.is_some() {
            warn!("Tunnel already established");
            pending.running();
            return Ok(());
        }

        let interface = match self.build().await {
            Ok(interface) => interface,
            Err(e) => {
                self.fail(pending, &e);
                return Err(e);
            }
        };

        let fd = interface.fd();
        if let Err(e) = self.engine.start_tunnel(fd) {
            if let Err(close_err) = interface.close() {
                warn!("Failed to close interface after engine error: {}", close_err);
            }
            self.fail(pending, &e);
            return Err(e);
        }

        let platform = self.platform.clone();
        let state = self.state.clone();
        let refresher = Ticker::spawn(self.refresh_period, move || {
            platform.refresh_notification(&state.snapshot());
        });

        *active = Some(ActiveTunnel {
            interface,
            refresher,
        });
        self.up.store(true, Ordering::SeqCst);
        pending.running();

        info!("Tunnel established (fd {})", fd);
        Ok(())
    }

    /// Tear the interface down
    ///
    /// Ends in `Stopped` unless a step panics. Returns the first failure
    /// from the engine or the interface, after completing every step.
    pub async fn teardown(&self) -> Result<(), TunnelError> {
        let mut active = self.active.lock().await;
        let pending = self.state.begin_stopping();

        let mut first_error = None;

        if let Some(tunnel) = active.as_mut() {
            tunnel.refresher.cancel();
        }

        if let Err(e) = self.engine.stop_tunnel() {
            warn!("Engine tunnel stop failed: {}", e);
            first_error.get_or_insert(e);
        }

        if let Some(tunnel) = active.take() {
            if let Err(e) = tunnel.interface.close() {
                warn!("Failed to close interface: {}", e);
                first_error.get_or_insert(e);
            }
        }

        self.up.store(false, Ordering::SeqCst);
        pending.stopped();
        info!("Tunnel torn down");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn build(&self) -> Result<Box<dyn TunInterface>, TunnelError> {
        let settings = self.load_settings().await;
        let routing = self.routing.load();
        let session_name = self.session_name.clone();
        let builder = self.platform.new_builder();

        // Builder calls are synchronous platform calls
        tokio::task::spawn_blocking(move || {
            let mut builder = builder;
            configure_builder(builder.as_mut(), &settings, &routing, &session_name)?;
            builder.establish()?.ok_or(TunnelError::EstablishFailed)
        })
        .await
        .map_err(|e| TunnelError::Platform(e.to_string()))?
    }

    async fn load_settings(&self) -> TunSettings {
        match tokio::time::timeout(self.settings_timeout, self.settings.load()).await {
            Ok(Ok(settings)) => settings,
            Ok(Err(e)) => {
                warn!("Failed to load tunnel settings, using defaults: {}", e);
                TunSettings::default()
            }
            Err(_) => {
                warn!(
                    "Tunnel settings not loaded within {:?}, using defaults",
                    self.settings_timeout
                );
                TunSettings::default()
            }
        }
    }

    fn fail(&self, pending: PendingTransition<'_>, e: &TunnelError) {
        error!("Tunnel establish failed: {}", e);
        pending.failed(e.to_string());
        self.platform.stop_self();
    }
}

impl std::fmt::Debug for TunnelOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelOrchestrator")
            .field("session_name", &self.session_name)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Apply settings and routing selection to a builder
///
/// MTU and address failures abort; DNS and per-app failures are logged
/// and skipped.
pub fn configure_builder(
    builder: &mut dyn TunBuilder,
    settings: &TunSettings,
    routing: &RoutingSelection,
    session_name: &str,
) -> Result<(), TunnelError> {
    builder.set_mtu(resolve_mtu(settings.mtu))?;
    builder.add_address(IpAddr::V4(TUN_ADDRESS_V4), TUN_PREFIX_V4)?;

    if settings.auto_route() {
        builder.add_route(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)?;
        if settings.ipv6() {
            builder.add_address(IpAddr::V6(TUN_ADDRESS_V6), TUN_PREFIX_V6)?;
            builder.add_route(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)?;
        }
    } else if settings.strict_route() {
        warn!("Strict route without auto route: no default route installed, connectivity may be reduced");
    }

    for server in filter_dns_servers(&settings.dns_servers) {
        if let Err(e) = builder.add_dns_server(&server) {
            warn!("Failed to add DNS server {}: {}", server, e);
        }
    }

    info!(
        "Routing mode: {}, apps: {}",
        routing.mode,
        routing.packages.len()
    );
    match routing.mode {
        RoutingMode::ProxySelected => {
            for package in &routing.packages {
                if let Err(e) = builder.add_allowed_application(package) {
                    warn!("Failed to allow app {}: {}", package, e);
                }
            }
        }
        RoutingMode::BypassSelected => {
            for package in &routing.packages {
                if let Err(e) = builder.add_disallowed_application(package) {
                    warn!("Failed to disallow app {}: {}", package, e);
                }
            }
        }
        RoutingMode::ProxyAll => debug!("No per-app filter"),
    }

    builder.set_session(session_name);
    Ok(())
}

/// MTU to apply; unset or out-of-range values yield [`DEFAULT_MTU`]
pub fn resolve_mtu(mtu: Option<u32>) -> u32 {
    match mtu {
        Some(m) if m > 0 && m <= i32::MAX as u32 => m,
        _ => DEFAULT_MTU,
    }
}

/// Keep only entries that are IPv4 or IPv6 literals (after trimming)
pub fn filter_dns_servers(servers: &[String]) -> Vec<String> {
    servers
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && !s.contains("://"))
        .filter(|s| is_ipv4_literal(s) || is_ipv6_literal(s))
        .map(str::to_string)
        .collect()
}

/// Four dot-separated integers in 0..=255
pub fn is_ipv4_literal(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| p.parse::<u8>().is_ok())
}

/// At least one colon, otherwise only hex digits
pub fn is_ipv6_literal(value: &str) -> bool {
    value.contains(':') && value.chars().all(|c| c == ':' || c.is_ascii_hexdigit())
}

/// Tunnel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to establish VPN interface")]
    EstablishFailed,

    #[error("Interface configuration failed: {0}")]
    Interface(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Platform error: {0}")]
    Platform(String),
}
