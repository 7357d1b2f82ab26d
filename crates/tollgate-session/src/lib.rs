//! Tollgate - Proxy Session Orchestration
//!
//! Manages the lifecycle of a local proxying session: supervising the
//! proxy-engine process, bringing the OS virtual network interface up and
//! down, replicating session state to every UI surface, and keeping
//! credentials encrypted at rest.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SessionCommands                          │
//! │        start / stop / status / settings / routing            │
//! └──────────────┬──────────────────────────────┬────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────┐     ┌────────────────────────────┐
//! │   SessionHost            │     │   SessionStateMachine      │
//! │   (BridgeHost facade)    │────▶│   subscribers + StateBus   │
//! └──┬──────────┬─────────┬──┘     └────────────────────────────┘
//!    │          │         │                     ▲
//!    ▼          ▼         ▼                     │
//! ┌───────┐ ┌────────┐ ┌──────────────────┐     │
//! │ Vault │ │Process │ │ Tunnel           │─────┘
//! │       │ │Super-  │ │ Orchestrator     │
//! │       │ │visor   │ │ (TunPlatform)    │
//! └───────┘ └───┬────┘ └────────┬─────────┘
//!               │ spawn         │ fd
//!               ▼               ▼
//!         ┌────────────────────────────┐
//!         │     proxy engine process   │
//!         └────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Idempotent start/stop**: repeated calls never spawn a second engine
//!   or a second interface
//! - **Terminal-state guard**: every start or stop ends in `Running`,
//!   `Stopped` or `Error`
//! - **Replicated state**: contexts converge through a broadcast bus
//! - **Envelope encryption**: AES-256-GCM under a non-exportable key
//!
//! Packet processing, proxy protocols, rule matching and DNS resolution
//! happen inside the engine and are not part of this crate.

mod bus;
mod commands;
mod config;
mod context;
mod host;
mod keystore;
mod prefs;
mod settings;
mod state;
mod supervisor;
mod ticker;
mod tunnel;
mod vault;

#[cfg(test)]
mod test_util;

pub use bus::{BusMessage, SessionEvent, StateBus};
pub use commands::{
    CommandError, DEFAULT_LONG_TIMEOUT, DEFAULT_QUERY_TIMEOUT, PREF_SESSION_DESIRED,
    SessionCommands, ToggleOutcome,
};
pub use config::{ConfigError, DEFAULT_CONTROLLER_ADDR, DEFAULT_SESSION_NAME, SessionConfig};
pub use context::{PlatformBindings, SessionContext, Stores};
pub use host::{BridgeHost, FACADE_VERSION, HostError, SessionHost};
pub use keystore::{FileKeyStore, KeyStore, KeyStoreError, Sealed, SoftwareKeyStore};
pub use prefs::{JsonPrefStore, MemoryPrefStore, PrefStore, PrefsError};
pub use settings::{
    PREF_ROUTING_MODE, PREF_SELECTED_PACKAGES, RoutingMode, RoutingSelection, RoutingStore,
    SettingsError, TunSettings, TunSettingsFile, TunSettingsPatch, TunSettingsSource,
};
pub use state::{
    PendingTransition, PermissionProbe, PermissionState, SessionSnapshot, SessionState,
    SessionStateMachine, SubscriptionId, spawn_replicator,
};
pub use supervisor::{DEFAULT_CRASH_WINDOW, ProcessSupervisor, default_engine_config};
pub use ticker::Ticker;
pub use tunnel::{
    DEFAULT_MTU, TunBuilder, TunInterface, TunPlatform, TunnelEngine, TunnelError,
    TunnelOrchestrator, configure_builder, filter_dns_servers, is_ipv4_literal, is_ipv6_literal,
    resolve_mtu,
};
pub use vault::{CREDENTIALS_KEY_ALIAS, CredentialVault};
