//! Tunnel and Routing Settings
//!
//! [`TunSettings`] describe the virtual interface (MTU, routes, DNS) and are
//! owned by the engine side; the orchestrator reads them through a
//! [`TunSettingsSource`] before every establish. [`RoutingSelection`] is the
//! per-app filter and lives in the host's preference store.
//!
//! Both are read once per establish. Changing them while a tunnel is up has
//! no effect until the next establish.

use crate::prefs::{PrefStore, PrefsError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Preference key for the routing mode
pub const PREF_ROUTING_MODE: &str = "routing_mode";

/// Preference key for the selected package set
pub const PREF_SELECTED_PACKAGES: &str = "selected_packages";

/// Virtual interface settings
///
/// Unset fields fall back to defaults at establish time: MTU 1500, auto
/// route on, strict route off, IPv6 off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_route: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict_route: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<bool>,
    pub dns_servers: Vec<String>,
}

impl TunSettings {
    pub fn auto_route(&self) -> bool {
        self.auto_route.unwrap_or(true)
    }

    pub fn strict_route(&self) -> bool {
        self.strict_route.unwrap_or(false)
    }

    pub fn ipv6(&self) -> bool {
        self.ipv6.unwrap_or(false)
    }

    /// Overlay the fields present in `patch`
    pub fn apply_patch(&mut self, patch: &TunSettingsPatch) {
        if let Some(mtu) = patch.mtu {
            self.mtu = Some(mtu);
        }
        if let Some(auto_route) = patch.auto_route {
            self.auto_route = Some(auto_route);
        }
        if let Some(strict_route) = patch.strict_route {
            self.strict_route = Some(strict_route);
        }
        if let Some(ipv6) = patch.ipv6 {
            self.ipv6 = Some(ipv6);
        }
        if let Some(dns) = &patch.dns_servers {
            self.dns_servers = dns.clone();
        }
    }
}

/// Partial update for [`TunSettings`]; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunSettingsPatch {
    pub mtu: Option<u32>,
    pub auto_route: Option<bool>,
    pub strict_route: Option<bool>,
    pub ipv6: Option<bool>,
    pub dns_servers: Option<Vec<String>>,
}

impl TunSettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Reject values that could never be applied to an interface
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.mtu == Some(0) {
            return Err(SettingsError::Invalid("MTU must be positive".into()));
        }
        if let Some(dns) = &self.dns_servers {
            for entry in dns {
                let entry = entry.trim();
                if entry.is_empty() {
                    return Err(SettingsError::Invalid("Empty DNS server entry".into()));
                }
                if entry.contains("://") {
                    return Err(SettingsError::Invalid(format!(
                        "DNS server must be an IP literal: {}",
                        entry
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Where the orchestrator reads tunnel settings from
#[async_trait]
pub trait TunSettingsSource: Send + Sync {
    /// Current settings
    async fn load(&self) -> Result<TunSettings, SettingsError>;

    /// Apply a patch and return the updated settings
    async fn save(&self, patch: &TunSettingsPatch) -> Result<TunSettings, SettingsError>;
}

/// Tunnel settings kept in a TOML file
///
/// A missing file reads as all defaults.
#[derive(Debug, Clone)]
pub struct TunSettingsFile {
    path: PathBuf,
}

impl TunSettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, settings: &TunSettings) -> Result<(), SettingsError> {
        let content =
            toml::to_string_pretty(settings).map_err(|e| SettingsError::Parse(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SettingsError::Io(e.to_string()))?;
        }

        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| SettingsError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SettingsError::Io(e.to_string()))
    }
}

#[async_trait]
impl TunSettingsSource for TunSettingsFile {
    async fn load(&self) -> Result<TunSettings, SettingsError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => toml::from_str(&content).map_err(|e| SettingsError::Parse(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No tunnel settings at {}, using defaults", self.path.display());
                Ok(TunSettings::default())
            }
            Err(e) => Err(SettingsError::Io(e.to_string())),
        }
    }

    async fn save(&self, patch: &TunSettingsPatch) -> Result<TunSettings, SettingsError> {
        patch.validate()?;

        let mut settings = self.load().await?;
        settings.apply_patch(patch);
        self.write(&settings).await?;

        info!("Saved tunnel settings to {}", self.path.display());
        Ok(settings)
    }
}

/// Per-app routing mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Every app goes through the tunnel
    #[default]
    ProxyAll,
    /// Only the selected apps go through the tunnel
    ProxySelected,
    /// Every app except the selected ones goes through the tunnel
    BypassSelected,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::ProxyAll => "proxy_all",
            RoutingMode::ProxySelected => "proxy_selected",
            RoutingMode::BypassSelected => "bypass_selected",
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingMode {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proxy_all" => Ok(RoutingMode::ProxyAll),
            "proxy_selected" => Ok(RoutingMode::ProxySelected),
            "bypass_selected" => Ok(RoutingMode::BypassSelected),
            other => Err(SettingsError::Invalid(format!("Unknown routing mode: {}", other))),
        }
    }
}

/// Per-app routing selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSelection {
    pub mode: RoutingMode,
    pub packages: BTreeSet<String>,
}

/// Routing selection backed by a preference store
#[derive(Clone)]
pub struct RoutingStore {
    prefs: Arc<dyn PrefStore>,
}

impl RoutingStore {
    pub fn new(prefs: Arc<dyn PrefStore>) -> Self {
        Self { prefs }
    }

    /// Read the current selection; unknown modes read as `ProxyAll`
    pub fn load(&self) -> RoutingSelection {
        let mode = match self.prefs.get_string(PREF_ROUTING_MODE) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Unknown routing mode {:?}, using proxy_all", raw);
                RoutingMode::ProxyAll
            }),
            None => RoutingMode::ProxyAll,
        };
        let packages = self
            .prefs
            .get_string_set(PREF_SELECTED_PACKAGES)
            .unwrap_or_default();

        RoutingSelection { mode, packages }
    }

    pub fn set_mode(&self, mode: RoutingMode) -> Result<(), PrefsError> {
        self.prefs.put_string(PREF_ROUTING_MODE, mode.as_str())?;
        info!("Routing mode set to {}", mode);
        Ok(())
    }

    /// Flip membership of `package`; returns true if it is now selected
    pub fn toggle(&self, package: &str) -> Result<bool, PrefsError> {
        let mut packages = self
            .prefs
            .get_string_set(PREF_SELECTED_PACKAGES)
            .unwrap_or_default();

        let selected = if packages.remove(package) {
            false
        } else {
            packages.insert(package.to_string());
            true
        };

        self.prefs.put_string_set(PREF_SELECTED_PACKAGES, &packages)?;
        debug!("Routing package {} selected={}", package, selected);
        Ok(selected)
    }
}

impl fmt::Debug for RoutingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingStore").finish_non_exhaustive()
    }
}

/// Settings errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error("Settings parse error: {0}")]
    Parse(String),

    #[error("Settings I/O error: {0}")]
    Io(String),

    #[error("Settings unavailable: {0}")]
    Unavailable(String),
}
