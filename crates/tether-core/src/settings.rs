//! Daemon settings loaded from TOML.
//!
//! Settings come from (in priority order):
//! 1. Environment overrides (`TETHER_CONNECT_TIMEOUT_MS`)
//! 2. `$TETHER_CONFIG`, or `<config_dir>/tether/config.toml`
//! 3. Compiled defaults
//!
//! A missing file is not an error; a malformed one is.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::dedup::DEFAULT_DEDUP_WINDOW;
use crate::error::DomainError;
use crate::session::{DEFAULT_LOG_CAPACITY, SUBSCRIPTION_LOG_CAPACITY};

/// Environment variable naming an explicit settings file.
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

/// Environment variable overriding the RPC/stream connect timeout.
pub const CONNECT_TIMEOUT_ENV: &str = "TETHER_CONNECT_TIMEOUT_MS";

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid settings: {0}")]
    Invalid(#[from] DomainError),
}

// ============================================================================
// Top-level Settings
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub manager: ManagerSettings,
    pub network: NetworkSettings,
}

impl Settings {
    /// Loads settings from the default location with env overrides applied.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if an existing file cannot be read or parsed.
    pub fn load() -> Result<Self, SettingsError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(default_path);

        let mut settings = match path {
            Some(path) if path.exists() => Self::load_from_path(&path)?,
            Some(path) => {
                debug!(path = %path.display(), "No settings file, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Loads settings from a specific TOML file.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if the file cannot be read, parsed or
    /// fails validation.
    pub fn load_from_path(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.manager.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(CONNECT_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.network.connect_timeout_ms = ms,
                Err(_) => warn!(value = %raw, "Ignoring invalid {CONNECT_TIMEOUT_ENV}"),
            }
        }
    }
}

/// Default settings file location.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tether").join("config.toml"))
}

// ============================================================================
// Manager tuning
// ============================================================================

/// Timers and buffer sizes of the connection manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Interval between cleanup sweeps
    pub sweep_interval_ms: u64,
    /// Idle time after which a session is reaped
    pub inactivity_threshold_ms: u64,
    /// Delay between a session closing and its log being purged
    pub purge_grace_ms: u64,
    /// Window in which repeated connection requests are suppressed
    pub dedup_window_ms: u64,
    /// Delay between disposing a subscription and creating its replacement
    pub resubscribe_grace_ms: u64,
    /// Message Log capacity for stream and RPC sessions
    pub log_capacity: usize,
    /// Message Log capacity for subscription sessions
    pub subscription_log_capacity: usize,
    /// Command channel buffer
    pub command_buffer: usize,
    /// Observer event channel buffer
    pub event_buffer: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
            inactivity_threshold_ms: 5 * 60_000,
            purge_grace_ms: 5 * 60_000,
            dedup_window_ms: DEFAULT_DEDUP_WINDOW.as_millis() as u64,
            resubscribe_grace_ms: 50,
            log_capacity: DEFAULT_LOG_CAPACITY,
            subscription_log_capacity: SUBSCRIPTION_LOG_CAPACITY,
            command_buffer: 256,
            event_buffer: 1024,
        }
    }
}

impl ManagerSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.inactivity_threshold_ms)
    }

    pub fn purge_grace(&self) -> Duration {
        Duration::from_millis(self.purge_grace_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn resubscribe_grace(&self) -> Duration {
        Duration::from_millis(self.resubscribe_grace_ms)
    }

    /// Rejects values that would stall the manager.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidFieldValue` naming the offending field.
    pub fn validate(&self) -> Result<(), DomainError> {
        let positive = [
            ("manager.sweep_interval_ms", self.sweep_interval_ms as usize),
            ("manager.log_capacity", self.log_capacity),
            ("manager.subscription_log_capacity", self.subscription_log_capacity),
            ("manager.command_buffer", self.command_buffer),
            ("manager.event_buffer", self.event_buffer),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(DomainError::InvalidFieldValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    expected: "a value greater than 0".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Network settings
// ============================================================================

/// Proxy, TLS and channel preferences consulted for every outbound session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Bound on establishing a transport / waiting for channel readiness
    pub connect_timeout_ms: u64,
    /// When false, TLS certificate validation is bypassed
    pub validate_certificates: bool,
    pub proxy: ProxySettings,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            validate_certificates: true,
            proxy: ProxySettings::default(),
        }
    }
}

impl NetworkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns true if certificate validation should be skipped.
    pub fn tls_bypass(&self) -> bool {
        !self.validate_certificates
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    /// Id of the profile in `profiles` to use
    pub active_profile: Option<String>,
    pub profiles: Vec<ProxyProfile>,
}

impl ProxySettings {
    /// Returns the active profile, if proxying is enabled and it exists.
    pub fn active(&self) -> Option<&ProxyProfile> {
        if !self.enabled {
            return None;
        }
        let active = self.active_profile.as_deref()?;
        self.profiles.iter().find(|p| p.id == active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_proxy_scheme")]
    pub scheme: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ProxyAuth>,
    /// Hosts that bypass the proxy (`*.suffix` or exact host)
    #[serde(default)]
    pub excluded_domains: Vec<String>,
}

fn default_proxy_scheme() -> String {
    "http".to_string()
}

/// Basic-auth credentials for a proxy.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
