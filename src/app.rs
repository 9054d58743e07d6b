use crate::error::ConfigError;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub base_url: String,
    pub push_url: Option<String>,
    pub identity: String,
    pub token: Option<String>,
    pub confirm_grace_ms: u64,
    pub reaction_refetch_ms: u64,
    pub entitlement_refresh_secs: u64,
    pub pending_window_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub excerpt_chars: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            push_url: None,
            identity: String::new(),
            token: None,
            confirm_grace_ms: 1_500,
            reaction_refetch_ms: 600,
            entitlement_refresh_secs: 300,
            pending_window_secs: 5,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            excerpt_chars: 80,
        }
    }
}

/// Delays the session runs its reconciliation timers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// How long a REST-confirmed send waits for its push twin.
    pub confirm_grace: Duration,
    /// Delay between a reaction write and the snapshot re-fetch.
    pub reaction_refetch: Duration,
    pub entitlement_refresh: Duration,
    /// Width of the time bucket used to spot duplicate pending sends.
    pub pending_window: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        AppConfig::default().timings()
    }
}

/// Exponential reconnect schedule for the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }
    // TOML is the primary format; a legacy JSON state file is migrated to TOML when found
    fn toml_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("matchchat.toml"))
    }

    fn legacy_json_path() -> Option<PathBuf> {
        let proj = directories::ProjectDirs::from("com", "example", "MatchChat")?;
        Some(proj.config_dir().join("state.json"))
    }

    /// Best-effort load: TOML, then legacy JSON, then defaults.
    pub fn load() -> Self {
        if let Some(path) = Self::toml_path() {
            match Self::load_from(&path) {
                Ok(config) => return config,
                Err(ConfigError::Io(_)) => {}
                Err(e) => log::warn!("ignoring {}: {e}", path.display()),
            }
        }

        if let Some(legacy) = Self::legacy_json_path() {
            if let Ok(bytes) = fs::read(&legacy) {
                match serde_json::from_slice::<AppConfig>(&bytes) {
                    Ok(config) => {
                        if let Err(e) = config.save() {
                            log::warn!("could not migrate legacy config: {e}");
                        }
                        return config;
                    }
                    Err(e) => log::warn!("ignoring {}: {e}", legacy.display()),
                }
            }
        }

        Self::new()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str::<AppConfig>(&text)?)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::toml_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            confirm_grace: Duration::from_millis(self.confirm_grace_ms),
            reaction_refetch: Duration::from_millis(self.reaction_refetch_ms),
            entitlement_refresh: Duration::from_secs(self.entitlement_refresh_secs.max(1)),
            pending_window: Duration::from_secs(self.pending_window_secs.max(1)),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.reconnect_initial_ms.max(1)),
            max: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms)),
        }
    }

    pub fn push_endpoint(&self) -> Result<Url, ConfigError> {
        match &self.push_url {
            Some(explicit) => Ok(Url::parse(explicit)?),
            None => crate::utils::push_url_from_base(&self.base_url),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.base_url.is_empty() && !self.identity.is_empty()
    }
}
