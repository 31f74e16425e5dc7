//! Worker configuration.
//!
//! Loads the worker's TOML configuration (cache naming, precache manifest,
//! push notification defaults, sync tags). Every field has a default, so an
//! empty file yields the stock NovaCore worker.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_QUOTA;

/// Configuration errors.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Data models ──────────────────────────────────────────────────────

/// Top-level worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix shared by every cache namespace.
    pub cache_prefix: String,
    /// Cache version; bumping it purges older caches on activation.
    pub version: String,
    /// App shell served for navigation requests.
    pub app_shell: String,
    /// Root-relative paths stored at install time.
    pub precache: Vec<String>,
    /// Call `skip_waiting()` once installation succeeds.
    pub skip_waiting_on_install: bool,
    /// Byte quota across all caches.
    pub quota_bytes: usize,
    pub push: PushConfig,
    pub sync: SyncConfig,
}

/// Push notification defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PushConfig {
    pub title: String,
    /// Body used when the push carries no text.
    pub default_body: String,
    pub icon: String,
    pub badge: String,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
}

/// Background sync tags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub wishlist_tag: String,
    pub cart_tag: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "novacore".into(),
            version: "v1".into(),
            app_shell: "/index.html".into(),
            precache: ["/", "/index.html", "/manifest.json", "/favicon.ico", "/logo192.png", "/logo512.png"]
                .into_iter()
                .map(String::from)
                .collect(),
            skip_waiting_on_install: true,
            quota_bytes: DEFAULT_QUOTA,
            push: PushConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            title: "NovaCore".into(),
            default_body: "New games and deals are waiting for you!".into(),
            icon: "/logo192.png".into(),
            badge: "/logo192.png".into(),
            vibrate: vec![100, 50, 100],
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wishlist_tag: "sync-wishlist".into(),
            cart_tag: "sync-cart".into(),
        }
    }
}

// ── Parsing ──────────────────────────────────────────────────────────

impl WorkerConfig {
    /// Parse and validate a configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: WorkerConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound { path: path.to_path_buf() }
            } else {
                ConfigError::Io(e)
            }
        })?;
        let config = Self::from_toml_str(&content)?;
        log::info!(
            "[SW Config] loaded {} (version {}, {} precache entries)",
            path.display(),
            config.version,
            config.precache.len()
        );
        Ok(config)
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_prefix.is_empty() || self.version.is_empty() {
            return Err(ConfigError::Invalid("cache_prefix and version must be non-empty".into()));
        }
        if !self.app_shell.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "app_shell must be root-relative, got '{}'",
                self.app_shell
            )));
        }
        if let Some(bad) = self.precache.iter().find(|p| !p.starts_with('/')) {
            return Err(ConfigError::Invalid(format!(
                "precache entries must be root-relative, got '{}'",
                bad
            )));
        }
        if self.quota_bytes == 0 {
            return Err(ConfigError::Invalid("quota_bytes must be positive".into()));
        }
        if self.sync.wishlist_tag == self.sync.cart_tag {
            return Err(ConfigError::Invalid(format!(
                "sync tags must differ, both are '{}'",
                self.sync.cart_tag
            )));
        }
        Ok(())
    }

    /// Name of the static (install-time) cache.
    pub fn static_cache_name(&self) -> String {
        format!("{}-static-{}", self.cache_prefix, self.version)
    }

    /// Name of the runtime (fetch-populated) cache.
    pub fn runtime_cache_name(&self) -> String {
        format!("{}-runtime-{}", self.cache_prefix, self.version)
    }

    /// Whether a cache belongs to the current version.
    pub fn is_current_cache(&self, name: &str) -> bool {
        name == self.static_cache_name() || name == self.runtime_cache_name()
    }
}
