//! Configuration loader.
//!
//! Settings come from an optional TOML file (`superduperfeeder.toml` or
//! `$SUPERDUPERFEEDER_CONFIG`), with environment variables overriding
//! the deployment-critical fields afterwards. A missing file yields the
//! defaults; unknown keys are accepted but logged.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level service configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be
/// specified; missing keys fall back to the documented defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen port.
    pub port: u16,

    /// Public base URL of this service (callback paths are appended).
    pub base_url: String,

    /// Advertised hub URL; defaults to `base_url` when empty.
    pub hub_url: Option<String>,

    /// SQLite database path; `:memory:` for ephemeral.
    pub database_path: String,

    /// Lease applied when a subscriber does not request one.
    pub default_lease_seconds: u32,

    /// Upper bound on requested leases.
    pub max_lease_seconds: u32,

    /// Polling cadence for newly-created feeds.
    pub default_polling_interval_minutes: u32,

    /// Floor for per-feed polling cadence.
    pub min_polling_interval_minutes: u32,

    /// Timeout for verification GETs, delivery POSTs, and relays.
    pub webhook_timeout_ms: u64,

    /// Retry budget for user-callback relays.
    pub webhook_retries: u32,

    /// Timeout for upstream feed fetches.
    pub feed_fetch_timeout_secs: u64,

    /// Renew outbound subscriptions expiring within this window.
    pub renewal_window_minutes: u32,

    /// Inbound subscriptions stay past `expires` this long before the
    /// sweep deletes them.
    pub expired_grace_seconds: u64,

    /// Scheduler cadences.
    pub poll_tick_seconds: u64,
    pub maintenance_tick_seconds: u64,
    pub sweep_tick_seconds: u64,

    /// Queue consumers and claim visibility.
    pub queue_workers: usize,
    pub queue_visibility_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            base_url: "http://localhost:8080".to_string(),
            hub_url: None,
            database_path: "superduperfeeder.db".to_string(),
            default_lease_seconds: 86_400,
            max_lease_seconds: 2_592_000,
            default_polling_interval_minutes: 60,
            min_polling_interval_minutes: 15,
            webhook_timeout_ms: 10_000,
            webhook_retries: 3,
            feed_fetch_timeout_secs: 30,
            renewal_window_minutes: 60,
            expired_grace_seconds: 86_400,
            poll_tick_seconds: 60,
            maintenance_tick_seconds: 600,
            sweep_tick_seconds: 3_600,
            queue_workers: 4,
            queue_visibility_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply env overrides.
    ///
    /// - Missing file → defaults
    /// - Invalid TOML → `Err(ConfigError::Parse)` with location info
    /// - Unknown keys → accepted, logged as a warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default().with_env_overrides());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            return Ok(Self::default().with_env_overrides());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            const KNOWN_KEYS: [&str; 18] = [
                "port",
                "base_url",
                "hub_url",
                "database_path",
                "default_lease_seconds",
                "max_lease_seconds",
                "default_polling_interval_minutes",
                "min_polling_interval_minutes",
                "webhook_timeout_ms",
                "webhook_retries",
                "feed_fetch_timeout_secs",
                "renewal_window_minutes",
                "expired_grace_seconds",
                "poll_tick_seconds",
                "maintenance_tick_seconds",
                "sweep_tick_seconds",
                "queue_workers",
                "queue_visibility_secs",
            ];
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), port = config.port, "Loaded configuration");
        Ok(config.with_env_overrides())
    }

    /// Environment overrides for the deployment-critical settings.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(base_url) = std::env::var("BASE_URL") {
            self.base_url = base_url;
        }
        if let Ok(hub_url) = std::env::var("HUB_URL") {
            self.hub_url = Some(hub_url);
        }
        if let Ok(db) = std::env::var("DATABASE_PATH") {
            self.database_path = db;
        }
        self
    }

    /// The hub URL advertised in `Link` headers.
    pub fn hub_url(&self) -> &str {
        match &self.hub_url {
            Some(url) if !url.is_empty() => url,
            _ => &self.base_url,
        }
    }

    /// The User-Agent sent on every outbound request.
    pub fn user_agent() -> String {
        format!("SuperDuperFeeder/{}", env!("CARGO_PKG_VERSION"))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.default_lease_seconds, 86_400);
        assert_eq!(config.max_lease_seconds, 2_592_000);
        assert_eq!(config.default_polling_interval_minutes, 60);
        assert_eq!(config.min_polling_interval_minutes, 15);
        assert_eq!(config.webhook_timeout_ms, 10_000);
        assert_eq!(config.webhook_retries, 3);
    }

    #[test]
    fn test_missing_file_returns_defaults() {
        let config = Config::load(Path::new("/tmp/sdf_nonexistent_config.toml")).unwrap();
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let dir = std::env::temp_dir().join("sdf_config_test_partial");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "port = 9999\nbase_url = \"https://hub.example.com\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.base_url, "https://hub.example.com");
        assert_eq!(config.default_lease_seconds, 86_400); // default

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = std::env::temp_dir().join("sdf_config_test_invalid");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "this is not [valid toml").unwrap();

        let result = Config::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_hub_url_falls_back_to_base() {
        let mut config = Config::default();
        assert_eq!(config.hub_url(), "http://localhost:8080");
        config.hub_url = Some("https://hub.example.com".to_string());
        assert_eq!(config.hub_url(), "https://hub.example.com");
    }

    #[test]
    fn test_user_agent_shape() {
        let ua = Config::user_agent();
        assert!(ua.starts_with("SuperDuperFeeder/"));
    }
}
