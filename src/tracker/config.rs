//! Tracker configuration from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv/helix";
pub const DEFAULT_TMI_BASE_URL: &str = "http://tmi.twitch.tv";
pub const DEFAULT_AUTH_BASE_URL: &str = "https://id.twitch.tv";

/// Configuration for the tracker runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `.sql` schema migrations
    pub schema_dir: String,

    /// Path to the durable iteration state file
    pub state_path: String,

    /// Directory for per-channel chatter spool files (None disables the spool)
    pub spool_dir: Option<String>,

    /// Wall-clock budget for one full pass over all channels
    pub pass_budget_secs: u64,

    /// Completed passes between overlap flushes
    pub flush_threshold: u64,

    /// Number of top channels tracked per pass
    pub top_channel_limit: usize,

    /// Fetch attempts per channel per pass (0 = unlimited)
    pub max_fetch_attempts: u32,

    /// Timeout applied to every outbound HTTP request
    pub http_timeout_secs: u64,

    pub client_id: String,
    pub client_secret: String,

    /// Pre-issued app access token (fetched on demand when absent)
    pub app_token: Option<String>,

    pub helix_base_url: String,
    pub tmi_base_url: String,
    pub auth_base_url: String,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl TrackerConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TRACKER_DB_PATH` (default: /var/lib/tracker/tracker.db)
    /// - `TRACKER_SCHEMA_DIR` (default: sql)
    /// - `TRACKER_STATE_PATH` (default: /var/lib/tracker/iteration_state.json)
    /// - `TRACKER_SPOOL_DIR` (default: /usr/share/tracker/chatters, empty disables)
    /// - `FETCH_INTERVAL` - pass budget in seconds (default: 30)
    /// - `TRACKER_FLUSH_THRESHOLD` (default: 4)
    /// - `TRACKER_TOP_CHANNELS` (default: 100)
    /// - `TRACKER_MAX_FETCH_ATTEMPTS` (default: 5)
    /// - `TRACKER_HTTP_TIMEOUT_SECS` (default: 10)
    /// - `TWITCH_CLIENT_ID`, `TWITCH_CLIENT_SECRET`, `TWITCH_APP_TOKEN`
    /// - `HELIX_BASE_URL`, `TMI_BASE_URL`, `TWITCH_AUTH_BASE_URL`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let spool_dir = match lookup("TRACKER_SPOOL_DIR") {
            Some(dir) if dir.trim().is_empty() => None,
            Some(dir) => Some(dir),
            None => Some("/usr/share/tracker/chatters".to_string()),
        };

        Self {
            db_path: lookup("TRACKER_DB_PATH")
                .unwrap_or_else(|| "/var/lib/tracker/tracker.db".to_string()),

            schema_dir: lookup("TRACKER_SCHEMA_DIR").unwrap_or_else(|| "sql".to_string()),

            state_path: lookup("TRACKER_STATE_PATH")
                .unwrap_or_else(|| "/var/lib/tracker/iteration_state.json".to_string()),

            spool_dir,

            pass_budget_secs: parse_var(&lookup, "FETCH_INTERVAL").unwrap_or(30),

            flush_threshold: parse_var(&lookup, "TRACKER_FLUSH_THRESHOLD").unwrap_or(4),

            top_channel_limit: parse_var(&lookup, "TRACKER_TOP_CHANNELS").unwrap_or(100),

            max_fetch_attempts: parse_var(&lookup, "TRACKER_MAX_FETCH_ATTEMPTS").unwrap_or(5),

            http_timeout_secs: parse_var(&lookup, "TRACKER_HTTP_TIMEOUT_SECS").unwrap_or(10),

            client_id: lookup("TWITCH_CLIENT_ID").unwrap_or_default(),
            client_secret: lookup("TWITCH_CLIENT_SECRET").unwrap_or_default(),
            app_token: lookup("TWITCH_APP_TOKEN").filter(|t| !t.trim().is_empty()),

            helix_base_url: lookup("HELIX_BASE_URL")
                .unwrap_or_else(|| DEFAULT_HELIX_BASE_URL.to_string()),
            tmi_base_url: lookup("TMI_BASE_URL").unwrap_or_else(|| DEFAULT_TMI_BASE_URL.to_string()),
            auth_base_url: lookup("TWITCH_AUTH_BASE_URL")
                .unwrap_or_else(|| DEFAULT_AUTH_BASE_URL.to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.is_empty() {
            return Err(ConfigError::MissingVariable("TWITCH_CLIENT_ID".to_string()));
        }

        if self.client_secret.is_empty() && self.app_token.is_none() {
            return Err(ConfigError::MissingVariable("TWITCH_CLIENT_SECRET".to_string()));
        }

        if self.pass_budget_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "FETCH_INTERVAL must be at least 1 second".to_string(),
            ));
        }

        if self.flush_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "TRACKER_FLUSH_THRESHOLD must be at least 1".to_string(),
            ));
        }

        if self.top_channel_limit == 0 || self.top_channel_limit > 100 {
            return Err(ConfigError::InvalidValue(format!(
                "TRACKER_TOP_CHANNELS must be 1-100, got {}",
                self.top_channel_limit
            )));
        }

        for (name, url) in [
            ("HELIX_BASE_URL", &self.helix_base_url),
            ("TMI_BASE_URL", &self.tmi_base_url),
            ("TWITCH_AUTH_BASE_URL", &self.auth_base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must start with http:// or https://",
                    name
                )));
            }
        }

        Ok(())
    }

    pub fn pass_budget(&self) -> Duration {
        Duration::from_secs(self.pass_budget_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> TrackerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TrackerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = config_from(&[]);

        assert_eq!(config.db_path, "/var/lib/tracker/tracker.db");
        assert_eq!(config.schema_dir, "sql");
        assert_eq!(config.state_path, "/var/lib/tracker/iteration_state.json");
        assert_eq!(config.spool_dir.as_deref(), Some("/usr/share/tracker/chatters"));
        assert_eq!(config.pass_budget_secs, 30);
        assert_eq!(config.flush_threshold, 4);
        assert_eq!(config.top_channel_limit, 100);
        assert_eq!(config.max_fetch_attempts, 5);
        assert_eq!(config.http_timeout_secs, 10);
        assert_eq!(config.helix_base_url, DEFAULT_HELIX_BASE_URL);
        assert!(config.app_token.is_none());
    }

    #[test]
    fn test_custom_config() {
        let config = config_from(&[
            ("TRACKER_DB_PATH", "/tmp/test.db"),
            ("FETCH_INTERVAL", "60"),
            ("TRACKER_FLUSH_THRESHOLD", "2"),
            ("TRACKER_MAX_FETCH_ATTEMPTS", "0"),
            ("TRACKER_SPOOL_DIR", ""),
            ("TWITCH_CLIENT_ID", "abc"),
            ("TWITCH_APP_TOKEN", "token"),
        ]);

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.pass_budget(), Duration::from_secs(60));
        assert_eq!(config.flush_threshold, 2);
        assert_eq!(config.max_fetch_attempts, 0);
        assert!(config.spool_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparseable_values_fall_back_to_defaults() {
        let config = config_from(&[("FETCH_INTERVAL", "soon"), ("TRACKER_TOP_CHANNELS", "-3")]);
        assert_eq!(config.pass_budget_secs, 30);
        assert_eq!(config.top_channel_limit, 100);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let missing_id = config_from(&[]);
        assert!(matches!(missing_id.validate(), Err(ConfigError::MissingVariable(_))));

        let zero_threshold = config_from(&[
            ("TWITCH_CLIENT_ID", "abc"),
            ("TWITCH_CLIENT_SECRET", "secret"),
            ("TRACKER_FLUSH_THRESHOLD", "0"),
        ]);
        assert!(matches!(zero_threshold.validate(), Err(ConfigError::InvalidValue(_))));

        let bad_url = config_from(&[
            ("TWITCH_CLIENT_ID", "abc"),
            ("TWITCH_CLIENT_SECRET", "secret"),
            ("TMI_BASE_URL", "tmi.twitch.tv"),
        ]);
        assert!(matches!(bad_url.validate(), Err(ConfigError::InvalidValue(_))));
    }
}
