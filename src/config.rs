//! Config loading (ambient component I). TOML file, `serde`-deserialized,
//! every field carrying a default so a missing file — or a missing section
//! within one — loads cleanly. Modeled on the teacher's `WideConfig::load`.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["receiver", "scanner", "alerts", "display", "storage", "models"];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            receiver: ReceiverConfig::default(),
            scanner: ScannerConfig::default(),
            alerts: AlertsConfig::default(),
            display: DisplayConfig::default(),
            storage: StorageConfig::default(),
            models: ModelsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            grpc_port: default_grpc_port(),
            http_port: default_http_port(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_grpc_port() -> u16 {
    4317
}
fn default_http_port() -> u16 {
    4318
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_scanner_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { interval_secs: default_scanner_interval_secs() }
    }
}

fn default_scanner_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub thresholds: HashMap<String, f64>,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationsConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_refresh_rate_ms")]
    pub refresh_rate_ms: u64,
    #[serde(default)]
    pub color_thresholds: HashMap<String, f64>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            refresh_rate_ms: default_refresh_rate_ms(),
            color_thresholds: HashMap::new(),
        }
    }
}

fn default_buffer_size() -> usize {
    500
}
fn default_refresh_rate_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_raw_retention_days")]
    pub raw_retention_days: i64,
    #[serde(default = "default_summary_retention_days")]
    pub summary_retention_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            raw_retention_days: default_raw_retention_days(),
            summary_retention_days: default_summary_retention_days(),
        }
    }
}

fn default_database_path() -> String {
    "~/.ccpulse/ccpulse.db".to_string()
}
fn default_raw_retention_days() -> i64 {
    7
}
fn default_summary_retention_days() -> i64 {
    90
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub context_limits: HashMap<String, i64>,
    /// model -> `[input, output, cache_read, cache_creation]` USD per
    /// million tokens.
    #[serde(default)]
    pub pricing: HashMap<String, [f64; 4]>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    /// Load from `path`. A missing file is not an error — it loads
    /// defaults and logs at info, matching the teacher's `WideConfig::load`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        warn_on_unknown_keys(&contents);
        tracing::info!(path = %path.display(), "loaded config");
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.receiver.grpc_port == 0 {
            errors.push("receiver.grpc_port must be in 1..=65535".to_string());
        }
        if self.receiver.http_port == 0 {
            errors.push("receiver.http_port must be in 1..=65535".to_string());
        }
        if self.receiver.grpc_port == self.receiver.http_port {
            errors.push("receiver.grpc_port and receiver.http_port must differ".to_string());
        }
        if self.storage.raw_retention_days <= 0 {
            errors.push("storage.raw_retention_days must be positive".to_string());
        }
        if self.storage.summary_retention_days <= 0 {
            errors.push("storage.summary_retention_days must be positive".to_string());
        }
        if self.scanner.interval_secs == 0 {
            errors.push("scanner.interval_secs must be positive".to_string());
        }
        for (rule, threshold) in &self.alerts.thresholds {
            if *threshold <= 0.0 {
                errors.push(format!("alerts.thresholds.{rule} must be positive"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }

    /// Expand a leading `~` in the database path via `dirs::home_dir`.
    pub fn resolved_database_path(&self) -> std::path::PathBuf {
        let raw = &self.storage.database_path;
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        std::path::PathBuf::from(raw)
    }
}

/// Round-trips `contents` through `toml::Value` to enumerate the top-level
/// table keys actually present, and warns (doesn't error) on any not in
/// `KNOWN_TOP_LEVEL_KEYS` — a typo'd section should surface, not silently
/// vanish via `#[serde(default)]`.
fn warn_on_unknown_keys(contents: &str) {
    let Ok(toml::Value::Table(table)) = contents.parse::<toml::Value>() else {
        return;
    };
    for key in table.keys() {
        if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "unknown top-level config key, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_defaults() {
        let config = Config::load("/nonexistent/path/ccpulse.toml").unwrap();
        assert_eq!(config.receiver.grpc_port, 4317);
        assert_eq!(config.storage.raw_retention_days, 7);
    }

    #[test]
    fn conflicting_ports_fail_validation() {
        let mut config = Config::default();
        config.receiver.http_port = config.receiver.grpc_port;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn tilde_expands_against_home_dir() {
        let config = Config::default();
        let resolved = config.resolved_database_path();
        assert!(resolved.ends_with(".ccpulse/ccpulse.db"));
    }

    #[test]
    fn unknown_top_level_key_is_ignored_not_an_error() {
        warn_on_unknown_keys("[receiver]\ngrpc_port = 4317\n\n[bogus_section]\nfoo = 1\n");
        // no panic, and Config::load over the same document still succeeds
        let config: Config = toml::from_str("[receiver]\ngrpc_port = 4317\n\n[bogus_section]\nfoo = 1\n").unwrap();
        assert_eq!(config.receiver.grpc_port, 4317);
    }

    #[test]
    fn parses_full_toml_document() {
        let toml_str = r#"
            [receiver]
            grpc_port = 5317
            http_port = 5318

            [storage]
            database_path = "/tmp/ccpulse.db"
            raw_retention_days = 3

            [models.pricing]
            "claude-3" = [3.0, 15.0, 0.3, 3.75]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.receiver.grpc_port, 5317);
        assert_eq!(config.storage.database_path, "/tmp/ccpulse.db");
        assert_eq!(config.models.pricing.get("claude-3"), Some(&[3.0, 15.0, 0.3, 3.75]));
    }
}
