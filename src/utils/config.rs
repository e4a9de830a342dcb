use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisThresholds;
use crate::utils::error::AppError;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Capture settings
    pub network_interface: String,
    pub default_packet_count: usize,
    pub max_packet_count: usize,
    pub capture_timeout_secs: u64,
    pub cache_max_age_secs: u64,

    // Background capture
    pub background_capture: bool,
    pub background_interval_secs: u64,
    pub retry_backoff_secs: u64,

    // Enrichment
    pub enrichment_enabled: bool,
    pub lookup_timeout_secs: u64,

    // Analysis thresholds
    pub entropy_threshold: f64,
    pub medium_risk_indicators: usize,
    pub high_risk_indicators: usize,

    // Logging settings
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let thresholds = AnalysisThresholds::default();
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 5000,
            network_interface: "default".to_string(),
            default_packet_count: 20,
            max_packet_count: 100,
            capture_timeout_secs: 5,
            cache_max_age_secs: 5,
            background_capture: true,
            background_interval_secs: 10,
            retry_backoff_secs: 5,
            enrichment_enabled: false,
            lookup_timeout_secs: 2,
            entropy_threshold: thresholds.entropy_threshold,
            medium_risk_indicators: thresholds.medium_risk_indicators,
            high_risk_indicators: thresholds.high_risk_indicators,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load from the first configuration file found, falling back to the environment.
    ///
    /// An explicit `path` is tried before the usual locations.
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let mut config_paths: Vec<String> = Vec::new();
        if let Some(path) = path {
            config_paths.push(path.to_string());
        }
        if let Ok(path) = std::env::var("CONFIG_PATH") {
            config_paths.push(path);
        }
        config_paths.extend([
            "config.json".to_string(),
            "config.toml".to_string(),
            "configs/config.json".to_string(),
        ]);
        if let Some(dir) = dirs::config_dir() {
            config_paths.push(dir.join("osi-visualizer/config.json").to_string_lossy().to_string());
        }

        let mut config: Option<Config> = None;

        for config_path in &config_paths {
            if !Path::new(config_path).exists() {
                if path == Some(config_path.as_str()) {
                    warn!("Configuration file not found: {}", config_path);
                }
                continue;
            }

            info!("Attempting to load configuration from: {}", config_path);
            match Self::load_from_file(config_path) {
                Ok(loaded) => {
                    info!("✅ Configuration successfully loaded from: {}", config_path);
                    config = Some(loaded);
                    break;
                }
                Err(e) => {
                    error!("❌ Failed to load config from {}: {:#}", config_path, e);
                }
            }
        }

        let final_config = match config {
            Some(config) => config,
            None => {
                warn!("⚠️  No configuration file found. Using environment variables and defaults.");
                Self::from_environment_and_defaults()
            }
        };

        final_config.validate()?;

        info!("🔧 Configuration validation passed");
        Ok(final_config)
    }

    /// Load configuration from a specific file; `.toml` files are parsed as TOML, anything else as JSON
    pub fn load_from_file(config_path: &str) -> Result<Self> {
        let mut file = File::open(config_path)
            .with_context(|| format!("Failed to open config file: {}", config_path))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;

        let is_toml = Path::new(config_path)
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));

        let config: Config = if is_toml {
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", config_path))?
        } else {
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", config_path))?
        };

        Ok(config)
    }

    /// Create configuration from environment variables and defaults
    fn from_environment_and_defaults() -> Self {
        info!("Building configuration from environment variables and defaults");
        let defaults = Self::default();

        Config {
            server_host: std::env::var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: env_or("SERVER_PORT", defaults.server_port),
            network_interface: std::env::var("NETWORK_INTERFACE").unwrap_or(defaults.network_interface),
            default_packet_count: env_or("DEFAULT_PACKET_COUNT", defaults.default_packet_count),
            max_packet_count: env_or("MAX_PACKET_COUNT", defaults.max_packet_count),
            capture_timeout_secs: env_or("CAPTURE_TIMEOUT_SECS", defaults.capture_timeout_secs),
            cache_max_age_secs: env_or("CACHE_MAX_AGE_SECS", defaults.cache_max_age_secs),
            background_capture: env_flag("BACKGROUND_CAPTURE", defaults.background_capture),
            background_interval_secs: env_or("BACKGROUND_INTERVAL_SECS", defaults.background_interval_secs),
            retry_backoff_secs: env_or("RETRY_BACKOFF_SECS", defaults.retry_backoff_secs),
            enrichment_enabled: env_flag("ENRICHMENT_ENABLED", defaults.enrichment_enabled),
            lookup_timeout_secs: env_or("LOOKUP_TIMEOUT_SECS", defaults.lookup_timeout_secs),
            entropy_threshold: env_or("ENTROPY_THRESHOLD", defaults.entropy_threshold),
            medium_risk_indicators: env_or("MEDIUM_RISK_INDICATORS", defaults.medium_risk_indicators),
            high_risk_indicators: env_or("HIGH_RISK_INDICATORS", defaults.high_risk_indicators),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_file: std::env::var("LOG_FILE").ok(),
        }
    }

    /// Configuration validation
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        // Server settings
        if self.server_host.is_empty() {
            errors.push("Server host cannot be empty".to_string());
        }

        if self.server_port == 0 {
            errors.push(format!("Invalid server port: {}", self.server_port));
        }

        if self.server_port < 1024 && self.server_host == "0.0.0.0" {
            warn!("⚠️  Using privileged port {} with public binding. Ensure proper permissions.", self.server_port);
        }

        // Capture settings
        if self.default_packet_count == 0 {
            errors.push("Default packet count must be at least 1".to_string());
        }

        if self.default_packet_count > self.max_packet_count {
            errors.push(format!(
                "Default packet count {} exceeds maximum {}",
                self.default_packet_count, self.max_packet_count
            ));
        }

        if self.capture_timeout_secs == 0 {
            errors.push("Capture timeout must be at least 1 second".to_string());
        }

        if self.cache_max_age_secs < 2 {
            warn!("⚠️  Cache max age of {}s will trigger a capture on almost every request.", self.cache_max_age_secs);
        }

        if self.background_capture && self.background_interval_secs == 0 {
            errors.push("Background capture interval must be at least 1 second".to_string());
        }

        // Enrichment
        if !(1..=5).contains(&self.lookup_timeout_secs) {
            errors.push(format!(
                "Lookup timeout must be between 1 and 5 seconds, got {}",
                self.lookup_timeout_secs
            ));
        }

        // Analysis thresholds
        if !(0.0..=8.0).contains(&self.entropy_threshold) {
            errors.push(format!(
                "Entropy threshold must be within 0..=8 bits, got {}",
                self.entropy_threshold
            ));
        }

        if self.medium_risk_indicators == 0 {
            errors.push("Medium risk threshold must be at least 1 indicator".to_string());
        }

        if self.medium_risk_indicators > self.high_risk_indicators {
            errors.push(format!(
                "Medium risk threshold {} exceeds high risk threshold {}",
                self.medium_risk_indicators, self.high_risk_indicators
            ));
        }

        // Logging settings
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            errors.push(format!(
                "Invalid log level: '{}'. Must be one of: {:?}",
                self.log_level, VALID_LOG_LEVELS
            ));
        }

        self.validate_paths()?;

        if !errors.is_empty() {
            return Err(AppError::ConfigError(format!("validation failed:\n{}", errors.join("\n"))).into());
        }

        Ok(())
    }

    /// Create the log file directory if necessary
    fn validate_paths(&self) -> Result<()> {
        if let Some(log_file) = &self.log_file {
            if let Some(parent) = Path::new(log_file).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    warn!("Log directory doesn't exist: {}. Will attempt to create it.", parent.display());
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
                    info!("✅ Created log directory: {}", parent.display());
                }
            }
        }

        Ok(())
    }

    pub fn thresholds(&self) -> AnalysisThresholds {
        AnalysisThresholds {
            entropy_threshold: self.entropy_threshold,
            medium_risk_indicators: self.medium_risk_indicators,
            high_risk_indicators: self.high_risk_indicators,
            ..AnalysisThresholds::default()
        }
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    /// Display configuration summary
    pub fn display_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("   Server: {}:{}", self.server_host, self.server_port);
        info!("   Network Interface: {}", self.network_interface);
        info!(
            "   Packets: {} default, {} max, {}s capture timeout",
            self.default_packet_count, self.max_packet_count, self.capture_timeout_secs
        );
        info!("   Cache Max Age: {}s", self.cache_max_age_secs);
        info!(
            "   Background Capture: {}",
            if self.background_capture {
                format!("every {}s (backoff {}s)", self.background_interval_secs, self.retry_backoff_secs)
            } else {
                "Disabled".to_string()
            }
        );
        info!(
            "   Enrichment: {}",
            if self.enrichment_enabled {
                format!("Enabled ({}s lookup timeout)", self.lookup_timeout_secs)
            } else {
                "Disabled".to_string()
            }
        );
        info!(
            "   Risk Thresholds: medium >= {}, high >= {}, entropy > {}",
            self.medium_risk_indicators, self.high_risk_indicators, self.entropy_threshold
        );
        info!("   Log Level: {}", self.log_level);
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("⚠️  Ignoring unparsable {}={}", key, value);
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}
