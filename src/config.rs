//! Configuration module for persistent settings.
//!
//! This module handles loading, saving, and validating governor
//! configuration, and defines the quality mode presets.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

/// How eagerly quality is traded for heat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityMode {
    /// Tolerates more heat before giving up quality
    Quality,
    /// Default behavior
    #[default]
    Balanced,
    /// Gives up quality early to stay cool and save power
    Efficiency,
}

impl QualityMode {
    /// Multiplier applied to the thermal momentum.
    pub fn momentum_multiplier(&self) -> f64 {
        match self {
            QualityMode::Quality => 0.7,
            QualityMode::Balanced => 1.0,
            QualityMode::Efficiency => 1.4,
        }
    }

    /// Scale below which frame interpolation kicks in.
    pub fn interpolation_scale_threshold(&self) -> f64 {
        match self {
            QualityMode::Quality => 0.75,
            QualityMode::Balanced => 0.85,
            QualityMode::Efficiency => 0.95,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityMode::Quality => "quality",
            QualityMode::Balanced => "balanced",
            QualityMode::Efficiency => "efficiency",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_lowercase().as_str() {
            "quality" => Ok(QualityMode::Quality),
            "balanced" => Ok(QualityMode::Balanced),
            "efficiency" => Ok(QualityMode::Efficiency),
            _ => Err(ConfigError::ValidationError(format!(
                "invalid mode: {}, expected one of: quality, balanced, efficiency",
                s
            ))),
        }
    }
}

/// Where thermal and power state come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSource {
    /// Poll Linux sysfs
    #[default]
    Sysfs,
    /// Values pushed over IPC
    Push,
}

/// Governor configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GovernorConfig {
    pub mode: QualityMode,
    /// Optimization tick period
    pub tick_interval_secs: u64,
    /// Analytics flush period
    pub flush_interval_secs: u64,
    /// Background time after which resume grants a cooldown bonus
    pub background_threshold_secs: u64,
    /// Persist the profile every N ticks
    pub persist_every_ticks: u64,
    /// Measured-rate deficit ignored as vsync jitter
    pub rate_tolerance: f64,
    pub context_source: ContextSource,
    pub socket_path: String,
    /// Workload activated at startup
    pub initial_workload: Option<String>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            mode: QualityMode::Balanced,
            tick_interval_secs: 5,
            flush_interval_secs: 300,
            background_threshold_secs: 60,
            persist_every_ticks: 12,
            rate_tolerance: 3.0,
            context_source: ContextSource::Sysfs,
            socket_path: "/tmp/quality-governor.sock".to_string(),
            initial_workload: None,
        }
    }
}

impl GovernorConfig {
    /// Validate configuration values.
    /// Returns Ok(()) if valid, Err with descriptive message if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tick_interval_secs must be at least 1".to_string(),
            ));
        }

        if self.flush_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "flush_interval_secs must be at least 1".to_string(),
            ));
        }

        if self.persist_every_ticks == 0 {
            return Err(ConfigError::ValidationError(
                "persist_every_ticks must be at least 1".to_string(),
            ));
        }

        if !self.rate_tolerance.is_finite() || self.rate_tolerance < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "rate_tolerance ({}) must be a non-negative number",
                self.rate_tolerance
            )));
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn background_threshold(&self) -> Duration {
        Duration::from_secs(self.background_threshold_secs)
    }
}

/// Configuration manager with file I/O.
pub struct ConfigManager {
    config: RwLock<GovernorConfig>,
    path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults.
    /// If the file doesn't exist, returns a manager with default config.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                ConfigError::ParseError(format!("Failed to read config file: {}", e))
            })?;

            let config: GovernorConfig = serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("Invalid JSON: {}", e)))?;

            // Validate loaded config
            config.validate()?;
            config
        } else {
            GovernorConfig::default()
        };

        Ok(Self {
            config: RwLock::new(config),
            path: path.to_path_buf(),
        })
    }

    /// Save configuration to file using atomic write.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config = self.get();

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {}", e)))?;

        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Get current configuration.
    pub fn get(&self) -> GovernorConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|_| GovernorConfig::default())
    }

    /// Update configuration with validation.
    pub fn update(&self, config: GovernorConfig) -> Result<(), ConfigError> {
        // Validate before updating
        config.validate()?;

        let mut current = self.config.write().map_err(|_| {
            ConfigError::ValidationError("Failed to acquire write lock".to_string())
        })?;

        *current = config;

        // Release lock before saving
        drop(current);

        // Persist to file
        self.save()
    }

    /// Get the config file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the default config path (~/.config/quality-governor/config.json).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("quality-governor")
            .join("config.json")
    }
}

// Custom serialization for QualityMode enum
impl Serialize for QualityMode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for QualityMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        QualityMode::parse(&s).map_err(serde::de::Error::custom)
    }
}
