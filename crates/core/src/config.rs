use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_watchdog_period")]
    pub watchdog_period_ms: u64,
    #[serde(default = "default_device_settle")]
    pub device_settle_ms: u64,
    #[serde(default)]
    pub shaders_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub sounds_enabled: bool,
    #[serde(default = "default_log_retention")]
    pub log_retention_count: usize,
    #[serde(default)]
    pub stream_logs: bool,
    #[serde(default)]
    pub restore_enabled_on_launch: bool,
    #[serde(default = "default_true")]
    pub allow_tearing: bool,
    #[serde(default = "default_profile")]
    pub default_profile: String,
}

fn default_watchdog_period() -> u64 {
    5000
}

fn default_device_settle() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_log_retention() -> usize {
    10
}

fn default_profile() -> String {
    "identity".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            watchdog_period_ms: default_watchdog_period(),
            device_settle_ms: default_device_settle(),
            shaders_dir: None,
            sounds_enabled: true,
            log_retention_count: default_log_retention(),
            stream_logs: false,
            restore_enabled_on_launch: false,
            allow_tearing: true,
            default_profile: default_profile(),
        }
    }
}

pub struct Config {
    config_path: PathBuf,
    pub app_data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub sounds_dir: PathBuf,
}

impl Config {
    pub fn new() -> Result<Self> {
        let base = match std::env::var("APPDATA") {
            Ok(app_data) => PathBuf::from(app_data),
            Err(_) => {
                let home = std::env::var("HOME")
                    .context("Failed to get APPDATA or HOME environment variable")?;
                PathBuf::from(home).join(".config")
            }
        };

        Self::in_dir(base.join("ClarityLayer"))
    }

    /// Roots the configuration at an explicit directory, creating it if needed.
    pub fn in_dir(app_data_dir: impl AsRef<Path>) -> Result<Self> {
        let app_data_dir = app_data_dir.as_ref().to_path_buf();
        let config_path = app_data_dir.join("config.json");
        let logs_dir = app_data_dir.join("logs");
        let sounds_dir = app_data_dir.join("assets").join("sounds");

        fs::create_dir_all(&app_data_dir)
            .context("Failed to create app data directory")?;
        fs::create_dir_all(&sounds_dir)
            .context("Failed to create sounds directory")?;

        Ok(Self {
            config_path,
            app_data_dir,
            logs_dir,
            sounds_dir,
        })
    }

    pub fn load(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&self.config_path)
            .context("Failed to read config file")?;

        let config: AppConfig = serde_json::from_str(&content)
            .context("Failed to parse config file")?;

        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config)
            .context("Failed to serialize config")?;

        fs::write(&self.config_path, content)
            .context("Failed to write config file")?;

        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}
