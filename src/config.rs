use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::PollSettings;

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "jobpilot.toml";
const ENV_PREFIX: &str = "JOBPILOT_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base URL of the remote job service, e.g. `http://localhost:5000/api`
    pub api_base_url: String,
    pub poll_interval_secs: u64,
    pub training_poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Re-attach to an in-flight training job at startup
    pub resume_on_start: bool,
    /// Use the in-memory simulated backend instead of HTTP
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api".to_string(),
            poll_interval_secs: 5,
            training_poll_interval_secs: 10,
            request_timeout_secs: 30,
            resume_on_start: true,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then the TOML file, then `JOBPILOT_*`
    /// environment variables, then `overrides` (typically the parsed CLI args).
    ///
    /// `file` defaults to `jobpilot.toml`; a missing file is not an error.
    pub fn new<T: Serialize>(file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("JOBPILOT_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        Self::from_figment(figment)
            .with_context(|| format!("Failed to load configuration (file: {})", file.display()))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 || self.training_poll_interval_secs == 0 {
            anyhow::bail!("poll intervals must be at least one second");
        }
        if !self.simulation && self.api_base_url.trim().is_empty() {
            anyhow::bail!("api_base_url must be set unless simulation is enabled");
        }
        Ok(())
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.poll_interval_secs),
            training_interval: Duration::from_secs(self.training_poll_interval_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
