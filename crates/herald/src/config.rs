use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Account handle used when `--account` is not given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_account: Option<String>,

    /// Deliver envelopes with the outer sender hidden
    #[serde(default = "default_sealed")]
    pub sealed_sender: bool,

    /// Bounded retry: attempts per envelope
    #[serde(default = "default_attempts")]
    pub max_send_attempts: u32,

    /// Path to the config file
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_sealed() -> bool {
    true
}

fn default_attempts() -> u32 {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_account: None,
            sealed_sender: true,
            max_send_attempts: 4,
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Load config from the data directory
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.json");

        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            config.path = config_path;
            Ok(config)
        } else {
            Ok(Config {
                path: config_path,
                ..Default::default()
            })
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&self.path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn set_default_account(&mut self, handle: &str) -> Result<()> {
        self.default_account = Some(handle.to_string());
        self.save()
    }

    /// The account handle to operate on: the flag wins, then the configured
    /// default.
    pub fn resolve_account(&self, flag: Option<&str>) -> Result<String> {
        if let Some(handle) = flag {
            return Ok(handle.to_string());
        }
        self.default_account
            .clone()
            .context("No account selected; pass --account or register one")
    }
}
