//! Process settings: an optional YAML file plus environment overrides.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::EnvVar;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DEPLOYER_IMAGE: &str = "registry.local/krollout/deployer:latest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub listen_addr: String,
    pub storage: StorageSettings,
    pub deployer: DeployerSettings,
    pub triggers: ControllerSettings,
    pub configs: ControllerSettings,
    /// Seconds between informer resyncs; zero disables them.
    pub resync_period_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub database_url: String,
    pub poll_interval_ms: u64,
}

/// What the deployer controller puts into worker pods, and how hard it
/// retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeployerSettings {
    pub image: String,
    pub environment: Vec<EnvVar>,
    pub service_account: String,
    pub workers: usize,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerSettings {
    pub workers: usize,
    pub max_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6443".to_string(),
            storage: StorageSettings::default(),
            deployer: DeployerSettings::default(),
            triggers: ControllerSettings {
                workers: 2,
                max_retries: 5,
            },
            configs: ControllerSettings::default(),
            resync_period_secs: 300,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_url: "sqlite:krollout.db?mode=rwc".to_string(),
            poll_interval_ms: 500,
        }
    }
}

impl Default for DeployerSettings {
    fn default() -> Self {
        Self {
            image: DEFAULT_DEPLOYER_IMAGE.to_string(),
            environment: Vec::new(),
            service_account: "deployer".to_string(),
            workers: 2,
            max_retries: 15,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 15,
        }
    }
}

impl Settings {
    /// Reads `path` if given, then applies `KROLLOUT_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading settings from {}", path.display()))?;
                Self::from_yaml(&raw)
                    .with_context(|| format!("parsing settings in {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.apply_overrides(|key| env::var(key).ok());
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("KROLLOUT_DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Some(addr) = lookup("KROLLOUT_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(image) = lookup("KROLLOUT_DEPLOYER_IMAGE") {
            self.deployer.image = image;
        }
    }

    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_period_secs > 0).then(|| Duration::from_secs(self.resync_period_secs))
    }
}
