use anyhow::{Context, Result};
use nodeflow_core::config::LlmProviderKind;
use nodeflow_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
}

fn default_results_dir() -> String {
    "results".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
        }
    }
}

/// Values from flags or `NODEFLOW_*` environment variables that win over the file
#[derive(Debug, Clone, Default)]
pub struct LlmOverrides {
    pub provider: Option<LlmProviderKind>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

impl CliConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!(
                "Configuration file {} not found, using defaults",
                config_path.display()
            );
            Self {
                data_dir: data_dir.clone(),
                engine: EngineConfig::default(),
                storage: StorageConfig::default(),
            }
        };

        config.data_dir = data_dir;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: LlmOverrides) {
        let llm = &mut self.engine.llm;
        if let Some(provider) = overrides.provider {
            llm.provider = provider;
        }
        if overrides.api_key.is_some() {
            llm.api_key = overrides.api_key;
        }
        if overrides.model.is_some() {
            llm.model = overrides.model;
        }
        if overrides.base_url.is_some() {
            llm.base_url = overrides.base_url;
        }
    }

    /// Directory holding recorded execution results
    pub fn results_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.results_dir)
    }
}
