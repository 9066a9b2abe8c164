//! Sequencer configuration

use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Sequencer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Name attached to log lines from this sequencer
    #[serde(default = "default_name")]
    pub name: String,

    /// Whether the worklist starts paused and waits for `start`/`resume`
    #[serde(rename = "start-suspended", default = "default_start_suspended")]
    pub start_suspended: bool,
}

fn default_name() -> String {
    "sequencer".to_string()
}

fn default_start_suspended() -> bool {
    true
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            start_suspended: default_start_suspended(),
        }
    }
}

impl SequencerConfig {
    /// Config for a sequencer that starts running immediately
    pub fn running() -> Self {
        Self {
            start_suspended: false,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Parse configuration from YAML
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        debug!("SequencerConfig::from_yaml_str: called");
        serde_yaml::from_str(content).context("Failed to parse sequencer config")
    }

    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        debug!(path = %path.as_ref().display(), "SequencerConfig::load: called");
        let content = fs::read_to_string(&path)
            .context(format!("Failed to read sequencer config {}", path.as_ref().display()))?;

        let config = Self::from_yaml_str(&content)?;

        info!("Loaded sequencer config from: {}", path.as_ref().display());
        Ok(config)
    }
}
