//! Configuration file support for motion.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/motion/config.toml`.

use crate::classifier::ClassifierSettings;
use crate::pipeline::PipelineSettings;
use crate::series::Duration;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub models: ModelsConfig,
}

/// Sliding-window classification parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_step")]
    pub step: usize,

    #[serde(default = "default_threshold")]
    pub threshold: f64,

    #[serde(default = "default_merge_tolerance")]
    pub merge_tolerance: f64,

    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            step: default_step(),
            threshold: default_threshold(),
            merge_tolerance: default_merge_tolerance(),
            max_results: default_max_results(),
        }
    }
}

/// Chunk stitching parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_max_gap_seconds")]
    pub max_gap_seconds: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_gap_seconds: default_max_gap_seconds(),
        }
    }
}

/// Background classification
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Where model manifests and weights live
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_models_dir")]
    pub dir: PathBuf,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: default_models_dir(),
        }
    }
}

// Default value functions
fn default_window_size() -> usize {
    400
}

fn default_step() -> usize {
    10
}

fn default_threshold() -> f64 {
    0.7
}

fn default_merge_tolerance() -> f64 {
    0.1
}

fn default_max_results() -> usize {
    10
}

fn default_max_gap_seconds() -> Duration {
    crate::series::MAX_GAP
}

fn default_workers() -> usize {
    2
}

fn default_models_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| home_dir().join(".local/share"));
    base.join("motion").join("models")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| home_dir().join(".config"));
        base.join("motion").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject values the classifier or pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.classifier.window_size == 0 || self.classifier.step == 0 {
            return Err(Error::Config(
                "classifier.window_size and classifier.step must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.classifier.threshold) {
            return Err(Error::Config(format!(
                "classifier.threshold must be within 0..1, got {}",
                self.classifier.threshold
            )));
        }
        if self.pipeline.workers == 0 {
            return Err(Error::Config("pipeline.workers must be at least 1".into()));
        }
        let gap = self.reconciler.max_gap_seconds;
        if gap.is_nan() || gap < 0.0 {
            return Err(Error::Config(
                "reconciler.max_gap_seconds must not be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn classifier_settings(&self) -> ClassifierSettings {
        ClassifierSettings {
            window_size: self.classifier.window_size,
            step: self.classifier.step,
            threshold: self.classifier.threshold,
            merge_tolerance: self.classifier.merge_tolerance,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            workers: self.pipeline.workers,
            max_results: self.classifier.max_results,
            max_gap: self.reconciler.max_gap_seconds,
            classifier: self.classifier_settings(),
        }
    }
}
