//! Engine configuration
//!
//! Tuned constants (confidence coefficients, deactivation thresholds, merchant
//! similarity, learned-rule weight) are heuristics, so they live in TOML.
//!
//! ## Configuration Resolution
//!
//! Config is loaded with a two-layer resolution:
//! 1. An explicit path, or the override in the data dir
//!    (~/.local/share/tally/config/engine.toml)
//! 2. Fall back to embedded defaults (compiled into binary)
//!
//! Keys missing from an override keep their default values.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::confidence::{ConfidenceConfig, DeactivationConfig};
use crate::error::{Error, Result};
use crate::feedback::FeedbackConfig;
use crate::merchant::MerchantConfig;

/// Embedded default config (compiled into binary)
const DEFAULT_CONFIG: &str = include_str!("../../../config/engine.toml");

/// All engine settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub confidence: ConfidenceConfig,
    pub deactivation: DeactivationConfig,
    pub merchants: MerchantConfig,
    pub feedback: FeedbackConfig,
}

impl EngineConfig {
    /// Load from the data-dir override if present, else the embedded defaults
    pub fn load() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Self::from_toml(DEFAULT_CONFIG),
        }
    }

    /// Load from an explicit file; a missing file falls back to the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config {} not found, using defaults", path.display());
            return Self::from_toml(DEFAULT_CONFIG);
        }
        let content = fs::read_to_string(path)?;
        debug!("Loaded engine config from {}", path.display());
        Self::from_toml(&content)
    }

    /// Parse TOML content over the built-in defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))?;

        let mut config = EngineConfig::default();

        if let Some(c) = raw.confidence {
            let target = &mut config.confidence;
            if let Some(v) = c.floor {
                target.floor = v;
            }
            if let Some(v) = c.ceiling {
                target.ceiling = v;
            }
            if let Some(v) = c.min_usage {
                target.min_usage = v;
            }
            if let Some(v) = c.sparse_penalty {
                target.sparse_penalty = v;
            }
            if let Some(v) = c.composite_sparse_penalty {
                target.composite_sparse_penalty = v;
            }
            if let Some(v) = c.composite_member_boost {
                target.composite_member_boost = v;
            }
        }

        if let Some(d) = raw.deactivation {
            if let Some(v) = d.min_usage {
                config.deactivation.min_usage = v;
            }
            if let Some(v) = d.min_success_rate {
                config.deactivation.min_success_rate = v;
            }
        }

        if let Some(m) = raw.merchants {
            if let Some(v) = m.fuzzy_matching {
                config.merchants.fuzzy_matching = v;
            }
            if let Some(v) = m.similarity_threshold {
                config.merchants.similarity_threshold = v;
            }
        }

        if let Some(f) = raw.feedback {
            if let Some(v) = f.learned_rule_weight {
                config.feedback.learned_rule_weight = v;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let c = &self.confidence;
        if !(c.floor.is_finite() && c.ceiling.is_finite()) || c.floor <= 0.0 || c.floor > c.ceiling {
            return Err(Error::Config(format!(
                "confidence floor {} must be positive and not above ceiling {}",
                c.floor, c.ceiling
            )));
        }
        if !(0.0..=1.0).contains(&self.merchants.similarity_threshold) {
            return Err(Error::Config(format!(
                "merchants.similarity_threshold {} must be within 0..1",
                self.merchants.similarity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.deactivation.min_success_rate) {
            return Err(Error::Config(format!(
                "deactivation.min_success_rate {} must be within 0..1",
                self.deactivation.min_success_rate
            )));
        }
        crate::validation::validate_weight(self.feedback.learned_rule_weight)
            .map_err(|e| Error::Config(format!("feedback.learned_rule_weight: {}", e)))
    }
}

/// Default config override path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("tally").join("config").join("engine.toml"))
}

/// Raw config structure for TOML parsing
#[derive(Debug, Deserialize)]
struct RawConfig {
    confidence: Option<RawConfidence>,
    deactivation: Option<RawDeactivation>,
    merchants: Option<RawMerchants>,
    feedback: Option<RawFeedback>,
}

#[derive(Debug, Deserialize)]
struct RawConfidence {
    floor: Option<f64>,
    ceiling: Option<f64>,
    min_usage: Option<i64>,
    sparse_penalty: Option<f64>,
    composite_sparse_penalty: Option<f64>,
    composite_member_boost: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawDeactivation {
    min_usage: Option<i64>,
    min_success_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawMerchants {
    fuzzy_matching: Option<bool>,
    similarity_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawFeedback {
    learned_rule_weight: Option<f64>,
}
