// THEORY:
// The `config` module holds every tunable knob of a tracking run in one serde
// struct. The pipeline, the trajectory driver and the CLI all read from the same
// `TrackerConfig`, so a run is fully described by this value plus its input frames.
//
// Unknown keys are rejected and missing keys fall back to the defaults below, so a
// TOML file only needs to mention what it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_modules::similarity::SimilarityWeights;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Per-run configuration for the lineage tracker.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    /// Matches scoring below this similarity are discarded after assignment.
    pub min_similarity: f64,
    /// Maximum Euclidean distance between a Burgers sum and its counterpart for a
    /// merge or split to be accepted.
    pub burgers_tolerance: f64,
    pub spatial_weight: f64,
    pub burgers_weight: f64,
    pub length_weight: f64,
    /// Segments farther apart than this never match.
    pub max_spatial_distance: f64,
    /// Largest number of parents (merge) or children (split) considered for one event.
    pub max_event_arity: usize,

    // --- Trajectory options ---
    pub start_frame: u64,
    /// Inclusive upper bound. `None` means "up to the last available frame".
    pub end_frame: Option<u64>,
    pub step: u64,
    /// Number of loader workers. `None` means one per logical CPU.
    pub workers: Option<usize>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.6,
            burgers_tolerance: 0.05,
            spatial_weight: 0.4,
            burgers_weight: 0.4,
            length_weight: 0.2,
            max_spatial_distance: 15.0,
            max_event_arity: 3,
            start_frame: 0,
            end_frame: None,
            step: 1,
            workers: None,
        }
    }
}

impl TrackerConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file can't be read, isn't valid TOML, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.min_similarity) {
            return Err(ConfigError::Invalid(format!(
                "min_similarity must be within [0, 1], got {}",
                self.min_similarity
            )));
        }
        if !(self.burgers_tolerance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "burgers_tolerance must be positive, got {}",
                self.burgers_tolerance
            )));
        }
        if !(self.max_spatial_distance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "max_spatial_distance must be positive, got {}",
                self.max_spatial_distance
            )));
        }
        for (name, weight) in [
            ("spatial_weight", self.spatial_weight),
            ("burgers_weight", self.burgers_weight),
            ("length_weight", self.length_weight),
        ] {
            if !(weight >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be non-negative, got {weight}"
                )));
            }
        }
        if self.max_event_arity < 2 {
            return Err(ConfigError::Invalid(format!(
                "max_event_arity must be at least 2, got {}",
                self.max_event_arity
            )));
        }
        if self.step == 0 {
            return Err(ConfigError::Invalid("step must be at least 1".to_string()));
        }
        if let Some(end) = self.end_frame {
            if end < self.start_frame {
                return Err(ConfigError::Invalid(format!(
                    "end_frame {end} precedes start_frame {}",
                    self.start_frame
                )));
            }
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn similarity_weights(&self) -> SimilarityWeights {
        SimilarityWeights {
            spatial_weight: self.spatial_weight,
            burgers_weight: self.burgers_weight,
            length_weight: self.length_weight,
            max_spatial_distance: self.max_spatial_distance,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Whether `frame` is selected by `start_frame`, `end_frame` and `step`.
    pub fn includes_frame(&self, frame: u64) -> bool {
        frame >= self.start_frame
            && self.end_frame.is_none_or(|end| frame <= end)
            && (frame - self.start_frame) % self.step.max(1) == 0
    }
}
