//! Pipeline configuration.
//!
//! Every field has a default, so a YAML file only needs the values it
//! changes:
//!
//! ```yaml
//! target_shape: [96, 96, 96]
//! batch_size: 4
//! augment: true
//! failure_policy: abort
//! ```

use crate::dataset::discover_subjects;
use crate::error::{Error, Result};
use crate::loader::{BatchGenerator, FailurePolicy, GeneratorOptions};
use crate::split::{DEFAULT_SPLIT_COUNT, DEFAULT_SPLIT_SEED};
use crate::subject::{SubjectPreprocessor, DEFAULT_EXTENSION};
use crate::transforms::Augmenter;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for preprocessing, batching and splitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Spatial shape every volume is resampled to
    #[serde(default = "default_target_shape")]
    pub target_shape: [usize; 3],
    /// Subjects per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Random flips and quarter-turn rotations
    #[serde(default)]
    pub augment: bool,
    /// Reshuffle the pool every pass
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Handling of subjects that fail to preprocess
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Preprocess the subjects of a batch in parallel
    #[serde(default)]
    pub parallel: bool,
    /// Generator seed; entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,
    /// Extension of subject volumes, e.g. `nii.gz` or `nii`
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    /// Seed of the hold-out split
    #[serde(default = "default_split_seed")]
    pub split_seed: u64,
    /// Number of subjects moved by a split
    #[serde(default = "default_split_count")]
    pub split_count: usize,
    /// Per-axis flip probability during augmentation
    #[serde(default = "default_flip_prob")]
    pub flip_prob: f64,
}

fn default_target_shape() -> [usize; 3] {
    [128, 128, 128]
}

fn default_batch_size() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_file_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_split_seed() -> u64 {
    DEFAULT_SPLIT_SEED
}

fn default_split_count() -> usize {
    DEFAULT_SPLIT_COUNT
}

fn default_flip_prob() -> f64 {
    0.5
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_shape: default_target_shape(),
            batch_size: default_batch_size(),
            augment: false,
            shuffle: true,
            failure_policy: FailurePolicy::default(),
            parallel: false,
            seed: None,
            file_extension: default_file_extension(),
            split_seed: default_split_seed(),
            split_count: default_split_count(),
            flip_prob: default_flip_prob(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)
            .map_err(|e| Error::Configuration(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| Error::Configuration(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        if self.target_shape.contains(&0) {
            return Err(Error::Configuration(format!(
                "target_shape must be positive, got {:?}",
                self.target_shape
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Configuration("batch_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.flip_prob) {
            return Err(Error::Configuration(format!(
                "flip_prob must be in [0, 1], got {}",
                self.flip_prob
            )));
        }
        if self.file_extension.trim_start_matches('.').is_empty() {
            return Err(Error::Configuration("file_extension is empty".into()));
        }
        Ok(())
    }

    /// Options for [`BatchGenerator`].
    pub fn generator_options(&self) -> GeneratorOptions {
        GeneratorOptions::new(self.batch_size)
            .augment(self.augment)
            .shuffle(self.shuffle)
            .failure_policy(self.failure_policy)
            .parallel(self.parallel)
    }

    /// Preprocessor for the configured shape and extension.
    pub fn preprocessor(&self) -> Result<SubjectPreprocessor> {
        SubjectPreprocessor::new(self.target_shape, self.file_extension.as_str())
    }

    /// Generator over every subject directory in `pool_dir`.
    pub fn generator<P: AsRef<Path>>(&self, pool_dir: P) -> Result<BatchGenerator> {
        self.validate()?;
        let pool = discover_subjects(pool_dir)?;
        let generator =
            BatchGenerator::seeded(pool, self.preprocessor()?, self.generator_options(), self.seed)?;
        Ok(generator.with_augmenter(Augmenter::new(self.flip_prob)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.target_shape, [128, 128, 128]);
        assert_eq!(config.split_seed, 42);
        assert_eq!(config.split_count, 100);
        assert_eq!(config.file_extension, "nii.gz");
        assert!(config.shuffle && !config.augment);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: PipelineConfig =
            serde_yaml::from_str("batch_size: 5\nfailure_policy: abort\naugment: true\n").unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.target_shape, [128, 128, 128]);

        let options = config.generator_options();
        assert!(options.augment && options.shuffle);
        assert_eq!(options.failure_policy, FailurePolicy::Abort);
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        let config = PipelineConfig {
            target_shape: [64, 64, 32],
            seed: Some(9),
            ..Default::default()
        };
        config.to_yaml(&path).unwrap();
        assert_eq!(PipelineConfig::from_yaml(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "target_shape: [0, 128, 128]\n").unwrap();
        assert!(matches!(
            PipelineConfig::from_yaml(&path),
            Err(Error::Configuration(_))
        ));

        let config = PipelineConfig {
            flip_prob: 2.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_pool_dir() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            PipelineConfig::default().generator(dir.path()),
            Err(Error::EmptyPool)
        ));
    }
}
