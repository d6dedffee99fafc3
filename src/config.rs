//! YAML configuration for the coordinator

use std::fs;
use std::io;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::buffer::BufferPoolConfig;
use crate::cache::{CacheConfig, SCALE_TIERS};
use crate::pool::{BalancingPolicy, MAX_WORKERS, PoolOptions, WorkerCount};
use crate::strategy::StrategyThresholds;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything the coordinator needs to start
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PagetileConfig {
    pub workers: WorkerCount,
    pub balancing: BalancingPolicy,
    pub cache: CacheConfig,
    pub buffers: BufferPoolConfig,
    pub strategy: StrategyThresholds,
}

impl PagetileConfig {
    /// Parses and validates YAML text. Missing keys take their defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&text)?;
        info!("Loaded config from {path:?}");
        debug!("{config:?}");
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    #[must_use]
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            workers: self.workers,
            balancing: self.balancing,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if let WorkerCount::Fixed(n) = self.workers {
            if !(1..=MAX_WORKERS).contains(&n) {
                return invalid(format!("workers {n} is outside 1..={MAX_WORKERS}"));
            }
        }

        if self.cache.l1_max_entries == 0 {
            return invalid("cache.l1_max_entries must be at least 1".to_string());
        }
        if self.cache.l2_max_entries == 0 {
            return invalid("cache.l2_max_entries must be at least 1".to_string());
        }
        if self.cache.l2_max_bytes == 0 {
            return invalid("cache.l2_max_bytes must be at least 1".to_string());
        }
        if self.cache.max_scale_tier.is_nan() || self.cache.max_scale_tier < SCALE_TIERS[0] {
            return invalid(format!(
                "cache.max_scale_tier {} is below the lowest tier {}",
                self.cache.max_scale_tier, SCALE_TIERS[0]
            ));
        }

        if let Some(tier) = self
            .buffers
            .tiers
            .iter()
            .find(|tier| tier.slot_size == 0 || tier.slots == 0)
        {
            return invalid(format!(
                "buffer tier with {} slots of {} bytes is empty",
                tier.slots, tier.slot_size
            ));
        }

        let strategy = &self.strategy;
        let positive = |zoom: f32| zoom.is_finite() && zoom > 0.0;
        if !positive(strategy.low_zoom) || !positive(strategy.high_zoom) {
            return invalid("strategy zoom thresholds must be positive".to_string());
        }
        if strategy.low_zoom > strategy.high_zoom {
            return invalid(format!(
                "strategy.low_zoom {} is above strategy.high_zoom {}",
                strategy.low_zoom, strategy.high_zoom
            ));
        }
        if !(0.0..=1.0).contains(&strategy.visibility_threshold) {
            return invalid(format!(
                "strategy.visibility_threshold {} is outside 0..=1",
                strategy.visibility_threshold
            ));
        }
        if strategy.tile_size == 0 {
            return invalid("strategy.tile_size must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::cache::CompliancePolicy;

    #[test]
    fn empty_yaml_is_default() {
        let config = PagetileConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, PagetileConfig::default());
        assert_eq!(config.workers, WorkerCount::Auto);
        assert_eq!(config.balancing, BalancingPolicy::DocumentAffinity);
    }

    #[test]
    fn partial_yaml_overrides_fields() {
        let yaml = r"
workers: 2
balancing: least_loaded
cache:
  l2_max_entries: 128
  compliance: reject
strategy:
  high_zoom: 6.0
";
        let config = PagetileConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.workers, WorkerCount::Fixed(2));
        assert_eq!(config.balancing, BalancingPolicy::LeastLoaded);
        assert_eq!(config.cache.l2_max_entries, 128);
        assert_eq!(config.cache.l1_max_entries, 64);
        assert_eq!(config.cache.compliance, CompliancePolicy::Reject);
        assert_eq!(config.strategy.high_zoom, 6.0);
        assert_eq!(config.strategy.low_zoom, 1.5);
    }

    #[test]
    fn worker_count_out_of_range_fails_to_parse() {
        assert!(matches!(
            PagetileConfig::from_yaml_str("workers: 9"),
            Err(ConfigError::Parse(_))
        ));
        assert!(PagetileConfig::from_yaml_str("workers: auto").is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let inverted = "strategy:\n  low_zoom: 5.0\n  high_zoom: 2.0\n";
        assert!(matches!(
            PagetileConfig::from_yaml_str(inverted),
            Err(ConfigError::Invalid(_))
        ));

        let empty_l2 = "cache:\n  l2_max_entries: 0\n";
        assert!(matches!(
            PagetileConfig::from_yaml_str(empty_l2),
            Err(ConfigError::Invalid(_))
        ));

        let empty_tier = "buffers:\n  tiers:\n    - slot_size: 1024\n      slots: 0\n";
        assert!(matches!(
            PagetileConfig::from_yaml_str(empty_tier),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn validate_rejects_worker_count_outside_range() {
        for workers in [0, MAX_WORKERS + 1, 9] {
            let config = PagetileConfig {
                workers: WorkerCount::Fixed(workers),
                ..PagetileConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{workers} workers accepted"
            );
        }
        for workers in 1..=MAX_WORKERS {
            let config = PagetileConfig {
                workers: WorkerCount::Fixed(workers),
                ..PagetileConfig::default()
            };
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn load_from_file_and_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workers: 3\ncache:\n  max_scale_tier: 16.0").unwrap();

        let config = PagetileConfig::load(file.path()).unwrap();
        assert_eq!(config.workers, WorkerCount::Fixed(3));
        assert_eq!(config.cache.max_scale_tier, 16.0);

        let reparsed = PagetileConfig::from_yaml_str(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PagetileConfig::load(dir.path().join("absent.yaml")),
            Err(ConfigError::Io(_))
        ));
    }
}
