//! # Engine Configuration
//!
//! Tunables for the resolution pipeline, loaded with precedence:
//! programmatic overrides > env vars > config file > defaults.
//!
//! # Example config file (idgraph.toml)
//! ```toml
//! resolver = "union-find"
//! max_iterations = 30
//! default_max_group_size = 10000
//! large_cluster_threshold = 500
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};

pub const DEFAULT_MAX_ITERATIONS: u32 = 30;
pub const DEFAULT_LOOKBACK_MINUTES: i64 = 0;
pub const DEFAULT_MAX_GROUP_SIZE: usize = 10_000;
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 10_000;
pub const DEFAULT_SKIPPED_SAMPLE_SIZE: usize = 5;
pub const DEFAULT_LARGE_CLUSTER_THRESHOLD: usize = 1_000;
pub const DEFAULT_PARTITION_COUNT: usize = 8;
pub const DEFAULT_STALE_RUN_HOURS: i64 = 4;

/// Connected-components strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResolverStrategy {
    /// Single-writer union-find with path halving. Exact convergence, no
    /// iteration cap.
    #[default]
    UnionFind,
    /// Partitioned bulk relaxation with a barrier per pass. Subject to
    /// `max_iterations` and may surface a convergence warning.
    Relaxation,
}

/// Engine-level tunables, immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Connected-components strategy
    pub resolver: ResolverStrategy,
    /// Relaxation pass cap before a convergence warning
    pub max_iterations: u32,
    /// Edge shards for the relaxation strategy
    pub partition_count: usize,
    /// Minutes subtracted from the stored watermark when selecting deltas
    pub lookback_minutes: i64,
    /// Group size cap applied when a rule does not set its own
    pub default_max_group_size: usize,
    /// Fuzzy block size cap; larger blocks are skipped with a warning
    pub max_block_size: usize,
    /// Entity keys sampled onto each skipped-group audit row
    pub skipped_sample_size: usize,
    /// Member count at which a cluster is reported as large
    pub large_cluster_threshold: usize,
    /// Age after which a RUNNING run record is expired as interrupted
    pub stale_run_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resolver: ResolverStrategy::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            partition_count: DEFAULT_PARTITION_COUNT,
            lookback_minutes: DEFAULT_LOOKBACK_MINUTES,
            default_max_group_size: DEFAULT_MAX_GROUP_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            skipped_sample_size: DEFAULT_SKIPPED_SAMPLE_SIZE,
            large_cluster_threshold: DEFAULT_LARGE_CLUSTER_THRESHOLD,
            stale_run_hours: DEFAULT_STALE_RUN_HOURS,
        }
    }
}

impl EngineConfig {
    /// Load configuration with precedence: overrides > env > file > defaults.
    ///
    /// Environment variables use the `IDGRAPH_` prefix, e.g.
    /// `IDGRAPH_MAX_ITERATIONS=50`.
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(EngineConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("IDGRAPH_"));
        figment = figment.merge(Serialized::defaults(overrides));

        let config: EngineConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only.
    pub fn from_env(config_path: Option<&str>) -> Result<Self> {
        Self::load(config_path, ConfigOverrides::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations < 1 {
            return Err(EngineError::Configuration(format!(
                "max_iterations must be >= 1, got {}",
                self.max_iterations
            )));
        }
        if self.partition_count < 1 {
            return Err(EngineError::Configuration(format!(
                "partition_count must be >= 1, got {}",
                self.partition_count
            )));
        }
        if self.default_max_group_size < 2 {
            return Err(EngineError::Configuration(format!(
                "default_max_group_size must be >= 2, got {}",
                self.default_max_group_size
            )));
        }
        if self.max_block_size < 2 {
            return Err(EngineError::Configuration(format!(
                "max_block_size must be >= 2, got {}",
                self.max_block_size
            )));
        }
        if self.lookback_minutes < 0 {
            return Err(EngineError::Configuration(format!(
                "lookback_minutes must be >= 0, got {}",
                self.lookback_minutes
            )));
        }
        if self.stale_run_hours < 1 {
            return Err(EngineError::Configuration(format!(
                "stale_run_hours must be >= 1, got {}",
                self.stale_run_hours
            )));
        }
        Ok(())
    }
}

/// Programmatic overrides applied on top of file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver: Option<ResolverStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookback_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_max_group_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_block_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_sample_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_cluster_threshold: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_run_hours: Option<i64>,
}
