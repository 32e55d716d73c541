use serde::{Serialize, Deserialize};
use std::fs;
use std::path::{Path, PathBuf};
use crate::core::cache::default_cache_dir;
use crate::core::error::{Result, TuneError};
use crate::optimizer::memory::MemoryConfig;
use crate::optimizer::scheduler::ILPConfig;
use crate::optimizer::search::{GeneticParams, SearchStrategy};
use crate::optimizer::HardwareProfile;

pub const ENV_CACHE_DIR: &str = "PTXTUNE_CACHE_DIR";
pub const ENV_SEED: &str = "PTXTUNE_SEED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Genetic,
    Random,
    Model,
}

impl std::str::FromStr for StrategyKind {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "genetic" | "ga" => Ok(StrategyKind::Genetic),
            "random" => Ok(StrategyKind::Random),
            "model" | "model-guided" => Ok(StrategyKind::Model),
            other => Err(TuneError::Config(format!("unknown search strategy '{}'", other))),
        }
    }
}

/// Runtime settings for a tuning run. Every field has a default, so a config file
/// only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub concurrency_limit: usize,
    pub samples_per_trial: usize,
    pub seed: u64,
    pub trial_cache_capacity: usize,
    /// `None` resolves to `$HOME/.ptxtune`.
    pub cache_dir: Option<PathBuf>,
    pub use_result_cache: bool,
    /// Combinations the combiner may measure. 0 ranks by estimate only.
    pub measure_budget: usize,
    pub ilp: ILPConfig,
    /// `None` derives the memory model from the target hardware.
    pub memory: Option<MemoryConfig>,
    pub genetic: GeneticParams,
    pub strategy: StrategyKind,
    pub random_samples: usize,
    pub model_initial_samples: usize,
    pub model_iterations: usize,
    pub exploration_beta: f64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            samples_per_trial: 3,
            seed: 42,
            trial_cache_capacity: 64,
            cache_dir: None,
            use_result_cache: true,
            measure_budget: 8,
            ilp: ILPConfig::default(),
            memory: None,
            genetic: GeneticParams::default(),
            strategy: StrategyKind::Genetic,
            random_samples: 64,
            model_initial_samples: 8,
            model_iterations: 32,
            exploration_beta: 2.0,
        }
    }
}

impl TunerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `PTXTUNE_CACHE_DIR` and `PTXTUNE_SEED` when set.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(
            std::env::var(ENV_CACHE_DIR).ok().as_deref(),
            std::env::var(ENV_SEED).ok().as_deref(),
        )
    }

    fn apply_overrides(mut self, cache_dir: Option<&str>, seed: Option<&str>) -> Result<Self> {
        if let Some(dir) = cache_dir.filter(|d| !d.is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(seed) = seed {
            self.seed = seed.trim().parse()
                .map_err(|_| TuneError::Config(format!("{} must be an unsigned integer, got '{}'", ENV_SEED, seed)))?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(TuneError::Config("concurrency_limit must be at least 1".into()));
        }
        if self.samples_per_trial == 0 {
            return Err(TuneError::Config("samples_per_trial must be at least 1".into()));
        }
        self.genetic.validate()
    }

    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn memory_config(&self, hardware: &HardwareProfile) -> MemoryConfig {
        self.memory.clone().unwrap_or_else(|| MemoryConfig::from_hardware(hardware))
    }

    pub fn search_strategy(&self) -> SearchStrategy {
        match self.strategy {
            StrategyKind::Genetic => SearchStrategy::Genetic(self.genetic.clone()),
            StrategyKind::Random => SearchStrategy::Random { samples: self.random_samples },
            StrategyKind::Model => SearchStrategy::ModelGuided {
                initial_samples: self.model_initial_samples,
                iterations: self.model_iterations,
                exploration_beta: self.exploration_beta,
            },
        }
    }
}
