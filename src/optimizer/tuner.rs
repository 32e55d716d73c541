use serde::{Serialize, Deserialize};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use crate::core::cache::ResultCache;
use crate::core::config::KernelConfig;
use crate::core::hash::StableHasher;
use crate::optimizer::benchmark::Objective;
use crate::optimizer::policy::{ConstraintViolation, ParameterSpace, TuningConstraints};
use crate::optimizer::search::{self, CancelToken, DeviceArbiter, Evaluator, SearchOutcome, SearchStrategy, Termination};
use crate::optimizer::HardwareProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunerState {
    Init,
    Searching,
    Converged,
    BudgetExhausted,
    Cancelled,
    Done,
}

impl From<Termination> for TunerState {
    fn from(t: Termination) -> Self {
        match t {
            Termination::Converged => TunerState::Converged,
            Termination::BudgetExhausted => TunerState::BudgetExhausted,
            Termination::Cancelled => TunerState::Cancelled,
        }
    }
}

/// Final report of a tuning session. `performance_metric` is always a measured
/// objective value, or −∞ when nothing could be measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningResult {
    pub kernel_name: String,
    pub best_config: KernelConfig,
    pub performance_metric: f64,
    pub optimization_log: Vec<String>,
    /// How the search ended.
    pub termination: TunerState,
    /// Objective invocations spent by this session.
    pub evaluations: usize,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub optimized_source: Option<String>,
    /// RFC 3339.
    pub created_at: String,
}

impl TuningResult {
    pub fn is_measured(&self) -> bool {
        self.performance_metric.is_finite()
    }
}

/// Hex cache key over everything that determines a session's answer.
pub fn cache_key(
    kernel_signature: u64,
    arch: &str,
    constraints: &TuningConstraints,
    space: &ParameterSpace,
) -> String {
    let mut hasher = StableHasher::new();
    hasher
        .write_u64(kernel_signature)
        .write_str(arch)
        .write_u64(constraints.max_shared_memory as u64)
        .write_u64(constraints.max_registers_per_thread as u64)
        .write_u64(constraints.min_occupancy.to_bits());
    for p in &space.parameters {
        hasher.write_str(&p.name).write_u64(p.possible_values.len() as u64);
        for &v in &p.possible_values {
            hasher.write_i64(v);
        }
    }
    format!("{:016x}", hasher.finish())
}

/// One tuning session over a parameter space.
pub struct AutoTuner {
    pub kernel_name: String,
    pub space: ParameterSpace,
    pub constraints: TuningConstraints,
    pub hardware: HardwareProfile,
    pub strategy: SearchStrategy,
    pub concurrency_limit: usize,
    pub seed: u64,
    cache: Option<(ResultCache, u64)>,
    cancel: CancelToken,
    arbiter: DeviceArbiter,
    state: TunerState,
}

impl AutoTuner {
    pub fn new(kernel_name: &str, space: ParameterSpace, hardware: HardwareProfile) -> Self {
        Self {
            kernel_name: kernel_name.to_string(),
            space,
            constraints: TuningConstraints::from_hardware(&hardware),
            hardware,
            strategy: SearchStrategy::default(),
            concurrency_limit: 4,
            seed: 42,
            cache: None,
            cancel: CancelToken::new(),
            arbiter: DeviceArbiter::new(),
            state: TunerState::Init,
        }
    }

    pub fn with_constraints(mut self, constraints: TuningConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_strategy(mut self, strategy: SearchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Shares an externally owned cancellation flag with this session.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Serializes this session's measurements with everything else using `arbiter`.
    pub fn with_arbiter(mut self, arbiter: DeviceArbiter) -> Self {
        self.arbiter = arbiter;
        self
    }

    /// Short-circuits sessions whose (kernel, arch, constraints, space) were tuned before.
    pub fn with_cache(mut self, cache: ResultCache, kernel_signature: u64) -> Self {
        self.cache = Some((cache, kernel_signature));
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> TunerState {
        self.state
    }

    pub fn validate_config(&self, config: &KernelConfig) -> Result<(), ConstraintViolation> {
        self.constraints.check(config, &self.hardware)
    }

    fn cache_key(&self) -> Option<String> {
        let (_, signature) = self.cache.as_ref()?;
        Some(cache_key(*signature, &self.hardware.arch, &self.constraints, &self.space))
    }

    pub fn tune(&mut self, objective: &dyn Objective) -> TuningResult {
        self.state = TunerState::Init;
        let key = self.cache_key();

        if let (Some((cache, _)), Some(key)) = (&self.cache, &key) {
            if let Some(mut hit) = cache.get::<TuningResult>(key).filter(TuningResult::is_measured) {
                info!("[Tuner] {}: cache hit {}", self.kernel_name, key);
                hit.from_cache = true;
                hit.evaluations = 0;
                hit.optimization_log.push(format!("loaded from result cache ({})", key));
                self.state = TunerState::Done;
                return hit;
            }
        }

        let mut log = vec![format!(
            "{} search over {} configurations on {}",
            self.strategy.name(), self.space.size(), self.hardware.arch
        )];

        if self.space.is_empty() {
            warn!("[Tuner] {}: parameter space has an empty domain", self.kernel_name);
            log.push("parameter space has an empty domain".to_string());
            self.state = TunerState::Done;
            return self.finish(KernelConfig::default(), f64::NEG_INFINITY, log, TunerState::Converged, 0);
        }

        self.state = TunerState::Searching;
        info!("[Tuner] {}: {}", self.kernel_name, log[0]);
        let evaluator = Evaluator::new(&self.space, &self.constraints, &self.hardware, objective)
            .with_concurrency(self.concurrency_limit)
            .with_cancel(self.cancel.clone())
            .with_arbiter(self.arbiter.clone());
        let mut rng = StdRng::seed_from_u64(self.seed);

        let outcome: SearchOutcome = match &self.strategy {
            SearchStrategy::Genetic(params) => search::genetic::run(&evaluator, params, &mut rng),
            SearchStrategy::Random { samples } => search::random::run(&evaluator, *samples, &mut rng),
            SearchStrategy::ModelGuided { initial_samples, iterations, exploration_beta } => {
                search::model::run(&evaluator, *initial_samples, *iterations, *exploration_beta, &mut rng)
            }
        };
        let evaluations = evaluator.calls();
        drop(evaluator);

        let termination = TunerState::from(outcome.termination);
        self.state = termination;
        log.extend(outcome.log);
        log.push(format!("{:?} after {} rounds, {} evaluations", termination, outcome.rounds, evaluations));

        let (config, metric) = match outcome.best {
            Some(best) => (best.config, best.evaluation.fitness()),
            None => {
                warn!("[Tuner] {}: no configuration could be measured", self.kernel_name);
                log.push("no valid configuration measured".to_string());
                (self.space.materialize(&vec![0; self.space.dimensions()]), f64::NEG_INFINITY)
            }
        };

        let result = self.finish(config, metric, log, termination, evaluations);
        if termination != TunerState::Cancelled && result.is_measured() {
            if let (Some((cache, _)), Some(key)) = (self.cache.as_mut(), key) {
                if let Err(e) = cache.put(&key, &result) {
                    warn!("[Tuner] failed to persist result: {}", e);
                }
            }
        }
        self.state = TunerState::Done;
        result
    }

    fn finish(
        &self,
        best_config: KernelConfig,
        performance_metric: f64,
        optimization_log: Vec<String>,
        termination: TunerState,
        evaluations: usize,
    ) -> TuningResult {
        info!(
            "[Tuner] {}: {:?}, best {:.4} at {}",
            self.kernel_name, termination, performance_metric, best_config.describe()
        );
        TuningResult {
            kernel_name: self.kernel_name.clone(),
            best_config,
            performance_metric,
            optimization_log,
            termination,
            evaluations,
            from_cache: false,
            optimized_source: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
