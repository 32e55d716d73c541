//! Configuration search. Every strategy goes through the same [`Evaluator`], which
//! rejects constraint violations before the objective sees them, memoizes results by
//! structural hash, and serializes evaluations per device.

use serde::{Serialize, Deserialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use rayon::prelude::*;
use tracing::{debug, warn};
use crate::core::config::KernelConfig;
use crate::core::error::{Result, TuneError};
use crate::optimizer::benchmark::Objective;
use crate::optimizer::policy::{ConstraintViolation, ParameterSpace, TuningConstraints};
use crate::optimizer::HardwareProfile;

pub mod genetic;
pub mod model;
pub mod random;

pub use genetic::next_generation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneticParams {
    pub population_size: usize,
    pub num_generations: usize,
    pub mutation_rate: f64,
    pub crossover_rate: f64,
    pub tournament_size: usize,
    /// Best individuals copied unchanged into the next generation.
    pub elitism: usize,
    /// Generations without improvement before the search is declared converged.
    pub stagnation_limit: Option<usize>,
    /// Re-mutation attempts for a child that duplicates one already seen.
    pub max_remutations: usize,
}

impl Default for GeneticParams {
    fn default() -> Self {
        Self {
            population_size: 20,
            num_generations: 50,
            mutation_rate: 0.1,
            crossover_rate: 0.8,
            tournament_size: 3,
            elitism: 1,
            stagnation_limit: Some(10),
            max_remutations: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchStrategy {
    Genetic(GeneticParams),
    Random { samples: usize },
    /// Kernel-regression surrogate with an upper-confidence-bound acquisition.
    ModelGuided { initial_samples: usize, iterations: usize, exploration_beta: f64 },
}

impl Default for SearchStrategy {
    fn default() -> Self {
        SearchStrategy::Genetic(GeneticParams::default())
    }
}

impl GeneticParams {
    pub fn validate(&self) -> Result<()> {
        if self.population_size == 0 {
            return Err(TuneError::Config("genetic.population_size must be at least 1".into()));
        }
        if self.elitism == 0 {
            return Err(TuneError::Config("genetic.elitism must keep at least the best individual".into()));
        }
        if self.tournament_size == 0 {
            return Err(TuneError::Config("genetic.tournament_size must be at least 1".into()));
        }
        for (name, rate) in [("mutation_rate", self.mutation_rate), ("crossover_rate", self.crossover_rate)] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(TuneError::Config(format!("genetic.{} must lie in [0, 1], got {}", name, rate)));
            }
        }
        Ok(())
    }
}

impl SearchStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SearchStrategy::Genetic(_) => "genetic",
            SearchStrategy::Random { .. } => "random",
            SearchStrategy::ModelGuided { .. } => "model",
        }
    }
}

/// Outcome of scoring one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Measured(f64),
    Rejected(ConstraintViolation),
    Failed(String),
}

impl Evaluation {
    /// Higher is better; anything but a finite measurement scores −∞.
    pub fn fitness(&self) -> f64 {
        match self {
            Evaluation::Measured(v) if v.is_finite() => *v,
            _ => f64::NEG_INFINITY,
        }
    }

    pub fn is_measured(&self) -> bool {
        matches!(self, Evaluation::Measured(_))
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a search stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Converged,
    BudgetExhausted,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub indices: Vec<usize>,
    pub config: KernelConfig,
    pub evaluation: Evaluation,
}

impl Candidate {
    pub fn fitness(&self) -> f64 {
        self.evaluation.fitness()
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best: Option<Candidate>,
    pub termination: Termination,
    /// Generations for the genetic search, rounds otherwise.
    pub rounds: usize,
    pub log: Vec<String>,
}

/// Keeps the highest-fitness measured candidate; the first one wins ties.
pub(crate) fn keep_best(best: &mut Option<Candidate>, candidate: &Candidate) -> bool {
    if !candidate.evaluation.is_measured() || !candidate.fitness().is_finite() {
        return false;
    }
    let better = best.as_ref().map_or(true, |b| candidate.fitness() > b.fitness());
    if better {
        *best = Some(candidate.clone());
    }
    better
}

type DeviceLock = Arc<Mutex<()>>;

/// Per-device measurement locks. Work run through the same arbiter on the same device
/// id never overlaps; different devices proceed concurrently. Clones share the locks.
#[derive(Debug, Clone, Default)]
pub struct DeviceArbiter {
    locks: Arc<Mutex<HashMap<usize, DeviceLock>>>,
}

impl DeviceArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, device: usize) -> DeviceLock {
        let mut map = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(device).or_default().clone()
    }

    /// Runs `work` while holding the lock of `device`.
    pub fn run<T>(&self, device: usize, work: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(device);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
        work()
    }

    pub fn devices(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Constraint filter and memo layer in front of an objective.
pub struct Evaluator<'a> {
    pub space: &'a ParameterSpace,
    constraints: &'a TuningConstraints,
    hardware: &'a HardwareProfile,
    objective: &'a dyn Objective,
    memo: Mutex<HashMap<u64, Evaluation>>,
    calls: AtomicUsize,
    pool: Option<rayon::ThreadPool>,
    cancel: CancelToken,
    arbiter: DeviceArbiter,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        space: &'a ParameterSpace,
        constraints: &'a TuningConstraints,
        hardware: &'a HardwareProfile,
        objective: &'a dyn Objective,
    ) -> Self {
        Self {
            space,
            constraints,
            hardware,
            objective,
            memo: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            pool: None,
            cancel: CancelToken::new(),
            arbiter: DeviceArbiter::new(),
        }
    }

    /// Runs batches on a dedicated pool of at most `limit` threads.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.pool = match rayon::ThreadPoolBuilder::new().num_threads(limit.max(1)).build() {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!("[Search] thread pool unavailable ({}), evaluating sequentially", e);
                None
            }
        };
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Serializes measurements with every other evaluator sharing `arbiter`.
    pub fn with_arbiter(mut self, arbiter: DeviceArbiter) -> Self {
        self.arbiter = arbiter;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of times the objective was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Distinct configurations with a recorded outcome.
    pub fn evaluated(&self) -> usize {
        self.memo().len()
    }

    pub fn check(&self, indices: &[usize]) -> std::result::Result<KernelConfig, ConstraintViolation> {
        let config = self.space.materialize(indices);
        self.constraints.check(&config, self.hardware).map(|_| config)
    }

    pub fn is_valid(&self, indices: &[usize]) -> bool {
        self.check(indices).is_ok()
    }

    pub fn is_evaluated(&self, indices: &[usize]) -> bool {
        let hash = self.space.materialize(indices).structural_hash();
        self.memo().contains_key(&hash)
    }

    pub fn evaluate(&self, indices: &[usize]) -> Candidate {
        self.evaluate_batch(&[indices.to_vec()]).remove(0)
    }

    /// Scores a batch. Distinct unseen configurations are measured once each, in
    /// parallel; repeats and memo hits reuse the recorded outcome.
    pub fn evaluate_batch(&self, batch: &[Vec<usize>]) -> Vec<Candidate> {
        let checked: Vec<(KernelConfig, Option<ConstraintViolation>)> = batch.iter()
            .map(|indices| match self.check(indices) {
                Ok(config) => (config, None),
                Err(violation) => (self.space.materialize(indices), Some(violation)),
            })
            .collect();

        let mut pending: Vec<(u64, &KernelConfig)> = Vec::new();
        {
            let memo = self.memo();
            let mut queued = HashSet::new();
            for (config, violation) in &checked {
                let hash = config.structural_hash();
                if violation.is_none() && !memo.contains_key(&hash) && queued.insert(hash) {
                    pending.push((hash, config));
                }
            }
        }

        if !pending.is_empty() && !self.is_cancelled() {
            let run = || {
                pending.par_iter()
                    .for_each(|&(hash, config)| self.measure(hash, config));
            };
            match &self.pool {
                Some(pool) => pool.install(run),
                None => pending.iter().for_each(|&(hash, config)| self.measure(hash, config)),
            }
        }

        let memo = self.memo();
        batch.iter().zip(checked).map(|(indices, (config, violation))| {
            let evaluation = match violation {
                Some(v) => Evaluation::Rejected(v),
                None => memo.get(&config.structural_hash()).cloned()
                    .unwrap_or_else(|| Evaluation::Failed("cancelled".to_string())),
            };
            Candidate { indices: indices.clone(), config, evaluation }
        }).collect()
    }

    fn measure(&self, hash: u64, config: &KernelConfig) {
        if self.is_cancelled() {
            return;
        }
        let evaluation = self.arbiter.run(self.objective.device_id(), || {
            // Cancellation may land while this measurement waited for the device.
            if self.is_cancelled() {
                return None;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(match self.objective.evaluate(config) {
                Ok(score) => Evaluation::Measured(score),
                Err(e) => {
                    debug!("[Search] {} failed: {}", config.describe(), e);
                    Evaluation::Failed(e.to_string())
                }
            })
        });
        if let Some(evaluation) = evaluation {
            self.memo().insert(hash, evaluation);
        }
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Evaluation>> {
        self.memo.lock().unwrap_or_else(|p| p.into_inner())
    }
}
