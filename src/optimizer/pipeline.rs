use std::sync::Arc;
use tracing::{info, warn};
use crate::config::TunerConfig;
use crate::core::cache::ResultCache;
use crate::core::config::KernelConfig;
use crate::core::error::Result;
use crate::core::instruction::{InstructionKind, Kernel, StateSpace};
use crate::optimizer::benchmark::{Compiler, Profiler, SimulatedCompiler, SimulatedProfiler, TrialRunner, Workload};
use crate::optimizer::blocks::{analyze_kernel_features, thread_block_space};
use crate::optimizer::combiner::{ConfigCombiner, MemoryVariant};
use crate::optimizer::memory::MemoryOptimizer;
use crate::optimizer::policy::{ParameterSpace, TuningConstraints};
use crate::optimizer::scheduler::{ArchitectureConstraints, InstructionScheduler};
use crate::optimizer::search::{CancelToken, DeviceArbiter};
use crate::optimizer::tuner::{cache_key, AutoTuner, TunerState, TuningResult};
use crate::optimizer::{HardwareProfile, OptimizationGoal};

/// Cycles charged per arithmetic instruction when sizing the prefetch distance.
const CYCLES_PER_ARITHMETIC: f64 = 4.0;

fn compute_cycles_per_element(kernel: &Kernel) -> f64 {
    let loads = kernel.body.iter()
        .filter(|i| i.is_load() && i.state_space() == Some(StateSpace::Global))
        .count()
        .max(1);
    let arithmetic = kernel.body.iter()
        .filter(|i| matches!(i.kind, InstructionKind::Arithmetic | InstructionKind::Special))
        .count();
    arithmetic as f64 * CYCLES_PER_ARITHMETIC / loads as f64
}

/// Memory analysis, scheduling, launch-shape search and combination for one kernel.
/// Without an explicit space the launch shapes come from the kernel's own features.
pub struct KernelPipeline {
    pub hardware: HardwareProfile,
    pub config: TunerConfig,
    pub space: Option<ParameterSpace>,
    pub constraints: TuningConstraints,
    runner: TrialRunner,
    cancel: CancelToken,
}

impl KernelPipeline {
    pub fn new(hardware: HardwareProfile, config: TunerConfig, compiler: Arc<dyn Compiler>, profiler: Arc<dyn Profiler>) -> Self {
        let runner = TrialRunner::new(compiler, profiler, &hardware.arch, OptimizationGoal::MinimizeLatency)
            .with_samples(config.samples_per_trial)
            .with_cache_capacity(config.trial_cache_capacity);
        Self {
            space: None,
            constraints: TuningConstraints::from_hardware(&hardware),
            hardware,
            config,
            runner,
            cancel: CancelToken::new(),
        }
    }

    /// Pipeline backed by the roofline oracle, for running without a device.
    pub fn simulated(hardware: HardwareProfile, config: TunerConfig, workload: Workload) -> Self {
        let profiler = SimulatedProfiler::new(hardware.clone(), workload);
        Self::new(hardware, config, Arc::new(SimulatedCompiler::new()), Arc::new(profiler))
    }

    pub fn with_space(mut self, space: ParameterSpace) -> Self {
        self.space = Some(space);
        self
    }

    /// Measurements of every session this pipeline runs go through the runner's arbiter,
    /// so sharing one arbiter across pipelines serializes a shared device.
    pub fn with_arbiter(mut self, arbiter: DeviceArbiter) -> Self {
        self.runner = self.runner.with_arbiter(arbiter);
        self
    }

    pub fn with_goal(mut self, goal: OptimizationGoal) -> Self {
        self.runner.goal = goal;
        self
    }

    pub fn runner(&self) -> &TrialRunner {
        &self.runner
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn result_cache(&self) -> Option<ResultCache> {
        self.config.use_result_cache.then(|| ResultCache::in_dir(&self.config.resolved_cache_dir()))
    }

    /// Only a kernel that fails to parse is an error; everything downstream degrades to
    /// less optimized output.
    pub fn optimize_kernel(&self, source: &str) -> Result<TuningResult> {
        let kernel = Kernel::parse(source)?;
        let memory = MemoryOptimizer::new(self.config.memory_config(&self.hardware));
        let scheduler = InstructionScheduler::new(self.config.ilp.clone(), self.hardware.max_registers_per_thread as usize)
            .with_architecture(ArchitectureConstraints::for_hardware(&self.hardware));
        let space = match &self.space {
            Some(space) => space.clone(),
            None => thread_block_space(&self.hardware, &analyze_kernel_features(&kernel, &memory, &scheduler)),
        };

        if space.is_empty() {
            warn!("[Tuner] {}: parameter space has an empty domain, nothing to measure", kernel.name);
            return Ok(TuningResult {
                kernel_name: kernel.name.clone(),
                best_config: KernelConfig::default(),
                performance_metric: f64::NEG_INFINITY,
                optimization_log: vec!["parameter space has an empty domain".to_string()],
                termination: TunerState::Converged,
                evaluations: 0,
                from_cache: false,
                optimized_source: Some(kernel.to_source()),
                created_at: chrono::Utc::now().to_rfc3339(),
            });
        }

        let key = format!(
            "pipeline-{}",
            cache_key(kernel.signature(), &self.hardware.arch, &self.constraints, &space)
        );
        let mut cache = self.result_cache();
        if let Some(hit) = cache.as_ref()
            .and_then(|c| c.get::<TuningResult>(&key))
            .filter(TuningResult::is_measured)
        {
            info!("[Tuner] {}: pipeline cache hit", kernel.name);
            let mut hit = hit;
            hit.from_cache = true;
            hit.evaluations = 0;
            return Ok(hit);
        }

        let mut log = Vec::new();

        // Memory access
        let pattern = memory.dominant_pattern(&kernel);
        log.push(format!(
            "dominant access {:?}, coalescence {:.2}", pattern.pattern_type, pattern.coalescence_rate
        ));
        let access = memory.optimize_access_pattern(&kernel, &pattern);
        log.extend(access.optimization_steps.iter().cloned());
        let strategy = memory.optimize_cache_usage(&pattern, compute_cycles_per_element(&kernel));
        log.push(format!("cache strategy: {}", strategy.cache_hints.join(", ")));
        let iterations = if kernel.find_loop().is_some() { 2 } else { 1 };
        let shared = memory.optimize_shared_memory(space.template.problem_size.volume() as usize, &pattern, iterations);

        let mut variants = vec![MemoryVariant {
            label: "original".to_string(),
            kernel: kernel.clone(),
            estimated_improvement: 0.0,
        }];
        let tuned = memory.apply_cache_strategy(&access.kernel, &strategy);
        if tuned != kernel {
            variants.push(MemoryVariant {
                label: if access.estimated_improvement > 0.0 { "staged".into() } else { "cache-hinted".into() },
                kernel: tuned,
                estimated_improvement: access.estimated_improvement,
            });
        }

        // Scheduling happens per variant inside the combiner; the lead combination
        // by estimate is what the launch-shape search measures.
        let combiner = ConfigCombiner::new(self.constraints.clone(), self.hardware.clone(), self.config.measure_budget);
        let provisional = space.materialize(&vec![0; space.dimensions()]);
        let preview = combiner.select(combiner.enumerate(&variants, &scheduler, &shared, &provisional), None);
        let lead_source = preview.best.as_ref().map(|c| c.source.clone()).unwrap_or_else(|| kernel.to_source());

        // Launch shape
        let mut tuner = AutoTuner::new(&kernel.name, space, self.hardware.clone())
            .with_constraints(self.constraints.clone())
            .with_strategy(self.config.search_strategy())
            .with_seed(self.config.seed)
            .with_concurrency(self.config.concurrency_limit)
            .with_cancel(self.cancel.clone())
            .with_arbiter(self.runner.arbiter().clone());
        let objective = self.runner.objective(&lead_source);
        let search = tuner.tune(&objective);
        log.extend(search.optimization_log.iter().cloned());

        let mut evaluations = search.evaluations;
        let (best_config, metric, optimized_source, termination) = if search.termination == TunerState::Cancelled
            || !search.is_measured()
        {
            warn!("[Tuner] {}: launch search produced no measurement, keeping the lead variant", kernel.name);
            (search.best_config.clone(), search.performance_metric, lead_source, search.termination)
        } else {
            // Combination under the tuned launch shape
            let combos = combiner.enumerate(&variants, &scheduler, &shared, &search.best_config);
            let outcome = combiner.select(combos, Some(&self.runner));
            evaluations += outcome.measurements;
            log.extend(outcome.log);
            match outcome.best {
                Some(best) if best.measured.is_some() => {
                    let metric = best.measured.unwrap_or(search.performance_metric);
                    if metric >= search.performance_metric {
                        (best.config, metric, best.source, search.termination)
                    } else {
                        log.push("combinations measured below the searched launch shape".to_string());
                        (search.best_config.clone(), search.performance_metric, lead_source, search.termination)
                    }
                }
                _ => (search.best_config.clone(), search.performance_metric, lead_source, search.termination),
            }
        };

        let result = TuningResult {
            kernel_name: kernel.name.clone(),
            best_config,
            performance_metric: metric,
            optimization_log: log,
            termination,
            evaluations,
            from_cache: false,
            optimized_source: Some(optimized_source),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        info!(
            "[Tuner] {}: {:.4} at {} after {} evaluations",
            result.kernel_name, result.performance_metric, result.best_config.describe(), result.evaluations
        );

        if termination != TunerState::Cancelled && result.is_measured() {
            if let Some(cache) = cache.as_mut() {
                if let Err(e) = cache.put(&key, &result) {
                    warn!("[Tuner] failed to persist result: {}", e);
                }
            }
        }
        Ok(result)
    }
}
