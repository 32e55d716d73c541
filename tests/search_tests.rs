use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use ptxtune::core::config::{KernelConfig, TuningParameter};
use ptxtune::core::cache::ResultCache;
use ptxtune::optimizer::policy::{ParameterSpace, TuningConstraints, PARAM_BLOCK_X, PARAM_REGISTERS};
use ptxtune::optimizer::benchmark::{Executable, Metrics, Profiler, SimulatedCompiler, TrialRunner};
use ptxtune::optimizer::search::{CancelToken, GeneticParams, SearchStrategy};
use ptxtune::{AutoTuner, HardwareProfile, OptimizationGoal, Result, TunerState};

fn grid_space() -> ParameterSpace {
    ParameterSpace::new(vec![
        TuningParameter::new("a", &[0, 1, 2, 3]),
        TuningParameter::new("b", &[0, 1, 2, 3]),
        TuningParameter::new("c", &[0, 1, 2, 3]),
    ])
}

fn peaked(cfg: &KernelConfig) -> Result<f64> {
    let v = cfg.values();
    Ok(-((v[0] - 2).pow(2) + (v[1] - 1).pow(2) + (v[2] - 3).pow(2)) as f64)
}

#[test]
fn test_genetic_finds_exact_optimum_of_64_points() {
    let mut tuner = AutoTuner::new("grid", grid_space(), HardwareProfile::rtx3070())
        .with_seed(1234)
        .with_strategy(SearchStrategy::Genetic(GeneticParams {
            population_size: 8,
            num_generations: 20,
            stagnation_limit: None,
            ..Default::default()
        }));
    let result = tuner.tune(&peaked);
    assert_eq!(result.best_config.values(), vec![2, 1, 3]);
    assert_eq!(result.performance_metric, 0.0);
    assert!(result.evaluations <= 64);
}

#[test]
fn test_single_individual_with_zero_rates_is_evaluated_once() {
    let calls = AtomicUsize::new(0);
    let objective = |cfg: &KernelConfig| -> Result<f64> {
        calls.fetch_add(1, Ordering::SeqCst);
        peaked(cfg)
    };
    let mut tuner = AutoTuner::new("grid", grid_space(), HardwareProfile::rtx3070())
        .with_strategy(SearchStrategy::Genetic(GeneticParams {
            population_size: 1,
            num_generations: 10,
            mutation_rate: 0.0,
            crossover_rate: 0.0,
            stagnation_limit: None,
            ..Default::default()
        }));
    let result = tuner.tune(&objective);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.evaluations, 1);
    assert_eq!(result.termination, TunerState::Converged);
}

#[test]
fn test_zero_rates_never_explore_beyond_the_initial_population() {
    for (population_size, elitism) in [(1, 0), (4, 1), (4, 0)] {
        let calls = AtomicUsize::new(0);
        let objective = |cfg: &KernelConfig| -> Result<f64> {
            calls.fetch_add(1, Ordering::SeqCst);
            peaked(cfg)
        };
        let mut tuner = AutoTuner::new("grid", grid_space(), HardwareProfile::rtx3070())
            .with_seed(77)
            .with_strategy(SearchStrategy::Genetic(GeneticParams {
                population_size,
                num_generations: 25,
                mutation_rate: 0.0,
                crossover_rate: 0.0,
                elitism,
                stagnation_limit: None,
                ..Default::default()
            }));
        let result = tuner.tune(&objective);
        assert_eq!(calls.load(Ordering::SeqCst), population_size, "population {}", population_size);
        assert_eq!(result.evaluations, population_size);
        assert_eq!(result.termination, TunerState::Converged);
    }
}

#[test]
fn test_constraint_violations_never_reach_the_objective() {
    let hw = HardwareProfile::rtx3070();
    let constraints = TuningConstraints::from_hardware(&hw).with_min_occupancy(0.5);
    let space = ParameterSpace::new(vec![
        TuningParameter::new(PARAM_BLOCK_X, &[32, 64, 128, 256, 512, 1024, 2048]),
        TuningParameter::new(PARAM_REGISTERS, &[32, 64, 128, 255, 300]),
    ]);
    let seen = Mutex::new(Vec::new());
    let objective = |cfg: &KernelConfig| -> Result<f64> {
        seen.lock().unwrap().push(cfg.clone());
        Ok(cfg.threads_per_block() as f64 / cfg.registers_per_thread as f64)
    };

    for strategy in [
        SearchStrategy::Genetic(GeneticParams { population_size: 10, num_generations: 10, ..Default::default() }),
        SearchStrategy::Random { samples: 100 },
        SearchStrategy::ModelGuided { initial_samples: 5, iterations: 10, exploration_beta: 2.0 },
    ] {
        let mut tuner = AutoTuner::new("k", space.clone(), hw.clone())
            .with_constraints(constraints.clone())
            .with_strategy(strategy);
        let result = tuner.tune(&objective);
        assert!(tuner.validate_config(&result.best_config).is_ok());
    }

    let seen = seen.into_inner().unwrap();
    assert!(!seen.is_empty());
    for cfg in &seen {
        assert!(constraints.check(cfg, &hw).is_ok(), "objective saw {}", cfg.describe());
    }
}

#[test]
fn test_memo_prevents_repeat_evaluations_within_a_session() {
    let seen = Mutex::new(Vec::new());
    let objective = |cfg: &KernelConfig| -> Result<f64> {
        seen.lock().unwrap().push(cfg.structural_hash());
        peaked(cfg)
    };
    let mut tuner = AutoTuner::new("grid", grid_space(), HardwareProfile::rtx3070())
        .with_concurrency(8)
        .with_strategy(SearchStrategy::Genetic(GeneticParams {
            population_size: 16,
            num_generations: 30,
            stagnation_limit: None,
            ..Default::default()
        }));
    tuner.tune(&objective);
    let seen = seen.into_inner().unwrap();
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), seen.len());
}

#[test]
fn test_result_cache_round_trip_skips_objective() {
    let dir = tempfile::tempdir().unwrap();
    let calls = AtomicUsize::new(0);
    let objective = |cfg: &KernelConfig| -> Result<f64> {
        calls.fetch_add(1, Ordering::SeqCst);
        peaked(cfg)
    };

    let session = |signature: u64| {
        AutoTuner::new("grid", grid_space(), HardwareProfile::rtx3070())
            .with_cache(ResultCache::in_dir(dir.path()), signature)
    };

    let first = session(42).tune(&objective);
    let spent = calls.load(Ordering::SeqCst);

    let second = session(42).tune(&objective);
    assert_eq!(calls.load(Ordering::SeqCst), spent);
    assert!(second.from_cache);
    assert_eq!(second.best_config, first.best_config);

    // a different kernel signature is a different entry
    let third = session(43).tune(&objective);
    assert!(!third.from_cache);
    assert!(calls.load(Ordering::SeqCst) > spent);
}

#[test]
fn test_corrupt_cache_falls_back_to_search() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(ptxtune::core::cache::CACHE_FILE), "[1, 2").unwrap();
    let mut tuner = AutoTuner::new("grid", grid_space(), HardwareProfile::rtx3070())
        .with_cache(ResultCache::in_dir(dir.path()), 7);
    let result = tuner.tune(&peaked);
    assert!(!result.from_cache);
    assert!(result.is_measured());
}

struct CancelAfter {
    limit: usize,
    calls: AtomicUsize,
    cancel: CancelToken,
}

impl Profiler for CancelAfter {
    fn measure(&self, config: &KernelConfig, _: &Executable) -> Result<Metrics> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.limit {
            self.cancel.cancel();
        }
        let v = config.values();
        Ok(Metrics {
            execution_time_ms: 1.0 + (v[0] + v[1] + v[2]) as f64,
            flops: 1e9,
            bandwidth: 0.0,
            occupancy: 1.0,
        })
    }
}

#[test]
fn test_cancel_stops_every_session_sharing_a_runner() {
    let cancel = CancelToken::new();
    let profiler = Arc::new(CancelAfter { limit: 5, calls: AtomicUsize::new(0), cancel: cancel.clone() });
    let runner = TrialRunner::new(
        Arc::new(SimulatedCompiler::new()),
        profiler.clone(),
        "sm_86",
        OptimizationGoal::MinimizeLatency,
    ).with_samples(1);
    let source = "ld.global.f32 %f1, [%rd1];\nst.global.f32 [%rd2], %f1;";

    let terminations: Vec<TunerState> = std::thread::scope(|s| {
        let sessions: Vec<_> = (0..2u64).map(|seed| {
            let (runner, cancel) = (&runner, cancel.clone());
            s.spawn(move || {
                let mut tuner = AutoTuner::new("shared", grid_space(), HardwareProfile::rtx3070())
                    .with_seed(seed)
                    .with_cancel(cancel)
                    .with_arbiter(runner.arbiter().clone())
                    .with_strategy(SearchStrategy::Genetic(GeneticParams {
                        population_size: 8,
                        num_generations: 20,
                        stagnation_limit: None,
                        ..Default::default()
                    }));
                tuner.tune(&runner.objective(source)).termination
            })
        }).collect();
        sessions.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(profiler.calls.load(Ordering::SeqCst), 5);
    assert_eq!(terminations, vec![TunerState::Cancelled, TunerState::Cancelled]);
}
