use serde::{Serialize, Deserialize};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use crate::core::config::KernelConfig;
use crate::core::error::{Result, TuneError};
use crate::core::hash::StableHasher;
use crate::core::instruction::Kernel;
use crate::optimizer::search::DeviceArbiter;
use crate::optimizer::trials::TrialCache;
use crate::optimizer::{HardwareProfile, OptimizationGoal};

/// One measurement of a compiled kernel under a launch configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub execution_time_ms: f64,
    /// Floating point operations per second.
    pub flops: f64,
    /// GB/s.
    pub bandwidth: f64,
    pub occupancy: f64,
}

/// Opaque handle to a compiled kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Executable {
    pub handle: u64,
    pub arch: String,
    pub kernel_name: String,
    pub instruction_count: usize,
}

/// Performance oracle. Measurements are noisy; callers aggregate repeated samples.
pub trait Profiler: Send + Sync {
    fn measure(&self, config: &KernelConfig, executable: &Executable) -> Result<Metrics>;

    /// Measurements sharing a device id are never run concurrently.
    fn device_id(&self) -> usize {
        0
    }
}

pub trait Compiler: Send + Sync {
    fn compile(&self, source: &str, target_arch: &str) -> Result<Executable>;
}

/// Scalar fitness of a configuration, higher is better.
pub trait Objective: Send + Sync {
    fn evaluate(&self, config: &KernelConfig) -> Result<f64>;

    fn device_id(&self) -> usize {
        0
    }
}

impl<F> Objective for F
where
    F: Fn(&KernelConfig) -> Result<f64> + Send + Sync,
{
    fn evaluate(&self, config: &KernelConfig) -> Result<f64> {
        self(config)
    }
}

/// Work performed by one launch, used by the simulated oracle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub flops: f64,
    pub bytes: f64,
}

impl Default for Workload {
    fn default() -> Self {
        // SAXPY over 2^24 elements
        let n = (1u64 << 24) as f64;
        Self { flops: 2.0 * n, bytes: 12.0 * n }
    }
}

/// Simulated profiler for tuning without a physical GPU: a roofline model shaped by
/// occupancy and warp utilisation, with multiplicative Gaussian noise.
pub struct SimulatedProfiler {
    pub hardware: HardwareProfile,
    pub workload: Workload,
    /// Relative standard deviation of the noise, 0 for a deterministic oracle.
    pub noise: f64,
    device: usize,
    rng: Mutex<StdRng>,
    calls: AtomicUsize,
}

impl SimulatedProfiler {
    pub fn new(hardware: HardwareProfile, workload: Workload) -> Self {
        Self {
            hardware,
            workload,
            noise: 0.0,
            device: 0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_noise(mut self, noise: f64, seed: u64) -> Self {
        self.noise = noise.max(0.0);
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_device(mut self, device: usize) -> Self {
        self.device = device;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn jitter(&self) -> f64 {
        if self.noise == 0.0 {
            return 1.0;
        }
        let Ok(normal) = Normal::new(1.0, self.noise) else { return 1.0 };
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        normal.sample(&mut *rng).max(0.5)
    }
}

impl Profiler for SimulatedProfiler {
    fn measure(&self, config: &KernelConfig, executable: &Executable) -> Result<Metrics> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let hw = &self.hardware;
        let occupancy = hw.occupancy(config);
        if occupancy <= 0.0 {
            return Err(TuneError::MeasurementFailure(format!(
                "{} cannot be resident with {}", executable.kernel_name, config.describe()
            )));
        }

        let threads = config.threads_per_block() as f64;
        let warp = hw.warp_size as f64;
        let warp_utilisation = threads / ((threads / warp).ceil() * warp);
        // Latency hiding saturates well before full occupancy.
        let hiding = (occupancy / 0.5).min(1.0);

        let compute_s = self.workload.flops / (hw.peak_gflops * 1e9 * warp_utilisation * hiding.max(0.1));
        // Partial warps still pay for whole transactions.
        let memory_s = self.workload.bytes
            / (hw.memory_bandwidth_gbps * 1e9 * (0.25 + 0.75 * hiding) * warp_utilisation);
        let launch_s = 5e-6 + config.grid_dim.volume() as f64 * 1e-10;
        let seconds = (compute_s.max(memory_s) + launch_s) * self.jitter();

        debug!("[Profiler] {} -> {:.4} ms", config.describe(), seconds * 1e3);
        Ok(Metrics {
            execution_time_ms: seconds * 1e3,
            flops: self.workload.flops / seconds,
            bandwidth: self.workload.bytes / seconds / 1e9,
            occupancy,
        })
    }

    fn device_id(&self) -> usize {
        self.device
    }
}

/// Parses the kernel text and hands out a handle derived from its signature.
#[derive(Default)]
pub struct SimulatedCompiler {
    compiles: AtomicUsize,
}

impl SimulatedCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }
}

impl Compiler for SimulatedCompiler {
    fn compile(&self, source: &str, target_arch: &str) -> Result<Executable> {
        self.compiles.fetch_add(1, Ordering::Relaxed);
        let kernel = Kernel::parse(source).map_err(|e| TuneError::CompileFailure(e.to_string()))?;
        if kernel.body.is_empty() {
            return Err(TuneError::CompileFailure(format!("{} has no instructions", kernel.name)));
        }
        Ok(Executable {
            handle: StableHasher::new().write_u64(kernel.signature()).write_str(target_arch).finish(),
            arch: target_arch.to_string(),
            kernel_name: kernel.name.clone(),
            instruction_count: kernel.body.len(),
        })
    }
}

/// Compiles and measures candidate configurations, reducing repeated samples to their
/// median and scoring them against an optimization goal. Every search or combination
/// step measuring through one runner shares its device arbiter.
pub struct TrialRunner {
    compiler: Arc<dyn Compiler>,
    profiler: Arc<dyn Profiler>,
    pub arch: String,
    pub goal: OptimizationGoal,
    pub samples_per_trial: usize,
    cache: TrialCache,
    arbiter: DeviceArbiter,
}

impl TrialRunner {
    pub fn new(compiler: Arc<dyn Compiler>, profiler: Arc<dyn Profiler>, arch: &str, goal: OptimizationGoal) -> Self {
        Self {
            compiler,
            profiler,
            arch: arch.to_string(),
            goal,
            samples_per_trial: 3,
            cache: TrialCache::new(64),
            arbiter: DeviceArbiter::new(),
        }
    }

    /// Shares device locks with other runners driving the same hardware.
    pub fn with_arbiter(mut self, arbiter: DeviceArbiter) -> Self {
        self.arbiter = arbiter;
        self
    }

    pub fn arbiter(&self) -> &DeviceArbiter {
        &self.arbiter
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples_per_trial = samples.max(1);
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = TrialCache::new(capacity);
        self
    }

    pub fn trial_cache(&self) -> &TrialCache {
        &self.cache
    }

    pub fn device_id(&self) -> usize {
        self.profiler.device_id()
    }

    pub fn compile(&self, source: &str) -> Result<Executable> {
        let key = StableHasher::new().write_str(source).write_str(&self.arch).finish();
        self.cache.get_or_compile(key, || self.compiler.compile(source, &self.arch))
    }

    /// Median of `samples_per_trial` measurements by execution time.
    pub fn measure(&self, source: &str, config: &KernelConfig) -> Result<Metrics> {
        let exe = self.compile(source)?;
        let mut samples = (0..self.samples_per_trial)
            .map(|_| self.profiler.measure(config, &exe))
            .collect::<Result<Vec<Metrics>>>()?;
        samples.sort_by(|a, b| a.execution_time_ms.total_cmp(&b.execution_time_ms));
        samples.get(samples.len() / 2).copied()
            .ok_or_else(|| TuneError::MeasurementFailure("no samples taken".to_string()))
    }

    pub fn run(&self, source: &str, config: &KernelConfig) -> Result<f64> {
        let metrics = self.measure(source, config)?;
        Ok(self.goal.score(&metrics))
    }

    /// [`run`](Self::run) while holding this runner's lock on its device.
    pub fn run_exclusive(&self, source: &str, config: &KernelConfig) -> Result<f64> {
        self.arbiter.run(self.device_id(), || self.run(source, config))
    }

    pub fn objective<'a>(&'a self, source: &'a str) -> TrialObjective<'a> {
        TrialObjective { runner: self, source }
    }
}

/// A fixed kernel source bound to a trial runner.
pub struct TrialObjective<'a> {
    runner: &'a TrialRunner,
    source: &'a str,
}

impl Objective for TrialObjective<'_> {
    fn evaluate(&self, config: &KernelConfig) -> Result<f64> {
        self.runner.run(self.source, config)
    }

    fn device_id(&self) -> usize {
        self.runner.device_id()
    }
}
