use serde::{Serialize, Deserialize};
use crate::core::config::KernelConfig;

pub mod benchmark;
pub mod blocks;
pub mod combiner;
pub mod memory;
pub mod pipeline;
pub mod policy;
pub mod scheduler;
pub mod search;
pub mod trials;
pub mod tuner;

pub use benchmark::{Metrics, Profiler, Compiler, Executable, Objective, TrialRunner};
pub use policy::{TuningConstraints, ConstraintViolation, ParameterSpace, LaunchTemplate};
pub use search::{SearchStrategy, GeneticParams, CancelToken, DeviceArbiter};
pub use tuner::{AutoTuner, TuningResult, TunerState};

/// Static description of the target device. Limits feed the constraint filter and the
/// occupancy estimate; the throughput figures feed the simulated oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub name: String,
    pub arch: String,
    pub warp_size: u32,
    pub max_threads_per_block: u32,
    pub max_warps_per_sm: u32, // CUDA: Warps, ROCm: Waves
    pub max_blocks_per_sm: u32,
    pub shared_memory_per_block: usize,
    pub shared_memory_per_sm: usize,
    pub registers_per_sm: u32,
    pub max_registers_per_thread: u32,
    pub shared_memory_banks: u32,
    pub bank_width: u32,
    pub cache_line_size: u32,
    pub memory_latency_cycles: u32,
    pub l1_cache_size: usize,
    pub l2_cache_size: usize,
    pub peak_gflops: f64,
    pub memory_bandwidth_gbps: f64,
}

impl HardwareProfile {
    pub fn rtx3070() -> Self {
        Self {
            name: "NVIDIA GeForce RTX 3070".to_string(),
            arch: "sm_86".to_string(),
            warp_size: 32,
            max_threads_per_block: 1024,
            max_warps_per_sm: 48,
            max_blocks_per_sm: 16,
            shared_memory_per_block: 99 * 1024, // Real limit with dynamic SMEM config
            shared_memory_per_sm: 100 * 1024,
            registers_per_sm: 65536,
            max_registers_per_thread: 255,
            shared_memory_banks: 32,
            bank_width: 4,
            cache_line_size: 128,
            memory_latency_cycles: 400,
            l1_cache_size: 128 * 1024,
            l2_cache_size: 4 * 1024 * 1024,
            peak_gflops: 20_300.0,
            memory_bandwidth_gbps: 448.0,
        }
    }

    pub fn a100() -> Self {
        Self {
            name: "NVIDIA A100-SXM4-40GB".to_string(),
            arch: "sm_80".to_string(),
            warp_size: 32,
            max_threads_per_block: 1024,
            max_warps_per_sm: 64,
            max_blocks_per_sm: 32,
            shared_memory_per_block: 163 * 1024,
            shared_memory_per_sm: 164 * 1024,
            registers_per_sm: 65536,
            max_registers_per_thread: 255,
            shared_memory_banks: 32,
            bank_width: 4,
            cache_line_size: 128,
            memory_latency_cycles: 450,
            l1_cache_size: 192 * 1024,
            l2_cache_size: 40 * 1024 * 1024,
            peak_gflops: 19_500.0,
            memory_bandwidth_gbps: 1555.0,
        }
    }

    pub fn mi250() -> Self {
        Self {
            name: "AMD Instinct MI250X".to_string(),
            arch: "gfx90a".to_string(),
            warp_size: 64,
            max_threads_per_block: 1024,
            max_warps_per_sm: 32,
            max_blocks_per_sm: 16,
            shared_memory_per_block: 64 * 1024,
            shared_memory_per_sm: 64 * 1024,
            registers_per_sm: 131072,
            max_registers_per_thread: 256,
            shared_memory_banks: 32,
            bank_width: 4,
            cache_line_size: 128,
            memory_latency_cycles: 500,
            l1_cache_size: 16 * 1024,
            l2_cache_size: 8 * 1024 * 1024,
            peak_gflops: 47_900.0,
            memory_bandwidth_gbps: 3277.0,
        }
    }

    pub fn by_arch(arch: &str) -> Option<Self> {
        match arch {
            "sm_86" => Some(Self::rtx3070()),
            "sm_80" => Some(Self::a100()),
            "gfx90a" => Some(Self::mi250()),
            _ => None,
        }
    }

    /// Fraction of warp slots kept busy by resident blocks of this shape.
    pub fn occupancy(&self, config: &KernelConfig) -> f64 {
        let threads = config.threads_per_block();
        if threads == 0 || self.max_warps_per_sm == 0 {
            return 0.0;
        }
        let warps_per_block = threads.div_ceil(self.warp_size as u64);
        let by_warps = self.max_warps_per_sm as u64 / warps_per_block;
        let by_smem = match config.shared_memory_size {
            0 => u64::MAX,
            smem => self.shared_memory_per_sm as u64 / smem as u64,
        };
        let regs_per_block = config.registers_per_thread.max(1) as u64 * warps_per_block * self.warp_size as u64;
        let by_regs = self.registers_per_sm as u64 / regs_per_block;
        let blocks = by_warps.min(by_smem).min(by_regs).min(self.max_blocks_per_sm as u64);
        ((blocks * warps_per_block) as f64 / self.max_warps_per_sm as f64).min(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OptimizationGoal {
    MaximizeFlops,
    MinimizeLatency,
    Balanced { flops_weight: f64 },
}

impl OptimizationGoal {
    /// Scalar fitness, higher is better.
    pub fn score(&self, metrics: &Metrics) -> f64 {
        let gflops = metrics.flops / 1e9;
        let latency_score = 1000.0 / metrics.execution_time_ms.max(1e-6);
        match *self {
            OptimizationGoal::MaximizeFlops => gflops,
            OptimizationGoal::MinimizeLatency => latency_score,
            OptimizationGoal::Balanced { flops_weight } => {
                gflops * flops_weight + latency_score * (1.0 - flops_weight)
            }
        }
    }
}
