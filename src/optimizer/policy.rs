use serde::{Serialize, Deserialize};
use rand::Rng;
use thiserror::Error;
use crate::core::config::{Dim3, KernelConfig, TuningParameter};
use crate::optimizer::HardwareProfile;

/// Hard limits a candidate must satisfy before it may be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningConstraints {
    pub max_shared_memory: usize,
    pub max_registers_per_thread: u32,
    /// Fraction of the SM's warp slots, 0.0 ..= 1.0.
    pub min_occupancy: f64,
}

impl TuningConstraints {
    pub fn from_hardware(hw: &HardwareProfile) -> Self {
        Self {
            max_shared_memory: hw.shared_memory_per_block,
            max_registers_per_thread: hw.max_registers_per_thread,
            min_occupancy: 0.0,
        }
    }

    pub fn with_min_occupancy(mut self, occupancy: f64) -> Self {
        self.min_occupancy = occupancy;
        self
    }

    pub fn check(&self, config: &KernelConfig, hw: &HardwareProfile) -> Result<(), ConstraintViolation> {
        let threads = config.threads_per_block();
        if threads == 0 {
            return Err(ConstraintViolation::EmptyBlock);
        }
        if threads > hw.max_threads_per_block as u64 {
            return Err(ConstraintViolation::ThreadsPerBlock { threads, limit: hw.max_threads_per_block });
        }
        let smem_limit = self.max_shared_memory.min(hw.shared_memory_per_block);
        if config.shared_memory_size > smem_limit {
            return Err(ConstraintViolation::SharedMemory { required: config.shared_memory_size, limit: smem_limit });
        }
        let reg_limit = self.max_registers_per_thread.min(hw.max_registers_per_thread);
        if config.registers_per_thread > reg_limit {
            return Err(ConstraintViolation::Registers { required: config.registers_per_thread, limit: reg_limit });
        }
        let occupancy = hw.occupancy(config);
        // Zero means not even one block can be resident.
        if occupancy <= 0.0 || occupancy < self.min_occupancy {
            return Err(ConstraintViolation::Occupancy { achieved: occupancy, required: self.min_occupancy });
        }
        Ok(())
    }
}

/// Pre-evaluation rejection. Not an error: the candidate simply scores −∞.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConstraintViolation {
    #[error("block has no threads")]
    EmptyBlock,
    #[error("{threads} threads per block exceeds {limit}")]
    ThreadsPerBlock { threads: u64, limit: u32 },
    #[error("shared memory {required}B exceeds {limit}B")]
    SharedMemory { required: usize, limit: usize },
    #[error("{required} registers per thread exceeds {limit}")]
    Registers { required: u32, limit: u32 },
    #[error("occupancy {achieved:.2} below {required:.2}")]
    Occupancy { achieved: f64, required: f64 },
}

/// How parameter values turn into a launch configuration when the parameter set does
/// not name the quantity directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchTemplate {
    pub problem_size: Dim3,
    pub base_registers: u32,
    pub base_shared_memory: usize,
    pub shared_bytes_per_thread: usize,
}

impl Default for LaunchTemplate {
    fn default() -> Self {
        Self {
            problem_size: Dim3::linear(1 << 20),
            base_registers: 32,
            base_shared_memory: 0,
            shared_bytes_per_thread: 0,
        }
    }
}

pub const PARAM_BLOCK_X: &str = "block_x";
pub const PARAM_BLOCK_Y: &str = "block_y";
pub const PARAM_BLOCK_Z: &str = "block_z";
pub const PARAM_SHARED_MEMORY: &str = "shared_memory";
pub const PARAM_REGISTERS: &str = "registers_per_thread";

/// Cartesian product of parameter domains, materialized through a launch template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    pub parameters: Vec<TuningParameter>,
    pub template: LaunchTemplate,
}

impl ParameterSpace {
    pub fn new(parameters: Vec<TuningParameter>) -> Self {
        Self { parameters, template: LaunchTemplate::default() }
    }

    pub fn with_template(mut self, template: LaunchTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn dimensions(&self) -> usize {
        self.parameters.len()
    }

    /// Number of points; saturates for absurdly large spaces.
    pub fn size(&self) -> u128 {
        self.parameters.iter()
            .map(|p| p.possible_values.len() as u128)
            .fold(1u128, |acc, n| acc.saturating_mul(n))
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.iter().any(|p| p.possible_values.is_empty())
    }

    pub fn domain_len(&self, dim: usize) -> usize {
        self.parameters[dim].possible_values.len()
    }

    /// Out-of-range indices clamp to the last value; a dimension with an empty domain
    /// contributes no parameter and the template default applies.
    pub fn materialize(&self, indices: &[usize]) -> KernelConfig {
        let parameters: Vec<TuningParameter> = self.parameters.iter().zip(indices)
            .filter_map(|(p, &i)| {
                let last = p.possible_values.len().checked_sub(1)?;
                Some(p.with_value(p.possible_values[i.min(last)]))
            })
            .collect();
        let lookup = |name: &str| parameters.iter().find(|p| p.name == name).map(|p| p.current_value);
        let dim = |name: &str, default: u32| lookup(name).map(|v| v.max(0) as u32).unwrap_or(default);

        let block_dim = Dim3::new(dim(PARAM_BLOCK_X, 128), dim(PARAM_BLOCK_Y, 1), dim(PARAM_BLOCK_Z, 1));
        let grid_dim = block_dim.blocks_to_cover(self.template.problem_size);
        let shared_memory_size = match lookup(PARAM_SHARED_MEMORY) {
            Some(bytes) => bytes.max(0) as usize,
            None => self.template.base_shared_memory
                + self.template.shared_bytes_per_thread * block_dim.volume() as usize,
        };
        let registers_per_thread = dim(PARAM_REGISTERS, self.template.base_registers);

        KernelConfig { grid_dim, block_dim, shared_memory_size, registers_per_thread, parameters }
    }

    pub fn sample_indices<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        self.parameters.iter()
            .map(|p| match p.possible_values.len() {
                0 => 0,
                len => rng.gen_range(0..len),
            })
            .collect()
    }

    /// Mixed-radix decoding of a flat point index, first parameter fastest.
    pub fn indices_at(&self, mut flat: u128) -> Vec<usize> {
        self.parameters.iter().map(|p| {
            let radix = (p.possible_values.len() as u128).max(1);
            let digit = (flat % radix) as usize;
            flat /= radix;
            digit
        }).collect()
    }

    /// Normalized coordinates in [0, 1] per dimension, used by the surrogate model.
    pub fn features(&self, indices: &[usize]) -> Vec<f32> {
        indices.iter().zip(&self.parameters).map(|(&i, p)| {
            let len = p.possible_values.len();
            if len <= 1 { 0.0 } else { i as f32 / (len - 1) as f32 }
        }).collect()
    }
}
