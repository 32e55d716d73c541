//! # ptxtune: scheduling, memory-access optimization and autotuning for PTX-like kernels
//!
//! Given a kernel's instruction stream, ptxtune reorders it along its dependency
//! graph, rewrites poorly coalesced global loads, and searches launch configurations
//! against a performance oracle.
//!
//! ## Modules
//!
//! - **[`core`]**: Instruction model, dependency graph, configuration data and result cache.
//! - **[`optimizer`]**: Scheduler, memory optimizer, search engine, combiner and pipeline.
//! - **[`semantic`]**: Shared-memory bank conflict simulation.
//! - **[`config`]**: Runtime settings for a tuning run.

pub mod config;
pub mod core;
pub mod optimizer;
pub mod semantic;

pub use crate::config::TunerConfig;
pub use crate::core::error::{Result, TuneError};
pub use crate::core::instruction::{Instruction, Kernel};
pub use crate::core::graph::DependencyGraph;
pub use crate::core::config::{Dim3, KernelConfig, TuningParameter};
pub use crate::optimizer::{AutoTuner, HardwareProfile, OptimizationGoal, TuningResult, TunerState};
pub use crate::optimizer::pipeline::KernelPipeline;
