//! # Core Abstractions
//!
//! - **[`instruction`]:** PTX-like instruction and kernel model.
//! - **[`graph`]:** Dependency DAG with earliest/latest start times and critical path.
//! - **[`config`]:** Launch configuration and tunable parameters.
//! - **[`cache`]:** Persisted tuning results.
//! - **[`hash`]:** Toolchain-independent hashing for persisted keys.

pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod hash;
pub mod instruction;
