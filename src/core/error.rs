use thiserror::Error;

/// Failures that can surface while parsing, scheduling or measuring a kernel.
///
/// Per-candidate variants (`CompileFailure`, `MeasurementFailure`) never abort a
/// tuning session; they are folded into the population as failed evaluations.
#[derive(Debug, Error)]
pub enum TuneError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Structural defect in a dependency graph. Aborts scheduling of that kernel only.
    #[error("cyclic dependency through instruction {node}")]
    CyclicDependency { node: usize },

    #[error("compile failure: {0}")]
    CompileFailure(String),

    #[error("measurement failure: {0}")]
    MeasurementFailure(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TuneError>;
