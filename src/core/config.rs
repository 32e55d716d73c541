use serde::{Serialize, Deserialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Number of blocks of this shape needed to cover `problem`.
    pub fn blocks_to_cover(&self, problem: Dim3) -> Dim3 {
        let div = |p: u32, b: u32| if b == 0 { 0 } else { p.div_ceil(b) };
        Dim3::new(div(problem.x, self.x), div(problem.y, self.y), div(problem.z, self.z))
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Self::linear(1)
    }
}

/// One tunable knob and its finite domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningParameter {
    pub name: String,
    pub possible_values: Vec<i64>,
    pub current_value: i64,
    /// Diagnostic estimate of how much this knob moves the metric. Never used for ranking.
    pub impact_score: f64,
}

impl TuningParameter {
    pub fn new(name: &str, possible_values: &[i64]) -> Self {
        Self {
            name: name.to_string(),
            possible_values: possible_values.to_vec(),
            current_value: possible_values.first().copied().unwrap_or(0),
            impact_score: 0.0,
        }
    }

    pub fn with_value(&self, value: i64) -> Self {
        let mut p = self.clone();
        p.current_value = value;
        p
    }
}

/// A point in the search space: launch shape, resource usage and parameter values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    pub shared_memory_size: usize,
    pub registers_per_thread: u32,
    pub parameters: Vec<TuningParameter>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            grid_dim: Dim3::linear(1),
            block_dim: Dim3::linear(128),
            shared_memory_size: 0,
            registers_per_thread: 32,
            parameters: Vec::new(),
        }
    }
}

impl KernelConfig {
    pub fn threads_per_block(&self) -> u64 {
        self.block_dim.volume()
    }

    pub fn parameter(&self, name: &str) -> Option<i64> {
        self.parameters.iter().find(|p| p.name == name).map(|p| p.current_value)
    }

    pub fn values(&self) -> Vec<i64> {
        self.parameters.iter().map(|p| p.current_value).collect()
    }

    /// Memo key: two configs with equal launch shape, resources and parameter values
    /// hash identically regardless of domain metadata or impact scores.
    pub fn structural_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.grid_dim.hash(&mut hasher);
        self.block_dim.hash(&mut hasher);
        self.shared_memory_size.hash(&mut hasher);
        self.registers_per_thread.hash(&mut hasher);
        for p in &self.parameters {
            p.name.hash(&mut hasher);
            p.current_value.hash(&mut hasher);
        }
        hasher.finish()
    }

    pub fn describe(&self) -> String {
        let params: Vec<String> = self.parameters.iter()
            .map(|p| format!("{}={}", p.name, p.current_value))
            .collect();
        format!(
            "grid=({},{},{}) block=({},{},{}) smem={}B regs={} [{}]",
            self.grid_dim.x, self.grid_dim.y, self.grid_dim.z,
            self.block_dim.x, self.block_dim.y, self.block_dim.z,
            self.shared_memory_size, self.registers_per_thread,
            params.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_hash_ignores_metadata() {
        let mut a = KernelConfig::default();
        a.parameters.push(TuningParameter::new("unroll", &[1, 2, 4]).with_value(2));
        let mut b = a.clone();
        b.parameters[0].impact_score = 3.5;
        b.parameters[0].possible_values.push(8);
        assert_eq!(a.structural_hash(), b.structural_hash());
        b.parameters[0].current_value = 4;
        assert_ne!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn test_blocks_to_cover() {
        let grid = Dim3::new(128, 2, 1).blocks_to_cover(Dim3::new(1000, 3, 1));
        assert_eq!(grid, Dim3::new(8, 2, 1));
    }
}
