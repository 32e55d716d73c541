use rand::rngs::StdRng;
use std::collections::HashSet;
use tracing::{debug, info};
use super::{keep_best, Candidate, Evaluator, SearchOutcome, Termination};

/// Spaces up to this size are scored exhaustively by the acquisition function.
const ENUMERATION_LIMIT: u128 = 4096;
const CANDIDATE_POOL: usize = 256;

/// Kernel-regression surrogate over normalized parameter coordinates. The prediction
/// is the observed mean corrected by a distance-weighted residual; uncertainty shrinks
/// with the total kernel weight of nearby observations.
#[derive(Debug, Clone)]
pub struct Surrogate {
    pub observations: Vec<(Vec<f32>, f64)>,
    pub length_scales: Vec<f32>,
    pub noise_sigma: f64,
    pub exploration_beta: f64,
}

impl Surrogate {
    pub fn new(dimensions: usize, exploration_beta: f64) -> Self {
        Self {
            observations: Vec::new(),
            length_scales: vec![0.25; dimensions],
            noise_sigma: 0.1,
            exploration_beta,
        }
    }

    pub fn observe(&mut self, features: Vec<f32>, score: f64) {
        self.observations.push((features, score));
        if self.observations.len() % 5 == 0 && self.observations.len() > 5 {
            self.optimize_hyperparams();
        }
    }

    /// Coordinate-wise hill climb of the length scales on leave-one-out error.
    pub fn optimize_hyperparams(&mut self) {
        if self.observations.len() < 3 {
            return;
        }
        let lr = 0.1;
        for _ in 0..10 {
            let current = self.loo_likelihood();
            for dim in 0..self.length_scales.len() {
                let orig = self.length_scales[dim];
                self.length_scales[dim] = orig * (1.0 + lr);
                let up = self.loo_likelihood();
                self.length_scales[dim] = orig * (1.0 - lr);
                let down = self.loo_likelihood();
                self.length_scales[dim] = if up > current && up > down {
                    orig * (1.0 + lr)
                } else if down > current {
                    orig * (1.0 - lr)
                } else {
                    orig
                };
                self.length_scales[dim] = self.length_scales[dim].clamp(0.05, 4.0);
            }
        }
    }

    fn loo_likelihood(&self) -> f64 {
        let mut sq_error = 0.0;
        let mut variance = 0.0;
        for (i, (x, y)) in self.observations.iter().enumerate() {
            let (mu, sigma) = self.predict_excluding(x, Some(i));
            sq_error += (y - mu).powi(2);
            variance += sigma.powi(2) + self.noise_sigma.powi(2);
        }
        -sq_error / variance.max(1e-9)
    }

    fn ard_distance_sq(&self, a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).enumerate().map(|(i, (ai, bi))| {
            let ls = self.length_scales.get(i).copied().unwrap_or(1.0);
            (ai - bi).powi(2) / ls.powi(2)
        }).sum()
    }

    fn prior(&self) -> (f64, f64) {
        let n = self.observations.len() as f64;
        if n == 0.0 {
            return (0.0, 1.0);
        }
        let mean = self.observations.iter().map(|(_, y)| y).sum::<f64>() / n;
        let var = self.observations.iter().map(|(_, y)| (y - mean).powi(2)).sum::<f64>() / n;
        (mean, var.sqrt().max(1e-6))
    }

    fn predict_excluding(&self, x: &[f32], exclude: Option<usize>) -> (f64, f64) {
        let (prior_mean, spread) = self.prior();
        let mut residual = 0.0;
        let mut total_weight = 0.0;
        for (i, (obs_x, obs_y)) in self.observations.iter().enumerate() {
            if Some(i) == exclude || obs_x.len() != x.len() {
                continue;
            }
            let weight = (-self.ard_distance_sq(x, obs_x) as f64 / 2.0).exp();
            residual += weight * (obs_y - prior_mean);
            total_weight += weight;
        }
        let mu = prior_mean + residual / (total_weight + self.noise_sigma);
        let sigma = spread / (total_weight + 1.0).sqrt();
        (mu, sigma)
    }

    pub fn predict(&self, x: &[f32]) -> (f64, f64) {
        self.predict_excluding(x, None)
    }

    pub fn ucb(&self, x: &[f32]) -> f64 {
        let (mu, sigma) = self.predict(x);
        mu + self.exploration_beta * sigma
    }
}

fn candidate_pool(evaluator: &Evaluator, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let space = evaluator.space;
    let fresh = |indices: &Vec<usize>| evaluator.is_valid(indices) && !evaluator.is_evaluated(indices);
    if space.size() <= ENUMERATION_LIMIT {
        return (0..space.size()).map(|flat| space.indices_at(flat)).filter(fresh).collect();
    }
    let mut seen = HashSet::new();
    (0..CANDIDATE_POOL * 4)
        .map(|_| space.sample_indices(rng))
        .filter(|indices| seen.insert(indices.clone()) && fresh(indices))
        .take(CANDIDATE_POOL)
        .collect()
}

/// Sequential model-guided search: a random batch seeds the surrogate, then each
/// iteration measures the candidate with the highest upper confidence bound.
pub fn run(
    evaluator: &Evaluator,
    initial_samples: usize,
    iterations: usize,
    exploration_beta: f64,
    rng: &mut StdRng,
) -> SearchOutcome {
    let space = evaluator.space;
    let mut surrogate = Surrogate::new(space.dimensions(), exploration_beta);
    let mut best: Option<Candidate> = None;
    let mut log = Vec::new();

    let mut seeds: Vec<Vec<usize>> = Vec::new();
    let mut seen = HashSet::new();
    for _ in 0..initial_samples.max(1) * 16 {
        if seeds.len() >= initial_samples.max(1) {
            break;
        }
        let indices = space.sample_indices(rng);
        if evaluator.is_valid(&indices) && seen.insert(indices.clone()) {
            seeds.push(indices);
        }
    }
    for c in evaluator.evaluate_batch(&seeds) {
        if c.evaluation.is_measured() && c.fitness().is_finite() {
            surrogate.observe(space.features(&c.indices), c.fitness());
        }
        keep_best(&mut best, &c);
    }
    log.push(format!("surrogate seeded with {} samples", seeds.len()));

    let mut round = 0;
    let termination = loop {
        if evaluator.is_cancelled() {
            break Termination::Cancelled;
        }
        if round >= iterations {
            break Termination::BudgetExhausted;
        }
        let pool = candidate_pool(evaluator, rng);
        let Some(next) = pool.into_iter()
            .map(|indices| (surrogate.ucb(&space.features(&indices)), indices))
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, indices)| indices)
        else {
            log.push("no unevaluated valid configuration left".to_string());
            break Termination::Converged;
        };

        let c = evaluator.evaluate(&next);
        round += 1;
        if c.evaluation.is_measured() && c.fitness().is_finite() {
            surrogate.observe(space.features(&c.indices), c.fitness());
        }
        if keep_best(&mut best, &c) {
            let line = format!("iteration {}: best {:.4} at {}", round, c.fitness(), c.config.describe());
            info!("[Tuner] {}", line);
            log.push(line);
        } else {
            debug!("[Tuner] iteration {}: {:?}", round, c.evaluation);
        }
    };

    SearchOutcome { best, termination, rounds: round, log }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use crate::core::config::{KernelConfig, TuningParameter};
    use crate::core::error::Result;
    use crate::optimizer::policy::{ParameterSpace, TuningConstraints};
    use crate::optimizer::HardwareProfile;

    #[test]
    fn test_prediction_tracks_nearby_observations() {
        let mut s = Surrogate::new(1, 2.0);
        s.observe(vec![0.0], 1.0);
        s.observe(vec![1.0], 9.0);
        let (near_low, _) = s.predict(&[0.05]);
        let (near_high, _) = s.predict(&[0.95]);
        assert!(near_low < near_high);
        let (_, sigma_seen) = s.predict(&[0.0]);
        let (_, sigma_far) = s.predict(&[0.5]);
        assert!(sigma_seen < sigma_far);
    }

    #[test]
    fn test_finds_peak_of_unimodal_objective() {
        let hw = HardwareProfile::rtx3070();
        let constraints = TuningConstraints::from_hardware(&hw);
        let space = ParameterSpace::new(vec![
            TuningParameter::new("x", &(0..16).collect::<Vec<i64>>()),
            TuningParameter::new("y", &(0..16).collect::<Vec<i64>>()),
        ]);
        let objective = |cfg: &KernelConfig| -> Result<f64> {
            let x = cfg.parameter("x").unwrap_or(0) as f64;
            let y = cfg.parameter("y").unwrap_or(0) as f64;
            Ok(-((x - 11.0).powi(2) + (y - 4.0).powi(2)))
        };
        let eval = Evaluator::new(&space, &constraints, &hw, &objective);
        let out = run(&eval, 8, 60, 1.0, &mut StdRng::seed_from_u64(5));
        assert_eq!(out.termination, Termination::BudgetExhausted);
        assert_eq!(eval.calls(), 68);
        let best = out.best.map(|b| b.fitness()).unwrap_or(f64::NEG_INFINITY);
        assert!(best >= -5.0, "best {}", best);
    }
}
