use rand::rngs::StdRng;
use std::collections::HashSet;
use tracing::info;
use super::{keep_best, Candidate, Evaluator, SearchOutcome, Termination};

const BATCH: usize = 16;

/// Uniform sampling without replacement. When the budget covers the whole space the
/// space is enumerated instead.
pub fn run(evaluator: &Evaluator, samples: usize, rng: &mut StdRng) -> SearchOutcome {
    let space_size = evaluator.space.size();
    let mut points: Vec<Vec<usize>> = Vec::new();
    if samples as u128 >= space_size {
        points.extend((0..space_size).map(|flat| evaluator.space.indices_at(flat)));
    } else {
        let mut seen = HashSet::new();
        let mut attempts = 0;
        while points.len() < samples && attempts < samples * 16 {
            let indices = evaluator.space.sample_indices(rng);
            if seen.insert(indices.clone()) {
                points.push(indices);
            }
            attempts += 1;
        }
    }
    let exhaustive = points.len() as u128 >= space_size;

    let mut best: Option<Candidate> = None;
    let mut rounds = 0;
    for chunk in points.chunks(BATCH) {
        if evaluator.is_cancelled() {
            return SearchOutcome { best, termination: Termination::Cancelled, rounds, log: vec!["cancelled".to_string()] };
        }
        for c in evaluator.evaluate_batch(chunk) {
            keep_best(&mut best, &c);
        }
        rounds += 1;
    }

    let mut log = vec![format!("{} random samples evaluated", points.len())];
    if let Some(b) = &best {
        info!("[Tuner] random search best {:.4} at {}", b.fitness(), b.config.describe());
        log.push(format!("best {:.4} at {}", b.fitness(), b.config.describe()));
    }
    let termination = if exhaustive { Termination::Converged } else { Termination::BudgetExhausted };
    SearchOutcome { best, termination, rounds, log }
}
