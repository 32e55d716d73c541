use rand::Rng;
use rand::rngs::StdRng;
use std::collections::HashSet;
use tracing::{debug, info};
use super::{keep_best, Candidate, Evaluator, GeneticParams, SearchOutcome, Termination};

/// Tournament pick: best fitness among `size` random draws, lowest index on ties.
fn tournament<R: Rng>(fitness: &[f64], size: usize, rng: &mut R) -> usize {
    let mut winner = rng.gen_range(0..fitness.len());
    for _ in 1..size.max(1) {
        let challenger = rng.gen_range(0..fitness.len());
        if fitness[challenger] > fitness[winner]
            || (fitness[challenger] == fitness[winner] && challenger < winner)
        {
            winner = challenger;
        }
    }
    winner
}

fn mutate<R: Rng>(genome: &mut [usize], domains: &[usize], rate: f64, rng: &mut R) {
    for (gene, &len) in genome.iter_mut().zip(domains) {
        if len > 1 && rng.gen_bool(rate.clamp(0.0, 1.0)) {
            *gene = different_value(*gene, len, rng);
        }
    }
}

fn different_value<R: Rng>(current: usize, len: usize, rng: &mut R) -> usize {
    let v = rng.gen_range(0..len - 1);
    if v >= current { v + 1 } else { v }
}

/// Changes exactly one gene. Returns false when no dimension has a second value.
pub(crate) fn force_mutation<R: Rng>(genome: &mut [usize], domains: &[usize], rng: &mut R) -> bool {
    let movable: Vec<usize> = (0..genome.len()).filter(|&d| domains[d] > 1).collect();
    if movable.is_empty() {
        return false;
    }
    let d = movable[rng.gen_range(0..movable.len())];
    genome[d] = different_value(genome[d], domains[d], rng);
    true
}

/// Breeds the next population from the current one. At least the best individual is
/// carried over unchanged; the remaining slots are filled by tournament selection,
/// uniform crossover and per-gene mutation. When mutation is enabled, a child equal to
/// an individual already placed in the new generation is re-mutated up to
/// `max_remutations` times.
pub fn next_generation<R: Rng>(
    population: &[Vec<usize>],
    fitness: &[f64],
    domains: &[usize],
    params: &GeneticParams,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    let n = population.len();
    if n == 0 || fitness.len() != n {
        return population.to_vec();
    }

    let mut ranked: Vec<usize> = (0..n).collect();
    ranked.sort_by(|&a, &b| fitness[b].total_cmp(&fitness[a]).then(a.cmp(&b)));

    let mut next: Vec<Vec<usize>> = Vec::with_capacity(n);
    let mut seen: HashSet<Vec<usize>> = HashSet::new();
    for &i in ranked.iter().take(params.elitism.clamp(1, n)) {
        seen.insert(population[i].clone());
        next.push(population[i].clone());
    }

    while next.len() < n {
        let a = tournament(fitness, params.tournament_size, rng);
        let b = tournament(fitness, params.tournament_size, rng);
        let mut child = if rng.gen_bool(params.crossover_rate.clamp(0.0, 1.0)) {
            population[a].iter().zip(&population[b])
                .map(|(&x, &y)| if rng.gen_bool(0.5) { x } else { y })
                .collect()
        } else {
            population[a].clone()
        };
        mutate(&mut child, domains, params.mutation_rate, rng);

        let mut attempts = 0;
        while params.mutation_rate > 0.0 && seen.contains(&child) && attempts < params.max_remutations {
            if !force_mutation(&mut child, domains, rng) {
                break;
            }
            attempts += 1;
        }
        seen.insert(child.clone());
        next.push(child);
    }
    next
}

/// Repairs a child the evaluator would reject or has already scored. Without mutation
/// an invalid child is replaced by `fallback` and a repeat is left for the memo.
fn repair(child: &mut Vec<usize>, fallback: &[usize], evaluator: &Evaluator, params: &GeneticParams, rng: &mut StdRng) {
    let domains: Vec<usize> = (0..evaluator.space.dimensions()).map(|d| evaluator.space.domain_len(d)).collect();
    let mut attempts = 0;
    while params.mutation_rate > 0.0
        && (!evaluator.is_valid(child) || evaluator.is_evaluated(child))
        && attempts < params.max_remutations
    {
        if !force_mutation(child, &domains, rng) {
            break;
        }
        attempts += 1;
    }
    if !evaluator.is_valid(child) {
        child.clear();
        child.extend_from_slice(fallback);
    }
}

/// Seeds up to `population_size` distinct valid individuals.
fn initial_population(evaluator: &Evaluator, params: &GeneticParams, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let target = params.population_size.max(1);
    let space_size = evaluator.space.size();
    let mut population: Vec<Vec<usize>> = Vec::with_capacity(target);
    let mut seen = HashSet::new();

    if space_size <= (target as u128) * 4 {
        // Small spaces are scanned in order so every valid point can be found.
        for flat in 0..space_size {
            let indices = evaluator.space.indices_at(flat);
            if evaluator.is_valid(&indices) && seen.insert(indices.clone()) {
                population.push(indices);
            }
        }
        if population.len() > target {
            // Keep an even spread rather than the first points in order.
            let step = population.len() as f64 / target as f64;
            population = (0..target).map(|i| population[(i as f64 * step) as usize].clone()).collect();
        }
        return population;
    }

    let max_attempts = target * 32;
    for _ in 0..max_attempts {
        if population.len() >= target {
            break;
        }
        let indices = evaluator.space.sample_indices(rng);
        if evaluator.is_valid(&indices) && seen.insert(indices.clone()) {
            population.push(indices);
        }
    }
    population
}

pub fn run(evaluator: &Evaluator, params: &GeneticParams, rng: &mut StdRng) -> SearchOutcome {
    let mut log = Vec::new();
    let mut best: Option<Candidate> = None;

    let mut population = initial_population(evaluator, params, rng);
    if population.is_empty() {
        log.push("no configuration satisfies the constraints".to_string());
        return SearchOutcome { best, termination: Termination::Converged, rounds: 0, log };
    }

    let domains: Vec<usize> = (0..evaluator.space.dimensions()).map(|d| evaluator.space.domain_len(d)).collect();
    let mut scored = evaluator.evaluate_batch(&population);
    for c in &scored {
        keep_best(&mut best, c);
    }
    log.push(format!("initial population of {} evaluated", population.len()));

    let space_size = evaluator.space.size();
    let mut stale = 0usize;
    let mut generation = 0usize;
    let termination = loop {
        if evaluator.is_cancelled() {
            break Termination::Cancelled;
        }
        if generation >= params.num_generations {
            break Termination::BudgetExhausted;
        }
        if params.stagnation_limit.is_some_and(|limit| stale >= limit) {
            log.push(format!("no improvement for {} generations", stale));
            break Termination::Converged;
        }
        if evaluator.evaluated() as u128 >= space_size {
            log.push("every configuration has been evaluated".to_string());
            break Termination::Converged;
        }
        if params.mutation_rate <= 0.0 && params.crossover_rate <= 0.0 {
            log.push("mutation and crossover disabled: population cannot change".to_string());
            break Termination::Converged;
        }

        let fitness: Vec<f64> = scored.iter().map(Candidate::fitness).collect();
        let elites = params.elitism.clamp(1, population.len());
        let mut children = next_generation(&population, &fitness, &domains, params, rng);
        let fallback = best.as_ref().map(|b| b.indices.clone()).unwrap_or_else(|| population[0].clone());
        for child in children.iter_mut().skip(elites) {
            repair(child, &fallback, evaluator, params, rng);
        }

        scored = evaluator.evaluate_batch(&children);
        population = children;
        generation += 1;

        let mut improved = false;
        for c in &scored {
            improved |= keep_best(&mut best, c);
        }
        if improved {
            stale = 0;
            if let Some(b) = &best {
                let line = format!("generation {}: best {:.4} at {}", generation, b.fitness(), b.config.describe());
                info!("[Tuner] {}", line);
                log.push(line);
            }
        } else {
            stale += 1;
            debug!("[Tuner] generation {}: no improvement", generation);
        }
    };

    SearchOutcome { best, termination, rounds: generation, log }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_elites_survive_and_children_are_distinct() {
        let population = vec![vec![0, 0], vec![1, 1], vec![2, 2], vec![3, 3]];
        let fitness = vec![1.0, 4.0, 2.0, 3.0];
        let params = GeneticParams { population_size: 4, elitism: 2, ..Default::default() };
        let mut rng = StdRng::seed_from_u64(3);
        let next = next_generation(&population, &fitness, &[4, 4], &params, &mut rng);
        assert_eq!(next.len(), 4);
        assert_eq!(next[0], vec![1, 1]);
        assert_eq!(next[1], vec![3, 3]);
        let unique: HashSet<_> = next.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_next_generation_is_deterministic_for_a_seed() {
        let population = vec![vec![0, 1, 2], vec![3, 2, 1], vec![1, 1, 1]];
        let fitness = vec![0.5, 0.1, f64::NEG_INFINITY];
        let params = GeneticParams::default();
        let a = next_generation(&population, &fitness, &[4, 4, 4], &params, &mut StdRng::seed_from_u64(9));
        let b = next_generation(&population, &fitness, &[4, 4, 4], &params, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
        assert!(a.iter().flatten().all(|&g| g < 4));
    }

    #[test]
    fn test_zero_rates_copy_the_only_parent() {
        let params = GeneticParams {
            population_size: 1,
            mutation_rate: 0.0,
            crossover_rate: 0.0,
            ..Default::default()
        };
        let next = next_generation(&[vec![2, 1]], &[1.0], &[4, 4], &params, &mut StdRng::seed_from_u64(1));
        assert_eq!(next, vec![vec![2, 1]]);

        // without mutation, duplicate children stay duplicates
        let population = vec![vec![0, 0], vec![1, 1], vec![2, 2], vec![3, 3]];
        let fitness = [1.0, 4.0, 2.0, 3.0];
        let params = GeneticParams { population_size: 4, ..params };
        let next = next_generation(&population, &fitness, &[4, 4], &params, &mut StdRng::seed_from_u64(5));
        assert_eq!(next[0], vec![1, 1]);
        assert!(next.iter().all(|g| population.contains(g)));
    }

    #[test]
    fn test_zero_elitism_still_keeps_the_best() {
        let population = vec![vec![0, 0], vec![3, 3]];
        let params = GeneticParams { population_size: 2, elitism: 0, ..Default::default() };
        let next = next_generation(&population, &[1.0, 9.0], &[4, 4], &params, &mut StdRng::seed_from_u64(2));
        assert_eq!(next[0], vec![3, 3]);
    }

    #[test]
    fn test_tournament_prefers_fitter() {
        let fitness = [0.0, 10.0, 5.0];
        let mut rng = StdRng::seed_from_u64(11);
        let wins = (0..200).filter(|_| tournament(&fitness, 3, &mut rng) == 1).count();
        assert!(wins > 100, "fittest won {} of 200", wins);
    }
}
