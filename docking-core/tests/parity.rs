//! Batched evaluation must reproduce the reference evaluator exactly.

use docking_core::{
    Backend, BatchEvaluator, Controller, ControllerConfig, EvaluationRound, ExplicitEuler, FitnessVariant,
    HillEquations, Perceptron, ReferenceEvaluator, SimulationConfig,
};

fn population(p: &Perceptron, islands: usize, individuals: usize, salt: u64) -> Vec<Vec<Vec<f64>>> {
    (0..islands)
        .map(|i| {
            (0..individuals)
                .map(|j| p.random_init(salt + (i * individuals + j) as u64))
                .collect()
        })
        .collect()
}

fn check(config: SimulationConfig, backend: Backend, islands: usize, individuals: usize, seed: u64) {
    let p = Perceptron::docking(&ControllerConfig::default());
    let reference = ReferenceEvaluator::new(config.clone(), p.clone()).unwrap();
    let mut batch = BatchEvaluator::new(config.clone(), p.clone(), backend).unwrap();
    let round = EvaluationRound::seeded(config.starting_conditions, seed);
    let pop = population(&p, islands, individuals, seed * 1000);

    let batched = batch.evaluate(&pop, &round).unwrap();
    for (island, members) in pop.iter().enumerate() {
        for (individual, weights) in members.iter().enumerate() {
            let expected = reference.objfun(weights, &round).unwrap();
            assert_eq!(
                batched[island][individual], expected,
                "island {island} individual {individual} ({:?})",
                config.fitness
            );
        }
    }
}

#[test]
fn test_default_config_parity() {
    check(SimulationConfig::default(), Backend::Rayon, 2, 5, 1);
}

#[test]
fn test_parity_for_every_variant() {
    for fitness in FitnessVariant::ALL {
        let config = SimulationConfig { fitness, starting_conditions: 3, ..Default::default() };
        check(config, Backend::Serial, 1, 4, 2);
    }
}

#[test]
fn test_parity_with_scale_limits_and_short_window() {
    let config = SimulationConfig {
        max_thrust: 1.0,
        scale_limits: 0.05,
        max_docking_time: 5.0,
        starting_conditions: 4,
        ..Default::default()
    };
    check(config, Backend::Rayon, 3, 3, 3);
}

#[test]
fn test_parity_with_explicit_conditions() {
    let config = SimulationConfig::default();
    let p = Perceptron::docking(&ControllerConfig::default());
    let round = EvaluationRound::from_conditions(&[
        vec![1.5, 0.0, 0.0, 0.0, 0.0, 0.0],
        vec![0.0, 0.0, -1.8, 0.0, 3.0, 0.0],
    ])
    .unwrap();
    let reference = ReferenceEvaluator::new(config.clone(), p.clone()).unwrap();
    let mut batch = BatchEvaluator::new(config, p.clone(), Backend::Rayon).unwrap();

    let pop = population(&p, 1, 3, 77);
    let batched = batch.evaluate(&pop, &round).unwrap();
    for (weights, fit) in pop[0].iter().zip(&batched[0]) {
        assert_eq!(*fit, reference.objfun(weights, &round).unwrap());
    }
}

#[test]
fn test_parity_with_euler_stepper() {
    let config = SimulationConfig { starting_conditions: 2, ..Default::default() };
    let p = Perceptron::docking(&ControllerConfig { hidden: vec![6, 4] });
    let reference =
        ReferenceEvaluator::with_parts(config.clone(), p.clone(), ExplicitEuler, HillEquations::default()).unwrap();
    let mut batch =
        BatchEvaluator::with_parts(config, p.clone(), ExplicitEuler, HillEquations::default(), Backend::Serial)
            .unwrap();
    let round = EvaluationRound::seeded(2, 12);

    let pop = population(&p, 1, 3, 5);
    let batched = batch.evaluate(&pop, &round).unwrap();
    for (weights, fit) in pop[0].iter().zip(&batched[0]) {
        assert_eq!(p.weight_count(), weights.len());
        assert_eq!(*fit, reference.objfun(weights, &round).unwrap());
    }
}

#[test]
fn test_fitness_never_positive() {
    let config = SimulationConfig::default();
    let p = Perceptron::docking(&ControllerConfig::default());
    let mut batch = BatchEvaluator::new(config, p.clone(), Backend::Rayon).unwrap();
    let round = EvaluationRound::seeded(5, 9);
    for island in batch.evaluate(&population(&p, 2, 6, 40), &round).unwrap() {
        assert!(island.iter().all(|&f| f <= 0.0));
    }
}

/// Fixed thrust; the time neuron fires once `|vx| + |vy| + |omega|` exceeds `0.2 * w0`.
struct Trigger;

impl Controller for Trigger {
    fn input_count(&self) -> usize {
        6
    }

    fn output_count(&self) -> usize {
        3
    }

    fn weight_count(&self) -> usize {
        1
    }

    fn compute_outputs(&self, weights: &[f64], inputs: &[f64], outputs: &mut [f64]) {
        outputs[0] = 0.9;
        outputs[1] = 0.2;
        let rate = inputs[1].abs() + inputs[3].abs() + inputs[5].abs();
        outputs[2] = if rate > 0.2 * weights[0] { 1.0 } else { 0.0 };
    }
}

#[test]
fn test_parity_when_runs_end_at_different_steps() {
    let pop = vec![
        vec![vec![0.5], vec![1.0], vec![2.0]],
        vec![vec![0.25], vec![1.5], vec![3.0]],
    ];
    for fitness in FitnessVariant::ALL {
        let config = SimulationConfig { fitness, max_thrust: 1.0, starting_conditions: 4, ..Default::default() };
        let round = EvaluationRound::seeded(config.starting_conditions, 31);
        let reference = ReferenceEvaluator::new(config.clone(), Trigger).unwrap();
        let mut batch = BatchEvaluator::new(config.clone(), Trigger, Backend::Rayon).unwrap();

        let batched = batch.evaluate(&pop, &round).unwrap();
        let mut steps = Vec::new();
        for (island, members) in pop.iter().enumerate() {
            for (individual, weights) in members.iter().enumerate() {
                assert_eq!(
                    batched[island][individual],
                    reference.objfun(weights, &round).unwrap(),
                    "island {island} individual {individual} ({fitness:?})"
                );
                for (outcome, _) in reference.trace(weights, &round).unwrap() {
                    steps.push((outcome.steps, outcome.time_neuron_fired));
                }
            }
        }
        let max_steps = config.max_steps();
        assert!(steps.iter().any(|&(n, fired)| fired && n < max_steps), "{fitness:?}: {steps:?}");
        assert!(steps.iter().any(|&(n, _)| n != steps[0].0), "{fitness:?}: {steps:?}");
    }
}
