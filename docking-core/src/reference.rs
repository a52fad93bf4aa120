//! Single-candidate evaluation, stepped explicitly on the calling thread.
//!
//! This is the ground truth the batched path is checked against. A round
//! ([`EvaluationRound`]) fixes the starting conditions; a candidate's fitness
//! is the mean of its per-condition run fitness.

use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::controller::Controller;
use crate::dynamics::{Dynamics, HillEquations, STATE_WIDTH, THRUSTER_COUNT};
use crate::error::{EngineError, Result};
use crate::fitness::{fitness_function, FitnessFunction, TerminalOutcome, CONTROLLER_OUTPUTS};
use crate::integrator::{apply_scale_limits, RungeKutta4, Stepper};

pub type State = [f64; STATE_WIDTH];

/// Starting conditions shared by every candidate evaluated in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRound {
    conditions: Vec<State>,
}

impl EvaluationRound {
    /// Draws `count` conditions: radius in `[1.5, 2)`, bearing in `[0, 2π)`,
    /// attitude in `[-π, π)`, at rest.
    pub fn sample<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Self {
        let conditions = (0..count)
            .map(|_| {
                let r = 1.5 + 0.5 * rng.gen::<f64>();
                let a = 2.0 * PI * rng.gen::<f64>();
                let theta = 2.0 * PI * rng.gen::<f64>() - PI;
                [r * a.cos(), 0.0, r * a.sin(), 0.0, theta, 0.0]
            })
            .collect();
        EvaluationRound { conditions }
    }

    pub fn seeded(count: usize, seed: u64) -> Self {
        EvaluationRound::sample(count, &mut StdRng::seed_from_u64(seed))
    }

    /// Fixed starting conditions; each must be a full state.
    pub fn from_conditions(conditions: &[Vec<f64>]) -> Result<Self> {
        if conditions.is_empty() {
            return Err(EngineError::InputContract("a round needs at least one starting condition".into()));
        }
        let conditions = conditions
            .iter()
            .map(|c| {
                State::try_from(c.as_slice()).map_err(|_| {
                    EngineError::InputContract(format!(
                        "starting condition has width {}, expected {STATE_WIDTH}",
                        c.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(EvaluationRound { conditions })
    }

    pub fn conditions(&self) -> &[State] {
        &self.conditions
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// Distance of a state from the target.
pub fn distance_of(state: &[f64]) -> f64 {
    state[0].hypot(state[2])
}

/// Arithmetic mean, summed left to right from `0.0`.
pub fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    sum / n as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub steps: usize,
    pub time: f64,
    pub initial_distance: f64,
    pub terminal: TerminalOutcome,
    pub outputs: [f64; CONTROLLER_OUTPUTS],
    pub fitness: f64,
    pub time_neuron_fired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRow {
    pub t: f64,
    pub state: State,
    pub outputs: [f64; CONTROLLER_OUTPUTS],
}

/// Per-step record of one run, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub rows: Vec<TrajectoryRow>,
}

pub struct ReferenceEvaluator<C: Controller, S: Stepper = RungeKutta4, D: Dynamics = HillEquations> {
    config: SimulationConfig,
    controller: C,
    stepper: S,
    dynamics: D,
    fitness: Box<dyn FitnessFunction>,
}

impl<C: Controller> ReferenceEvaluator<C> {
    pub fn new(config: SimulationConfig, controller: C) -> Result<Self> {
        ReferenceEvaluator::with_parts(config, controller, RungeKutta4, HillEquations::default())
    }
}

impl<C: Controller, S: Stepper, D: Dynamics> ReferenceEvaluator<C, S, D> {
    pub fn with_parts(config: SimulationConfig, controller: C, stepper: S, dynamics: D) -> Result<Self> {
        config.validate()?;
        check_parts(&controller, &dynamics)?;
        let fitness = fitness_function(config.fitness, config.fitness_params());
        Ok(ReferenceEvaluator { config, controller, stepper, dynamics, fitness })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Mean fitness of `weights` over every condition of `round`.
    pub fn objfun(&self, weights: &[f64], round: &EvaluationRound) -> Result<f64> {
        self.controller.check_weights(weights)?;
        let mut fitness = Vec::with_capacity(round.len());
        for start in round.conditions() {
            fitness.push(self.one_run(weights, start, None)?.fitness);
        }
        Ok(mean(fitness))
    }

    /// Evaluates a whole population against one round, candidates in parallel.
    /// Any malformed candidate fails the call.
    pub fn evaluate_population(&self, population: &[Vec<f64>], round: &EvaluationRound) -> Result<Vec<f64>> {
        population.par_iter().map(|w| self.objfun(w, round)).collect()
    }

    /// Every run of one candidate with its trajectory recorded.
    pub fn trace(&self, weights: &[f64], round: &EvaluationRound) -> Result<Vec<(RunOutcome, Trajectory)>> {
        self.controller.check_weights(weights)?;
        round
            .conditions()
            .iter()
            .map(|start| {
                let mut trajectory = Trajectory::default();
                let outcome = self.one_run(weights, start, Some(&mut trajectory))?;
                Ok((outcome, trajectory))
            })
            .collect()
    }

    /// Simulates one run from `start` until the time neuron fires or the
    /// docking window closes, and scores the terminal state.
    pub fn one_run(&self, weights: &[f64], start: &[f64], mut trajectory: Option<&mut Trajectory>) -> Result<RunOutcome> {
        self.controller.check_weights(weights)?;
        let mut state = State::try_from(start).map_err(|_| {
            EngineError::InputContract(format!("state has width {}, expected {STATE_WIDTH}", start.len()))
        })?;

        let cfg = &self.config;
        let max_steps = cfg.max_steps();
        let initial_distance = distance_of(&state);
        let mut outputs = [0.0; CONTROLLER_OUTPUTS];
        let mut steps = 0;
        let mut fired = false;

        loop {
            let t = steps as f64 * cfg.dt;
            self.controller.compute_outputs(weights, &state, &mut outputs);
            if let Some(tr) = trajectory.as_deref_mut() {
                tr.rows.push(TrajectoryRow { t, state, outputs });
            }

            let mut thrust = [outputs[0] * cfg.max_thrust, outputs[1] * cfg.max_thrust];
            apply_scale_limits(&mut thrust, cfg.scale_limits);
            self.stepper.step(&self.dynamics, &mut state, &thrust, t, cfg.dt);
            steps += 1;
            tracing::trace!(step = steps, x = state[0], y = state[2], theta = state[4], "step");

            if outputs[2] > cfg.time_neuron_threshold {
                fired = true;
                break;
            }
            if steps >= max_steps {
                break;
            }
        }

        let time = steps as f64 * cfg.dt;
        let terminal = TerminalOutcome::from_state(&state);
        if let Some(tr) = trajectory {
            tr.rows.push(TrajectoryRow { t: time, state, outputs });
        }
        Ok(RunOutcome {
            steps,
            time,
            initial_distance,
            terminal,
            outputs,
            fitness: self.fitness.fitness(&terminal, initial_distance, time),
            time_neuron_fired: fired,
        })
    }
}

/// Controller and dynamics must speak the docking state and thrust layout.
pub(crate) fn check_parts<C: Controller, D: Dynamics>(controller: &C, dynamics: &D) -> Result<()> {
    if dynamics.state_width() != STATE_WIDTH || dynamics.param_count() != THRUSTER_COUNT {
        return Err(EngineError::InvalidConfig(format!(
            "dynamics '{}' has {} states / {} inputs, expected {STATE_WIDTH} / {THRUSTER_COUNT}",
            dynamics.name(),
            dynamics.state_width(),
            dynamics.param_count()
        )));
    }
    if controller.input_count() != STATE_WIDTH || controller.output_count() != CONTROLLER_OUTPUTS {
        return Err(EngineError::InvalidConfig(format!(
            "controller maps {} -> {}, expected {STATE_WIDTH} -> {CONTROLLER_OUTPUTS}",
            controller.input_count(),
            controller.output_count()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControllerConfig, Perceptron};

    fn evaluator() -> ReferenceEvaluator<Perceptron> {
        let p = Perceptron::docking(&ControllerConfig::default());
        ReferenceEvaluator::new(SimulationConfig::default(), p).unwrap()
    }

    /// Outputs fixed by the biases alone: thrust `(a, b)`, time neuron `c`.
    struct Constant([f64; 3]);

    impl Controller for Constant {
        fn input_count(&self) -> usize {
            6
        }
        fn output_count(&self) -> usize {
            3
        }
        fn weight_count(&self) -> usize {
            0
        }
        fn compute_outputs(&self, _w: &[f64], _x: &[f64], out: &mut [f64]) {
            out.copy_from_slice(&self.0);
        }
    }

    #[test]
    fn test_sampled_conditions_in_range() {
        let round = EvaluationRound::seeded(200, 3);
        assert_eq!(round.len(), 200);
        for c in round.conditions() {
            let r = distance_of(c);
            assert!((1.5 - 1e-12..2.0 + 1e-12).contains(&r), "{r}");
            assert!(c[4] >= -PI && c[4] < PI);
            assert_eq!([c[1], c[3], c[5]], [0.0; 3]);
        }
        assert_eq!(EvaluationRound::seeded(5, 9), EvaluationRound::seeded(5, 9));
    }

    #[test]
    fn test_explicit_conditions_validated() {
        assert!(EvaluationRound::from_conditions(&[vec![1.5, 0.0, 0.0, 0.0, 0.0, 0.0]]).is_ok());
        assert!(matches!(
            EvaluationRound::from_conditions(&[vec![1.5, 0.0, 0.0]]),
            Err(EngineError::InputContract(_))
        ));
        assert!(EvaluationRound::from_conditions(&[]).is_err());
    }

    #[test]
    fn test_wrong_weight_count_is_contract_violation() {
        let ev = evaluator();
        let round = EvaluationRound::seeded(2, 1);
        let err = ev.objfun(&[0.0; 5], &round).unwrap_err();
        assert!(matches!(err, EngineError::InputContract(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_wrong_state_width_is_contract_violation() {
        let ev = evaluator();
        let w = vec![0.0; ev.controller().weight_count()];
        assert!(matches!(ev.one_run(&w, &[1.0; 5], None), Err(EngineError::InputContract(_))));
    }

    #[test]
    fn test_fitness_is_mean_of_runs() {
        let ev = evaluator();
        let w = ev.controller().random_init(11);
        let round = EvaluationRound::seeded(4, 5);
        let runs: Vec<f64> = round
            .conditions()
            .iter()
            .map(|s| ev.one_run(&w, s, None).unwrap().fitness)
            .collect();
        assert_eq!(ev.objfun(&w, &round).unwrap(), mean(runs.iter().copied()));
    }

    #[test]
    fn test_time_neuron_stops_after_one_step() {
        let ev = ReferenceEvaluator::new(SimulationConfig::default(), Constant([0.0, 0.0, 1.0])).unwrap();
        let run = ev.one_run(&[], &[1.5, 0.0, 0.0, 0.0, 0.0, 0.0], None).unwrap();
        assert_eq!(run.steps, 1);
        assert!(run.time_neuron_fired);
        assert!((run.time - 0.1).abs() < 1e-15);
    }

    #[test]
    fn test_runs_to_max_time_without_time_neuron() {
        let ev = ReferenceEvaluator::new(SimulationConfig::default(), Constant([0.0, 0.0, 0.5])).unwrap();
        let mut tr = Trajectory::default();
        let run = ev.one_run(&[], &[0.0, 0.0, 1.6, 0.0, 0.2, 0.0], Some(&mut tr)).unwrap();
        assert_eq!(run.steps, 200);
        assert!(!run.time_neuron_fired);
        assert!((run.time - 20.0).abs() < 1e-12);
        assert_eq!(tr.rows.len(), 201);
        assert_eq!(tr.rows[0].state, [0.0, 0.0, 1.6, 0.0, 0.2, 0.0]);
    }

    #[test]
    fn test_drifting_away_scores_zero() {
        // Full thrust along +x from a point on the +x axis only moves away.
        let ev = ReferenceEvaluator::new(SimulationConfig::default(), Constant([1.0, 1.0, 0.0])).unwrap();
        let run = ev.one_run(&[], &[1.5, 0.0, 0.0, 0.0, 0.0, 0.0], None).unwrap();
        assert!(run.terminal.distance >= run.initial_distance);
        assert_eq!(run.fitness, 0.0);
    }

    #[test]
    fn test_terminal_theta_normalized() {
        let ev = ReferenceEvaluator::new(SimulationConfig::default(), Constant([1.0, 0.0, 0.0])).unwrap();
        let round = EvaluationRound::seeded(6, 21);
        for (run, _) in ev.trace(&[], &round).unwrap() {
            assert!(run.terminal.theta > -PI && run.terminal.theta <= PI);
        }
    }

    #[test]
    fn test_population_matches_objfun() {
        let ev = evaluator();
        let round = EvaluationRound::seeded(3, 8);
        let pop: Vec<Vec<f64>> = (0..6).map(|s| ev.controller().random_init(s)).collect();
        let fits = ev.evaluate_population(&pop, &round).unwrap();
        for (w, f) in pop.iter().zip(&fits) {
            assert_eq!(ev.objfun(w, &round).unwrap(), *f);
        }

        let mut bad = pop.clone();
        bad[4].pop();
        assert!(ev.evaluate_population(&bad, &round).is_err());
    }

    #[test]
    fn test_mismatched_controller_rejected() {
        let p = Perceptron::new(4, 3, &[2]);
        assert!(matches!(
            ReferenceEvaluator::new(SimulationConfig::default(), p),
            Err(EngineError::InvalidConfig(_))
        ));
    }
}
