//! Whole-population evaluation through the task stages.
//!
//! One item per (island, individual, starting condition). Each step runs the
//! controller stage, then the integrator stage, for the whole batch; items
//! whose run has ended keep their terminal state. A single fitness launch
//! then scores every item and records are averaged per candidate.

use crate::backend::Backend;
use crate::batch::BatchShape;
use crate::config::SimulationConfig;
use crate::controller::{self, Controller, ControllerTask};
use crate::dynamics::{Dynamics, HillEquations, STATE_WIDTH, THRUSTER_COUNT};
use crate::error::{EngineError, Result};
use crate::fitness::{self, FitnessTask, CONTROLLER_OUTPUTS, RECORD_WIDTH};
use crate::integrator::{self, IntegratorTask, RungeKutta4, Stepper};
use crate::reference::{check_parts, distance_of, mean, EvaluationRound};
use crate::task::Stage;

pub struct BatchEvaluator<C: Controller, S: Stepper = RungeKutta4, D: Dynamics = HillEquations> {
    config: SimulationConfig,
    shape: BatchShape,
    controller: ControllerTask<C>,
    integrator: IntegratorTask<S, D>,
    fitness: FitnessTask,
}

impl<C: Controller> BatchEvaluator<C> {
    pub fn new(config: SimulationConfig, controller: C, backend: Backend) -> Result<Self> {
        BatchEvaluator::with_parts(config, controller, RungeKutta4, HillEquations::default(), backend)
    }
}

impl<C: Controller, S: Stepper, D: Dynamics> BatchEvaluator<C, S, D> {
    pub fn with_parts(config: SimulationConfig, controller: C, stepper: S, dynamics: D, backend: Backend) -> Result<Self> {
        config.validate()?;
        check_parts(&controller, &dynamics)?;
        let shape = BatchShape::new(0, 0, config.starting_conditions);
        Ok(BatchEvaluator {
            controller: ControllerTask::new("controller", shape, backend.clone(), controller),
            integrator: IntegratorTask::new(stepper.name(), shape, backend.clone(), stepper, dynamics)?,
            fitness: FitnessTask::new("fitness", shape, backend, config.fitness, config.fitness_params()),
            config,
            shape,
        })
    }

    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn controller(&self) -> &C {
        self.controller.controller()
    }

    /// Adopts a new batch shape. Every buffer of every stage is dropped and
    /// re-allocated at the new size; an unchanged shape keeps the buffers.
    pub fn resize(&mut self, shape: BatchShape) -> Result<()> {
        if shape == self.shape {
            return Ok(());
        }
        tracing::info!(from = %self.shape, to = %shape, "resizing batch");
        self.shape = shape;
        self.controller.reshape(shape);
        self.integrator.reshape(shape);
        self.fitness.reshape(shape);
        self.controller.prepare_outputs()?;
        self.integrator.prepare_outputs()?;
        self.fitness.prepare_outputs()
    }

    /// Per-item records `[fitness, distance, speed, theta]` of the last evaluation.
    pub fn records(&self) -> Result<&[f64]> {
        Ok(self.fitness.task().outputs(fitness::FITNESS)?.as_slice())
    }

    /// Fitness of every candidate, `population[island][individual]` being its weights.
    pub fn evaluate(&mut self, population: &[Vec<Vec<f64>>], round: &EvaluationRound) -> Result<Vec<Vec<f64>>> {
        let shape = BatchShape::from_population(population, round.len());
        if let Some((island, members)) = population.iter().enumerate().find(|(_, m)| m.len() != shape.individuals) {
            return Err(EngineError::InputContract(format!(
                "island {island} has {} individuals, expected {}",
                members.len(),
                shape.individuals
            )));
        }
        if round.is_empty() {
            return Err(EngineError::InputContract("a round needs at least one starting condition".into()));
        }
        self.resize(shape)?;
        if shape.is_empty() {
            return Ok(population.iter().map(|_| Vec::new()).collect());
        }

        for (island, members) in population.iter().enumerate() {
            for (individual, weights) in members.iter().enumerate() {
                self.controller.controller().check_weights(weights)?;
                self.controller.set_weights(island, individual, weights)?;
            }
        }

        let items = shape.items();
        let mut states = Vec::with_capacity(items * STATE_WIDTH);
        let mut initial_distance = Vec::with_capacity(items);
        for item in shape.iter() {
            let start = &round.conditions()[item.task];
            states.extend_from_slice(start);
            initial_distance.push(distance_of(start));
        }

        let cfg = &self.config;
        let max_steps = cfg.max_steps();
        let mut active = vec![true; items];
        let mut remaining = items;
        let mut steps = vec![0usize; items];
        let mut final_outputs = vec![0.0; items * CONTROLLER_OUTPUTS];
        let mut thrust = vec![0.0; items * THRUSTER_COUNT];

        let mut step = 0;
        while remaining > 0 {
            self.controller.task_mut().load_inputs(controller::INPUTS, &states)?;
            self.controller.launch()?;
            let outputs = self.controller.task().outputs(controller::OUTPUTS)?.as_slice();
            for (u, o) in thrust.chunks_mut(THRUSTER_COUNT).zip(outputs.chunks(CONTROLLER_OUTPUTS)) {
                u[0] = o[0] * cfg.max_thrust;
                u[1] = o[1] * cfg.max_thrust;
            }

            let task = self.integrator.task_mut();
            task.load_inputs(integrator::STATE, &states)?;
            task.load_inputs(integrator::DYNAMICAL_INPUTS, &thrust)?;
            self.integrator.set_params(step as f64 * cfg.dt, cfg.dt, cfg.scale_limits);
            self.integrator.launch()?;
            let next = self.integrator.task().outputs(integrator::STATE)?.as_slice();
            step += 1;

            for i in 0..items {
                if !active[i] {
                    continue;
                }
                let s = i * STATE_WIDTH..(i + 1) * STATE_WIDTH;
                let o = i * CONTROLLER_OUTPUTS..(i + 1) * CONTROLLER_OUTPUTS;
                states[s.clone()].copy_from_slice(&next[s]);
                final_outputs[o.clone()].copy_from_slice(&outputs[o.clone()]);
                steps[i] = step;
                if outputs[o][2] > cfg.time_neuron_threshold || step >= max_steps {
                    active[i] = false;
                    remaining -= 1;
                }
            }
        }
        tracing::debug!(batch = %shape, steps = step, "all trajectories terminated");

        let times: Vec<f64> = steps.iter().map(|&n| n as f64 * cfg.dt).collect();
        let task = self.fitness.task_mut();
        task.load_inputs(fitness::INPUTS, &states)?;
        task.load_inputs(fitness::OUTPUTS, &final_outputs)?;
        task.load_inputs(fitness::INITIAL_DISTANCE, &initial_distance)?;
        task.load_inputs(fitness::TIME, &times)?;
        self.fitness.launch()?;

        let records = self.records()?;
        let per_candidate = shape.task_size * RECORD_WIDTH;
        let fitness: Vec<f64> = records
            .chunks(per_candidate)
            .map(|runs| mean(runs.chunks(RECORD_WIDTH).map(|r| r[0])))
            .collect();
        Ok(fitness.chunks(shape.individuals).map(<[f64]>::to_vec).collect())
    }
}
