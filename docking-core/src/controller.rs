//! Neural controllers and the controller stage.
//!
//! A controller maps the 6-component state to three outputs in `[0, 1]`:
//! left thrust, right thrust and the time neuron. Weights are passed per
//! call so one controller value serves a whole population read-only.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::batch::{BatchShape, DataItem};
use crate::dynamics::STATE_WIDTH;
use crate::error::{EngineError, Result};
use crate::fitness::CONTROLLER_OUTPUTS;
use crate::task::{SlotRole, SlotSpec, Stage, Task};

pub const WEIGHTS: &str = "weights";
pub const INPUTS: &str = "inputs";
pub const OUTPUTS: &str = "outputs";

pub trait Controller: Send + Sync {
    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    fn weight_count(&self) -> usize;

    /// Forward pass. Slice lengths are the caller's responsibility.
    fn compute_outputs(&self, weights: &[f64], inputs: &[f64], outputs: &mut [f64]);

    fn check_weights(&self, weights: &[f64]) -> Result<()> {
        if weights.len() != self.weight_count() {
            return Err(EngineError::InputContract(format!(
                "controller expects {} weights, got {}",
                self.weight_count(),
                weights.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub hidden: Vec<usize>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig { hidden: vec![10] }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hidden.iter().any(|&h| h == 0) {
            return Err(EngineError::InvalidConfig(format!("empty hidden layer in {:?}", self.hidden)));
        }
        Ok(())
    }
}

/// Feed-forward network: tanh hidden layers, logistic outputs.
///
/// Weights are laid out layer by layer, each layer as its `fan_in × fan_out`
/// matrix (row-major by input) followed by `fan_out` biases.
#[derive(Debug, Clone, PartialEq)]
pub struct Perceptron {
    inputs: usize,
    outputs: usize,
    hidden: Vec<usize>,
    layer_dims: Vec<(usize, usize)>,
    n_weights: usize,
}

impl Perceptron {
    pub fn new(inputs: usize, outputs: usize, hidden: &[usize]) -> Self {
        let mut dims = Vec::new();
        let mut prev = inputs;
        for &h in hidden {
            dims.push((prev, h));
            prev = h;
        }
        dims.push((prev, outputs));
        let n_weights = dims.iter().map(|(i, o)| i * o + o).sum();

        Perceptron {
            inputs,
            outputs,
            hidden: hidden.to_vec(),
            layer_dims: dims,
            n_weights,
        }
    }

    /// The docking controller: state in, `(ul, ur, time_neuron)` out.
    pub fn docking(config: &ControllerConfig) -> Self {
        Perceptron::new(STATE_WIDTH, CONTROLLER_OUTPUTS, &config.hidden)
    }

    /// Xavier-uniform weights, zero biases.
    pub fn random_init(&self, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut weights = vec![0.0; self.n_weights];
        let mut offset = 0;
        for &(fan_in, fan_out) in &self.layer_dims {
            let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
            for w in &mut weights[offset..offset + fan_in * fan_out] {
                *w = rng.gen_range(-limit..limit);
            }
            offset += fan_in * fan_out + fan_out;
        }
        weights
    }

    /// e.g. `6→10→3`
    pub fn arch_string(&self) -> String {
        let mut parts = vec![self.inputs.to_string()];
        parts.extend(self.hidden.iter().map(|h| h.to_string()));
        parts.push(self.outputs.to_string());
        parts.join("→")
    }
}

impl Controller for Perceptron {
    fn input_count(&self) -> usize {
        self.inputs
    }

    fn output_count(&self) -> usize {
        self.outputs
    }

    fn weight_count(&self) -> usize {
        self.n_weights
    }

    fn compute_outputs(&self, weights: &[f64], inputs: &[f64], outputs: &mut [f64]) {
        debug_assert_eq!(weights.len(), self.n_weights);
        debug_assert_eq!(inputs.len(), self.inputs);

        let mut x = inputs.to_vec();
        let mut offset = 0;
        let last = self.layer_dims.len() - 1;

        for (layer, &(fan_in, fan_out)) in self.layer_dims.iter().enumerate() {
            let w = &weights[offset..offset + fan_in * fan_out];
            offset += fan_in * fan_out;
            let b = &weights[offset..offset + fan_out];
            offset += fan_out;

            let mut out = b.to_vec();
            for (i, xi) in x.iter().enumerate() {
                for (j, o) in out.iter_mut().enumerate() {
                    *o += xi * w[i * fan_out + j];
                }
            }
            if layer == last {
                out.iter_mut().for_each(|v| *v = 1.0 / (1.0 + (-*v).exp()));
            } else {
                out.iter_mut().for_each(|v| *v = v.tanh());
            }
            x = out;
        }
        outputs.copy_from_slice(&x);
    }
}

/// Evaluates one controller for every item of the batch.
///
/// Weights are per candidate; [`ControllerTask::set_weights`] replicates them
/// across the candidate's items so every item reads its own row.
pub struct ControllerTask<C: Controller> {
    task: Task,
    controller: C,
}

impl<C: Controller> ControllerTask<C> {
    pub fn new(name: &str, shape: BatchShape, backend: Backend, controller: C) -> Self {
        let specs = vec![
            SlotSpec::new(WEIGHTS, controller.weight_count(), SlotRole::Input),
            SlotSpec::new(INPUTS, controller.input_count(), SlotRole::Input),
            SlotSpec::new(OUTPUTS, controller.output_count(), SlotRole::Output),
        ];
        ControllerTask {
            task: Task::new(name, shape, backend, specs),
            controller,
        }
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn set_weights(&mut self, island: usize, individual: usize, weights: &[f64]) -> Result<()> {
        for task in 0..self.task.shape().task_size {
            self.task.set_inputs(WEIGHTS, &DataItem::new(island, individual, task), weights)?;
        }
        Ok(())
    }

    pub fn set_state(&mut self, item: &DataItem, state: &[f64]) -> Result<()> {
        self.task.set_inputs(INPUTS, item, state)
    }

    pub fn get_controller_outputs(&self, item: &DataItem) -> Result<&[f64]> {
        self.task.get_outputs(OUTPUTS, item)
    }
}

impl<C: Controller> Stage for ControllerTask<C> {
    fn task(&self) -> &Task {
        &self.task
    }

    fn task_mut(&mut self) -> &mut Task {
        &mut self.task
    }

    fn prepare_outputs(&mut self) -> Result<()> {
        self.task.prepare_dataset(OUTPUTS)
    }

    fn launch(&mut self) -> Result<()> {
        self.task.begin_launch();
        self.task.require_all()?;

        let (wc, ic, oc) = (
            self.controller.weight_count(),
            self.controller.input_count(),
            self.controller.output_count(),
        );
        let mut out = self.task.take(OUTPUTS)?;
        {
            let weights = self.task.require(WEIGHTS)?.as_slice();
            let inputs = self.task.require(INPUTS)?.as_slice();
            let controller = &self.controller;
            self.task.backend().map_items(out.as_mut_slice(), oc, |i, o| {
                controller.compute_outputs(&weights[i * wc..(i + 1) * wc], &inputs[i * ic..(i + 1) * ic], o);
            });
        }
        self.task.restore(out)?;
        self.task.finish_launch();
        Ok(())
    }
}
