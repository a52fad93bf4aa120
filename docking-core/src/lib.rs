//! Batched simulation and fitness evaluation for neural docking controllers.
//!
//! Architecture:
//! - `dataset`, `batch`, `task`: shape-checked buffers and the stage contract
//! - `backend`: serial, rayon and (feature `cuda`) CUDA execution
//! - `dynamics`, `integrator`: Hill's equations and fixed-step steppers
//! - `controller`: feed-forward controller and its stage
//! - `fitness`: reward variants and the fitness stage
//! - `reference`: single-candidate ground truth
//! - `batch_evaluator`: the same evaluation driven through the stages

pub mod backend;
pub mod batch;
pub mod batch_evaluator;
pub mod config;
pub mod controller;
pub mod dataset;
pub mod dynamics;
pub mod error;
pub mod fitness;
pub mod integrator;
pub mod reference;
pub mod task;

pub use backend::Backend;
pub use batch::{BatchShape, DataItem};
pub use batch_evaluator::BatchEvaluator;
pub use config::{ControllerConfig, SimulationConfig};
pub use controller::{Controller, ControllerTask, Perceptron};
pub use dataset::Dataset;
pub use dynamics::{Dynamics, HillEquations};
pub use error::{EngineError, Result};
pub use fitness::{FitnessFunction, FitnessParams, FitnessTask, FitnessVariant, TerminalOutcome};
pub use integrator::{ExplicitEuler, IntegratorTask, RungeKutta4, Stepper};
pub use reference::{EvaluationRound, ReferenceEvaluator, RunOutcome, Trajectory};
pub use task::{Stage, Task};
