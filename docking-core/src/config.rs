//! Simulation parameters shared by the reference and batched evaluators.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::fitness::{FitnessParams, FitnessVariant};

pub use crate::controller::ControllerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Raw controller thrust in `[0, 1]` is multiplied by this.
    pub max_thrust: f64,
    pub max_docking_time: f64,
    pub time_neuron_threshold: f64,
    pub dt: f64,
    /// Starting conditions sampled per evaluation round.
    pub starting_conditions: usize,
    pub vicinity_distance: f64,
    pub vicinity_speed: f64,
    pub vicinity_orientation: f64,
    /// Clamp on the scaled thrust; `0` disables it.
    pub scale_limits: f64,
    pub fitness: FitnessVariant,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            max_thrust: 0.1,
            max_docking_time: 20.0,
            time_neuron_threshold: 0.99,
            dt: 0.1,
            starting_conditions: 5,
            vicinity_distance: 0.1,
            vicinity_speed: 0.1,
            vicinity_orientation: PI / 8.0,
            scale_limits: 0.0,
            fitness: FitnessVariant::MinimalDistance,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_thrust", self.max_thrust),
            ("max_docking_time", self.max_docking_time),
            ("dt", self.dt),
            ("vicinity_distance", self.vicinity_distance),
            ("vicinity_speed", self.vicinity_speed),
            ("vicinity_orientation", self.vicinity_orientation),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(EngineError::InvalidConfig(format!("{name} must be positive, got {value}")));
            }
        }
        if self.starting_conditions == 0 {
            return Err(EngineError::InvalidConfig("starting_conditions must be at least 1".into()));
        }
        if !(self.scale_limits >= 0.0) {
            return Err(EngineError::InvalidConfig(format!(
                "scale_limits must be >= 0, got {}",
                self.scale_limits
            )));
        }
        if self.dt > self.max_docking_time {
            return Err(EngineError::InvalidConfig(format!(
                "dt {} exceeds max_docking_time {}",
                self.dt, self.max_docking_time
            )));
        }
        Ok(())
    }

    /// Step budget of one run: `max_docking_time / dt`, rounded.
    pub fn max_steps(&self) -> usize {
        (self.max_docking_time / self.dt).round() as usize
    }

    pub fn fitness_params(&self) -> FitnessParams {
        FitnessParams {
            vicinity_distance: self.vicinity_distance,
            vicinity_speed: self.vicinity_speed,
            vicinity_orientation: self.vicinity_orientation,
            max_docking_time: self.max_docking_time,
        }
    }
}
