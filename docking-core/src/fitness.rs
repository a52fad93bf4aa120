//! Terminal-state rewards and the fitness stage.
//!
//! Every variant maps a [`TerminalOutcome`] (plus the run's initial distance
//! and termination time) to a reward `r >= 0`; the written fitness is `-r`
//! because the optimizers minimize. A trajectory that ends no closer than it
//! started always scores zero.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaDevice, LaunchAsync};
use serde::{Deserialize, Serialize};
#[cfg(feature = "cuda")]
use std::sync::Arc;

use crate::backend::Backend;
use crate::batch::{BatchShape, DataItem};
use crate::dynamics::STATE_WIDTH;
use crate::error::{EngineError, Result};
use crate::task::{SlotRole, SlotSpec, Stage, Task};

pub const INPUTS: &str = "inputs";
pub const OUTPUTS: &str = "outputs";
pub const INITIAL_DISTANCE: &str = "initial_distance";
pub const TIME: &str = "time";
pub const FITNESS: &str = "fitness";

/// `[fitness, distance, speed, theta]`
pub const RECORD_WIDTH: usize = 4;
pub const CONTROLLER_OUTPUTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitnessVariant {
    #[default]
    MinimalDistance,
    MinimalDistanceSpeedTheta,
    MinimalDistanceSimple,
    NoAttitudeFitness,
    #[serde(rename = "twodee1", alias = "cristos_twodee_fitness1")]
    Twodee1,
    #[serde(rename = "twodee2", alias = "cristos_twodee_fitness2")]
    Twodee2,
    #[serde(rename = "twodee3", alias = "cristos_twodee_fitness3")]
    Twodee3,
}

impl FitnessVariant {
    pub const ALL: [FitnessVariant; 7] = [
        FitnessVariant::MinimalDistance,
        FitnessVariant::MinimalDistanceSpeedTheta,
        FitnessVariant::MinimalDistanceSimple,
        FitnessVariant::NoAttitudeFitness,
        FitnessVariant::Twodee1,
        FitnessVariant::Twodee2,
        FitnessVariant::Twodee3,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FitnessVariant::MinimalDistance => "minimal_distance",
            FitnessVariant::MinimalDistanceSpeedTheta => "minimal_distance_speed_theta",
            FitnessVariant::MinimalDistanceSimple => "minimal_distance_simple",
            FitnessVariant::NoAttitudeFitness => "no_attitude_fitness",
            FitnessVariant::Twodee1 => "twodee1",
            FitnessVariant::Twodee2 => "twodee2",
            FitnessVariant::Twodee3 => "twodee3",
        }
    }
}

impl fmt::Display for FitnessVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FitnessVariant {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let key = match lower.strip_prefix("cristos_") {
            Some(rest) => rest.replace("_fitness", ""),
            None => lower.clone(),
        };
        FitnessVariant::ALL
            .into_iter()
            .find(|v| v.name() == key)
            .ok_or_else(|| EngineError::InvalidConfig(format!("unknown fitness variant '{s}'")))
    }
}

/// Thresholds read by the reward formulas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitnessParams {
    pub vicinity_distance: f64,
    pub vicinity_speed: f64,
    pub vicinity_orientation: f64,
    pub max_docking_time: f64,
}

impl Default for FitnessParams {
    fn default() -> Self {
        FitnessParams {
            vicinity_distance: 0.1,
            vicinity_speed: 0.1,
            vicinity_orientation: PI / 8.0,
            max_docking_time: 20.0,
        }
    }
}

impl FitnessParams {
    /// Fraction of the docking window left at `t`.
    pub fn time_remaining(&self, t: f64) -> f64 {
        (self.max_docking_time - t) / self.max_docking_time
    }
}

/// Maps an angle into `(-π, π]` by whole turns of `2π`, one at a time.
/// In-range and non-finite angles come back untouched.
pub fn normalize_theta(theta: f64) -> f64 {
    if !theta.is_finite() {
        return theta;
    }
    let mut th = theta;
    while th > PI {
        th -= 2.0 * PI;
    }
    while th <= -PI {
        th += 2.0 * PI;
    }
    th
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerminalOutcome {
    pub distance: f64,
    pub speed: f64,
    pub theta: f64,
}

impl TerminalOutcome {
    /// From a `(x, vx, y, vy, theta, omega)` state.
    pub fn from_state(state: &[f64]) -> Self {
        TerminalOutcome {
            distance: state[0].hypot(state[2]),
            speed: state[1].hypot(state[3]),
            theta: normalize_theta(state[4]),
        }
    }
}

/// One closed-form reward. Implementations are pure and thread-safe.
pub trait FitnessFunction: Send + Sync {
    fn variant(&self) -> FitnessVariant;

    /// Reward `r >= 0` of a run that got closer than it started.
    fn reward(&self, outcome: &TerminalOutcome, initial_distance: f64, t: f64) -> f64;

    /// CUDA C of `__device__ double reward(double d, double s, double th, double d0, double t, Params p)`.
    fn device_source(&self) -> &'static str;

    /// Minimization-convention fitness of one run.
    fn fitness(&self, outcome: &TerminalOutcome, initial_distance: f64, t: f64) -> f64 {
        if outcome.distance >= initial_distance {
            return 0.0;
        }
        -self.reward(outcome, initial_distance, t)
    }
}

fn base_reward(o: &TerminalOutcome) -> f64 {
    1.0 / ((1.0 + o.distance) * (1.0 + o.theta.abs()) * (1.0 + o.speed))
}

/// Distance, attitude and speed, with a time bonus for docking inside fixed bounds.
#[derive(Debug, Clone, Copy)]
pub struct MinimalDistance {
    pub params: FitnessParams,
}

impl FitnessFunction for MinimalDistance {
    fn variant(&self) -> FitnessVariant {
        FitnessVariant::MinimalDistance
    }

    fn reward(&self, o: &TerminalOutcome, _initial_distance: f64, t: f64) -> f64 {
        let mut r = base_reward(o);
        if o.distance < 0.1 && o.theta.abs() < PI / 8.0 && o.speed < 0.1 {
            r += r * self.params.time_remaining(t);
        }
        r
    }

    fn device_source(&self) -> &'static str {
        r#"
__device__ double reward(double d, double s, double th, double d0, double t, Params p) {
    double r = 1.0 / ((1.0 + d) * (1.0 + fabs(th)) * (1.0 + s));
    if (d < 0.1 && fabs(th) < PI / 8.0 && s < 0.1) r += r * (p.tmax - t) / p.tmax;
    return r;
}
"#
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MinimalDistanceSpeedTheta;

impl FitnessFunction for MinimalDistanceSpeedTheta {
    fn variant(&self) -> FitnessVariant {
        FitnessVariant::MinimalDistanceSpeedTheta
    }

    fn reward(&self, o: &TerminalOutcome, _initial_distance: f64, _t: f64) -> f64 {
        base_reward(o)
    }

    fn device_source(&self) -> &'static str {
        r#"
__device__ double reward(double d, double s, double th, double d0, double t, Params p) {
    return 1.0 / ((1.0 + d) * (1.0 + fabs(th)) * (1.0 + s));
}
"#
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MinimalDistanceSimple;

impl FitnessFunction for MinimalDistanceSimple {
    fn variant(&self) -> FitnessVariant {
        FitnessVariant::MinimalDistanceSimple
    }

    fn reward(&self, o: &TerminalOutcome, _initial_distance: f64, _t: f64) -> f64 {
        1.0 / (1.0 + o.distance)
    }

    fn device_source(&self) -> &'static str {
        r#"
__device__ double reward(double d, double s, double th, double d0, double t, Params p) {
    return 1.0 / (1.0 + d);
}
"#
    }
}

/// Ignores attitude entirely.
#[derive(Debug, Clone, Copy)]
pub struct NoAttitude {
    pub params: FitnessParams,
}

impl FitnessFunction for NoAttitude {
    fn variant(&self) -> FitnessVariant {
        FitnessVariant::NoAttitudeFitness
    }

    fn reward(&self, o: &TerminalOutcome, _initial_distance: f64, t: f64) -> f64 {
        let p = &self.params;
        let mut r = 1.0 / ((1.0 + o.distance) * (1.0 + o.speed));
        if o.distance < p.vicinity_distance && o.speed < p.vicinity_speed {
            r += r * p.time_remaining(t);
        }
        r
    }

    fn device_source(&self) -> &'static str {
        r#"
__device__ double reward(double d, double s, double th, double d0, double t, Params p) {
    double r = 1.0 / ((1.0 + d) * (1.0 + s));
    if (d < p.vd && s < p.vs) r += r * (p.tmax - t) / p.tmax;
    return r;
}
"#
    }
}

/// Rewards progress relative to the starting distance.
#[derive(Debug, Clone, Copy)]
pub struct Twodee1 {
    pub params: FitnessParams,
}

impl FitnessFunction for Twodee1 {
    fn variant(&self) -> FitnessVariant {
        FitnessVariant::Twodee1
    }

    fn reward(&self, o: &TerminalOutcome, initial_distance: f64, t: f64) -> f64 {
        let progress = ((initial_distance - o.distance) / initial_distance).clamp(0.0, 1.0);
        let mut r = progress / (1.0 + o.speed);
        if o.distance < 0.1 && o.speed < 0.1 {
            r += r * self.params.time_remaining(t);
        }
        r
    }

    fn device_source(&self) -> &'static str {
        r#"
__device__ double reward(double d, double s, double th, double d0, double t, Params p) {
    double progress = fmin(fmax((d0 - d) / d0, 0.0), 1.0);
    double r = progress / (1.0 + s);
    if (d < 0.1 && s < 0.1) r += r * (p.tmax - t) / p.tmax;
    return r;
}
"#
    }
}

/// Flat docking bonus once every vicinity threshold is met.
#[derive(Debug, Clone, Copy)]
pub struct Twodee2 {
    pub params: FitnessParams,
}

impl FitnessFunction for Twodee2 {
    fn variant(&self) -> FitnessVariant {
        FitnessVariant::Twodee2
    }

    fn reward(&self, o: &TerminalOutcome, _initial_distance: f64, t: f64) -> f64 {
        let p = &self.params;
        let mut r = base_reward(o);
        if o.distance < p.vicinity_distance
            && o.speed < p.vicinity_speed
            && o.theta.abs() < p.vicinity_orientation
        {
            r += 1.0 + p.time_remaining(t);
        }
        r
    }

    fn device_source(&self) -> &'static str {
        r#"
__device__ double reward(double d, double s, double th, double d0, double t, Params p) {
    double r = 1.0 / ((1.0 + d) * (1.0 + fabs(th)) * (1.0 + s));
    if (d < p.vd && s < p.vs && fabs(th) < p.vo) r += 1.0 + (p.tmax - t) / p.tmax;
    return r;
}
"#
    }
}

/// Orientation error scales the docking bonus instead of gating it.
#[derive(Debug, Clone, Copy)]
pub struct Twodee3 {
    pub params: FitnessParams,
}

impl FitnessFunction for Twodee3 {
    fn variant(&self) -> FitnessVariant {
        FitnessVariant::Twodee3
    }

    fn reward(&self, o: &TerminalOutcome, _initial_distance: f64, t: f64) -> f64 {
        let p = &self.params;
        let mut r = 1.0 / ((1.0 + o.distance) * (1.0 + o.speed));
        if o.distance < p.vicinity_distance && o.speed < p.vicinity_speed {
            r += (1.0 + p.time_remaining(t)) / (1.0 + o.theta.abs() / p.vicinity_orientation);
        }
        r
    }

    fn device_source(&self) -> &'static str {
        r#"
__device__ double reward(double d, double s, double th, double d0, double t, Params p) {
    double r = 1.0 / ((1.0 + d) * (1.0 + s));
    if (d < p.vd && s < p.vs) r += (1.0 + (p.tmax - t) / p.tmax) / (1.0 + fabs(th) / p.vo);
    return r;
}
"#
    }
}

/// The strategy for `variant`, chosen once per task or evaluator.
pub fn fitness_function(variant: FitnessVariant, params: FitnessParams) -> Box<dyn FitnessFunction> {
    match variant {
        FitnessVariant::MinimalDistance => Box::new(MinimalDistance { params }),
        FitnessVariant::MinimalDistanceSpeedTheta => Box::new(MinimalDistanceSpeedTheta),
        FitnessVariant::MinimalDistanceSimple => Box::new(MinimalDistanceSimple),
        FitnessVariant::NoAttitudeFitness => Box::new(NoAttitude { params }),
        FitnessVariant::Twodee1 => Box::new(Twodee1 { params }),
        FitnessVariant::Twodee2 => Box::new(Twodee2 { params }),
        FitnessVariant::Twodee3 => Box::new(Twodee3 { params }),
    }
}

#[cfg(feature = "cuda")]
const FITNESS_KERNEL_TEMPLATE: &str = r#"
#define PI 3.14159265358979323846
#define STATE_WIDTH {STATE_WIDTH}
#define RECORD_WIDTH {RECORD_WIDTH}

struct Params { double vd; double vs; double vo; double tmax; };

__device__ double normalize_theta(double th) {
    if (isnan(th) || isinf(th)) return th;
    while (th > PI) th -= 2.0 * PI;
    while (th <= -PI) th += 2.0 * PI;
    return th;
}

{REWARD}

extern "C" __global__ void fitness(
    const double* __restrict__ state,
    const double* __restrict__ initial_distance,
    const double* __restrict__ times,
    int n_items,
    double vd, double vs, double vo, double tmax,
    double* out
) {
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= n_items) return;

    const double* x = &state[idx * STATE_WIDTH];
    double d = hypot(x[0], x[2]);
    double s = hypot(x[1], x[3]);
    double th = normalize_theta(x[4]);
    double d0 = initial_distance[idx];
    Params p = { vd, vs, vo, tmax };

    double f = 0.0;
    if (d < d0) f = -reward(d, s, th, d0, times[idx], p);

    double* rec = &out[idx * RECORD_WIDTH];
    rec[0] = f;
    rec[1] = d;
    rec[2] = s;
    rec[3] = th;
}
"#;

pub struct FitnessTask {
    task: Task,
    function: Box<dyn FitnessFunction>,
    params: FitnessParams,
    t: f64,
}

impl FitnessTask {
    pub fn new(name: &str, shape: BatchShape, backend: Backend, variant: FitnessVariant, params: FitnessParams) -> Self {
        let specs = vec![
            SlotSpec::new(INPUTS, STATE_WIDTH, SlotRole::Input),
            SlotSpec::new(OUTPUTS, CONTROLLER_OUTPUTS, SlotRole::Input),
            SlotSpec::new(INITIAL_DISTANCE, 1, SlotRole::Input),
            SlotSpec::new(TIME, 1, SlotRole::OptionalInput),
            SlotSpec::new(FITNESS, RECORD_WIDTH, SlotRole::Output),
        ];
        FitnessTask {
            task: Task::new(name, shape, backend, specs),
            function: fitness_function(variant, params),
            params,
            t: 0.0,
        }
    }

    pub fn variant(&self) -> FitnessVariant {
        self.function.variant()
    }

    pub fn params(&self) -> &FitnessParams {
        &self.params
    }

    /// Termination time used by items without their own `time` entry.
    pub fn set_time(&mut self, t: f64) {
        self.t = t;
    }

    pub fn set_state(&mut self, item: &DataItem, state: &[f64]) -> Result<()> {
        self.task.set_inputs(INPUTS, item, state)
    }

    pub fn set_controller_outputs(&mut self, item: &DataItem, outputs: &[f64]) -> Result<()> {
        self.task.set_inputs(OUTPUTS, item, outputs)
    }

    pub fn set_initial_distance(&mut self, item: &DataItem, distance: f64) -> Result<()> {
        self.task.set_inputs(INITIAL_DISTANCE, item, &[distance])
    }

    pub fn set_item_time(&mut self, item: &DataItem, t: f64) -> Result<()> {
        self.task.set_inputs(TIME, item, &[t])
    }

    /// The full `[fitness, distance, speed, theta]` record of one item.
    pub fn get_record(&self, item: &DataItem) -> Result<&[f64]> {
        self.task.get_outputs(FITNESS, item)
    }

    pub fn get_fitness(&self, item: &DataItem) -> Result<f64> {
        self.get_record(item).map(|r| r[0])
    }

    /// Per-item termination times: the `time` slot if present, else `set_time`.
    fn times(&self) -> Vec<f64> {
        match self.task.dataset(TIME) {
            Some(ds) => ds.as_slice().to_vec(),
            None => vec![self.t; self.task.shape().items()],
        }
    }

    fn launch_host(&mut self) -> Result<()> {
        let times = self.times();
        let mut out = self.task.take(FITNESS)?;
        {
            let state = self.task.require(INPUTS)?.as_slice();
            let d0 = self.task.require(INITIAL_DISTANCE)?.as_slice();
            let function = self.function.as_ref();
            self.task.backend().map_items(out.as_mut_slice(), RECORD_WIDTH, |i, rec| {
                let outcome = TerminalOutcome::from_state(&state[i * STATE_WIDTH..(i + 1) * STATE_WIDTH]);
                rec[0] = function.fitness(&outcome, d0[i], times[i]);
                rec[1] = outcome.distance;
                rec[2] = outcome.speed;
                rec[3] = outcome.theta;
            });
        }
        self.task.restore(out)
    }

    #[cfg(feature = "cuda")]
    fn launch_device(&mut self, dev: &Arc<CudaDevice>) -> Result<()> {
        use crate::backend::device;

        let stage = self.task.name().to_string();
        let src = FITNESS_KERNEL_TEMPLATE
            .replace("{STATE_WIDTH}", &STATE_WIDTH.to_string())
            .replace("{RECORD_WIDTH}", &RECORD_WIDTH.to_string())
            .replace("{REWARD}", self.function.device_source());
        let module = format!("fitness_{}", self.function.variant().name());
        let f = device::kernel(dev, &stage, &module, &src, "fitness")?;

        let items = self.task.shape().items();
        let d_state = device::upload(dev, &stage, self.task.require(INPUTS)?.as_slice())?;
        let d_d0 = device::upload(dev, &stage, self.task.require(INITIAL_DISTANCE)?.as_slice())?;
        let d_times = device::upload(dev, &stage, &self.times())?;
        let mut d_out = dev
            .alloc_zeros::<f64>(items * RECORD_WIDTH)
            .map_err(|e| EngineError::backend(&stage, format!("alloc failed: {e}")))?;
        let p = &self.params;
        unsafe {
            f.launch(
                device::launch_config(items),
                (
                    &d_state,
                    &d_d0,
                    &d_times,
                    items as i32,
                    p.vicinity_distance,
                    p.vicinity_speed,
                    p.vicinity_orientation,
                    p.max_docking_time,
                    &mut d_out,
                ),
            )
        }
        .map_err(|e| EngineError::backend(&stage, format!("launch failed: {e}")))?;
        let records = device::download(dev, &stage, &d_out)?;
        self.task.load_inputs(FITNESS, &records)
    }
}

impl Stage for FitnessTask {
    fn task(&self) -> &Task {
        &self.task
    }

    fn task_mut(&mut self) -> &mut Task {
        &mut self.task
    }

    fn prepare_outputs(&mut self) -> Result<()> {
        self.task.prepare_dataset(FITNESS)
    }

    fn launch(&mut self) -> Result<()> {
        self.task.begin_launch();
        self.task.require_all()?;

        #[cfg(feature = "cuda")]
        if let Backend::Cuda(dev) = self.task.backend().clone() {
            self.launch_device(&dev).map_err(|e| {
                tracing::warn!(stage = %self.task.name(), "device launch failed: {e}");
                e
            })?;
            self.task.finish_launch();
            return Ok(());
        }

        self.launch_host()?;
        tracing::debug!(stage = %self.task.name(), variant = %self.variant(), items = self.task.shape().items(), "fitness computed");
        self.task.finish_launch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(distance: f64, speed: f64, theta: f64) -> TerminalOutcome {
        TerminalOutcome { distance, speed, theta }
    }

    #[test]
    fn test_docked_with_time_bonus() {
        let f = fitness_function(FitnessVariant::MinimalDistance, FitnessParams::default());
        let fit = f.fitness(&outcome(0.05, 0.05, 0.1), 2.0, 5.0);
        let base = 1.0 / (1.05 * 1.1 * 1.05);
        assert!((fit + base * 1.75).abs() < 1e-12);
        assert!((fit + 1.443).abs() < 1e-3);
    }

    #[test]
    fn test_no_bonus_outside_vicinity() {
        let f = fitness_function(FitnessVariant::MinimalDistance, FitnessParams::default());
        let fit = f.fitness(&outcome(0.5, 0.05, 0.1), 2.0, 5.0);
        assert!((fit + 1.0 / (1.5 * 1.1 * 1.05)).abs() < 1e-12);
    }

    #[test]
    fn test_no_progress_scores_zero_for_every_variant() {
        for variant in FitnessVariant::ALL {
            let f = fitness_function(variant, FitnessParams::default());
            assert_eq!(f.fitness(&outcome(2.0, 0.0, 0.0), 2.0, 3.0), 0.0, "{variant}");
            assert_eq!(f.fitness(&outcome(2.5, 0.01, 0.0), 2.0, 3.0), 0.0, "{variant}");
            assert!(f.fitness(&outcome(0.05, 0.01, 0.0), 2.0, 3.0) < 0.0, "{variant}");
        }
    }

    #[test]
    fn test_variant_formulas() {
        let params = FitnessParams::default();
        let o = outcome(0.05, 0.05, 0.2);
        let rem = (20.0 - 4.0) / 20.0;

        let simple = fitness_function(FitnessVariant::MinimalDistanceSimple, params);
        assert!((simple.fitness(&o, 1.0, 4.0) + 1.0 / 1.05).abs() < 1e-12);

        let no_att = fitness_function(FitnessVariant::NoAttitudeFitness, params);
        let r = 1.0 / (1.05 * 1.05);
        assert!((no_att.fitness(&o, 1.0, 4.0) + (r + r * rem)).abs() < 1e-12);

        let twodee1 = fitness_function(FitnessVariant::Twodee1, params);
        let r = 0.95 / 1.05;
        assert!((twodee1.fitness(&o, 1.0, 4.0) + (r + r * rem)).abs() < 1e-12);

        // |theta| = 0.2 < π/8 opens the flat bonus.
        let twodee2 = fitness_function(FitnessVariant::Twodee2, params);
        let r = 1.0 / (1.05 * 1.2 * 1.05);
        assert!((twodee2.fitness(&o, 1.0, 4.0) + (r + 1.0 + rem)).abs() < 1e-12);

        let twodee3 = fitness_function(FitnessVariant::Twodee3, params);
        let r = 1.0 / (1.05 * 1.05);
        let bonus = (1.0 + rem) / (1.0 + 0.2 / (PI / 8.0));
        assert!((twodee3.fitness(&o, 1.0, 4.0) + (r + bonus)).abs() < 1e-12);
    }

    #[test]
    fn test_twodee2_orientation_gates_bonus() {
        let f = fitness_function(FitnessVariant::Twodee2, FitnessParams::default());
        let r = 1.0 / (1.05 * 1.5 * 1.05);
        assert!((f.fitness(&outcome(0.05, 0.05, 0.5), 1.0, 4.0) + r).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_theta_range() {
        assert_eq!(normalize_theta(0.3), 0.3);
        assert_eq!(normalize_theta(PI), PI);
        assert!((normalize_theta(-PI) - PI).abs() < 1e-12);
        assert!((normalize_theta(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
        for k in -200..200 {
            let th = k as f64 * 0.173;
            let w = normalize_theta(th);
            assert!(w > -PI && w <= PI, "{th} -> {w}");
            let turns = ((th - w) / (2.0 * PI)).round();
            assert!((th - w - turns * 2.0 * PI).abs() < 1e-9);
        }
    }

    #[test]
    fn test_normalize_theta_subtracts_single_turn() {
        assert_eq!(normalize_theta(3.1419078128551523), -3.141277494324434);
        assert_eq!(normalize_theta(-3.1419078128551523), 3.141277494324434);
        let n = 20_000;
        for k in 1..n {
            let th = PI + 2.0 * PI * k as f64 / n as f64;
            assert_eq!(normalize_theta(th), th - 2.0 * PI, "{th}");
            assert_eq!(normalize_theta(-th), -th + 2.0 * PI, "{}", -th);
        }
        assert!(normalize_theta(f64::NAN).is_nan());
        assert_eq!(normalize_theta(f64::INFINITY), f64::INFINITY);
    }

    #[test]
    fn test_variant_names_parse() {
        for v in FitnessVariant::ALL {
            assert_eq!(v.name().parse::<FitnessVariant>().unwrap(), v);
        }
        assert_eq!(
            "cristos_twodee_fitness2".parse::<FitnessVariant>().unwrap(),
            FitnessVariant::Twodee2
        );
        assert!("fastest".parse::<FitnessVariant>().is_err());
        let v: FitnessVariant = serde_json::from_str("\"no_attitude_fitness\"").unwrap();
        assert_eq!(v, FitnessVariant::NoAttitudeFitness);
    }

    fn loaded_task(backend: Backend) -> FitnessTask {
        let shape = BatchShape::new(1, 2, 2);
        let mut t = FitnessTask::new("fitness", shape, backend, FitnessVariant::MinimalDistance, FitnessParams::default());
        for (i, item) in shape.iter().enumerate() {
            let f = i as f64;
            t.set_state(&item, &[0.03 * f, 0.01, 0.02 * f, -0.01 * f, 0.05 * f, 0.0]).unwrap();
            t.set_controller_outputs(&item, &[0.5, 0.5, 0.0]).unwrap();
            t.set_initial_distance(&item, 1.7).unwrap();
        }
        t.set_time(6.0);
        t.prepare_outputs().unwrap();
        t
    }

    #[test]
    fn test_launch_writes_records() {
        let mut t = loaded_task(Backend::Rayon);
        t.launch().unwrap();
        let item = DataItem::new(0, 1, 1);
        let rec = t.get_record(&item).unwrap();
        let f = 3.0;
        let o = TerminalOutcome::from_state(&[0.03 * f, 0.01, 0.02 * f, -0.01 * f, 0.05 * f, 0.0]);
        assert_eq!(rec[1], o.distance);
        assert_eq!(rec[2], o.speed);
        assert_eq!(rec[3], o.theta);
        let expected = MinimalDistance { params: FitnessParams::default() }.fitness(&o, 1.7, 6.0);
        assert_eq!(rec[0], expected);
    }

    #[test]
    fn test_item_time_overrides_task_time() {
        let mut a = loaded_task(Backend::Serial);
        let mut b = loaded_task(Backend::Serial);
        for item in a.task().shape().iter().collect::<Vec<_>>() {
            b.set_item_time(&item, 6.0).unwrap();
        }
        b.set_time(0.0);
        a.launch().unwrap();
        b.launch().unwrap();
        assert_eq!(
            a.task().outputs(FITNESS).unwrap().as_slice(),
            b.task().outputs(FITNESS).unwrap().as_slice()
        );
    }

    #[test]
    fn test_launch_without_initial_distance_fails() {
        let shape = BatchShape::new(1, 1, 1);
        let mut t = FitnessTask::new("fitness", shape, Backend::Serial, FitnessVariant::Twodee1, FitnessParams::default());
        let item = DataItem::point(0, 0);
        t.set_state(&item, &[0.0; STATE_WIDTH]).unwrap();
        t.set_controller_outputs(&item, &[0.0; CONTROLLER_OUTPUTS]).unwrap();
        t.prepare_outputs().unwrap();

        assert_eq!(t.launch().unwrap_err(), EngineError::missing("fitness", INITIAL_DISTANCE));
        assert!(t.get_fitness(&item).is_err());
    }

    #[test]
    fn test_serial_and_rayon_records_identical() {
        let mut a = loaded_task(Backend::Serial);
        let mut b = loaded_task(Backend::Rayon);
        a.launch().unwrap();
        b.launch().unwrap();
        assert_eq!(
            a.task().outputs(FITNESS).unwrap().as_slice(),
            b.task().outputs(FITNESS).unwrap().as_slice()
        );
    }
}
