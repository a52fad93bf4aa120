//! Integrator stage: advance every item's state by one step of `dt`.
//!
//! A [`Stepper`] is the numerical scheme (RK4, explicit Euler), a
//! [`Dynamics`] the right-hand side; [`IntegratorTask`] applies the pair to
//! the `state` buffer in place, reading each item's `dynamical_inputs`.

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaDevice, LaunchAsync};
#[cfg(feature = "cuda")]
use std::sync::Arc;

use crate::backend::Backend;
use crate::batch::{BatchShape, DataItem};
use crate::dynamics::{Dynamics, MAX_STATE_WIDTH};
use crate::error::{EngineError, Result};
use crate::task::{SlotRole, SlotSpec, Stage, Task};

pub const STATE: &str = "state";
pub const DYNAMICAL_INPUTS: &str = "dynamical_inputs";

/// One explicit step of a fixed-step scheme.
pub trait Stepper: Send + Sync {
    fn name(&self) -> &'static str;

    /// Advances `state` in place from `t` to `t + dt` with `params` held fixed.
    fn step(&self, sys: &dyn Dynamics, state: &mut [f64], params: &[f64], t: f64, dt: f64);

    /// CUDA C body of `__device__ void step(double* x, const double* p, double t, double dt)`,
    /// written against `derivative` and `STATE_WIDTH`.
    fn device_source(&self) -> Option<&'static str> {
        None
    }
}

/// Classic 4th-order Runge-Kutta.
#[derive(Debug, Clone, Copy, Default)]
pub struct RungeKutta4;

impl Stepper for RungeKutta4 {
    fn name(&self) -> &'static str {
        "rk4"
    }

    fn step(&self, sys: &dyn Dynamics, state: &mut [f64], params: &[f64], t: f64, dt: f64) {
        let n = state.len();
        let mut k1 = [0.0; MAX_STATE_WIDTH];
        let mut k2 = [0.0; MAX_STATE_WIDTH];
        let mut k3 = [0.0; MAX_STATE_WIDTH];
        let mut k4 = [0.0; MAX_STATE_WIDTH];
        let mut tmp = [0.0; MAX_STATE_WIDTH];
        let half = dt / 2.0;

        sys.derivative(state, params, t, &mut k1[..n]);
        for i in 0..n {
            tmp[i] = state[i] + half * k1[i];
        }
        sys.derivative(&tmp[..n], params, t + half, &mut k2[..n]);
        for i in 0..n {
            tmp[i] = state[i] + half * k2[i];
        }
        sys.derivative(&tmp[..n], params, t + half, &mut k3[..n]);
        for i in 0..n {
            tmp[i] = state[i] + dt * k3[i];
        }
        sys.derivative(&tmp[..n], params, t + dt, &mut k4[..n]);
        for i in 0..n {
            state[i] += dt / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
        }
    }

    fn device_source(&self) -> Option<&'static str> {
        Some(RK4_DEVICE_SRC)
    }
}

const RK4_DEVICE_SRC: &str = r#"
__device__ void step(double* x, const double* p, double t, double dt) {
    double k1[STATE_WIDTH], k2[STATE_WIDTH], k3[STATE_WIDTH], k4[STATE_WIDTH], tmp[STATE_WIDTH];
    double half = dt / 2.0;
    derivative(x, p, t, k1);
    for (int i = 0; i < STATE_WIDTH; i++) tmp[i] = x[i] + half * k1[i];
    derivative(tmp, p, t + half, k2);
    for (int i = 0; i < STATE_WIDTH; i++) tmp[i] = x[i] + half * k2[i];
    derivative(tmp, p, t + half, k3);
    for (int i = 0; i < STATE_WIDTH; i++) tmp[i] = x[i] + dt * k3[i];
    derivative(tmp, p, t + dt, k4);
    for (int i = 0; i < STATE_WIDTH; i++)
        x[i] += dt / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
}
"#;

/// First-order explicit Euler. Cheap, used for quick sweeps and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitEuler;

impl Stepper for ExplicitEuler {
    fn name(&self) -> &'static str {
        "euler"
    }

    fn step(&self, sys: &dyn Dynamics, state: &mut [f64], params: &[f64], t: f64, dt: f64) {
        let n = state.len();
        let mut k = [0.0; MAX_STATE_WIDTH];
        sys.derivative(state, params, t, &mut k[..n]);
        for i in 0..n {
            state[i] += dt * k[i];
        }
    }

    fn device_source(&self) -> Option<&'static str> {
        Some(EULER_DEVICE_SRC)
    }
}

const EULER_DEVICE_SRC: &str = r#"
__device__ void step(double* x, const double* p, double t, double dt) {
    double k[STATE_WIDTH];
    derivative(x, p, t, k);
    for (int i = 0; i < STATE_WIDTH; i++) x[i] += dt * k[i];
}
"#;

/// Clamps `params` into `[-limit, limit]` when `limit > 0`.
pub fn apply_scale_limits(params: &mut [f64], limit: f64) {
    if limit > 0.0 {
        for p in params.iter_mut() {
            *p = p.clamp(-limit, limit);
        }
    }
}

#[cfg(feature = "cuda")]
const INTEGRATOR_KERNEL_TEMPLATE: &str = r#"
#define STATE_WIDTH {STATE_WIDTH}
#define PARAM_COUNT {PARAM_COUNT}

{DERIVATIVE}
{STEPPER}

extern "C" __global__ void integrate(
    double* state,
    const double* __restrict__ params,
    int n_items,
    double t,
    double dt,
    double scale_limits
) {
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= n_items) return;

    double p[PARAM_COUNT];
    for (int k = 0; k < PARAM_COUNT; k++) {
        double v = params[idx * PARAM_COUNT + k];
        if (scale_limits > 0.0) v = fmax(-scale_limits, fmin(scale_limits, v));
        p[k] = v;
    }
    step(&state[idx * STATE_WIDTH], p, t, dt);
}
"#;

pub struct IntegratorTask<S: Stepper, D: Dynamics> {
    task: Task,
    stepper: S,
    dynamics: D,
    t: f64,
    dt: f64,
    scale_limits: f64,
}

impl<S: Stepper, D: Dynamics> IntegratorTask<S, D> {
    pub fn new(name: &str, shape: BatchShape, backend: Backend, stepper: S, dynamics: D) -> Result<Self> {
        let width = dynamics.state_width();
        if width == 0 || width > MAX_STATE_WIDTH || dynamics.param_count() > MAX_STATE_WIDTH {
            return Err(EngineError::InvalidConfig(format!(
                "{}: state width {width} / {} params outside 1..={MAX_STATE_WIDTH}",
                dynamics.name(),
                dynamics.param_count()
            )));
        }
        let specs = vec![
            SlotSpec::new(STATE, width, SlotRole::InOut),
            SlotSpec::new(DYNAMICAL_INPUTS, dynamics.param_count(), SlotRole::Input),
        ];
        Ok(IntegratorTask {
            task: Task::new(name, shape, backend, specs),
            stepper,
            dynamics,
            t: 0.0,
            dt: 0.0,
            scale_limits: 0.0,
        })
    }

    pub fn set_state(&mut self, item: &DataItem, state: &[f64]) -> Result<()> {
        self.task.set_inputs(STATE, item, state)
    }

    pub fn set_dynamical_inputs(&mut self, item: &DataItem, params: &[f64]) -> Result<()> {
        self.task.set_inputs(DYNAMICAL_INPUTS, item, params)
    }

    pub fn get_state(&self, item: &DataItem) -> Result<&[f64]> {
        self.task.get_outputs(STATE, item)
    }

    /// Simulation time, step size and the optional thrust bound (`0` disables it).
    pub fn set_params(&mut self, t: f64, dt: f64, scale_limits: f64) {
        self.t = t;
        self.dt = dt;
        self.scale_limits = scale_limits;
    }

    pub fn state_width(&self) -> usize {
        self.dynamics.state_width()
    }

    fn launch_host(&mut self) -> Result<()> {
        let width = self.dynamics.state_width();
        let pc = self.dynamics.param_count();
        let (t, dt, limit) = (self.t, self.dt, self.scale_limits);

        let mut state = self.task.take(STATE)?;
        {
            let params = self.task.require(DYNAMICAL_INPUTS)?.as_slice();
            let stepper = &self.stepper;
            let dynamics = &self.dynamics;
            self.task.backend().map_items(state.as_mut_slice(), width, |i, x| {
                let mut p = [0.0; MAX_STATE_WIDTH];
                let p = &mut p[..pc];
                p.copy_from_slice(&params[i * pc..(i + 1) * pc]);
                apply_scale_limits(p, limit);
                stepper.step(dynamics, x, p, t, dt);
            });
        }
        self.task.restore(state)
    }

    #[cfg(feature = "cuda")]
    fn launch_device(&mut self, dev: &Arc<CudaDevice>) -> Result<bool> {
        use crate::backend::device;

        let (Some(deriv), Some(step)) = (self.dynamics.device_source(), self.stepper.device_source()) else {
            return Ok(false);
        };
        let stage = self.task.name().to_string();
        let src = INTEGRATOR_KERNEL_TEMPLATE
            .replace("{STATE_WIDTH}", &self.dynamics.state_width().to_string())
            .replace("{PARAM_COUNT}", &self.dynamics.param_count().to_string())
            .replace("{DERIVATIVE}", deriv)
            .replace("{STEPPER}", step);
        let module = format!("integrator_{}_{}", self.stepper.name(), self.dynamics.name());
        let f = device::kernel(dev, &stage, &module, &src, "integrate")?;

        let items = self.task.shape().items();
        let mut d_state = device::upload(dev, &stage, self.task.require(STATE)?.as_slice())?;
        let d_params = device::upload(dev, &stage, self.task.require(DYNAMICAL_INPUTS)?.as_slice())?;
        unsafe {
            f.launch(
                device::launch_config(items),
                (&mut d_state, &d_params, items as i32, self.t, self.dt, self.scale_limits),
            )
        }
        .map_err(|e| EngineError::backend(&stage, format!("launch failed: {e}")))?;
        let next = device::download(dev, &stage, &d_state)?;
        self.task.load_inputs(STATE, &next)?;
        Ok(true)
    }
}

impl<S: Stepper, D: Dynamics> Stage for IntegratorTask<S, D> {
    fn task(&self) -> &Task {
        &self.task
    }

    fn task_mut(&mut self) -> &mut Task {
        &mut self.task
    }

    /// The state buffer is updated in place; it only has to exist.
    fn prepare_outputs(&mut self) -> Result<()> {
        self.task.prepare_dataset(STATE)
    }

    fn launch(&mut self) -> Result<()> {
        self.task.begin_launch();
        self.task.require_all()?;
        if !(self.dt > 0.0) {
            return Err(EngineError::InvalidConfig(format!("step size must be positive, got {}", self.dt)));
        }

        #[cfg(feature = "cuda")]
        if let Backend::Cuda(dev) = self.task.backend().clone() {
            if self.launch_device(&dev).map_err(|e| {
                tracing::warn!(stage = %self.task.name(), "device launch failed: {e}");
                e
            })? {
                self.task.finish_launch();
                return Ok(());
            }
            tracing::debug!(stage = %self.task.name(), "no device kernel, stepping on host");
        }

        self.launch_host()?;
        tracing::trace!(stage = %self.task.name(), t = self.t, dt = self.dt, "integrated");
        self.task.finish_launch();
        Ok(())
    }
}
