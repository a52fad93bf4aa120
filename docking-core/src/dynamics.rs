//! Equations of motion.
//!
//! The docking system is a planar rigid body near a target in circular
//! orbit, described by Hill's equations in the rotating frame:
//!
//! ```text
//! state  = (x, vx, y, vy, theta, omega)
//! params = (ul, ur)            thrust of the left/right thruster
//!
//! dx/dt     = vx
//! dvx/dt    =  2 nu vy + 3 nu^2 x + (ul + ur) cos(theta)
//! dy/dt     = vy
//! dvy/dt    = -2 nu vx + (ul + ur) sin(theta)
//! dtheta/dt = omega
//! domega/dt = (ul - ur) / mR
//! ```

/// Widest state any stepper supports; steppers keep their stages on the stack.
pub const MAX_STATE_WIDTH: usize = 16;

pub const STATE_WIDTH: usize = 6;
pub const THRUSTER_COUNT: usize = 2;

/// Orbital rate of the target.
pub const NU: f64 = 0.08;
/// Mass times radius of the chaser.
pub const MASS_RADIUS: f64 = 1.5 * 0.5;

/// A continuous-time system `dx/dt = f(x, p, t)`.
///
/// `params` are per-candidate inputs held constant over one integration step
/// (for docking: the two thrust commands).
pub trait Dynamics: Send + Sync {
    fn name(&self) -> &'static str;

    fn state_width(&self) -> usize;

    fn param_count(&self) -> usize;

    fn derivative(&self, state: &[f64], params: &[f64], t: f64, dxdt: &mut [f64]);

    /// CUDA C body of
    /// `__device__ void derivative(const double* x, const double* p, double t, double* dxdt)`.
    fn device_source(&self) -> Option<&'static str> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HillEquations {
    pub nu: f64,
    pub mass_radius: f64,
}

impl Default for HillEquations {
    fn default() -> Self {
        HillEquations { nu: NU, mass_radius: MASS_RADIUS }
    }
}

impl Dynamics for HillEquations {
    fn name(&self) -> &'static str {
        "hill"
    }

    fn state_width(&self) -> usize {
        STATE_WIDTH
    }

    fn param_count(&self) -> usize {
        THRUSTER_COUNT
    }

    fn derivative(&self, state: &[f64], params: &[f64], _t: f64, dxdt: &mut [f64]) {
        let (x, vx, vy, theta, omega) = (state[0], state[1], state[3], state[4], state[5]);
        let (ul, ur) = (params[0], params[1]);
        let nu = self.nu;

        dxdt[0] = vx;
        dxdt[1] = 2.0 * nu * vy + 3.0 * nu * nu * x + (ul + ur) * theta.cos();
        dxdt[2] = vy;
        dxdt[3] = -2.0 * nu * vx + (ul + ur) * theta.sin();
        dxdt[4] = omega;
        dxdt[5] = (ul - ur) / self.mass_radius;
    }

    fn device_source(&self) -> Option<&'static str> {
        // Constants are baked in; a non-default system runs on the host.
        if *self == HillEquations::default() {
            Some(HILL_DEVICE_SRC)
        } else {
            None
        }
    }
}

const HILL_DEVICE_SRC: &str = r#"
#define HILL_NU 0.08
#define HILL_MASS_RADIUS 0.75

__device__ void derivative(const double* x, const double* p, double t, double* dxdt) {
    double ul = p[0], ur = p[1];
    dxdt[0] = x[1];
    dxdt[1] = 2.0 * HILL_NU * x[3] + 3.0 * HILL_NU * HILL_NU * x[0] + (ul + ur) * cos(x[4]);
    dxdt[2] = x[3];
    dxdt[3] = -2.0 * HILL_NU * x[1] + (ul + ur) * sin(x[4]);
    dxdt[4] = x[5];
    dxdt[5] = (ul - ur) / HILL_MASS_RADIUS;
}
"#;
