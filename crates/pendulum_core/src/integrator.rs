use crate::error::{SimulationError, SimulationResult};
use crate::solvers::RungeKutta;
use crate::traits::{DynamicalSystem, Steppable};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Adaptive Dormand-Prince 5(4).
    #[default]
    Dopri5,
    /// Fixed-step Tsitouras 5.
    Tsit5,
    /// Fixed-step classic Runge-Kutta 4.
    Rk4,
}

impl FromStr for Method {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dopri5" => Ok(Method::Dopri5),
            "tsit5" => Ok(Method::Tsit5),
            "rk4" => Ok(Method::Rk4),
            other => Err(SimulationError::InvalidConfig(format!(
                "unknown integration method \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Dopri5 => "dopri5",
            Method::Tsit5 => "tsit5",
            Method::Rk4 => "rk4",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorSettings {
    pub method: Method,
    pub rtol: f64,
    pub atol: f64,
    /// Upper bound on any step; the fixed step size for `tsit5` and `rk4`.
    pub max_step: f64,
    /// Step attempts allowed between two consecutive output times.
    pub max_steps: usize,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            method: Method::Dopri5,
            rtol: 1e-8,
            atol: 1e-10,
            max_step: 0.01,
            max_steps: 1_000_000,
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> SimulationResult<()> {
        if !(self.rtol > 0.0 && self.rtol.is_finite()) {
            return Err(SimulationError::InvalidConfig(format!(
                "rtol must be positive, got {}",
                self.rtol
            )));
        }
        if !(self.atol > 0.0 && self.atol.is_finite()) {
            return Err(SimulationError::InvalidConfig(format!(
                "atol must be positive, got {}",
                self.atol
            )));
        }
        if !(self.max_step > 0.0 && self.max_step.is_finite()) {
            return Err(SimulationError::InvalidConfig(format!(
                "max_step must be positive, got {}",
                self.max_step
            )));
        }
        if self.max_steps == 0 {
            return Err(SimulationError::InvalidConfig(
                "max_steps must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Strictly increasing output times.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeGrid {
    times: Vec<f64>,
}

impl TimeGrid {
    /// `samples` evenly spaced times from `start` to `end` inclusive.
    pub fn linspace(start: f64, end: f64, samples: usize) -> SimulationResult<Self> {
        if samples == 0 {
            return Err(SimulationError::InvalidConfig(
                "time grid needs at least one sample".to_string(),
            ));
        }
        if samples == 1 {
            return Self::from_times(vec![start]);
        }
        let step = (end - start) / (samples - 1) as f64;
        let mut times: Vec<f64> = (0..samples).map(|i| start + step * i as f64).collect();
        times[samples - 1] = end;
        Self::from_times(times)
    }

    pub fn from_times(times: Vec<f64>) -> SimulationResult<Self> {
        if times.is_empty() {
            return Err(SimulationError::InvalidConfig(
                "time grid needs at least one sample".to_string(),
            ));
        }
        if times.iter().any(|t| !t.is_finite()) {
            return Err(SimulationError::InvalidConfig(
                "time grid contains non-finite values".to_string(),
            ));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SimulationError::InvalidConfig(
                "time grid must be strictly increasing".to_string(),
            ));
        }
        Ok(Self { times })
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrationStats {
    pub accepted: usize,
    pub rejected: usize,
    pub evaluations: usize,
}

/// States at every grid time, stored row-major (`dim` values per sample).
#[derive(Debug, Clone)]
pub struct Solution {
    pub dim: usize,
    pub times: Vec<f64>,
    pub states: Vec<f64>,
    pub stats: IntegrationStats,
}

impl Solution {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn state(&self, index: usize) -> &[f64] {
        &self.states[index * self.dim..(index + 1) * self.dim]
    }
}

/// Integrates `system` from `initial` at `grid[0]` and records the state at
/// every grid time. Sample 0 is `initial` itself.
pub fn integrate<S: DynamicalSystem<f64>>(
    system: &S,
    initial: &[f64],
    grid: &TimeGrid,
    settings: &IntegratorSettings,
) -> SimulationResult<Solution> {
    settings.validate()?;
    let dim = system.dimension();
    if initial.len() != dim {
        return Err(SimulationError::InvalidConfig(format!(
            "initial state has {} components, system has {}",
            initial.len(),
            dim
        )));
    }

    let mut solver = match settings.method {
        Method::Dopri5 => RungeKutta::dopri5(dim),
        Method::Tsit5 => RungeKutta::tsit5(dim),
        Method::Rk4 => RungeKutta::rk4(dim),
    };

    let mut driver = Driver {
        settings,
        t: grid.times()[0],
        state: initial.to_vec(),
        stats: IntegrationStats::default(),
        interval_attempts: 0,
        warned_non_finite: false,
    };

    let mut states = Vec::with_capacity(grid.len() * dim);
    states.extend_from_slice(&driver.state);

    let mut extra_evaluations = 0;
    let mut proposal = settings.max_step;
    if solver.is_adaptive() && grid.len() > 1 {
        let order = solver.tableau().error_order;
        proposal = initial_step(system, driver.t, initial, order, settings);
        extra_evaluations = 2;
    }
    for &target in &grid.times()[1..] {
        driver.interval_attempts = 0;
        if solver.is_adaptive() {
            proposal = driver.adaptive_to(system, &mut solver, target, proposal)?;
        } else {
            driver.fixed_to(system, &mut solver, target)?;
        }
        states.extend_from_slice(&driver.state);
    }

    driver.stats.evaluations = solver.evaluations + extra_evaluations;
    debug!(
        "{}: {} samples, {} accepted, {} rejected, {} evaluations",
        settings.method,
        grid.len(),
        driver.stats.accepted,
        driver.stats.rejected,
        driver.stats.evaluations
    );

    Ok(Solution {
        dim,
        times: grid.times().to_vec(),
        states,
        stats: driver.stats,
    })
}

struct Driver<'a> {
    settings: &'a IntegratorSettings,
    t: f64,
    state: Vec<f64>,
    stats: IntegrationStats,
    interval_attempts: usize,
    warned_non_finite: bool,
}

impl Driver<'_> {
    fn count_attempt(&mut self) -> SimulationResult<()> {
        if self.interval_attempts >= self.settings.max_steps {
            return Err(SimulationError::Integration {
                t: self.t,
                reason: format!(
                    "exceeded {} steps before the next output time",
                    self.settings.max_steps
                ),
            });
        }
        self.interval_attempts += 1;
        Ok(())
    }

    fn reject(&mut self, proposal: f64) -> SimulationResult<()> {
        self.stats.rejected += 1;
        let floor = 16.0 * f64::EPSILON * self.t.abs().max(1.0);
        if proposal < floor {
            return Err(SimulationError::Integration {
                t: self.t,
                reason: format!("step size {proposal:e} fell below {floor:e}"),
            });
        }
        Ok(())
    }

    fn fixed_to<S: DynamicalSystem<f64>>(
        &mut self,
        system: &S,
        solver: &mut RungeKutta<f64>,
        target: f64,
    ) -> SimulationResult<()> {
        let span = target - self.t;
        let substeps = (span / self.settings.max_step).ceil().max(1.0) as usize;
        let dt = span / substeps as f64;
        for _ in 0..substeps {
            self.count_attempt()?;
            solver.step(system, &mut self.t, &mut self.state, dt);
            self.stats.accepted += 1;
        }
        self.t = target;
        Ok(())
    }

    /// Advances exactly to `target`; returns the step proposal for the next interval.
    fn adaptive_to<S: DynamicalSystem<f64>>(
        &mut self,
        system: &S,
        solver: &mut RungeKutta<f64>,
        target: f64,
        mut proposal: f64,
    ) -> SimulationResult<f64> {
        let exponent = -1.0 / f64::from(solver.tableau().error_order + 1);
        let rtol = self.settings.rtol;
        let atol = self.settings.atol;

        while self.t < target {
            self.count_attempt()?;
            let remaining = target - self.t;
            // Stretch slightly rather than leave a sliver before the target.
            let lands = remaining <= (proposal * 1.1).min(self.settings.max_step);
            let dt = if lands { remaining } else { proposal };

            solver.attempt(system, self.t, &self.state, dt);
            let err = solver.error_norm(&self.state, dt, rtol, atol);

            if !err.is_finite() {
                let degenerate = !self
                    .state
                    .iter()
                    .chain(solver.slope())
                    .all(|v| v.is_finite());
                if degenerate {
                    if !self.warned_non_finite {
                        warn!(
                            "non-finite state or derivative at t = {}; values propagate unchecked",
                            self.t
                        );
                        self.warned_non_finite = true;
                    }
                    self.commit(solver, dt, lands, target);
                } else {
                    // Finite start, overflowing stages: the step is too large.
                    proposal = dt * 0.2;
                    self.reject(proposal)?;
                }
                continue;
            }

            let factor = (0.9 * err.powf(exponent)).clamp(0.2, 5.0);
            if err <= 1.0 {
                self.commit(solver, dt, lands, target);
                let next = dt * factor;
                proposal = if lands { proposal.max(next) } else { next };
                proposal = proposal.min(self.settings.max_step);
            } else {
                proposal = dt * factor;
                self.reject(proposal)?;
            }
        }
        Ok(proposal)
    }

    fn commit(&mut self, solver: &mut RungeKutta<f64>, dt: f64, lands: bool, target: f64) {
        solver.accept(&mut self.t, &mut self.state, dt);
        if lands {
            self.t = target;
        }
        self.stats.accepted += 1;
    }
}

/// Starting step from the size of the state, its derivative and a trial
/// Euler step (Hairer, Norsett and Wanner, Solving ODEs I, II.4).
fn initial_step<S: DynamicalSystem<f64>>(
    system: &S,
    t0: f64,
    y0: &[f64],
    order: u32,
    settings: &IntegratorSettings,
) -> f64 {
    let scale: Vec<f64> = y0
        .iter()
        .map(|y| settings.atol + settings.rtol * y.abs())
        .collect();
    let rms = |values: &[f64]| {
        let sum: f64 = values.iter().zip(&scale).map(|(v, s)| (v / s).powi(2)).sum();
        (sum / values.len().max(1) as f64).sqrt()
    };

    let mut f0 = vec![0.0; y0.len()];
    system.apply(t0, y0, &mut f0);
    let d0 = rms(y0);
    let d1 = rms(&f0);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };
    let h0 = h0.min(settings.max_step);

    let y1: Vec<f64> = y0.iter().zip(&f0).map(|(y, f)| y + h0 * f).collect();
    let mut f1 = vec![0.0; y0.len()];
    system.apply(t0 + h0, &y1, &mut f1);
    let diff: Vec<f64> = f1.iter().zip(&f0).map(|(a, b)| a - b).collect();
    let d2 = rms(&diff) / h0;

    let dmax = d1.max(d2);
    let h1 = if dmax <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / dmax).powf(1.0 / f64::from(order + 1))
    };
    let h = (100.0 * h0).min(h1).min(settings.max_step);
    if h.is_finite() && h > 0.0 {
        h
    } else {
        settings.max_step
    }
}
