//! Run configuration, loadable from JSON.

use crate::error::{SimulationError, SimulationResult};
use crate::integrator::{IntegratorSettings, TimeGrid};
use crate::pendulum::{DoublePendulum, PhysicalConstants, StateVector, Trajectory};
use log::debug;
use serde::{Deserialize, Serialize};

/// Every input of one simulation run. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    pub g: f64,
    pub m1: f64,
    pub m2: f64,
    #[serde(rename = "L1")]
    pub l1: f64,
    #[serde(rename = "L2")]
    pub l2: f64,
    pub theta1_0: f64,
    pub omega1_0: f64,
    pub theta2_0: f64,
    pub omega2_0: f64,
    pub t_start: f64,
    pub t_end: f64,
    pub n_samples: usize,
    pub integrator: IntegratorSettings,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let constants = PhysicalConstants::default();
        Self {
            g: constants.g,
            m1: constants.m1,
            m2: constants.m2,
            l1: constants.l1,
            l2: constants.l2,
            theta1_0: 1.0,
            omega1_0: -3.0,
            theta2_0: -1.0,
            omega2_0: 5.0,
            t_start: 0.0,
            t_end: 40.0,
            n_samples: 1001,
            integrator: IntegratorSettings::default(),
        }
    }
}

impl SimulationConfig {
    pub fn from_json(text: &str) -> SimulationResult<Self> {
        serde_json::from_str(text).map_err(|e| SimulationError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> SimulationResult<()> {
        self.constants().validate()?;

        let initial = [
            ("theta1_0", self.theta1_0),
            ("omega1_0", self.omega1_0),
            ("theta2_0", self.theta2_0),
            ("omega2_0", self.omega2_0),
            ("t_start", self.t_start),
            ("t_end", self.t_end),
        ];
        if let Some((name, value)) = initial.iter().find(|(_, v)| !v.is_finite()) {
            return Err(SimulationError::InvalidConfig(format!(
                "{name} must be finite, got {value}"
            )));
        }

        if self.n_samples == 0 {
            return Err(SimulationError::InvalidConfig(
                "n_samples must be at least 1".to_string(),
            ));
        }
        if self.n_samples > 1 && self.t_end <= self.t_start {
            return Err(SimulationError::InvalidConfig(format!(
                "t_end ({}) must be greater than t_start ({})",
                self.t_end, self.t_start
            )));
        }

        self.integrator.validate()
    }

    pub fn constants(&self) -> PhysicalConstants {
        PhysicalConstants {
            g: self.g,
            m1: self.m1,
            m2: self.m2,
            l1: self.l1,
            l2: self.l2,
        }
    }

    pub fn initial_state(&self) -> StateVector {
        StateVector::new(self.theta1_0, self.omega1_0, self.theta2_0, self.omega2_0)
    }

    pub fn time_grid(&self) -> SimulationResult<TimeGrid> {
        TimeGrid::linspace(self.t_start, self.t_end, self.n_samples)
    }
}

/// Validates `config`, derives the model and integrates it.
pub fn simulate(config: &SimulationConfig) -> SimulationResult<Trajectory> {
    config.validate()?;
    let pendulum = DoublePendulum::derive()?;
    debug!("integrating {} samples with {}", config.n_samples, config.integrator.method);
    pendulum.simulate(
        &config.constants(),
        &config.initial_state(),
        &config.time_grid()?,
        &config.integrator,
    )
}
