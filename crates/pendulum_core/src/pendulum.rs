//! The planar double pendulum: two point masses on massless rigid links.
//!
//! `DoublePendulum::derive` runs the symbolic pipeline once; the result can
//! be reused for any number of runs with different constants and initial
//! conditions.

use crate::acceleration::AccelerationModel;
use crate::calculus::Coordinate;
use crate::equation_engine::{parse, EquationSystem, Expr};
use crate::error::{SimulationError, SimulationResult};
use crate::integrator::{integrate, IntegrationStats, IntegratorSettings, TimeGrid};
use crate::lagrangian::{EquationsOfMotion, MechanicalSystem, PointMass};
use log::debug;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Parameter order used by the compiled functions.
pub const PARAMETER_NAMES: [&str; 5] = ["g", "m1", "m2", "L1", "L2"];

const X1: &str = "L1 * sin(theta1)";
const Y1: &str = "-L1 * cos(theta1)";
const X2: &str = "L1 * sin(theta1) + L2 * sin(theta2)";
const Y2: &str = "-L1 * cos(theta1) - L2 * cos(theta2)";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalConstants {
    pub g: f64,
    pub m1: f64,
    pub m2: f64,
    #[serde(rename = "L1")]
    pub l1: f64,
    #[serde(rename = "L2")]
    pub l2: f64,
}

impl Default for PhysicalConstants {
    fn default() -> Self {
        Self {
            g: 9.81,
            m1: 2.0,
            m2: 1.0,
            l1: 2.0,
            l2: 1.0,
        }
    }
}

impl PhysicalConstants {
    pub fn validate(&self) -> SimulationResult<()> {
        for (name, value) in PARAMETER_NAMES.iter().zip(self.as_params()) {
            if !(value > 0.0 && value.is_finite()) {
                return Err(SimulationError::InvalidConfig(format!(
                    "{name} must be positive and finite, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Values in `PARAMETER_NAMES` order.
    pub fn as_params(&self) -> [f64; 5] {
        [self.g, self.m1, self.m2, self.l1, self.l2]
    }
}

/// `(θ1, ω1, θ2, ω2)`, the integrator's state layout.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StateVector {
    pub theta1: f64,
    pub omega1: f64,
    pub theta2: f64,
    pub omega2: f64,
}

impl StateVector {
    pub fn new(theta1: f64, omega1: f64, theta2: f64, omega2: f64) -> Self {
        Self {
            theta1,
            omega1,
            theta2,
            omega2,
        }
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.theta1, self.omega1, self.theta2, self.omega2]
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }
}

/// One row of simulation output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    pub t: f64,
    pub theta1: f64,
    pub omega1: f64,
    pub theta2: f64,
    pub omega2: f64,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl TrajectorySample {
    pub fn state(&self) -> StateVector {
        StateVector::new(self.theta1, self.omega1, self.theta2, self.omega2)
    }
}

/// Samples in grid order, plus solver statistics for the run.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub constants: PhysicalConstants,
    pub samples: Vec<TrajectorySample>,
    pub stats: IntegrationStats,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total mechanical energy at every sample.
    pub fn energies(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| energy(&self.constants, &s.state()))
            .collect()
    }
}

/// The two closed-form angular accelerations.
#[derive(Debug, Clone)]
pub struct AccelerationExpressions {
    pub alpha1: Expr,
    pub alpha2: Expr,
}

/// Derived and compiled double-pendulum model.
pub struct DoublePendulum {
    equations: EquationsOfMotion,
    model: AccelerationModel,
}

impl DoublePendulum {
    pub fn mechanical_system() -> SimulationResult<MechanicalSystem> {
        Ok(MechanicalSystem {
            coordinates: vec![
                Coordinate::new("theta1", "omega1", "alpha1"),
                Coordinate::new("theta2", "omega2", "alpha2"),
            ],
            masses: vec![
                PointMass::new("m1", parse(X1)?, parse(Y1)?),
                PointMass::new("m2", parse(X2)?, parse(Y2)?),
            ],
            gravity: "g".to_string(),
            time: "t".to_string(),
        })
    }

    pub fn derive() -> SimulationResult<Self> {
        let equations = Self::mechanical_system()?.derive()?;
        let params: Vec<String> = PARAMETER_NAMES.iter().map(|s| s.to_string()).collect();
        let model = AccelerationModel::compile(&equations, &params)?;
        debug!(
            "compiled accelerations: {} and {} ops",
            model.accelerations[0].bytecode.len(),
            model.accelerations[1].bytecode.len()
        );
        Ok(Self { equations, model })
    }

    pub fn equations(&self) -> &EquationsOfMotion {
        &self.equations
    }

    pub fn expressions(&self) -> AccelerationExpressions {
        AccelerationExpressions {
            alpha1: self.equations.accelerations[0].clone(),
            alpha2: self.equations.accelerations[1].clone(),
        }
    }

    /// `[α1, α2]` at time `t`. The expressions do not depend on `t`.
    ///
    /// Constants bind in `PARAMETER_NAMES` order and the state in the
    /// integrator layout `[θ1, ω1, θ2, ω2]`.
    pub fn angular_accelerations(
        &self,
        t: f64,
        constants: &PhysicalConstants,
        state: &StateVector,
    ) -> [f64; 2] {
        let params = constants.as_params();
        let state = state.to_array();
        let mut out = [0.0; 2];
        self.model.evaluate_into(t, &params, &state, &mut out);
        out
    }

    /// Acceleration `index` (0 for α1, 1 for α2) from flat arguments
    /// `[t, g, m1, m2, L1, L2, θ1, θ2, ω1, ω2]`; `None` for any other index.
    pub fn compiled_acceleration(&self, index: usize, args: &[f64; 10]) -> Option<f64> {
        let [t, g, m1, m2, l1, l2, theta1, theta2, omega1, omega2] = *args;
        self.model.evaluate(
            index,
            t,
            &[g, m1, m2, l1, l2],
            &[theta1, omega1, theta2, omega2],
        )
    }

    /// First-order system `[ω1, α1, ω2, α2]` for fixed constants.
    pub fn system(&self, constants: &PhysicalConstants) -> EquationSystem<f64> {
        self.model.first_order_system(constants.as_params().to_vec())
    }

    pub fn simulate(
        &self,
        constants: &PhysicalConstants,
        initial: &StateVector,
        grid: &TimeGrid,
        settings: &IntegratorSettings,
    ) -> SimulationResult<Trajectory> {
        constants.validate()?;
        let system = self.system(constants);
        let solution = integrate(&system, &initial.to_array(), grid, settings)?;

        let samples = (0..solution.len())
            .map(|i| {
                let state = StateVector::from_slice(solution.state(i));
                let [p1, p2] = positions(constants, state.theta1, state.theta2);
                TrajectorySample {
                    t: solution.times[i],
                    theta1: state.theta1,
                    omega1: state.omega1,
                    theta2: state.theta2,
                    omega2: state.omega2,
                    x1: p1.x,
                    y1: p1.y,
                    x2: p2.x,
                    y2: p2.y,
                }
            })
            .collect();

        Ok(Trajectory {
            constants: *constants,
            samples,
            stats: solution.stats,
        })
    }
}

/// Cartesian positions of both bobs, pivot at the origin, `y` up.
pub fn positions(constants: &PhysicalConstants, theta1: f64, theta2: f64) -> [Vector2<f64>; 2] {
    let first = Vector2::new(theta1.sin(), -theta1.cos()) * constants.l1;
    let second = first + Vector2::new(theta2.sin(), -theta2.cos()) * constants.l2;
    [first, second]
}

/// Kinetic plus potential energy, with zero potential at the pivot height.
pub fn energy(constants: &PhysicalConstants, state: &StateVector) -> f64 {
    let c = constants;
    let v1 = Vector2::new(state.theta1.cos(), state.theta1.sin()) * (c.l1 * state.omega1);
    let v2 = v1 + Vector2::new(state.theta2.cos(), state.theta2.sin()) * (c.l2 * state.omega2);
    let kinetic = 0.5 * c.m1 * v1.norm_squared() + 0.5 * c.m2 * v2.norm_squared();
    let [p1, p2] = positions(c, state.theta1, state.theta2);
    let potential = c.g * (c.m1 * p1.y + c.m2 * p2.y);
    kinetic + potential
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::f64::consts::PI;

    fn random_point(rng: &mut StdRng) -> (PhysicalConstants, StateVector) {
        let constants = PhysicalConstants {
            g: rng.random_range(1.0..20.0),
            m1: rng.random_range(0.5..3.0),
            m2: rng.random_range(0.5..3.0),
            l1: rng.random_range(0.5..3.0),
            l2: rng.random_range(0.5..3.0),
        };
        let state = StateVector::new(
            rng.random_range(-PI..PI),
            rng.random_range(-5.0..5.0),
            rng.random_range(-PI..PI),
            rng.random_range(-5.0..5.0),
        );
        (constants, state)
    }

    fn bindings(constants: &PhysicalConstants, state: &StateVector) -> HashMap<String, f64> {
        let mut map: HashMap<String, f64> = PARAMETER_NAMES
            .iter()
            .zip(constants.as_params())
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        map.insert("theta1".to_string(), state.theta1);
        map.insert("omega1".to_string(), state.omega1);
        map.insert("theta2".to_string(), state.theta2);
        map.insert("omega2".to_string(), state.omega2);
        map
    }

    fn textbook(c: &PhysicalConstants, s: &StateVector) -> [f64; 2] {
        let (m1, m2, g, l1, l2) = (c.m1, c.m2, c.g, c.l1, c.l2);
        let delta = s.theta1 - s.theta2;
        let den = 2.0 * m1 + m2 - m2 * (2.0 * delta).cos();
        let a1 = (-g * (2.0 * m1 + m2) * s.theta1.sin()
            - m2 * g * (s.theta1 - 2.0 * s.theta2).sin()
            - 2.0 * delta.sin() * m2 * (s.omega2.powi(2) * l2 + s.omega1.powi(2) * l1 * delta.cos()))
            / (l1 * den);
        let a2 = (2.0
            * delta.sin()
            * (s.omega1.powi(2) * l1 * (m1 + m2)
                + g * (m1 + m2) * s.theta1.cos()
                + s.omega2.powi(2) * l2 * m2 * delta.cos()))
            / (l2 * den);
        [a1, a2]
    }

    fn default_run(pendulum: &DoublePendulum) -> Trajectory {
        let grid = TimeGrid::linspace(0.0, 40.0, 1001).unwrap();
        pendulum
            .simulate(
                &PhysicalConstants::default(),
                &StateVector::new(1.0, -3.0, -1.0, 5.0),
                &grid,
                &IntegratorSettings::default(),
            )
            .unwrap()
    }

    #[test]
    fn accelerations_depend_only_on_state_and_constants() {
        let pendulum = DoublePendulum::derive().unwrap();
        let mut expected: Vec<String> = PARAMETER_NAMES.iter().map(|s| s.to_string()).collect();
        expected.extend(["omega1", "omega2", "theta1", "theta2"].map(String::from));
        expected.sort();
        assert_eq!(pendulum.equations().parameters(), expected);
    }

    #[test]
    fn flat_callables_take_angles_before_velocities() {
        let pendulum = DoublePendulum::derive().unwrap();
        let c = PhysicalConstants::default();
        let s = StateVector::new(0.4, -1.5, 1.1, 2.0);
        let args = [0.0, c.g, c.m1, c.m2, c.l1, c.l2, s.theta1, s.theta2, s.omega1, s.omega2];
        let grouped = pendulum.angular_accelerations(0.0, &c, &s);
        assert_eq!(pendulum.compiled_acceleration(0, &args), Some(grouped[0]));
        assert_eq!(pendulum.compiled_acceleration(1, &args), Some(grouped[1]));
        assert_eq!(pendulum.compiled_acceleration(2, &args), None);
        let expected = textbook(&c, &s);
        assert_relative_eq!(grouped[0], expected[0], epsilon = 1e-8, max_relative = 1e-9);
        assert_relative_eq!(grouped[1], expected[1], epsilon = 1e-8, max_relative = 1e-9);
    }

    #[test]
    fn derived_accelerations_match_textbook_formulas() {
        let pendulum = DoublePendulum::derive().unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let (constants, state) = random_point(&mut rng);
            let derived = pendulum.angular_accelerations(0.0, &constants, &state);
            let reference = textbook(&constants, &state);
            for k in 0..2 {
                assert_relative_eq!(derived[k], reference[k], epsilon = 1e-8, max_relative = 1e-9);
            }
        }
    }

    #[test]
    fn accelerations_solve_the_mass_matrix_equation() {
        let pendulum = DoublePendulum::derive().unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..25 {
            let (c, s) = random_point(&mut rng);
            let delta = s.theta1 - s.theta2;
            let coupling = c.m2 * c.l1 * c.l2 * delta.cos();
            let mass = Matrix2::new(
                (c.m1 + c.m2) * c.l1 * c.l1,
                coupling,
                coupling,
                c.m2 * c.l2 * c.l2,
            );
            let force = Vector2::new(
                -c.m2 * c.l1 * c.l2 * s.omega2.powi(2) * delta.sin()
                    - (c.m1 + c.m2) * c.g * c.l1 * s.theta1.sin(),
                c.m2 * c.l1 * c.l2 * s.omega1.powi(2) * delta.sin() - c.m2 * c.g * c.l2 * s.theta2.sin(),
            );
            let [a1, a2] = pendulum.angular_accelerations(0.0, &c, &s);
            let lhs = mass * Vector2::new(a1, a2);
            assert_relative_eq!(lhs, force, epsilon = 1e-8, max_relative = 1e-9);
        }
    }

    #[test]
    fn compiled_functions_agree_with_symbolic_evaluation() {
        let pendulum = DoublePendulum::derive().unwrap();
        let expressions = pendulum.expressions();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let (constants, state) = random_point(&mut rng);
            let at = bindings(&constants, &state);
            let compiled = pendulum.angular_accelerations(0.0, &constants, &state);
            let symbolic = [
                expressions.alpha1.evaluate(&at).unwrap(),
                expressions.alpha2.evaluate(&at).unwrap(),
            ];
            for k in 0..2 {
                assert_relative_eq!(compiled[k], symbolic[k], epsilon = 1e-12, max_relative = 1e-9);
            }
        }
    }

    #[test]
    fn back_substitution_satisfies_euler_lagrange_equations() {
        let pendulum = DoublePendulum::derive().unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let (constants, state) = random_point(&mut rng);
            let residuals = pendulum
                .equations()
                .residuals(&bindings(&constants, &state))
                .unwrap();
            for residual in residuals {
                assert!(residual.abs() < 1e-8, "residual {residual}");
            }
        }
    }

    #[test]
    fn energy_is_conserved_over_default_run() {
        let pendulum = DoublePendulum::derive().unwrap();
        let trajectory = default_run(&pendulum);
        let energies = trajectory.energies();
        assert_relative_eq!(energies[0], 41.88, max_relative = 1e-3);
        let drift = energies
            .iter()
            .map(|e| (e - energies[0]).abs())
            .fold(0.0, f64::max);
        assert!(drift < 0.01 * energies[0].abs(), "energy drift {drift}");
    }

    #[test]
    fn fast_spin_with_loose_step_cap_stays_finite() {
        let pendulum = DoublePendulum::derive().unwrap();
        let grid = TimeGrid::linspace(0.0, 2.0, 11).unwrap();
        let settings = IntegratorSettings {
            max_step: 1000.0,
            ..IntegratorSettings::default()
        };
        let trajectory = pendulum
            .simulate(
                &PhysicalConstants::default(),
                &StateVector::new(1.0, -300.0, -1.0, 500.0),
                &grid,
                &settings,
            )
            .unwrap();
        for sample in &trajectory.samples {
            assert!(sample.state().to_array().iter().all(|v| v.is_finite()), "t = {}", sample.t);
        }
        let energies = trajectory.energies();
        let drift = energies
            .iter()
            .map(|e| (e - energies[0]).abs())
            .fold(0.0, f64::max);
        assert!(drift < 0.01 * energies[0].abs(), "energy drift {drift}");
    }

    #[test]
    fn default_run_is_reproducible() {
        let pendulum = DoublePendulum::derive().unwrap();
        let first = default_run(&pendulum);
        let second = default_run(&DoublePendulum::derive().unwrap());
        assert_eq!(first.len(), 1001);
        assert_eq!(first.stats, second.stats);
        for (a, b) in first.samples.iter().zip(&second.samples) {
            assert_eq!(a.t.to_bits(), b.t.to_bits());
            for (x, y) in a.state().to_array().iter().zip(b.state().to_array()) {
                assert_eq!(x.to_bits(), y.to_bits());
            }
        }
    }

    #[test]
    fn hanging_rest_is_a_fixed_point() {
        let pendulum = DoublePendulum::derive().unwrap();
        let constants = PhysicalConstants {
            g: 9.81,
            m1: 1.0,
            m2: 1.0,
            l1: 1.0,
            l2: 1.0,
        };
        let grid = TimeGrid::linspace(0.0, 10.0, 101).unwrap();
        let trajectory = pendulum
            .simulate(
                &constants,
                &StateVector::default(),
                &grid,
                &IntegratorSettings::default(),
            )
            .unwrap();
        for sample in &trajectory.samples {
            assert_eq!(sample.state().to_array(), [0.0; 4]);
            assert_eq!((sample.x2, sample.y2), (0.0, -2.0));
        }
    }

    #[test]
    fn samples_follow_grid_and_geometry() {
        let pendulum = DoublePendulum::derive().unwrap();
        let constants = PhysicalConstants::default();
        let grid = TimeGrid::from_times(vec![0.0, 0.25, 0.3, 1.0]).unwrap();
        let initial = StateVector::new(0.4, 0.0, -0.2, 0.1);
        let trajectory = pendulum
            .simulate(&constants, &initial, &grid, &IntegratorSettings::default())
            .unwrap();

        assert_eq!(trajectory.samples[0].state(), initial);
        for (sample, &t) in trajectory.samples.iter().zip(grid.times()) {
            assert_eq!(sample.t, t);
            let x1 = constants.l1 * sample.theta1.sin();
            let y1 = -constants.l1 * sample.theta1.cos();
            assert_relative_eq!(sample.x1, x1, epsilon = 1e-15);
            assert_relative_eq!(sample.y1, y1, epsilon = 1e-15);
            assert_relative_eq!(sample.x2, x1 + constants.l2 * sample.theta2.sin(), epsilon = 1e-15);
            assert_relative_eq!(sample.y2, y1 - constants.l2 * sample.theta2.cos(), epsilon = 1e-15);
        }
    }

    #[test]
    fn non_positive_constants_are_rejected() {
        let pendulum = DoublePendulum::derive().unwrap();
        let constants = PhysicalConstants {
            m2: 0.0,
            ..PhysicalConstants::default()
        };
        let grid = TimeGrid::linspace(0.0, 1.0, 2).unwrap();
        let err = pendulum
            .simulate(&constants, &StateVector::default(), &grid, &IntegratorSettings::default())
            .unwrap_err();
        assert!(err.to_string().contains("m2 must be positive"));
    }
}
