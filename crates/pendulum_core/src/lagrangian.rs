//! Equations of motion from a Lagrangian.
//!
//! A `MechanicalSystem` is a set of point masses whose Cartesian positions
//! are expressions in generalized coordinates. `derive` builds `L = T - V`,
//! applies the Euler-Lagrange operator to every coordinate and solves the
//! resulting equations for the accelerations in closed form.

use crate::calculus::{time_derivative, Coordinate};
use crate::equation_engine::Expr;
use crate::error::{SimulationError, SimulationResult};
use log::debug;
use std::collections::{BTreeSet, HashMap};

/// A point mass with symbolic Cartesian position.
#[derive(Debug, Clone)]
pub struct PointMass {
    pub mass: String,
    pub x: Expr,
    pub y: Expr,
}

impl PointMass {
    pub fn new(mass: &str, x: Expr, y: Expr) -> Self {
        Self {
            mass: mass.to_string(),
            x,
            y,
        }
    }
}

/// Point masses in a uniform gravity field pointing along `-y`.
#[derive(Debug, Clone)]
pub struct MechanicalSystem {
    pub coordinates: Vec<Coordinate>,
    pub masses: Vec<PointMass>,
    pub gravity: String,
    pub time: String,
}

/// Euler-Lagrange equations and their solution for the accelerations.
#[derive(Debug, Clone)]
pub struct EquationsOfMotion {
    pub coordinates: Vec<Coordinate>,
    pub lagrangian: Expr,
    /// `E_k = ∂L/∂q_k - d/dt(∂L/∂q'_k)`; the motion satisfies `E_k = 0`.
    pub equations: Vec<Expr>,
    /// Closed-form `q''_k`, one per coordinate, free of accelerations and time.
    pub accelerations: Vec<Expr>,
}

impl MechanicalSystem {
    pub fn kinetic_energy(&self) -> SimulationResult<Expr> {
        let mut total = Expr::num(0.0);
        for body in &self.masses {
            let vx = time_derivative(&body.x, &self.coordinates, &self.time)?;
            let vy = time_derivative(&body.y, &self.coordinates, &self.time)?;
            let speed_sq = vx.powi(2) + vy.powi(2);
            total = total + Expr::num(0.5) * Expr::var(&body.mass) * speed_sq;
        }
        Ok(total.simplify())
    }

    pub fn potential_energy(&self) -> Expr {
        let mut total = Expr::num(0.0);
        for body in &self.masses {
            total = total + Expr::var(&body.mass) * Expr::var(&self.gravity) * body.y.clone();
        }
        total.simplify()
    }

    pub fn lagrangian(&self) -> SimulationResult<Expr> {
        Ok((self.kinetic_energy()? - self.potential_energy()).simplify())
    }

    /// One Euler-Lagrange expression per generalized coordinate.
    pub fn euler_lagrange(&self, lagrangian: &Expr) -> SimulationResult<Vec<Expr>> {
        self.coordinates
            .iter()
            .map(|coord| {
                let generalized_force = lagrangian.diff(&coord.position)?;
                let momentum = lagrangian.diff(&coord.velocity)?;
                let momentum_rate = time_derivative(&momentum, &self.coordinates, &self.time)?;
                Ok((generalized_force - momentum_rate).simplify())
            })
            .collect()
    }

    /// Derives the equations of motion and solves them for the accelerations.
    pub fn derive(&self) -> SimulationResult<EquationsOfMotion> {
        if self.coordinates.len() != 2 {
            return Err(SimulationError::Derivation(format!(
                "closed-form solve needs exactly two coordinates, got {}",
                self.coordinates.len()
            )));
        }

        let lagrangian = self.lagrangian()?;
        let equations = self.euler_lagrange(&lagrangian)?;
        let accelerations = self.solve_linear(&equations)?;

        for (coord, accel) in self.coordinates.iter().zip(&accelerations) {
            if accel.depends_on(&self.time) {
                return Err(SimulationError::Derivation(format!(
                    "acceleration of {} depends explicitly on {}",
                    coord.position, self.time
                )));
            }
            debug!(
                "derived {} with {} nodes",
                coord.acceleration,
                accel.size()
            );
        }

        let eom = EquationsOfMotion {
            coordinates: self.coordinates.clone(),
            lagrangian,
            equations,
            accelerations,
        };
        eom.check_sample_residuals()?;
        Ok(eom)
    }

    /// Writes `E_k = Σ_j A_kj q''_j + b_k` and applies Cramer's rule to `A x = -b`.
    fn solve_linear(&self, equations: &[Expr]) -> SimulationResult<Vec<Expr>> {
        let mut matrix = Vec::with_capacity(4);
        let mut rhs = Vec::with_capacity(2);
        for equation in equations {
            for coord in &self.coordinates {
                let coefficient = equation.diff(&coord.acceleration)?;
                if let Some(acc) = self
                    .coordinates
                    .iter()
                    .find(|c| coefficient.depends_on(&c.acceleration))
                {
                    return Err(SimulationError::Derivation(format!(
                        "equations are not linear in {}",
                        acc.acceleration
                    )));
                }
                matrix.push(coefficient);
            }
            let mut remainder = equation.clone();
            for coord in &self.coordinates {
                remainder = remainder.substitute(&coord.acceleration, &Expr::num(0.0));
            }
            rhs.push(remainder.simplify());
        }

        let (a11, a12, a21, a22) = (&matrix[0], &matrix[1], &matrix[2], &matrix[3]);
        let (b1, b2) = (&rhs[0], &rhs[1]);
        let det = (a11.clone() * a22.clone() - a12.clone() * a21.clone()).simplify();
        if det.is_number(0.0) {
            return Err(SimulationError::Derivation(
                "coefficient matrix of the accelerations is singular".to_string(),
            ));
        }

        let first = ((a12.clone() * b2.clone() - a22.clone() * b1.clone()) / det.clone()).simplify();
        let second = ((a21.clone() * b1.clone() - a11.clone() * b2.clone()) / det).simplify();
        Ok(vec![first, second])
    }
}

impl EquationsOfMotion {
    /// Euler-Lagrange expressions with the solved accelerations substituted back in.
    /// Each one vanishes identically when the solution is correct.
    pub fn back_substituted(&self) -> Vec<Expr> {
        self.equations
            .iter()
            .map(|equation| {
                self.coordinates
                    .iter()
                    .zip(&self.accelerations)
                    .fold(equation.clone(), |acc, (coord, solution)| {
                        acc.substitute(&coord.acceleration, solution)
                    })
            })
            .collect()
    }

    /// Evaluates the back-substituted equations at `bindings`.
    pub fn residuals(&self, bindings: &HashMap<String, f64>) -> SimulationResult<Vec<f64>> {
        self.back_substituted()
            .iter()
            .map(|expr| expr.evaluate(bindings))
            .collect()
    }

    /// Symbols the accelerations depend on, sorted.
    pub fn parameters(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for accel in &self.accelerations {
            names.extend(accel.symbols());
        }
        names.into_iter().collect()
    }

    fn check_sample_residuals(&self) -> SimulationResult<()> {
        let mut symbols = BTreeSet::new();
        for equation in &self.equations {
            symbols.extend(equation.symbols());
        }
        for coord in &self.coordinates {
            symbols.remove(&coord.acceleration);
        }
        for point in 0..3 {
            let bindings: HashMap<String, f64> = symbols
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), 0.7 + 0.3 * i as f64 + 0.45 * point as f64))
                .collect();
            let mut scaled = bindings.clone();
            for coord in &self.coordinates {
                scaled.insert(coord.acceleration.clone(), 0.0);
            }
            for (k, residual) in self.residuals(&bindings)?.into_iter().enumerate() {
                let scale = 1.0 + self.equations[k].evaluate(&scaled)?.abs();
                if !(residual.abs() <= 1e-8 * scale) {
                    return Err(SimulationError::Derivation(format!(
                        "solution does not satisfy equation {k} (residual {residual:e})"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;

    fn single_pendulum() -> MechanicalSystem {
        MechanicalSystem {
            coordinates: vec![Coordinate::new("theta", "omega", "alpha")],
            masses: vec![PointMass::new(
                "m",
                parse("L * sin(theta)").unwrap(),
                parse("-L * cos(theta)").unwrap(),
            )],
            gravity: "g".to_string(),
            time: "t".to_string(),
        }
    }

    fn two_free_masses() -> MechanicalSystem {
        // Two decoupled particles on a line under gravity.
        MechanicalSystem {
            coordinates: vec![
                Coordinate::new("p", "pdot", "pddot"),
                Coordinate::new("q", "qdot", "qddot"),
            ],
            masses: vec![
                PointMass::new("ma", Expr::num(0.0), Expr::var("p")),
                PointMass::new("mb", Expr::num(0.0), Expr::var("q")),
            ],
            gravity: "g".to_string(),
            time: "t".to_string(),
        }
    }

    #[test]
    fn single_pendulum_euler_lagrange_matches_textbook() {
        let system = single_pendulum();
        let lagrangian = system.lagrangian().unwrap();
        let equations = system.euler_lagrange(&lagrangian).unwrap();
        assert_eq!(equations.len(), 1);
        // E = -m g L sin(theta) - m L^2 alpha
        let at: HashMap<String, f64> = [
            ("m", 1.5),
            ("L", 0.8),
            ("g", 9.81),
            ("theta", 0.3),
            ("omega", 2.0),
            ("alpha", -0.7),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let expected = -1.5 * 9.81 * 0.8 * 0.3_f64.sin() - 1.5 * 0.8 * 0.8 * -0.7;
        let value = equations[0].evaluate(&at).unwrap();
        assert!((value - expected).abs() < 1e-12);
    }

    #[test]
    fn derive_requires_two_coordinates() {
        let err = single_pendulum().derive().unwrap_err();
        assert!(matches!(err, SimulationError::Derivation(msg) if msg.contains("two coordinates")));
    }

    #[test]
    fn free_fall_accelerations_are_minus_g() {
        let eom = two_free_masses().derive().unwrap();
        let at: HashMap<String, f64> = [("g", 9.81), ("ma", 2.0), ("mb", 3.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        for accel in &eom.accelerations {
            assert!((accel.evaluate(&at).unwrap() + 9.81).abs() < 1e-12);
        }
    }

    #[test]
    fn singular_system_is_a_derivation_failure() {
        // Second coordinate never enters the kinetic energy.
        let mut system = two_free_masses();
        system.masses[1] = PointMass::new("mb", Expr::num(0.0), Expr::num(1.0));
        let err = system.derive().unwrap_err();
        assert!(matches!(err, SimulationError::Derivation(msg) if msg.contains("singular")));
    }
}
