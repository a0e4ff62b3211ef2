pub mod acceleration;
pub mod calculus;
pub mod config;
pub mod equation_engine;
pub mod error;
pub mod integrator;
pub mod lagrangian;
pub mod pendulum;
pub mod solvers;
/// The `pendulum_core` crate derives and integrates the equations of motion of a
/// planar double pendulum.
///
/// Key components:
/// - **Equation Engine**: `Expr` trees, a text parser and a bytecode VM for fast evaluation.
/// - **Calculus / Lagrangian**: symbolic differentiation and the Euler-Lagrange solve for the accelerations.
/// - **Solvers / Integrator**: tableau-driven Runge-Kutta steppers and an adaptive driver over a time grid.
/// - **Pendulum / Config**: the double-pendulum model, energy, positions and the `simulate` pipeline.
pub mod traits;

pub use config::{simulate, SimulationConfig};
pub use error::{SimulationError, SimulationResult};
pub use integrator::{IntegratorSettings, Method, TimeGrid};
pub use pendulum::{DoublePendulum, PhysicalConstants, StateVector, Trajectory, TrajectorySample};
