//! Compiles closed-form accelerations into VM bytecode.

use crate::equation_engine::{Bytecode, Compiler, EquationSystem, Expr, VM};
use crate::error::SimulationResult;
use crate::lagrangian::EquationsOfMotion;
use std::cell::RefCell;

/// One acceleration expression and its bytecode.
#[derive(Debug, Clone)]
pub struct CompiledAcceleration {
    pub expression: Expr,
    pub bytecode: Bytecode,
}

/// Numeric accelerations for a set of equations of motion.
///
/// The state layout interleaves each coordinate with its velocity, e.g.
/// `[theta1, omega1, theta2, omega2]`; parameters follow `param_names`.
pub struct AccelerationModel {
    pub state_names: Vec<String>,
    pub param_names: Vec<String>,
    pub accelerations: Vec<CompiledAcceleration>,
    velocity_codes: Vec<Bytecode>,
    stack: RefCell<Vec<f64>>,
}

impl AccelerationModel {
    pub fn compile(eom: &EquationsOfMotion, param_names: &[String]) -> SimulationResult<Self> {
        let state_names: Vec<String> = eom
            .coordinates
            .iter()
            .flat_map(|c| [c.position.clone(), c.velocity.clone()])
            .collect();
        let compiler = Compiler::new(&state_names, param_names);

        let accelerations = eom
            .accelerations
            .iter()
            .map(|expr| {
                Ok(CompiledAcceleration {
                    expression: expr.clone(),
                    bytecode: compiler.compile(expr)?,
                })
            })
            .collect::<SimulationResult<Vec<_>>>()?;
        let velocity_codes = eom
            .coordinates
            .iter()
            .map(|c| compiler.compile(&Expr::var(&c.velocity)))
            .collect::<SimulationResult<Vec<_>>>()?;

        Ok(Self {
            state_names,
            param_names: param_names.to_vec(),
            accelerations,
            velocity_codes,
            stack: RefCell::new(Vec::with_capacity(64)),
        })
    }

    /// Evaluates acceleration `index`, or `None` past the last coordinate.
    ///
    /// `params` follows `param_names` and `state` follows `state_names`.
    /// `_t` is accepted for signature parity with time-dependent systems;
    /// the compiled expressions never read it.
    pub fn evaluate(&self, index: usize, _t: f64, params: &[f64], state: &[f64]) -> Option<f64> {
        let accel = self.accelerations.get(index)?;
        let mut stack = self.stack.borrow_mut();
        Some(VM::execute(&accel.bytecode, state, params, &mut stack))
    }

    /// Writes every acceleration into `out`, one per coordinate.
    pub fn evaluate_into(&self, _t: f64, params: &[f64], state: &[f64], out: &mut [f64]) {
        let mut stack = self.stack.borrow_mut();
        for (slot, accel) in out.iter_mut().zip(&self.accelerations) {
            *slot = VM::execute(&accel.bytecode, state, params, &mut stack);
        }
    }

    /// First-order system `[q1' = v1, v1' = a1, q2' = v2, v2' = a2, ...]`.
    pub fn first_order_system(&self, params: Vec<f64>) -> EquationSystem<f64> {
        let equations = self
            .velocity_codes
            .iter()
            .zip(&self.accelerations)
            .flat_map(|(velocity, accel)| [velocity.clone(), accel.bytecode.clone()])
            .collect();
        EquationSystem::new(equations, params)
    }
}
