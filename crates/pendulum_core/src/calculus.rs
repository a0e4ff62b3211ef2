//! Symbolic differentiation, simplification and substitution over `Expr`.
//!
//! Simplification only folds constants and removes the usual identities
//! (`x + 0`, `x * 1`, `x * 0`, `x ^ 1`, `--x`, `x - x`). No canonical form
//! is attempted.

use crate::equation_engine::{pow as numeric_pow, Expr};
use crate::error::{SimulationError, SimulationResult};
use std::collections::{BTreeSet, HashMap};

/// A generalized coordinate together with the symbols naming its first and
/// second time derivatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordinate {
    pub position: String,
    pub velocity: String,
    pub acceleration: String,
}

impl Coordinate {
    pub fn new(position: &str, velocity: &str, acceleration: &str) -> Self {
        Self {
            position: position.to_string(),
            velocity: velocity.to_string(),
            acceleration: acceleration.to_string(),
        }
    }
}

impl Expr {
    /// Partial derivative with respect to `var`, simplified on the way up.
    pub fn diff(&self, var: &str) -> SimulationResult<Expr> {
        if !self.depends_on(var) {
            return Ok(Expr::Number(0.0));
        }
        let derivative = match self {
            Expr::Number(_) => Expr::Number(0.0),
            Expr::Variable(name) => Expr::Number(if name == var { 1.0 } else { 0.0 }),
            Expr::Binary(a, op, b) => {
                let da = a.diff(var)?;
                let db = b.diff(var)?;
                let (a, b) = (a.as_ref().clone(), b.as_ref().clone());
                match op {
                    '+' => add(da, db),
                    '-' => sub(da, db),
                    '*' => add(mul(da, b), mul(a, db)),
                    '/' => div(
                        sub(mul(da, b.clone()), mul(a, db)),
                        power(b, Expr::Number(2.0)),
                    ),
                    '^' => {
                        if !b.depends_on(var) {
                            let reduced = sub(b.clone(), Expr::Number(1.0));
                            mul(mul(b, power(a, reduced)), da)
                        } else {
                            let log_term = mul(db, call("ln", a.clone()));
                            let ratio = div(mul(b.clone(), da), a.clone());
                            mul(power(a, b), add(log_term, ratio))
                        }
                    }
                    _ => {
                        return Err(SimulationError::Parse(format!(
                            "Unknown binary operator: {op}"
                        )))
                    }
                }
            }
            Expr::Unary(op, operand) => match op {
                '-' => neg(operand.diff(var)?),
                _ => {
                    return Err(SimulationError::Parse(format!(
                        "Unknown unary operator: {op}"
                    )))
                }
            },
            Expr::Call(func, arg) => {
                let inner = arg.diff(var)?;
                let arg = arg.as_ref().clone();
                match func.as_str() {
                    "sin" => mul(call("cos", arg), inner),
                    "cos" => neg(mul(call("sin", arg), inner)),
                    "exp" => mul(call("exp", arg), inner),
                    "ln" => div(inner, arg),
                    _ => return Err(SimulationError::UnknownFunction(func.clone())),
                }
            }
        };
        Ok(derivative)
    }

    /// Rebuilds the tree bottom-up through the simplifying constructors.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Number(_) | Expr::Variable(_) => self.clone(),
            Expr::Binary(a, op, b) => {
                let (a, b) = (a.simplify(), b.simplify());
                match op {
                    '+' => add(a, b),
                    '-' => sub(a, b),
                    '*' => mul(a, b),
                    '/' => div(a, b),
                    '^' => power(a, b),
                    _ => Expr::Binary(Box::new(a), *op, Box::new(b)),
                }
            }
            Expr::Unary('-', operand) => neg(operand.simplify()),
            Expr::Unary(op, operand) => Expr::Unary(*op, Box::new(operand.simplify())),
            Expr::Call(func, arg) => call(func, arg.simplify()),
        }
    }

    /// Replaces every occurrence of `var` with `replacement`.
    pub fn substitute(&self, var: &str, replacement: &Expr) -> Expr {
        match self {
            Expr::Variable(name) if name == var => replacement.clone(),
            Expr::Number(_) | Expr::Variable(_) => self.clone(),
            Expr::Binary(a, op, b) => Expr::Binary(
                Box::new(a.substitute(var, replacement)),
                *op,
                Box::new(b.substitute(var, replacement)),
            ),
            Expr::Unary(op, operand) => {
                Expr::Unary(*op, Box::new(operand.substitute(var, replacement)))
            }
            Expr::Call(func, arg) => {
                Expr::Call(func.clone(), Box::new(arg.substitute(var, replacement)))
            }
        }
    }

    /// Evaluates the tree directly, looking every symbol up in `bindings`.
    pub fn evaluate(&self, bindings: &HashMap<String, f64>) -> SimulationResult<f64> {
        let value = match self {
            Expr::Number(n) => *n,
            Expr::Variable(name) => *bindings
                .get(name)
                .ok_or_else(|| SimulationError::UnknownSymbol(name.clone()))?,
            Expr::Binary(a, op, b) => {
                let a = a.evaluate(bindings)?;
                let b = b.evaluate(bindings)?;
                match op {
                    '+' => a + b,
                    '-' => a - b,
                    '*' => a * b,
                    '/' => a / b,
                    '^' => numeric_pow(a, b),
                    _ => {
                        return Err(SimulationError::Parse(format!(
                            "Unknown binary operator: {op}"
                        )))
                    }
                }
            }
            Expr::Unary('-', operand) => -operand.evaluate(bindings)?,
            Expr::Unary(op, _) => {
                return Err(SimulationError::Parse(format!(
                    "Unknown unary operator: {op}"
                )))
            }
            Expr::Call(func, arg) => {
                let x = arg.evaluate(bindings)?;
                match func.as_str() {
                    "sin" => x.sin(),
                    "cos" => x.cos(),
                    "exp" => x.exp(),
                    "ln" => x.ln(),
                    _ => return Err(SimulationError::UnknownFunction(func.clone())),
                }
            }
        };
        Ok(value)
    }

    pub fn depends_on(&self, var: &str) -> bool {
        match self {
            Expr::Number(_) => false,
            Expr::Variable(name) => name == var,
            Expr::Binary(a, _, b) => a.depends_on(var) || b.depends_on(var),
            Expr::Unary(_, operand) | Expr::Call(_, operand) => operand.depends_on(var),
        }
    }

    /// All symbol names appearing in the tree, sorted.
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                out.insert(name.clone());
            }
            Expr::Binary(a, _, b) => {
                a.collect_symbols(out);
                b.collect_symbols(out);
            }
            Expr::Unary(_, operand) | Expr::Call(_, operand) => operand.collect_symbols(out),
        }
    }
}

/// Total derivative along a trajectory:
/// `df/dt = ∂f/∂t + Σ (∂f/∂q · q' + ∂f/∂q' · q'')`.
pub fn time_derivative(expr: &Expr, coordinates: &[Coordinate], time: &str) -> SimulationResult<Expr> {
    let mut total = expr.diff(time)?;
    for coord in coordinates {
        let along_position = mul(expr.diff(&coord.position)?, Expr::var(&coord.velocity));
        let along_velocity = mul(expr.diff(&coord.velocity)?, Expr::var(&coord.acceleration));
        total = add(total, add(along_position, along_velocity));
    }
    Ok(total)
}

// --- Simplifying constructors ---

fn add(a: Expr, b: Expr) -> Expr {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Expr::Number(x + y),
        (Some(x), _) if x == 0.0 => b,
        (_, Some(y)) if y == 0.0 => a,
        _ => match b {
            Expr::Unary('-', inner) => sub(a, *inner),
            _ => a + b,
        },
    }
}

fn sub(a: Expr, b: Expr) -> Expr {
    if a == b {
        return Expr::Number(0.0);
    }
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Expr::Number(x - y),
        (Some(x), _) if x == 0.0 => neg(b),
        (_, Some(y)) if y == 0.0 => a,
        _ => match b {
            Expr::Unary('-', inner) => add(a, *inner),
            _ => a - b,
        },
    }
}

fn mul(a: Expr, b: Expr) -> Expr {
    if a.is_number(0.0) || b.is_number(0.0) {
        return Expr::Number(0.0);
    }
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => return Expr::Number(x * y),
        (Some(x), _) if x == 1.0 => return b,
        (_, Some(y)) if y == 1.0 => return a,
        (Some(x), _) if x == -1.0 => return neg(b),
        (_, Some(y)) if y == -1.0 => return neg(a),
        // Constants go to the left.
        (None, Some(_)) => return mul(b, a),
        _ => {}
    }
    match (a, b) {
        (Expr::Unary('-', x), b) => neg(mul(*x, b)),
        (a, Expr::Unary('-', y)) => neg(mul(a, *y)),
        (Expr::Number(x), Expr::Binary(inner_a, '*', inner_b)) if inner_a.as_number().is_some() => {
            let folded = x * inner_a.as_number().unwrap_or(1.0);
            mul(Expr::Number(folded), *inner_b)
        }
        (a, b) => a * b,
    }
}

fn div(a: Expr, b: Expr) -> Expr {
    if a == b && !a.is_number(0.0) {
        return Expr::Number(1.0);
    }
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) if y != 0.0 => return Expr::Number(x / y),
        (Some(x), _) if x == 0.0 => return Expr::Number(0.0),
        (_, Some(y)) if y == 1.0 => return a,
        _ => {}
    }
    match (a, b) {
        (Expr::Unary('-', x), b) => neg(div(*x, b)),
        (a, b) => a / b,
    }
}

fn neg(a: Expr) -> Expr {
    match a {
        Expr::Number(x) => Expr::Number(-x),
        Expr::Unary('-', inner) => *inner,
        other => -other,
    }
}

fn power(base: Expr, exponent: Expr) -> Expr {
    match (base.as_number(), exponent.as_number()) {
        (Some(x), Some(y)) => Expr::Number(numeric_pow(x, y)),
        (_, Some(y)) if y == 0.0 => Expr::Number(1.0),
        (_, Some(y)) if y == 1.0 => base,
        (Some(x), _) if x == 1.0 => Expr::Number(1.0),
        _ => base.pow(exponent),
    }
}

fn call(func: &str, arg: Expr) -> Expr {
    if let Some(x) = arg.as_number() {
        let folded = match func {
            "sin" => Some(x.sin()),
            "cos" => Some(x.cos()),
            "exp" => Some(x.exp()),
            "ln" if x > 0.0 => Some(x.ln()),
            _ => None,
        };
        if let Some(value) = folded {
            return Expr::Number(value);
        }
    }
    Expr::call(func, arg)
}
