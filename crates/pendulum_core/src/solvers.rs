use crate::traits::{DynamicalSystem, Scalar, Steppable};

/// Butcher tableau of an explicit Runge-Kutta method.
///
/// `a[i]` holds the coefficients of stage `i` on stages `0..i`. When `error`
/// is present it holds `b - b_hat` for the embedded lower-order solution.
#[derive(Debug)]
pub struct Tableau {
    pub name: &'static str,
    pub c: &'static [f64],
    pub a: &'static [&'static [f64]],
    pub b: &'static [f64],
    pub error: Option<&'static [f64]>,
    /// Order of the embedded estimate; step control uses `1 / (order + 1)`.
    pub error_order: u32,
    /// Last stage is evaluated at the accepted solution and can seed the next step.
    pub fsal: bool,
}

/// Classic Runge-Kutta 4th order.
pub const RK4_TABLEAU: Tableau = Tableau {
    name: "rk4",
    c: &[0.0, 0.5, 0.5, 1.0],
    a: &[&[], &[0.5], &[0.0, 0.5], &[0.0, 0.0, 1.0]],
    b: &[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
    error: None,
    error_order: 0,
    fsal: false,
};

/// Tsitouras 5/4, used here with its 5th order weights only.
pub const TSIT5_TABLEAU: Tableau = Tableau {
    name: "tsit5",
    c: &[0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0],
    a: &[
        &[],
        &[0.161],
        &[-0.008480655492356989, 0.335480655492357],
        &[2.897153057105493, -6.359448489975075, 4.3622954328695815],
        &[
            5.325864828439257,
            -11.748883564062828,
            7.4955393428898365,
            -0.09249506636175525,
        ],
        &[
            5.86145544294642,
            -12.92096931784711,
            8.159367898576159,
            -0.071584973281401,
            -0.028269050394068383,
        ],
    ],
    b: &[
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436081,
        2.324710524099774,
    ],
    error: None,
    error_order: 0,
    fsal: false,
};

/// Dormand-Prince 5(4) with embedded error estimate.
pub const DOPRI5_TABLEAU: Tableau = Tableau {
    name: "dopri5",
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[
            19372.0 / 6561.0,
            -25360.0 / 2187.0,
            64448.0 / 6561.0,
            -212.0 / 729.0,
        ],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ],
    error: Some(&[
        71.0 / 57600.0,
        0.0,
        -71.0 / 16695.0,
        71.0 / 1920.0,
        -17253.0 / 339200.0,
        22.0 / 525.0,
        -1.0 / 40.0,
    ]),
    error_order: 4,
    fsal: true,
};

/// Explicit Runge-Kutta stepper driven by a `Tableau`.
///
/// Fixed-step use goes through `Steppable::step`. Adaptive drivers call
/// `attempt`, inspect `error_norm`, then either `accept` or retry with a
/// smaller `dt` from the same state.
pub struct RungeKutta<T: Scalar> {
    tableau: &'static Tableau,
    k: Vec<Vec<T>>,
    tmp: Vec<T>,
    candidate: Vec<T>,
    // k[0] holds f(t, state) for the state the next attempt starts from.
    first_stage_ready: bool,
    pub evaluations: usize,
}

impl<T: Scalar> RungeKutta<T> {
    pub fn new(tableau: &'static Tableau, dim: usize) -> Self {
        let z = T::zero();
        Self {
            tableau,
            k: vec![vec![z; dim]; tableau.c.len()],
            tmp: vec![z; dim],
            candidate: vec![z; dim],
            first_stage_ready: false,
            evaluations: 0,
        }
    }

    pub fn rk4(dim: usize) -> Self {
        Self::new(&RK4_TABLEAU, dim)
    }

    pub fn tsit5(dim: usize) -> Self {
        Self::new(&TSIT5_TABLEAU, dim)
    }

    pub fn dopri5(dim: usize) -> Self {
        Self::new(&DOPRI5_TABLEAU, dim)
    }

    pub fn tableau(&self) -> &'static Tableau {
        self.tableau
    }

    pub fn is_adaptive(&self) -> bool {
        self.tableau.error.is_some()
    }

    /// Computes all stages and the candidate solution at `t + dt`.
    /// `state` is left untouched.
    pub fn attempt(&mut self, system: &impl DynamicalSystem<T>, t: T, state: &[T], dt: T) {
        let tableau = self.tableau;
        if !self.first_stage_ready {
            system.apply(t, state, &mut self.k[0]);
            self.evaluations += 1;
        }

        for stage in 1..tableau.c.len() {
            let row = tableau.a[stage];
            for i in 0..state.len() {
                let mut acc = T::zero();
                for (j, &a) in row.iter().enumerate() {
                    if a != 0.0 {
                        acc = acc + coeff::<T>(a) * self.k[j][i];
                    }
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            let ts = t + coeff::<T>(tableau.c[stage]) * dt;
            system.apply(ts, &self.tmp, &mut self.k[stage]);
            self.evaluations += 1;
        }

        for i in 0..state.len() {
            let mut acc = T::zero();
            for (j, &b) in tableau.b.iter().enumerate() {
                if b != 0.0 {
                    acc = acc + coeff::<T>(b) * self.k[j][i];
                }
            }
            self.candidate[i] = state[i] + dt * acc;
        }
        self.first_stage_ready = true;
    }

    /// Scaled RMS norm of the embedded error estimate of the last attempt:
    /// `sqrt(mean((err_i / (atol + rtol * max(|y_i|, |y_new_i|)))^2))`.
    /// Fixed-step tableaux report zero.
    pub fn error_norm(&self, state: &[T], dt: T, rtol: f64, atol: f64) -> f64 {
        let Some(weights) = self.tableau.error else {
            return 0.0;
        };
        if state.is_empty() {
            return 0.0;
        }
        let mut sum = 0.0;
        for i in 0..state.len() {
            let mut acc = T::zero();
            for (j, &e) in weights.iter().enumerate() {
                if e != 0.0 {
                    acc = acc + coeff::<T>(e) * self.k[j][i];
                }
            }
            let err = to_f64(dt * acc);
            let y0 = to_f64(state[i]).abs();
            let y1 = to_f64(self.candidate[i]).abs();
            let scale = atol + rtol * y0.max(y1);
            let ratio = err / scale;
            sum += ratio * ratio;
        }
        (sum / state.len() as f64).sqrt()
    }

    /// Commits the candidate from the last `attempt`.
    pub fn accept(&mut self, t: &mut T, state: &mut [T], dt: T) {
        state.copy_from_slice(&self.candidate);
        *t = *t + dt;
        if self.tableau.fsal {
            let last = self.k.len() - 1;
            self.k.swap(0, last);
        } else {
            self.first_stage_ready = false;
        }
    }

    /// `f(t, state)` at the start of the last attempt.
    pub fn slope(&self) -> &[T] {
        &self.k[0]
    }
}

impl<T: Scalar> Steppable<T> for RungeKutta<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        self.first_stage_ready = false;
        self.attempt(system, *t, state, dt);
        self.accept(t, state, dt);
    }
}

fn coeff<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap()
}

fn to_f64<T: Scalar>(value: T) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay {
        rate: f64,
    }

    impl DynamicalSystem<f64> for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -self.rate * x[0];
        }
    }

    struct Oscillator;

    impl DynamicalSystem<f64> for Oscillator {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = x[1];
            out[1] = -x[0];
        }
    }

    fn run_fixed(mut solver: RungeKutta<f64>, steps: usize, dt: f64) -> f64 {
        let system = Decay { rate: 1.0 };
        let mut t = 0.0;
        let mut state = vec![1.0];
        for _ in 0..steps {
            solver.step(&system, &mut t, &mut state, dt);
        }
        assert!((t - steps as f64 * dt).abs() < 1e-12);
        state[0]
    }

    #[test]
    fn tableaux_are_consistent() {
        for tableau in [&RK4_TABLEAU, &TSIT5_TABLEAU, &DOPRI5_TABLEAU] {
            assert_eq!(tableau.a.len(), tableau.c.len(), "{}", tableau.name);
            assert_eq!(tableau.b.len(), tableau.c.len(), "{}", tableau.name);
            let b_sum: f64 = tableau.b.iter().sum();
            assert!((b_sum - 1.0).abs() < 1e-12, "{}", tableau.name);
            for (row, &c) in tableau.a.iter().zip(tableau.c) {
                let row_sum: f64 = row.iter().sum();
                assert!((row_sum - c).abs() < 1e-12, "{}", tableau.name);
            }
            if let Some(error) = tableau.error {
                let e_sum: f64 = error.iter().sum();
                assert!(e_sum.abs() < 1e-12, "{}", tableau.name);
            }
        }
    }

    #[test]
    fn fixed_step_methods_converge_on_decay() {
        let exact = (-1.0_f64).exp();
        let rk4 = run_fixed(RungeKutta::rk4(1), 100, 0.01);
        let tsit5 = run_fixed(RungeKutta::tsit5(1), 100, 0.01);
        let dopri5 = run_fixed(RungeKutta::dopri5(1), 100, 0.01);
        assert!((rk4 - exact).abs() < 1e-9);
        assert!((tsit5 - exact).abs() < 1e-11);
        assert!((dopri5 - exact).abs() < 1e-11);
    }

    #[test]
    fn rk4_error_shrinks_at_fourth_order() {
        let exact = (-1.0_f64).exp();
        let coarse = (run_fixed(RungeKutta::rk4(1), 10, 0.1) - exact).abs();
        let fine = (run_fixed(RungeKutta::rk4(1), 20, 0.05) - exact).abs();
        let ratio = coarse / fine;
        assert!(ratio > 12.0 && ratio < 20.0, "ratio {ratio}");
    }

    #[test]
    fn error_norm_tracks_step_size() {
        let system = Oscillator;
        let state = [1.0, 0.0];
        let mut solver = RungeKutta::dopri5(2);
        solver.attempt(&system, 0.0, &state, 0.5);
        let large = solver.error_norm(&state, 0.5, 1e-9, 1e-9);
        solver.attempt(&system, 0.0, &state, 0.05);
        let small = solver.error_norm(&state, 0.05, 1e-9, 1e-9);
        assert!(large > 1.0);
        assert!(small < large / 1000.0);
    }

    #[test]
    fn fsal_reuses_last_stage() {
        let system = Oscillator;
        let mut solver = RungeKutta::dopri5(2);
        let mut t = 0.0;
        let mut state = vec![1.0, 0.0];
        solver.attempt(&system, t, &state, 0.1);
        solver.accept(&mut t, &mut state, 0.1);
        assert_eq!(solver.evaluations, 7);
        solver.attempt(&system, t, &state, 0.1);
        assert_eq!(solver.evaluations, 13);
        // Reused stage is the derivative at the accepted state.
        assert!((solver.slope()[0] - state[1]).abs() < 1e-15);
        assert!((solver.slope()[1] + state[0]).abs() < 1e-15);
    }

    #[test]
    fn fixed_tableau_reports_zero_error() {
        let system = Oscillator;
        let state = [1.0, 0.0];
        let mut solver = RungeKutta::rk4(2);
        solver.attempt(&system, 0.0, &state, 0.5);
        assert!(!solver.is_adaptive());
        assert_eq!(solver.error_norm(&state, 0.5, 1e-6, 1e-6), 0.0);
    }
}
