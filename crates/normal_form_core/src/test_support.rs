//! Trajectories of a damped Duffing oscillator for tests.
//!
//! `ẋ = y, ẏ = x − x³ − 0.1 y` has stable foci at `x = ±1`; trajectories are
//! shifted so the focus at `(1, 0)` sits at the origin.

use nalgebra::DMatrix;

use crate::data::PolynomialModel;

pub(crate) fn duffing(x: &[f64], out: &mut [f64]) {
    out[0] = x[1];
    out[1] = x[0] - x[0].powi(3) - 0.1 * x[1];
}

/// Exact Jacobian at `(1, 0)`.
pub(crate) fn duffing_linear_part() -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -2.0, -0.1])
}

/// `exp(A dt)` for the Jacobian at `(1, 0)`, the linear part of the
/// time-`dt` sampling map.
pub(crate) fn duffing_map_linear_part(dt: f64) -> DMatrix<f64> {
    let a = duffing_linear_part() * dt;
    let mut term = DMatrix::identity(2, 2);
    let mut sum = term.clone();
    for k in 1..25 {
        term = &term * &a / k as f64;
        sum += &term;
    }
    sum
}

/// Taylor expansion about `(1, 0)` in shifted coordinates `u = x − 1, v = y`:
/// `u̇ = v, v̇ = −2u − 0.1v − 3u² − u³`, padded with zeros up to `degree`.
pub(crate) fn duffing_model(degree: usize) -> PolynomialModel {
    let exponents =
        crate::monomials::exponents_in_degree_range(2, 1, degree).expect("exponents");
    let mut c = DMatrix::zeros(2, exponents.len());
    let mut set = |row: usize, exponent: [usize; 2], value: f64| {
        if let Some(j) = exponents.position_of(&exponent) {
            c[(row, j)] = value;
        }
    };
    set(0, [0, 1], 1.0);
    set(1, [1, 0], -2.0);
    set(1, [0, 1], -0.1);
    set(1, [2, 0], -3.0);
    set(1, [3, 0], -1.0);
    PolynomialModel::new(c).expect("model")
}

pub(crate) fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
        .collect()
}

/// Classic RK4 with `substeps` steps between consecutive samples.
fn rk4_step(state: &mut [f64; 2], dt: f64) {
    let mut k1 = [0.0; 2];
    let mut k2 = [0.0; 2];
    let mut k3 = [0.0; 2];
    let mut k4 = [0.0; 2];
    let mut tmp = [0.0; 2];

    duffing(state, &mut k1);
    for i in 0..2 {
        tmp[i] = state[i] + 0.5 * dt * k1[i];
    }
    duffing(&tmp, &mut k2);
    for i in 0..2 {
        tmp[i] = state[i] + 0.5 * dt * k2[i];
    }
    duffing(&tmp, &mut k3);
    for i in 0..2 {
        tmp[i] = state[i] + dt * k3[i];
    }
    duffing(&tmp, &mut k4);
    for i in 0..2 {
        state[i] += dt / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
    }
}

/// Samples at `times` starting from `initial` (unshifted coordinates),
/// returned shifted by `(−1, 0)` as a `2 × samples` matrix.
pub(crate) fn duffing_trajectory(initial: [f64; 2], times: &[f64], substeps: usize) -> DMatrix<f64> {
    let mut state = initial;
    let mut traj = DMatrix::zeros(2, times.len());
    for (c, window) in std::iter::once(None)
        .chain(times.windows(2).map(Some))
        .enumerate()
    {
        if let Some(w) = window {
            let dt = (w[1] - w[0]) / substeps as f64;
            for _ in 0..substeps {
                rk4_step(&mut state, dt);
            }
        }
        traj[(0, c)] = state[0] - 1.0;
        traj[(1, c)] = state[1];
    }
    traj
}

pub(crate) fn duffing_data(
    initial_conditions: &[[f64; 2]],
    t_end: f64,
    samples: usize,
) -> (Vec<Vec<f64>>, Vec<DMatrix<f64>>) {
    let t = linspace(0.0, t_end, samples);
    let trajectories = initial_conditions
        .iter()
        .map(|&ic| duffing_trajectory(ic, &t, 4))
        .collect();
    (vec![t; initial_conditions.len()], trajectories)
}

pub(crate) fn assert_err_contains<T: std::fmt::Debug>(result: anyhow::Result<T>, needle: &str) {
    let err = result.expect_err("expected error");
    let message = format!("{err}");
    assert!(
        message.contains(needle),
        "expected error to contain \"{needle}\", got \"{message}\""
    );
}
