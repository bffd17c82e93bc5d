//! Training pairs from trajectories and the pre-fit polynomial model.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

use crate::error::NormalFormError;
use crate::monomials::{exponents_in_degree_range, ExponentTable};
use crate::settings::SystemKind;

/// Build `(X, Y)` pairs from trajectories (`dimension × samples` each).
///
/// Flow: `X` is the trajectory and `Y` its time derivative, second-order
/// finite differences on the (possibly non-uniform) time grid, one-sided at
/// the ends. Map: `X = x_0..x_{N-2}`, `Y = x_1..x_{N-1}`.
pub fn shift_or_differentiate(
    trajectories: &[DMatrix<f64>],
    times: &[Vec<f64>],
    kind: SystemKind,
) -> Result<(Vec<DMatrix<f64>>, Vec<DMatrix<f64>>)> {
    if trajectories.is_empty() {
        bail!("At least one trajectory is required.");
    }
    if trajectories.len() != times.len() {
        return Err(NormalFormError::shape(
            "time vectors",
            trajectories.len(),
            times.len(),
        )
        .into());
    }

    let mut xs = Vec::with_capacity(trajectories.len());
    let mut ys = Vec::with_capacity(trajectories.len());
    for (idx, (traj, t)) in trajectories.iter().zip(times).enumerate() {
        if traj.ncols() != t.len() {
            return Err(NormalFormError::shape(
                &format!("samples of trajectory {idx}"),
                t.len(),
                traj.ncols(),
            )
            .into());
        }
        match kind {
            SystemKind::Flow => {
                if t.len() < 3 {
                    bail!("Trajectory {idx} needs at least 3 samples to differentiate.");
                }
                if t.windows(2).any(|w| !(w[1] > w[0])) {
                    bail!("Time vector of trajectory {idx} must be strictly increasing.");
                }
                xs.push(traj.clone());
                ys.push(differentiate(traj, t));
            }
            SystemKind::Map => {
                if t.len() < 2 {
                    bail!("Trajectory {idx} needs at least 2 samples to shift.");
                }
                let n = traj.ncols();
                xs.push(traj.columns(0, n - 1).into_owned());
                ys.push(traj.columns(1, n - 1).into_owned());
            }
        }
    }
    Ok((xs, ys))
}

fn differentiate(traj: &DMatrix<f64>, t: &[f64]) -> DMatrix<f64> {
    let n = t.len();
    let mut out = DMatrix::zeros(traj.nrows(), n);
    for row in 0..traj.nrows() {
        let f = |i: usize| traj[(row, i)];

        let (h1, h2) = (t[1] - t[0], t[2] - t[1]);
        out[(row, 0)] = -(2.0 * h1 + h2) / (h1 * (h1 + h2)) * f(0) + (h1 + h2) / (h1 * h2) * f(1)
            - h1 / (h2 * (h1 + h2)) * f(2);

        for i in 1..n - 1 {
            let (hm, hp) = (t[i] - t[i - 1], t[i + 1] - t[i]);
            out[(row, i)] = (hm * hm * f(i + 1) - hp * hp * f(i - 1) + (hp * hp - hm * hm) * f(i))
                / (hm * hp * (hm + hp));
        }

        let (h1, h2) = (t[n - 1] - t[n - 2], t[n - 2] - t[n - 3]);
        out[(row, n - 1)] = (2.0 * h1 + h2) / (h1 * (h1 + h2)) * f(n - 1)
            - (h1 + h2) / (h1 * h2) * f(n - 2)
            + h1 / (h2 * (h1 + h2)) * f(n - 3);
    }
    out
}

/// Polynomial regression model `ẋ = C φ(x)` (or `x⁺ = C φ(x)` for maps)
/// over the monomials of degrees `1..=degree`, linear block first.
#[derive(Debug, Clone)]
pub struct PolynomialModel {
    coefficients: DMatrix<f64>,
    exponents: ExponentTable,
}

impl PolynomialModel {
    /// The degree is inferred from the number of columns.
    pub fn new(coefficients: DMatrix<f64>) -> Result<Self> {
        let dim = coefficients.nrows();
        if dim == 0 {
            return Err(NormalFormError::InvalidDimension(0).into());
        }
        let mut degree = 1;
        loop {
            let exponents = exponents_in_degree_range(dim, 1, degree)?;
            if exponents.len() == coefficients.ncols() {
                return Ok(Self {
                    coefficients,
                    exponents,
                });
            }
            if exponents.len() > coefficients.ncols() {
                return Err(NormalFormError::shape(
                    "model coefficient columns",
                    "the monomial count of some degree",
                    coefficients.ncols(),
                )
                .into());
            }
            degree += 1;
        }
    }

    pub fn dimension(&self) -> usize {
        self.coefficients.nrows()
    }

    pub fn degree(&self) -> usize {
        self.exponents.max_degree()
    }

    pub fn exponents(&self) -> &ExponentTable {
        &self.exponents
    }

    pub fn coefficients(&self) -> &DMatrix<f64> {
        &self.coefficients
    }

    pub fn linear_part(&self) -> DMatrix<f64> {
        let n = self.dimension();
        self.coefficients.columns(0, n).into_owned()
    }

    pub fn evaluate(&self, x: &[f64]) -> Result<DVector<f64>> {
        let features = DVector::from_vec(self.exponents.evaluate(x)?);
        Ok(&self.coefficients * features)
    }
}
