//! Bookkeeping of multivariate monomial exponents.
//!
//! Columns are enumerated degree by degree; inside one degree the exponent
//! of the first coordinate descends, then the second, and so on. This is the
//! order of a standard bias-free polynomial feature matrix, e.g. for two
//! variables up to degree 3:
//! `x0, x1, x0², x0x1, x1², x0³, x0²x1, x0x1², x1³`.
//! Coefficient vectors are aligned positionally with it.

use anyhow::Result;
use nalgebra::{ComplexField, DMatrix};
use num_traits::Num;

use crate::error::NormalFormError;

/// A table of monomial exponents, one column per monomial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentTable {
    dimension: usize,
    columns: Vec<Vec<usize>>,
}

/// All monomials of exactly `degree` in `dimension` variables.
pub fn exponents_of_degree(dimension: usize, degree: usize) -> Result<ExponentTable> {
    exponents_in_degree_range(dimension, degree, degree)
}

/// All monomials with total degree in `min_degree..=max_degree`.
pub fn exponents_in_degree_range(
    dimension: usize,
    min_degree: usize,
    max_degree: usize,
) -> Result<ExponentTable> {
    if dimension == 0 {
        return Err(NormalFormError::InvalidDimension(dimension).into());
    }
    if min_degree == 0 || min_degree > max_degree {
        return Err(NormalFormError::InvalidDegree {
            min: min_degree,
            max: max_degree,
        }
        .into());
    }

    let mut columns = Vec::new();
    let mut current = Vec::with_capacity(dimension);
    for degree in min_degree..=max_degree {
        push_compositions(dimension, degree, &mut current, &mut columns);
    }
    Ok(ExponentTable { dimension, columns })
}

/// Nonlinear monomials, degrees `2..=degree`.
pub fn nonlinear_exponents(dimension: usize, degree: usize) -> Result<ExponentTable> {
    if degree < 2 {
        return Err(NormalFormError::InvalidDegree {
            min: 2,
            max: degree,
        }
        .into());
    }
    exponents_in_degree_range(dimension, 2, degree)
}

fn push_compositions(
    remaining_dims: usize,
    remaining_degree: usize,
    current: &mut Vec<usize>,
    out: &mut Vec<Vec<usize>>,
) {
    if remaining_dims == 1 {
        current.push(remaining_degree);
        out.push(current.clone());
        current.pop();
        return;
    }
    for d in (0..=remaining_degree).rev() {
        current.push(d);
        push_compositions(remaining_dims - 1, remaining_degree - d, current, out);
        current.pop();
    }
}

impl ExponentTable {
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of monomials.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, index: usize) -> &[usize] {
        &self.columns[index]
    }

    pub fn columns(&self) -> impl Iterator<Item = &[usize]> {
        self.columns.iter().map(|c| c.as_slice())
    }

    pub fn max_degree(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.iter().sum::<usize>())
            .max()
            .unwrap_or(0)
    }

    pub fn position_of(&self, exponent: &[usize]) -> Option<usize> {
        self.columns.iter().position(|c| c.as_slice() == exponent)
    }

    /// `dimension × len` integer matrix.
    pub fn to_matrix(&self) -> DMatrix<usize> {
        DMatrix::from_fn(self.dimension, self.columns.len(), |i, j| {
            self.columns[j][i]
        })
    }

    /// Values of every monomial at `point`.
    pub fn evaluate<T: Clone + Num>(&self, point: &[T]) -> Result<Vec<T>> {
        self.check_point(point.len())?;
        let mut out = vec![T::zero(); self.len()];
        self.evaluate_into(point, &mut out);
        Ok(out)
    }

    /// Unchecked evaluation; `point.len() == dimension`, `out.len() == len`.
    pub(crate) fn evaluate_into<T: Clone + Num>(&self, point: &[T], out: &mut [T]) {
        let powers = power_table(point, self.max_degree());
        for (value, exponent) in out.iter_mut().zip(&self.columns) {
            let mut acc = T::one();
            for (i, &e) in exponent.iter().enumerate() {
                if e > 0 {
                    acc = acc * powers[i][e].clone();
                }
            }
            *value = acc;
        }
    }

    /// Analytic Jacobian of the monomial vector, `len × dimension`:
    /// `∂φ_j/∂x_i = e_i x_i^(e_i - 1) Π_{l≠i} x_l^(e_l)`.
    pub fn jacobian<T: ComplexField>(&self, point: &[T]) -> Result<DMatrix<T>> {
        self.check_point(point.len())?;
        let powers = power_table(point, self.max_degree());
        let mut jac = DMatrix::zeros(self.len(), self.dimension);
        for (j, exponent) in self.columns.iter().enumerate() {
            for i in 0..self.dimension {
                if exponent[i] == 0 {
                    continue;
                }
                let mut acc: T = nalgebra::convert(exponent[i] as f64);
                for (l, &e) in exponent.iter().enumerate() {
                    let power = if l == i { e - 1 } else { e };
                    if power > 0 {
                        acc *= powers[l][power].clone();
                    }
                }
                jac[(j, i)] = acc;
            }
        }
        Ok(jac)
    }

    fn check_point(&self, len: usize) -> Result<()> {
        if len != self.dimension {
            return Err(NormalFormError::shape("monomial point", self.dimension, len).into());
        }
        Ok(())
    }
}

fn power_table<T: Clone + Num>(point: &[T], max_degree: usize) -> Vec<Vec<T>> {
    point
        .iter()
        .map(|x| {
            let mut row = Vec::with_capacity(max_degree + 1);
            row.push(T::one());
            for p in 1..=max_degree {
                let next = row[p - 1].clone() * x.clone();
                row.push(next);
            }
            row
        })
        .collect()
}
