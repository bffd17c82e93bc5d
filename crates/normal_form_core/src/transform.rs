//! Explicit polynomial change of coordinates `y = C φ(x)`.

use anyhow::Result;
use nalgebra::{ComplexField, DMatrix, DVector};

use crate::error::NormalFormError;
use crate::monomials::{exponents_in_degree_range, ExponentTable};

/// Polynomial map over the monomials of degrees `1..=degree` (linear block
/// first, no constant term), one coefficient row per output coordinate.
#[derive(Debug, Clone)]
pub struct NonlinearCoordinateTransform<T: ComplexField> {
    dimension: usize,
    degree: usize,
    exponents: ExponentTable,
    coefficients: DMatrix<T>,
}

impl<T: ComplexField> NonlinearCoordinateTransform<T> {
    pub fn new(dimension: usize, degree: usize, coefficients: DMatrix<T>) -> Result<Self> {
        let exponents = exponents_in_degree_range(dimension, 1, degree)?;
        check_coefficients(dimension, &exponents, &coefficients)?;
        Ok(Self {
            dimension,
            degree,
            exponents,
            coefficients,
        })
    }

    pub fn identity(dimension: usize, degree: usize) -> Result<Self> {
        let exponents = exponents_in_degree_range(dimension, 1, degree)?;
        let mut coefficients = DMatrix::zeros(dimension, exponents.len());
        for i in 0..dimension {
            coefficients[(i, i)] = T::one();
        }
        Ok(Self {
            dimension,
            degree,
            exponents,
            coefficients,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn exponents(&self) -> &ExponentTable {
        &self.exponents
    }

    pub fn coefficients(&self) -> &DMatrix<T> {
        &self.coefficients
    }

    pub fn set_coefficients(&mut self, coefficients: DMatrix<T>) -> Result<()> {
        check_coefficients(self.dimension, &self.exponents, &coefficients)?;
        self.coefficients = coefficients;
        Ok(())
    }

    pub fn transform_point(&self, point: &[T]) -> Result<DVector<T>> {
        let features = DVector::from_vec(self.exponents.evaluate(point)?);
        Ok(&self.coefficients * features)
    }

    /// Points are rows of `points` (`samples × dimension`).
    pub fn transform(&self, points: &DMatrix<T>) -> Result<DMatrix<T>> {
        if points.ncols() != self.dimension {
            return Err(
                NormalFormError::shape("point columns", self.dimension, points.ncols()).into(),
            );
        }
        let mut out = DMatrix::zeros(points.nrows(), self.dimension);
        let mut features = vec![T::zero(); self.exponents.len()];
        let mut point = vec![T::zero(); self.dimension];
        for s in 0..points.nrows() {
            for i in 0..self.dimension {
                point[i] = points[(s, i)].clone();
            }
            self.exponents.evaluate_into(&point, &mut features);
            for k in 0..self.dimension {
                let mut acc = T::zero();
                for (j, f) in features.iter().enumerate() {
                    acc += self.coefficients[(k, j)].clone() * f.clone();
                }
                out[(s, k)] = acc;
            }
        }
        Ok(out)
    }

    /// `∂y/∂x` at `point`, `dimension × dimension`.
    pub fn jacobian(&self, point: &[T]) -> Result<DMatrix<T>> {
        Ok(&self.coefficients * self.exponents.jacobian(point)?)
    }
}

fn check_coefficients<T: ComplexField>(
    dimension: usize,
    exponents: &ExponentTable,
    coefficients: &DMatrix<T>,
) -> Result<()> {
    if coefficients.nrows() != dimension || coefficients.ncols() != exponents.len() {
        return Err(NormalFormError::shape(
            "transform coefficients",
            format!("{}x{}", dimension, exponents.len()),
            format!("{}x{}", coefficients.nrows(), coefficients.ncols()),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64;

    fn sample_points() -> DMatrix<f64> {
        let n = 10;
        DMatrix::from_fn(n, 2, |s, i| {
            let t = s as f64 / (n - 1) as f64;
            if i == 0 {
                -1.0 + 2.0 * t
            } else {
                -0.5 + t
            }
        })
    }

    #[test]
    fn reproduces_known_polynomial_map() {
        // columns: x, y, x², xy, y², x³, x²y, xy², y³
        let coefficients = DMatrix::from_row_slice(
            2,
            9,
            &[
                1.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, //
                1.0, -1.0, 0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0,
            ],
        );
        let tf = NonlinearCoordinateTransform::new(2, 3, coefficients).expect("transform");
        let points = sample_points();
        let z = tf.transform(&points).expect("transformed");
        for s in 0..points.nrows() {
            let (x, y) = (points[(s, 0)], points[(s, 1)]);
            assert!((z[(s, 0)] - (x + y + x * x + y * y)).abs() < 1e-12);
            assert!((z[(s, 1)] - (x - y + x.powi(3) - y * x)).abs() < 1e-12);
        }
    }

    #[test]
    fn jacobian_is_analytic() {
        let coefficients = DMatrix::from_row_slice(
            2,
            9,
            &[
                1.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, //
                1.0, -1.0, 0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0,
            ],
        );
        let tf = NonlinearCoordinateTransform::new(2, 3, coefficients).expect("transform");
        let (x, y) = (0.4, -0.3);
        let jac = tf.jacobian(&[x, y]).expect("jacobian");
        let expected = [[1.0 + 2.0 * x, 1.0 + 2.0 * y], [1.0 + 3.0 * x * x - y, -1.0 - x]];
        for k in 0..2 {
            for i in 0..2 {
                assert!((jac[(k, i)] - expected[k][i]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn identity_leaves_points_unchanged() {
        let tf = NonlinearCoordinateTransform::<Complex64>::identity(2, 4).expect("transform");
        let p = [Complex64::new(0.2, 0.1), Complex64::new(0.2, -0.1)];
        let out = tf.transform_point(&p).expect("transformed");
        assert_eq!(out[0], p[0]);
        assert_eq!(out[1], p[1]);
    }

    #[test]
    fn rejects_wrong_coefficient_shape() {
        let err = NonlinearCoordinateTransform::new(2, 3, DMatrix::<f64>::zeros(2, 7)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NormalFormError>(),
            Some(NormalFormError::ShapeMismatch { .. })
        ));
        let mut tf = NonlinearCoordinateTransform::<f64>::identity(2, 2).expect("transform");
        assert!(tf.set_coefficients(DMatrix::zeros(3, 5)).is_err());
        assert!(tf.transform(&DMatrix::zeros(4, 3)).is_err());
    }
}
