//! Eigen-decomposition of the linear part and complex-conjugate bookkeeping.

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::linalg::SVD;
use nalgebra::{ComplexField, DMatrix, DVector};
use num_complex::Complex64;

use crate::error::NormalFormError;

const CONJUGATE_TOLERANCE: f64 = 1e-8;
/// Relative distance below which eigenvalues count as one repeated eigenvalue.
const GROUPING_TOLERANCE: f64 = 1e-6;
const CONDITION_WARNING: f64 = 1e8;

/// Linear part in diagonal form: `A = V Λ V⁻¹`.
#[derive(Debug, Clone)]
pub struct ModalDecomposition {
    pub eigenvalues: Vec<Complex64>,
    /// `V`, eigenvectors as columns.
    pub basis: DMatrix<Complex64>,
    /// `V⁻¹`, maps physical coordinates to modal ones.
    pub inverse: DMatrix<Complex64>,
}

pub fn decompose_real(linear_part: &DMatrix<f64>) -> Result<ModalDecomposition> {
    decompose(&linear_part.map(|v| Complex64::new(v, 0.0)))
}

pub fn decompose(linear_part: &DMatrix<Complex64>) -> Result<ModalDecomposition> {
    let dim = linear_part.nrows();
    if dim == 0 {
        return Err(NormalFormError::InvalidDimension(0).into());
    }
    if linear_part.ncols() != dim {
        return Err(NormalFormError::shape(
            "linear part",
            format!("{dim}x{dim}"),
            format!("{}x{}", dim, linear_part.ncols()),
        )
        .into());
    }
    if linear_part.iter().any(|c| !(c.re.is_finite() && c.im.is_finite())) {
        bail!("Linear part contains non-finite entries.");
    }

    if is_diagonal(linear_part) {
        let eigenvalues = (0..dim).map(|i| linear_part[(i, i)]).collect();
        let identity = DMatrix::identity(dim, dim);
        return Ok(ModalDecomposition {
            eigenvalues,
            basis: identity.clone(),
            inverse: identity,
        });
    }
    log::debug!("linear part is not diagonal; diagonalizing it before the resonance analysis");

    let is_real = linear_part.iter().all(|c| c.im == 0.0);
    let (eigenvalues, basis) = if is_real {
        real_eigenpairs(&linear_part.map(|c| c.re))?
    } else {
        complex_eigenpairs(linear_part)?
    };

    let inverse = basis
        .clone()
        .try_inverse()
        .ok_or_else(|| anyhow!("Modal basis is singular; the linear part is not diagonalizable."))?;

    let singular_values = SVD::new(basis.clone(), false, false).singular_values;
    let max = singular_values.iter().cloned().fold(0.0, f64::max);
    let min = singular_values.iter().cloned().fold(f64::INFINITY, f64::min);
    if min <= 0.0 || max / min > CONDITION_WARNING {
        log::warn!(
            "modal basis is ill-conditioned (condition estimate {:.3e})",
            if min > 0.0 { max / min } else { f64::INFINITY }
        );
    }

    Ok(ModalDecomposition {
        eigenvalues,
        basis,
        inverse,
    })
}

fn is_diagonal(matrix: &DMatrix<Complex64>) -> bool {
    let scale = matrix.iter().map(|c| c.norm()).fold(0.0, f64::max).max(1.0);
    let dim = matrix.nrows();
    for i in 0..dim {
        for j in 0..dim {
            if i != j && matrix[(i, j)].norm() > 1e-14 * scale {
                return false;
            }
        }
    }
    true
}

/// Eigenpairs of a real matrix. Each complex pair is stored with `Im λ > 0`
/// first, followed by its conjugate with the conjugate eigenvector, so the
/// second modal coordinate is exactly the conjugate of the first. Repeated
/// eigenvalues get one eigenvector per copy.
fn real_eigenpairs(matrix: &DMatrix<f64>) -> Result<(Vec<Complex64>, DMatrix<Complex64>)> {
    let dim = matrix.nrows();
    let raw: Vec<Complex64> = matrix.complex_eigenvalues().iter().cloned().collect();
    let scale = raw.iter().map(|c| c.norm()).fold(1.0, f64::max);
    // Pairs fold onto their upper member, real ones lose round-off imaginary parts.
    let folded: Vec<Complex64> = raw
        .iter()
        .map(|&lambda| {
            if lambda.im.abs() <= CONJUGATE_TOLERANCE * scale {
                Complex64::new(lambda.re, 0.0)
            } else {
                Complex64::new(lambda.re, lambda.im.abs())
            }
        })
        .collect();
    let complex_matrix = matrix.map(|v| Complex64::new(v, 0.0));

    let mut eigenvalues = Vec::with_capacity(dim);
    let mut vectors: Vec<DVector<Complex64>> = Vec::with_capacity(dim);
    for (lambda, count) in group_eigenvalues(&folded, GROUPING_TOLERANCE * scale) {
        if lambda.im == 0.0 {
            let shifted = matrix - DMatrix::identity(dim, dim) * lambda.re;
            for mut v in eigenspace(shifted, count, GROUPING_TOLERANCE * scale)
                .with_context(|| format!("Eigenvalue {lambda} of multiplicity {count}"))?
            {
                fix_sign(&mut v);
                eigenvalues.push(lambda);
                vectors.push(v.map(|x| Complex64::new(x, 0.0)));
            }
            continue;
        }
        if count % 2 != 0 {
            bail!("Complex eigenvalue {lambda} has no conjugate partner.");
        }
        let shifted = shift(&complex_matrix, lambda);
        for v in eigenspace(shifted, count / 2, GROUPING_TOLERANCE * scale)
            .with_context(|| format!("Eigenvalue {lambda} of multiplicity {}", count / 2))?
        {
            let v_conj = v.map(|c| c.conj());
            eigenvalues.push(lambda);
            vectors.push(v);
            eigenvalues.push(lambda.conj());
            vectors.push(v_conj);
        }
    }

    if vectors.len() != dim {
        bail!(
            "Found {} eigenvectors for a {dim}x{dim} linear part.",
            vectors.len()
        );
    }
    Ok((eigenvalues, DMatrix::from_columns(&vectors)))
}

fn complex_eigenpairs(
    matrix: &DMatrix<Complex64>,
) -> Result<(Vec<Complex64>, DMatrix<Complex64>)> {
    let dim = matrix.nrows();
    let raw: Vec<Complex64> = matrix
        .clone()
        .schur()
        .eigenvalues()
        .ok_or_else(|| anyhow!("Failed to compute eigenvalues of the complex linear part."))?
        .iter()
        .cloned()
        .collect();
    let scale = raw.iter().map(|c| c.norm()).fold(1.0, f64::max);

    let mut eigenvalues = Vec::with_capacity(dim);
    let mut vectors: Vec<DVector<Complex64>> = Vec::with_capacity(dim);
    for (lambda, count) in group_eigenvalues(&raw, GROUPING_TOLERANCE * scale) {
        for v in eigenspace(shift(matrix, lambda), count, GROUPING_TOLERANCE * scale)
            .with_context(|| format!("Eigenvalue {lambda} of multiplicity {count}"))?
        {
            eigenvalues.push(lambda);
            vectors.push(v);
        }
    }
    Ok((eigenvalues, DMatrix::from_columns(&vectors)))
}

/// Eigenvalues within `tol` of each other, as `(mean, multiplicity)` in
/// order of first appearance. Exactly real values never join complex ones.
fn group_eigenvalues(values: &[Complex64], tol: f64) -> Vec<(Complex64, usize)> {
    let mut groups: Vec<(Complex64, usize)> = Vec::new();
    for &value in values {
        match groups
            .iter_mut()
            .find(|(center, _)| {
                (center.im == 0.0) == (value.im == 0.0) && (*center - value).norm() <= tol
            })
        {
            Some((center, count)) => {
                *center = (*center * *count as f64 + value) / (*count + 1) as f64;
                *count += 1;
            }
            None => groups.push((value, 1)),
        }
    }
    groups
}

fn shift(matrix: &DMatrix<Complex64>, lambda: Complex64) -> DMatrix<Complex64> {
    let mut shifted = matrix.clone();
    for i in 0..shifted.nrows() {
        shifted[(i, i)] -= lambda;
    }
    shifted
}

/// The `count` right-singular vectors of `A - λI` with the smallest singular
/// values. Fails unless all of those are below `tol`.
fn eigenspace<T>(shifted: DMatrix<T>, count: usize, tol: f64) -> Result<Vec<DVector<T>>>
where
    T: ComplexField<RealField = f64>,
{
    let svd = SVD::new(shifted, false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow!("Singular value decomposition returned no right vectors."))?;
    let sigma = &svd.singular_values;
    let mut order: Vec<usize> = (0..sigma.len()).collect();
    order.sort_by(|&a, &b| sigma[a].total_cmp(&sigma[b]));
    if count == 0 || count > order.len() {
        bail!("Cannot take {count} eigenvectors in dimension {}.", order.len());
    }
    let largest = sigma[order[count - 1]];
    if largest > tol {
        bail!(
            "Eigenspace has dimension below {count} (singular value {largest:.3e}); \
             the linear part is not diagonalizable."
        );
    }
    // A = U Σ Vᴴ, so null vectors are the conjugated rows of Vᴴ.
    Ok(order[..count]
        .iter()
        .map(|&idx| v_t.row(idx).adjoint())
        .collect())
}

/// Flip the sign so the largest entry is positive.
fn fix_sign(vec: &mut DVector<f64>) {
    let pivot = vec.iter().cloned().fold(0.0, |best: f64, x| {
        if x.abs() > best.abs() {
            x
        } else {
            best
        }
    });
    if pivot < 0.0 {
        vec.neg_mut();
    }
}

/// For every eigenvalue, the index of its complex-conjugate partner, if any.
/// Real eigenvalues have no partner.
pub fn conjugate_partners(eigenvalues: &[Complex64]) -> Vec<Option<usize>> {
    let scale = eigenvalues.iter().map(|c| c.norm()).fold(1.0, f64::max);
    let tol = CONJUGATE_TOLERANCE * scale;
    let mut partners = vec![None; eigenvalues.len()];
    for i in 0..eigenvalues.len() {
        if partners[i].is_some() || eigenvalues[i].im <= tol {
            continue;
        }
        let candidate = (0..eigenvalues.len()).find(|&j| {
            partners[j].is_none()
                && eigenvalues[j].im < -tol
                && (eigenvalues[j] - eigenvalues[i].conj()).norm() <= tol
        });
        if let Some(j) = candidate {
            partners[i] = Some(j);
            partners[j] = Some(i);
        }
    }
    partners
}

#[cfg(test)]
mod tests {
    use super::*;

    fn duffing_jacobian() -> DMatrix<f64> {
        // ẋ = y, ẏ = x - x³ - 0.1 y linearized at (1, 0)
        DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -2.0, -0.1])
    }

    #[test]
    fn diagonal_input_keeps_order_and_identity_basis() {
        let lambda = Complex64::new(-0.05, 1.41332940251026);
        let a = DMatrix::from_diagonal(&DVector::from_vec(vec![lambda.conj(), lambda]));
        let modal = decompose(&a).expect("decomposition");
        assert_eq!(modal.eigenvalues, vec![lambda.conj(), lambda]);
        assert_eq!(modal.basis, DMatrix::identity(2, 2));
    }

    #[test]
    fn real_matrix_pairs_are_ordered_and_conjugate() {
        let modal = decompose_real(&duffing_jacobian()).expect("decomposition");
        let expected = Complex64::new(-0.05, (2.0f64 - 0.0025).sqrt());
        assert!((modal.eigenvalues[0] - expected).norm() < 1e-12);
        assert!((modal.eigenvalues[1] - expected.conj()).norm() < 1e-12);
        for i in 0..2 {
            assert_eq!(modal.basis[(i, 1)], modal.basis[(i, 0)].conj());
        }
    }

    #[test]
    fn decomposition_reconstructs_linear_part() {
        let a = duffing_jacobian();
        let modal = decompose_real(&a).expect("decomposition");
        assert_reconstructs(&a, &modal);
    }

    #[test]
    fn real_eigenvectors_are_real() {
        let a = DMatrix::from_row_slice(2, 2, &[-1.0, 1.0, 0.0, -2.0]);
        let modal = decompose_real(&a).expect("decomposition");
        assert!(modal.basis.iter().all(|c| c.im == 0.0));
        assert!(modal.eigenvalues.iter().all(|c| c.im == 0.0));
    }

    #[test]
    fn rejects_non_square_and_defective() {
        let rect = DMatrix::<f64>::zeros(2, 3);
        let err = decompose_real(&rect).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NormalFormError>(),
            Some(NormalFormError::ShapeMismatch { .. })
        ));
        let jordan = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]);
        let err = decompose_real(&jordan).unwrap_err();
        assert!(format!("{err:#}").contains("not diagonalizable"), "{err:#}");
    }

    fn assert_reconstructs(a: &DMatrix<f64>, modal: &ModalDecomposition) {
        let n = a.nrows();
        let lambda = DMatrix::from_diagonal(&DVector::from_vec(modal.eigenvalues.clone()));
        let rebuilt = &modal.basis * lambda * &modal.inverse;
        for i in 0..n {
            for j in 0..n {
                assert!((rebuilt[(i, j)] - Complex64::new(a[(i, j)], 0.0)).norm() < 1e-10);
            }
        }
    }

    #[test]
    fn identical_oscillators_are_diagonalized() {
        let block = duffing_jacobian();
        let mut a = DMatrix::<f64>::zeros(4, 4);
        a.view_mut((0, 0), (2, 2)).copy_from(&block);
        a.view_mut((2, 2), (2, 2)).copy_from(&block);

        let modal = decompose_real(&a).expect("decomposition");
        let expected = Complex64::new(-0.05, (2.0f64 - 0.0025).sqrt());
        for (k, lambda) in modal.eigenvalues.iter().enumerate() {
            let target = if k % 2 == 0 { expected } else { expected.conj() };
            assert!((lambda - target).norm() < 1e-10, "eigenvalue {k}: {lambda}");
        }
        for pair in [0, 2] {
            for i in 0..4 {
                assert_eq!(modal.basis[(i, pair + 1)], modal.basis[(i, pair)].conj());
            }
        }
        assert_reconstructs(&a, &modal);
        assert_eq!(
            conjugate_partners(&modal.eigenvalues),
            vec![Some(1), Some(0), Some(3), Some(2)]
        );
    }

    #[test]
    fn repeated_real_eigenvalue_gets_independent_vectors() {
        let a = DMatrix::from_row_slice(3, 3, &[-2.0, 1.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0]);
        let modal = decompose_real(&a).expect("decomposition");
        assert!(modal.basis.iter().all(|c| c.im == 0.0));
        let mut values: Vec<f64> = modal.eigenvalues.iter().map(|c| c.re).collect();
        values.sort_by(f64::total_cmp);
        for (v, target) in values.iter().zip([-2.0, -1.0, -1.0]) {
            assert!((v - target).abs() < 1e-10);
        }
        assert_reconstructs(&a, &modal);
    }

    #[test]
    fn repeated_complex_eigenvalue_of_complex_matrix() {
        let lambda = Complex64::new(-0.05, 1.4);
        let mut a = DMatrix::from_diagonal(&DVector::from_vec(vec![
            lambda,
            lambda,
            Complex64::new(-1.0, 0.0),
        ]));
        // Similarity by a non-orthogonal basis keeps the repeated eigenvalue.
        let p = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 0.5, 0.0, 0.0, 1.0, 0.3, 0.2, 0.0, 1.0],
        )
        .map(|v| Complex64::new(v, 0.0));
        let p_inv = p.clone().try_inverse().expect("invertible");
        a = &p * a * p_inv;

        let modal = decompose(&a).expect("decomposition");
        let repeated = modal
            .eigenvalues
            .iter()
            .filter(|c| (*c - lambda).norm() < 1e-8)
            .count();
        assert_eq!(repeated, 2);
        let rebuilt = &modal.basis
            * DMatrix::from_diagonal(&DVector::from_vec(modal.eigenvalues.clone()))
            * &modal.inverse;
        assert!((rebuilt - a).norm() < 1e-9);
    }

    #[test]
    fn partners_found_for_conjugate_pairs_only() {
        let lambda = Complex64::new(-0.05, 1.4);
        let values = vec![lambda.conj(), Complex64::new(-3.0, 0.0), lambda];
        let partners = conjugate_partners(&values);
        assert_eq!(partners, vec![Some(2), None, Some(0)]);
    }
}
