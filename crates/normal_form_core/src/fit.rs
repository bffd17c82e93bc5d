//! End-to-end identification and the resulting normal-form model.

use anyhow::{Context, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;

use crate::data::PolynomialModel;
use crate::error::NormalFormError;
use crate::normal_form::NormalForm;
use crate::optimization::{
    create_normalform_initial_guess, create_normalform_transform_objective,
    unpack_optimized_coeffs, OptimizedCoefficients,
};
use crate::settings::FitSettings;
use crate::solvers::{levenberg_marquardt, LeastSquaresReport};
use crate::transform::NonlinearCoordinateTransform;

#[derive(Debug)]
pub struct NormalFormFit {
    pub model: NormalFormModel,
    pub report: LeastSquaresReport,
}

/// Fit reduced dynamics and coordinate transform jointly, starting from the
/// pre-fit polynomial `model` of the same data.
pub fn fit_normal_form(
    times: &[Vec<f64>],
    trajectories: &[DMatrix<f64>],
    linear_part: &DMatrix<f64>,
    model: &PolynomialModel,
    settings: &FitSettings,
) -> Result<NormalFormFit> {
    settings.solver.validate()?;
    let mut objective = create_normalform_transform_objective(
        times,
        trajectories,
        linear_part,
        settings.kind,
        settings.degree,
        &settings.resonance,
    )?;
    let guess = create_normalform_initial_guess(model, objective.normal_form())?;
    objective.set_parameters(guess)?;
    let (objective, report) = levenberg_marquardt(objective, &settings.solver)
        .context("Least-squares fit of the normal form failed.")?;
    log::info!(
        "normal form fit: {:?} after {} evaluations, cost {:.6e} -> {:.6e}",
        report.minimization.termination,
        report.minimization.number_of_evaluations,
        report.initial_cost,
        report.cost
    );
    if !report.converged() {
        log::warn!(
            "normal form fit stopped without converging: {:?}",
            report.minimization.termination
        );
    }

    let coefficients = unpack_optimized_coeffs(
        report.x.as_slice(),
        objective.normal_form(),
        objective.n_unknowns_dynamics(),
        objective.n_unknowns_transformation(),
    )?;
    let model = NormalFormModel::new(objective.normal_form().clone(), coefficients)?;
    Ok(NormalFormFit { model, report })
}

/// Identified normal form: `ζ = z + h(z)` with `z = V⁻¹ x`, and
/// `ζ̇ = Λζ + N(ζ)` (flow) or `ζ⁺ = Λζ + N(ζ)` (map).
#[derive(Debug, Clone)]
pub struct NormalFormModel {
    normal_form: NormalForm,
    coefficients: OptimizedCoefficients,
}

impl NormalFormModel {
    pub fn new(normal_form: NormalForm, coefficients: OptimizedCoefficients) -> Result<Self> {
        let structure = normal_form.structure()?;
        let expected = (normal_form.fitted_modes().len(), structure.num_monomials());
        for (what, matrix) in [
            ("dynamics coefficients", &coefficients.coeff_dynamics),
            ("transformation coefficients", &coefficients.coeff_transformation),
        ] {
            if matrix.shape() != expected {
                return Err(NormalFormError::shape(
                    what,
                    format!("{}x{}", expected.0, expected.1),
                    format!("{}x{}", matrix.nrows(), matrix.ncols()),
                )
                .into());
            }
        }
        Ok(Self {
            normal_form,
            coefficients,
        })
    }

    pub fn coefficients(&self) -> &OptimizedCoefficients {
        &self.coefficients
    }

    pub fn normal_form(&self) -> &NormalForm {
        &self.normal_form
    }

    /// `z = V⁻¹ x` for points given as rows (`samples × dimension`).
    pub fn modal_coordinates(&self, points: &DMatrix<f64>) -> Result<DMatrix<Complex64>> {
        let n = self.normal_form.dimension();
        if points.ncols() != n {
            return Err(NormalFormError::shape("point columns", n, points.ncols()).into());
        }
        let complex = points.map(|v| Complex64::new(v, 0.0));
        Ok(complex * self.normal_form.modal_inverse().transpose())
    }

    /// `z ↦ z + h(z)` over all modes.
    pub fn coordinate_transform(&self) -> Result<NonlinearCoordinateTransform<Complex64>> {
        let n = self.normal_form.dimension();
        let degree = self.degree()?;
        let nonlinear = self.all_modes(&self.coefficients.coeff_transformation)?;
        let mut coefficients = DMatrix::zeros(n, n + nonlinear.ncols());
        for k in 0..n {
            coefficients[(k, k)] = Complex64::new(1.0, 0.0);
        }
        coefficients.columns_mut(n, nonlinear.ncols()).copy_from(&nonlinear);
        NonlinearCoordinateTransform::new(n, degree, coefficients)
    }

    /// Data points (rows) in normal-form coordinates `ζ`.
    pub fn normal_form_coordinates(&self, points: &DMatrix<f64>) -> Result<DMatrix<Complex64>> {
        let z = self.modal_coordinates(points)?;
        self.coordinate_transform()?.transform(&z)
    }

    /// `Λζ + N(ζ)`: the velocity for flows, the next iterate for maps.
    pub fn vector_field(&self, zeta: &[Complex64]) -> Result<DVector<Complex64>> {
        let structure = self.normal_form.structure()?;
        let features = DVector::from_vec(structure.exponents.evaluate(zeta)?);
        let nonlinear = self.all_modes(&self.coefficients.coeff_dynamics)? * features;
        let linear = DVector::from_iterator(
            zeta.len(),
            self.normal_form
                .eigenvalues()
                .iter()
                .zip(zeta)
                .map(|(&lambda, &z)| lambda * z),
        );
        Ok(linear + nonlinear)
    }

    fn degree(&self) -> Result<usize> {
        Ok(self.normal_form.structure()?.degree)
    }

    /// Expand fitted-mode rows to all modes. The row of the conjugate `k̄` of
    /// a fitted mode `k` carries `conj(c_e)` at the exponent with the entries
    /// of every conjugate pair swapped.
    fn all_modes(&self, fitted_rows: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>> {
        let structure = self.normal_form.structure()?;
        let exponents = &structure.exponents;
        let n = self.normal_form.dimension();
        let partner: Vec<usize> = (0..n)
            .map(|a| self.normal_form.conjugate_of(a).unwrap_or(a))
            .collect();

        let mut full = DMatrix::zeros(n, exponents.len());
        for (slot, &k) in self.normal_form.fitted_modes().iter().enumerate() {
            for j in 0..exponents.len() {
                full[(k, j)] = fitted_rows[(slot, j)];
            }
            let k_bar = partner[k];
            if k_bar == k {
                continue;
            }
            for (j, exponent) in exponents.columns().enumerate() {
                let mut swapped = vec![0; n];
                for (a, &e) in exponent.iter().enumerate() {
                    swapped[partner[a]] = e;
                }
                let target = exponents.position_of(&swapped).ok_or_else(|| {
                    anyhow::anyhow!("Conjugate exponent {swapped:?} missing from the table.")
                })?;
                full[(k_bar, target)] = fitted_rows[(slot, j)].conj();
            }
        }
        Ok(full)
    }
}
