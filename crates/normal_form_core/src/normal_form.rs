//! Resonance analysis of the linear part and the resulting split of the
//! nonlinear coefficients into reduced dynamics and coordinate transform.

use anyhow::{anyhow, bail, Result};
use nalgebra::DMatrix;
use num_complex::Complex64;
use std::f64::consts::PI;

use crate::monomials::{nonlinear_exponents, ExponentTable};
use crate::settings::{ResonanceMetric, ResonanceSettings, SystemKind, ToleranceScale};
use crate::spectrum::{conjugate_partners, decompose, decompose_real, ModalDecomposition};

/// Which nonlinear coefficients are free, flattened mode-major over
/// `(fitted mode, monomial)`.
#[derive(Debug, Clone)]
pub struct Structure {
    pub kind: SystemKind,
    pub degree: usize,
    pub exponents: ExponentTable,
    pub dynamics: Vec<bool>,
    pub transformation: Vec<bool>,
}

impl Structure {
    pub fn num_monomials(&self) -> usize {
        self.exponents.len()
    }

    pub fn free_dynamics(&self) -> usize {
        self.dynamics.iter().filter(|&&b| b).count()
    }

    pub fn free_transformation(&self) -> usize {
        self.transformation.iter().filter(|&&b| b).count()
    }
}

#[derive(Debug, Clone)]
pub struct NormalForm {
    modal: ModalDecomposition,
    partners: Vec<Option<usize>>,
    fitted_modes: Vec<usize>,
    settings: ResonanceSettings,
    structure: Option<Structure>,
}

impl NormalForm {
    pub fn new(linear_part: &DMatrix<Complex64>) -> Result<Self> {
        Self::with_settings(linear_part, ResonanceSettings::default())
    }

    pub fn with_settings(
        linear_part: &DMatrix<Complex64>,
        settings: ResonanceSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self::from_modal(decompose(linear_part)?, settings))
    }

    pub fn from_real(linear_part: &DMatrix<f64>) -> Result<Self> {
        Self::from_real_with_settings(linear_part, ResonanceSettings::default())
    }

    pub fn from_real_with_settings(
        linear_part: &DMatrix<f64>,
        settings: ResonanceSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self::from_modal(decompose_real(linear_part)?, settings))
    }

    fn from_modal(modal: ModalDecomposition, settings: ResonanceSettings) -> Self {
        let partners = conjugate_partners(&modal.eigenvalues);
        // The lower member of each conjugate pair follows from its partner.
        let fitted_modes = (0..modal.eigenvalues.len())
            .filter(|&i| !(partners[i].is_some() && modal.eigenvalues[i].im < 0.0))
            .collect();
        Self {
            modal,
            partners,
            fitted_modes,
            settings,
            structure: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.modal.eigenvalues.len()
    }

    pub fn eigenvalues(&self) -> &[Complex64] {
        &self.modal.eigenvalues
    }

    /// `V`, whose columns are the eigenvectors of the linear part.
    pub fn modal_basis(&self) -> &DMatrix<Complex64> {
        &self.modal.basis
    }

    /// `V⁻¹`, maps physical reduced coordinates to modal ones.
    pub fn modal_inverse(&self) -> &DMatrix<Complex64> {
        &self.modal.inverse
    }

    pub fn settings(&self) -> &ResonanceSettings {
        &self.settings
    }

    pub fn conjugate_of(&self, mode: usize) -> Option<usize> {
        self.partners.get(mode).copied().flatten()
    }

    /// Modes whose coefficients are unknowns of the fit.
    pub fn fitted_modes(&self) -> &[usize] {
        &self.fitted_modes
    }

    /// Exponent table of the nonlinear monomials, degrees `2..=degree`.
    pub fn nonlinear_coefficients(&self, degree: usize) -> Result<ExponentTable> {
        nonlinear_exponents(self.dimension(), degree)
    }

    /// `dimension × m` table of small divisors, row `k` = output mode.
    ///
    /// Flow: `λ_k − Σ_i e_i λ_i`.
    /// Map: `ln λ_k − Σ_i e_i ln λ_i` with the imaginary part wrapped to
    /// `(−π, π]`, the log form of `λ_k = Π_i λ_i^{e_i}`.
    pub fn eigenvalue_linear_combinations(
        &self,
        kind: SystemKind,
        degree: usize,
    ) -> Result<DMatrix<Complex64>> {
        let exponents = self.nonlinear_coefficients(degree)?;
        let mu = self.flow_equivalent_exponents(kind)?;
        let combination = |k: usize, exponent: &[usize]| -> Complex64 {
            let sum: Complex64 = exponent
                .iter()
                .zip(&mu)
                .map(|(&e, &m)| m * e as f64)
                .sum();
            mu[k] - sum
        };
        let table = match kind {
            SystemKind::Flow => DMatrix::from_fn(self.dimension(), exponents.len(), |k, j| {
                combination(k, exponents.column(j))
            }),
            SystemKind::Map => DMatrix::from_fn(self.dimension(), exponents.len(), |k, j| {
                let c = combination(k, exponents.column(j));
                Complex64::new(c.re, wrap_angle(c.im))
            }),
        };
        Ok(table)
    }

    /// `λ_i` for flows, `ln λ_i` for maps.
    fn flow_equivalent_exponents(&self, kind: SystemKind) -> Result<Vec<Complex64>> {
        match kind {
            SystemKind::Flow => Ok(self.modal.eigenvalues.clone()),
            SystemKind::Map => self
                .modal
                .eigenvalues
                .iter()
                .map(|&lambda| {
                    if lambda.norm() == 0.0 {
                        bail!("Map has a zero multiplier; its logarithm is undefined.");
                    }
                    Ok(lambda.ln())
                })
                .collect(),
        }
    }

    /// Resonance mask with the instance's settings.
    pub fn resonance_condition(&self, kind: SystemKind, degree: usize) -> Result<DMatrix<bool>> {
        self.resonance_condition_with(kind, degree, &self.settings)
    }

    /// `true` where the eigenvalue combination, measured and scaled as
    /// `settings` says, is below the tolerance.
    pub fn resonance_condition_with(
        &self,
        kind: SystemKind,
        degree: usize,
        settings: &ResonanceSettings,
    ) -> Result<DMatrix<bool>> {
        settings.validate()?;
        let combinations = self.eigenvalue_linear_combinations(kind, degree)?;
        let scale = match settings.scale {
            ToleranceScale::Absolute => 1.0,
            ToleranceScale::RelativeToSpectrum => {
                let smallest = self
                    .flow_equivalent_exponents(kind)?
                    .iter()
                    .map(|m| m.norm())
                    .filter(|&n| n > 0.0)
                    .fold(f64::INFINITY, f64::min);
                if smallest.is_finite() {
                    smallest
                } else {
                    1.0
                }
            }
        };
        let metric = settings.metric;
        Ok(combinations.map(|c| {
            let distance = match metric {
                ResonanceMetric::Modulus => c.norm(),
                ResonanceMetric::ImaginaryPart => c.im.abs(),
            };
            distance / scale < settings.tolerance
        }))
    }

    /// Split the nonlinear coefficients of degrees `2..=degree`: resonant
    /// ones belong to the reduced dynamics, the rest to the transform.
    pub fn set_dynamics_and_transformation_structure(
        &mut self,
        kind: SystemKind,
        degree: usize,
    ) -> Result<()> {
        let exponents = self.nonlinear_coefficients(degree)?;
        let resonances = self.resonance_condition(kind, degree)?;

        let m = exponents.len();
        let mut dynamics = Vec::with_capacity(self.fitted_modes.len() * m);
        for &mode in &self.fitted_modes {
            let row: Vec<bool> = (0..m).map(|j| resonances[(mode, j)]).collect();
            if !row.iter().any(|&b| b) {
                log::warn!(
                    "no resonant terms up to degree {degree} for mode {mode} (λ = {}); \
                     its reduced dynamics stay linear",
                    self.modal.eigenvalues[mode]
                );
            }
            dynamics.extend(row);
        }
        let transformation = dynamics.iter().map(|&b| !b).collect();

        self.structure = Some(Structure {
            kind,
            degree,
            exponents,
            dynamics,
            transformation,
        });
        Ok(())
    }

    pub fn structure(&self) -> Result<&Structure> {
        self.structure.as_ref().ok_or_else(|| {
            anyhow!("Dynamics and transformation structure has not been set.")
        })
    }

    /// Empty until the structure is set.
    pub fn dynamics_structure(&self) -> &[bool] {
        self.structure
            .as_ref()
            .map(|s| s.dynamics.as_slice())
            .unwrap_or(&[])
    }

    /// Empty until the structure is set.
    pub fn transformation_structure(&self) -> &[bool] {
        self.structure
            .as_ref()
            .map(|s| s.transformation.as_slice())
            .unwrap_or(&[])
    }

    pub fn structure_kind(&self) -> Option<SystemKind> {
        self.structure.as_ref().map(|s| s.kind)
    }

    pub fn structure_degree(&self) -> Option<usize> {
        self.structure.as_ref().map(|s| s.degree)
    }
}

fn wrap_angle(theta: f64) -> f64 {
    let two_pi = 2.0 * PI;
    let mut wrapped = theta - two_pi * (theta / two_pi).round();
    if wrapped <= -PI {
        wrapped += two_pi;
    }
    wrapped
}
