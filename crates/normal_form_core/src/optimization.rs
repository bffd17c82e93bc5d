//! The joint least-squares problem for reduced dynamics and coordinate
//! transform.
//!
//! In modal coordinates `z = V⁻¹ x` the sought normal form is
//! `ζ = z + h(z)` with `ζ̇ = Λζ + N(ζ)` (flow) or `ζ⁺ = Λζ + N(ζ)` (map),
//! where `N` holds the resonant monomials and `h` the others. For every data
//! sample and fitted mode `k` the residual is
//!
//! ```text
//! r_k = e_k + Σ_j h_kj (Ψ_j − λ_k Φ_j) − Σ_l N_kl φ_l(ζ)
//! ```
//!
//! with `e_k = w_k − λ_k z_k`, `Φ = φ(z)` and `Ψ` the derivative (flow) or
//! shifted value (map) of `Φ`. `N` is evaluated at the transformed point, so
//! both coefficient sets enter one nonlinear problem.
//!
//! Every complex unknown is two reals. The flat parameter vector is
//! `[Re N…, Im N…, Re h…, Im h…]`, coefficients in the mode-major order of
//! the structure masks.

use anyhow::{anyhow, Context, Result};
use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};
use num_complex::{Complex, Complex64};

use crate::autodiff::Dual;
use crate::data::{shift_or_differentiate, PolynomialModel};
use crate::error::NormalFormError;
use crate::normal_form::{NormalForm, Structure};
use crate::polynomial::Polynomial;
use crate::settings::{ResonanceSettings, SystemKind};
use crate::traits::Scalar;

/// One trajectory in modal coordinates, one row per sample.
#[derive(Debug, Clone)]
pub struct ModalTrajectory {
    /// `z`, `samples × dimension`.
    pub coordinates: DMatrix<Complex64>,
    /// `Φ = φ(z)`, `samples × monomials`.
    pub features: DMatrix<Complex64>,
    /// `Ψ`: `dΦ/dt` for flows, `φ(z_next)` for maps.
    pub target_features: DMatrix<Complex64>,
    /// `w_k − λ_k z_k`, `samples × fitted modes`.
    pub linear_error: DMatrix<Complex64>,
}

impl ModalTrajectory {
    pub fn num_samples(&self) -> usize {
        self.coordinates.nrows()
    }
}

/// Data and structure shared by the objective and the unpacker.
#[derive(Debug, Clone)]
pub struct PreparedOptimization {
    normal_form: NormalForm,
    trajectories: Vec<ModalTrajectory>,
}

/// Prepare the problem from real trajectories (`dimension × samples` each)
/// and the real linear part of the reduced dynamics.
pub fn prepare_normalform_transform_optimization(
    times: &[Vec<f64>],
    trajectories: &[DMatrix<f64>],
    linear_part: &DMatrix<f64>,
    kind: SystemKind,
    degree: usize,
    settings: &ResonanceSettings,
) -> Result<PreparedOptimization> {
    let normal_form = NormalForm::from_real_with_settings(linear_part, *settings)
        .context("Failed to analyse the linear part.")?;
    PreparedOptimization::from_normal_form(normal_form, times, trajectories, kind, degree)
}

impl PreparedOptimization {
    /// Use an already constructed `NormalForm`, e.g. one built from a complex
    /// linear part. Its structure is (re)set for `kind` and `degree`.
    pub fn from_normal_form(
        mut normal_form: NormalForm,
        times: &[Vec<f64>],
        trajectories: &[DMatrix<f64>],
        kind: SystemKind,
        degree: usize,
    ) -> Result<Self> {
        let n = normal_form.dimension();
        for (idx, traj) in trajectories.iter().enumerate() {
            if traj.nrows() != n {
                return Err(NormalFormError::shape(
                    &format!("dimension of trajectory {idx}"),
                    n,
                    traj.nrows(),
                )
                .into());
            }
        }
        normal_form.set_dynamics_and_transformation_structure(kind, degree)?;
        let (xs, ys) = shift_or_differentiate(trajectories, times, kind)?;

        let structure = normal_form.structure()?;
        let modal_inverse = normal_form.modal_inverse();
        let modal = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| {
                let z = modal_inverse * x.map(|v| Complex64::new(v, 0.0));
                let w = modal_inverse * y.map(|v| Complex64::new(v, 0.0));
                build_trajectory(&normal_form, structure, &z, &w)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            normal_form,
            trajectories: modal,
        })
    }

    pub fn normal_form(&self) -> &NormalForm {
        &self.normal_form
    }

    pub fn trajectories(&self) -> &[ModalTrajectory] {
        &self.trajectories
    }

    /// `Φ` restricted to the transformation monomials of `mode`.
    pub fn transformation_features(
        &self,
        trajectory: usize,
        mode: usize,
    ) -> Result<DMatrix<Complex64>> {
        let traj = self.trajectory(trajectory)?;
        self.select_transformation_columns(&traj.features, mode)
    }

    /// `Ψ` restricted to the transformation monomials of `mode`.
    pub fn transformation_feature_derivatives(
        &self,
        trajectory: usize,
        mode: usize,
    ) -> Result<DMatrix<Complex64>> {
        let traj = self.trajectory(trajectory)?;
        self.select_transformation_columns(&traj.target_features, mode)
    }

    fn trajectory(&self, index: usize) -> Result<&ModalTrajectory> {
        self.trajectories.get(index).ok_or_else(|| {
            NormalFormError::shape("trajectory index", self.trajectories.len(), index).into()
        })
    }

    fn select_transformation_columns(
        &self,
        features: &DMatrix<Complex64>,
        mode: usize,
    ) -> Result<DMatrix<Complex64>> {
        let structure = self.normal_form.structure()?;
        let slot = fitted_slot(&self.normal_form, mode)?;
        let m = structure.num_monomials();
        let columns: Vec<usize> = (0..m)
            .filter(|&j| structure.transformation[slot * m + j])
            .collect();
        Ok(features.select_columns(columns.iter()))
    }
}

fn fitted_slot(normal_form: &NormalForm, mode: usize) -> Result<usize> {
    normal_form
        .fitted_modes()
        .iter()
        .position(|&k| k == mode)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Mode {mode} is not fitted; fitted modes are {:?}.",
                normal_form.fitted_modes()
            )
        })
}

fn build_trajectory(
    normal_form: &NormalForm,
    structure: &Structure,
    z: &DMatrix<Complex64>,
    w: &DMatrix<Complex64>,
) -> Result<ModalTrajectory> {
    let exponents = &structure.exponents;
    let samples = z.ncols();
    let m = exponents.len();
    let lambda = normal_form.eigenvalues();
    let fitted = normal_form.fitted_modes();

    let mut features = DMatrix::zeros(samples, m);
    let mut target_features = DMatrix::zeros(samples, m);
    let mut linear_error = DMatrix::zeros(samples, fitted.len());
    for s in 0..samples {
        let zs: Vec<Complex64> = z.column(s).iter().copied().collect();
        let ws: Vec<Complex64> = w.column(s).iter().copied().collect();
        let phi = exponents.evaluate(&zs)?;
        let psi: Vec<Complex64> = match structure.kind {
            SystemKind::Flow => {
                let jac = exponents.jacobian(&zs)?;
                (jac * DVector::from_vec(ws.clone())).iter().copied().collect()
            }
            SystemKind::Map => exponents.evaluate(&ws)?,
        };
        for j in 0..m {
            features[(s, j)] = phi[j];
            target_features[(s, j)] = psi[j];
        }
        for (slot, &k) in fitted.iter().enumerate() {
            linear_error[(s, slot)] = ws[k] - lambda[k] * zs[k];
        }
    }

    Ok(ModalTrajectory {
        coordinates: z.transpose(),
        features,
        target_features,
        linear_error,
    })
}

/// `(fitted slot, monomial)` of every `true` entry, in flattened order.
fn free_slots(mask: &[bool], num_monomials: usize) -> Vec<(usize, usize)> {
    mask.iter()
        .enumerate()
        .filter(|&(_, &free)| free)
        .map(|(idx, _)| (idx / num_monomials, idx % num_monomials))
        .collect()
}

/// Where a mode of `ζ` comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeSource {
    Fitted(usize),
    Conjugate(usize),
}

/// Every mode is either fitted or the conjugate of a fitted mode.
fn mode_sources(fitted: &[usize], partners: &[Option<usize>]) -> Result<Vec<ModeSource>> {
    (0..partners.len())
        .map(|mode| {
            if let Some(slot) = fitted.iter().position(|&k| k == mode) {
                return Ok(ModeSource::Fitted(slot));
            }
            partners[mode]
                .and_then(|partner| fitted.iter().position(|&k| k == partner))
                .map(ModeSource::Conjugate)
                .ok_or_else(|| {
                    anyhow!("Mode {mode} is neither fitted nor the conjugate of a fitted mode.")
                })
        })
        .collect()
}

fn lift<T: Scalar>(c: Complex64) -> Complex<T> {
    Complex::new(T::from(c.re), T::from(c.im))
}

/// Residual of the joint fit, usable as a [`LeastSquaresProblem`]. Carries
/// the current parameters, which start at zero.
#[derive(Debug, Clone)]
pub struct NormalFormObjective {
    prepared: PreparedOptimization,
    dynamics_slots: Vec<(usize, usize)>,
    transformation_slots: Vec<(usize, usize)>,
    sources: Vec<ModeSource>,
    residual_len: usize,
    params: DVector<f64>,
}

pub fn create_normalform_transform_objective(
    times: &[Vec<f64>],
    trajectories: &[DMatrix<f64>],
    linear_part: &DMatrix<f64>,
    kind: SystemKind,
    degree: usize,
    settings: &ResonanceSettings,
) -> Result<NormalFormObjective> {
    let prepared = prepare_normalform_transform_optimization(
        times,
        trajectories,
        linear_part,
        kind,
        degree,
        settings,
    )?;
    NormalFormObjective::new(prepared)
}

impl NormalFormObjective {
    pub fn new(prepared: PreparedOptimization) -> Result<Self> {
        let structure = prepared.normal_form.structure()?;
        let m = structure.num_monomials();
        let dynamics_slots = free_slots(&structure.dynamics, m);
        let transformation_slots = free_slots(&structure.transformation, m);
        let normal_form = &prepared.normal_form;
        let partners: Vec<Option<usize>> = (0..normal_form.dimension())
            .map(|mode| normal_form.conjugate_of(mode))
            .collect();
        let sources = mode_sources(normal_form.fitted_modes(), &partners)?;
        let n_fit = normal_form.fitted_modes().len();
        let samples: usize = prepared
            .trajectories
            .iter()
            .map(ModalTrajectory::num_samples)
            .sum();
        let params = DVector::zeros(2 * (dynamics_slots.len() + transformation_slots.len()));
        Ok(Self {
            residual_len: 2 * samples * n_fit,
            prepared,
            dynamics_slots,
            transformation_slots,
            sources,
            params,
        })
    }

    pub fn normal_form(&self) -> &NormalForm {
        &self.prepared.normal_form
    }

    pub fn prepared(&self) -> &PreparedOptimization {
        &self.prepared
    }

    /// Real unknowns of the reduced dynamics.
    pub fn n_unknowns_dynamics(&self) -> usize {
        2 * self.dynamics_slots.len()
    }

    /// Real unknowns of the coordinate transform.
    pub fn n_unknowns_transformation(&self) -> usize {
        2 * self.transformation_slots.len()
    }

    pub fn n_unknowns(&self) -> usize {
        self.n_unknowns_dynamics() + self.n_unknowns_transformation()
    }

    pub fn residual_dim(&self) -> usize {
        self.residual_len
    }

    pub fn parameters(&self) -> &DVector<f64> {
        &self.params
    }

    /// Replace the current parameters, checking their length.
    pub fn set_parameters(&mut self, params: DVector<f64>) -> Result<()> {
        self.check_parameter_length(params.len())?;
        self.params = params;
        Ok(())
    }

    fn check_parameter_length(&self, actual: usize) -> Result<()> {
        if actual != self.n_unknowns() {
            return Err(NormalFormError::ParameterLengthMismatch {
                actual,
                dynamics: self.n_unknowns_dynamics(),
                transformation: self.n_unknowns_transformation(),
            }
            .into());
        }
        Ok(())
    }

    pub fn residual_at(&self, params: &[f64]) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.residual_len);
        self.residual_generic(params, out.as_mut_slice())?;
        Ok(out)
    }

    /// Exact Jacobian by forward-mode differentiation, one seeded pass per
    /// parameter.
    pub fn jacobian_at(&self, params: &[f64]) -> Result<DMatrix<f64>> {
        self.check_parameter_length(params.len())?;
        let mut jac = DMatrix::zeros(self.residual_len, params.len());
        let mut buffer = vec![Dual::constant(0.0); self.residual_len];
        for i in 0..params.len() {
            let seeded = Dual::seed(params, i);
            self.residual_generic(&seeded, &mut buffer)?;
            for (r, value) in buffer.iter().enumerate() {
                jac[(r, i)] = value.eps;
            }
        }
        Ok(jac)
    }

    /// Residual for any scalar carrying the parameters; `[Re r…, Im r…]`
    /// over trajectories, samples and fitted modes.
    pub fn residual_generic<T: Scalar>(&self, params: &[T], out: &mut [T]) -> Result<()> {
        self.check_parameter_length(params.len())?;
        if out.len() != self.residual_len {
            return Err(
                NormalFormError::shape("residual buffer", self.residual_len, out.len()).into(),
            );
        }

        let n_dyn = self.dynamics_slots.len();
        let n_trans = self.transformation_slots.len();
        let (dyn_params, trans_params) = params.split_at(2 * n_dyn);
        let dynamics: Vec<Complex<T>> = (0..n_dyn)
            .map(|q| Complex::new(dyn_params[q], dyn_params[n_dyn + q]))
            .collect();
        let transformation: Vec<Complex<T>> = (0..n_trans)
            .map(|q| Complex::new(trans_params[q], trans_params[n_trans + q]))
            .collect();

        let normal_form = &self.prepared.normal_form;
        let structure = normal_form.structure()?;
        let lambda = normal_form.eigenvalues();
        let fitted = normal_form.fitted_modes();
        let n = normal_form.dimension();
        let half = self.residual_len / 2;

        let zero = Complex::new(T::zero(), T::zero());
        let mut shift = vec![zero; fitted.len()];
        let mut correction = vec![zero; fitted.len()];
        let mut zeta = vec![zero; n];
        let mut phi_zeta = vec![zero; structure.num_monomials()];

        let mut row = 0;
        for traj in &self.prepared.trajectories {
            for s in 0..traj.num_samples() {
                shift.iter_mut().for_each(|v| *v = zero);
                correction.iter_mut().for_each(|v| *v = zero);
                for (&(slot, j), &c) in self.transformation_slots.iter().zip(&transformation) {
                    let k = fitted[slot];
                    let phi = traj.features[(s, j)];
                    let psi = traj.target_features[(s, j)];
                    shift[slot] = shift[slot] + c * lift::<T>(phi);
                    correction[slot] = correction[slot] + c * lift::<T>(psi - lambda[k] * phi);
                }

                for (mode, source) in self.sources.iter().enumerate() {
                    let z: Complex<T> = lift(traj.coordinates[(s, mode)]);
                    zeta[mode] = match *source {
                        ModeSource::Fitted(slot) => z + shift[slot],
                        ModeSource::Conjugate(slot) => z + shift[slot].conj(),
                    };
                }
                structure.exponents.evaluate_into(&zeta, &mut phi_zeta);

                for slot in 0..fitted.len() {
                    let mut r = lift::<T>(traj.linear_error[(s, slot)]) + correction[slot];
                    for (&(k_slot, l), &c) in self.dynamics_slots.iter().zip(&dynamics) {
                        if k_slot == slot {
                            r = r - c * phi_zeta[l];
                        }
                    }
                    out[row] = r.re;
                    out[half + row] = r.im;
                    row += 1;
                }
            }
        }
        Ok(())
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for NormalFormObjective {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params.copy_from(params);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.residual_at(self.params.as_slice())
            .map_err(|err| log::warn!("residual evaluation failed: {err:#}"))
            .ok()
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        self.jacobian_at(self.params.as_slice())
            .map_err(|err| log::warn!("jacobian evaluation failed: {err:#}"))
            .ok()
    }
}

/// Dense coefficients over the nonlinear monomials, one row per fitted mode,
/// zero where the structure leaves a coefficient out.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizedCoefficients {
    pub coeff_dynamics: DMatrix<Complex64>,
    pub coeff_transformation: DMatrix<Complex64>,
}

pub fn unpack_optimized_coeffs(
    flat: &[f64],
    normal_form: &NormalForm,
    n_unknowns_dynamics: usize,
    n_unknowns_transformation: usize,
) -> Result<OptimizedCoefficients> {
    let structure = normal_form.structure()?;
    let m = structure.num_monomials();
    let dynamics_slots = free_slots(&structure.dynamics, m);
    let transformation_slots = free_slots(&structure.transformation, m);
    let mismatch = || NormalFormError::ParameterLengthMismatch {
        actual: flat.len(),
        dynamics: n_unknowns_dynamics,
        transformation: n_unknowns_transformation,
    };
    if flat.len() != n_unknowns_dynamics + n_unknowns_transformation
        || n_unknowns_dynamics != 2 * dynamics_slots.len()
        || n_unknowns_transformation != 2 * transformation_slots.len()
    {
        return Err(mismatch().into());
    }

    let (dyn_block, trans_block) = flat.split_at(n_unknowns_dynamics);
    let n_fit = normal_form.fitted_modes().len();
    Ok(OptimizedCoefficients {
        coeff_dynamics: scatter(dyn_block, &dynamics_slots, n_fit, m),
        coeff_transformation: scatter(trans_block, &transformation_slots, n_fit, m),
    })
}

fn scatter(
    block: &[f64],
    slots: &[(usize, usize)],
    rows: usize,
    cols: usize,
) -> DMatrix<Complex64> {
    let count = slots.len();
    let mut dense = DMatrix::zeros(rows, cols);
    for (q, &(slot, j)) in slots.iter().enumerate() {
        dense[(slot, j)] = Complex64::new(block[q], block[count + q]);
    }
    dense
}

/// Inverse of [`unpack_optimized_coeffs`]; entries outside the structure
/// are ignored.
pub fn pack_coeffs(coeffs: &OptimizedCoefficients, normal_form: &NormalForm) -> Result<DVector<f64>> {
    let structure = normal_form.structure()?;
    let m = structure.num_monomials();
    let n_fit = normal_form.fitted_modes().len();
    for (what, matrix) in [
        ("dynamics coefficients", &coeffs.coeff_dynamics),
        ("transformation coefficients", &coeffs.coeff_transformation),
    ] {
        if matrix.shape() != (n_fit, m) {
            return Err(NormalFormError::shape(
                what,
                format!("{n_fit}x{m}"),
                format!("{}x{}", matrix.nrows(), matrix.ncols()),
            )
            .into());
        }
    }

    let mut flat = Vec::new();
    for (mask, matrix) in [
        (&structure.dynamics, &coeffs.coeff_dynamics),
        (&structure.transformation, &coeffs.coeff_transformation),
    ] {
        let slots = free_slots(mask, m);
        flat.extend(slots.iter().map(|&(slot, j)| matrix[(slot, j)].re));
        flat.extend(slots.iter().map(|&(slot, j)| matrix[(slot, j)].im));
    }
    Ok(DVector::from_vec(flat))
}

/// The pre-fit model rewritten in modal coordinates, `ż = V⁻¹ f(V z)`,
/// one polynomial per mode.
pub(crate) fn modal_vector_field(
    model: &PolynomialModel,
    normal_form: &NormalForm,
) -> Result<Vec<Polynomial>> {
    let n = normal_form.dimension();
    if model.dimension() != n {
        return Err(NormalFormError::shape("pre-fit model dimension", n, model.dimension()).into());
    }
    let basis = normal_form.modal_basis();
    let inverse = normal_form.modal_inverse();
    let degree = model.degree();

    // powers[i][p] = x_i^p with x = V z.
    let mut powers = Vec::with_capacity(n);
    for i in 0..n {
        let row: Vec<Complex64> = basis.row(i).iter().copied().collect();
        let x_i = Polynomial::linear_form(&row);
        let mut table = vec![Polynomial::one(n)];
        for p in 1..=degree {
            table.push(table[p - 1].mul(&x_i)?);
        }
        powers.push(table);
    }

    let monomials = model
        .exponents()
        .columns()
        .map(|exponent| {
            exponent
                .iter()
                .enumerate()
                .try_fold(Polynomial::one(n), |acc, (i, &e)| acc.mul(&powers[i][e]))
        })
        .collect::<Result<Vec<_>>>()?;

    let coefficients = model.coefficients();
    let mut physical = Vec::with_capacity(n);
    for r in 0..n {
        let mut f_r = Polynomial::zero(n);
        for (j, mono) in monomials.iter().enumerate() {
            f_r = f_r.add(&mono.scale(Complex64::new(coefficients[(r, j)], 0.0)))?;
        }
        physical.push(f_r);
    }

    (0..n)
        .map(|k| {
            physical
                .iter()
                .enumerate()
                .try_fold(Polynomial::zero(n), |acc, (r, f_r)| {
                    acc.add(&f_r.scale(inverse[(k, r)]))
                })
        })
        .collect()
}

/// Start the fit from the pre-fit model: resonant coefficients are read off
/// its modal form, the transform starts at the identity.
///
/// The linear block of the reduced dynamics is the spectrum of the linear
/// part and is not a parameter. The structure of `normal_form` must be set.
pub fn create_normalform_initial_guess(
    model: &PolynomialModel,
    normal_form: &NormalForm,
) -> Result<DVector<f64>> {
    let structure = normal_form.structure()?;
    let modal = modal_vector_field(model, normal_form)?;
    let m = structure.num_monomials();
    let fitted = normal_form.fitted_modes();

    let mut coeff_dynamics = DMatrix::zeros(fitted.len(), m);
    for (slot, j) in free_slots(&structure.dynamics, m) {
        coeff_dynamics[(slot, j)] = modal[fitted[slot]].coefficient(structure.exponents.column(j));
    }
    let coeffs = OptimizedCoefficients {
        coeff_dynamics,
        coeff_transformation: DMatrix::zeros(fitted.len(), m),
    };
    pack_coeffs(&coeffs, normal_form)
}
