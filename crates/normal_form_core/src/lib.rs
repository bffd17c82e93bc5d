/// The `normal_form_core` crate identifies data-driven normal forms of the reduced
/// dynamics on a spectral submanifold.
/// Given trajectories near an equilibrium and the linear part of the dynamics, it decides
/// which nonlinear monomials are resonant and fits the resonant reduced dynamics together
/// with the polynomial change of coordinates that removes the rest.
///
/// Key components:
/// - **Monomials**: exponent enumeration in graded order and monomial evaluation.
/// - **Normal form**: eigenvalue combinations, resonance masks and the dynamics/transform split.
/// - **Transform**: explicit polynomial coordinate transforms over real or complex data.
/// - **Optimization**: the joint least-squares objective, parameter packing and initial guess.
/// - **Solvers**: Levenberg–Marquardt from the `levenberg-marquardt` crate.
/// - **Autodiff**: Dual numbers for exact Jacobians of the objective.
pub mod autodiff;
pub mod data;
pub mod error;
pub mod fit;
pub mod monomials;
pub mod normal_form;
pub mod optimization;
pub mod polynomial;
pub mod settings;
pub mod solvers;
pub mod spectrum;
pub mod traits;
pub mod transform;

#[cfg(test)]
mod test_support;

pub use error::NormalFormError;
pub use fit::{fit_normal_form, NormalFormFit, NormalFormModel};
pub use normal_form::NormalForm;
pub use settings::{FitSettings, ResonanceSettings, SystemKind};
pub use transform::NonlinearCoordinateTransform;
