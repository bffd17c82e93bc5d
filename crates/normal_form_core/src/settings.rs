use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Continuous-time flow or discrete-time map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemKind {
    Flow,
    Map,
}

/// Which part of an eigenvalue combination measures its distance from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResonanceMetric {
    /// `|c|`. Damping differences count against resonance.
    Modulus,
    /// `|Im c|`, the frequency detuning. Keeps the whole backbone family
    /// `z^(k+1) z̄^k` of a lightly damped oscillator resonant at any degree.
    ImaginaryPart,
}

/// How the resonance tolerance is compared against an eigenvalue combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToleranceScale {
    /// `metric(c) < tolerance`.
    Absolute,
    /// `metric(c) / min_i |μ_i| < tolerance`, with `μ_i` the nonzero
    /// flow-equivalent exponents (`λ_i` for flows, `ln λ_i` for maps).
    RelativeToSpectrum,
}

/// Threshold deciding which eigenvalue combinations count as resonant.
///
/// These numbers fix the structure of the identified model, so they are
/// always explicit. The default flags combinations with `|c|` below a tenth
/// of the slowest eigenvalue.
///
/// [`ResonanceMetric::ImaginaryPart`] is opt-in. It ignores damping, so on a
/// spectrum without oscillatory modes every combination counts as resonant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResonanceSettings {
    pub tolerance: f64,
    pub metric: ResonanceMetric,
    pub scale: ToleranceScale,
}

impl Default for ResonanceSettings {
    fn default() -> Self {
        Self {
            tolerance: 0.1,
            metric: ResonanceMetric::Modulus,
            scale: ToleranceScale::RelativeToSpectrum,
        }
    }
}

impl ResonanceSettings {
    /// Plain `|c| < tolerance`.
    pub fn modulus(tolerance: f64) -> Self {
        Self {
            tolerance,
            metric: ResonanceMetric::Modulus,
            scale: ToleranceScale::Absolute,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            bail!(
                "resonance tolerance must be positive and finite, got {}.",
                self.tolerance
            );
        }
        Ok(())
    }
}

/// Stopping rules handed to [`levenberg_marquardt::LevenbergMarquardt`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LevenbergMarquardtSettings {
    /// Relative reduction of the cost below which iteration stops.
    pub ftol: f64,
    /// Relative step size below which iteration stops.
    pub xtol: f64,
    /// Cosine between residual and Jacobian columns below which iteration stops.
    pub gtol: f64,
    /// Initial step bound, relative to the scaled parameter norm.
    pub stepbound: f64,
    /// Residual evaluations allowed per parameter plus one.
    pub patience: usize,
    pub scale_diag: bool,
}

impl Default for LevenbergMarquardtSettings {
    fn default() -> Self {
        Self {
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
            stepbound: 100.0,
            patience: 100,
            scale_diag: true,
        }
    }
}

impl LevenbergMarquardtSettings {
    pub fn validate(&self) -> Result<()> {
        if self.patience == 0 {
            bail!("patience must be greater than zero.");
        }
        if !(self.stepbound.is_finite() && self.stepbound > 0.0) {
            bail!("stepbound must be positive and finite.");
        }
        if !(self.ftol >= 0.0 && self.xtol >= 0.0 && self.gtol >= 0.0) {
            bail!("ftol, xtol and gtol must be non-negative.");
        }
        Ok(())
    }
}

/// Settings for the end-to-end fit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FitSettings {
    pub kind: SystemKind,
    pub degree: usize,
    pub resonance: ResonanceSettings,
    pub solver: LevenbergMarquardtSettings,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            kind: SystemKind::Flow,
            degree: 3,
            resonance: ResonanceSettings::default(),
            solver: LevenbergMarquardtSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ResonanceSettings::default().validate().is_ok());
        assert!(LevenbergMarquardtSettings::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_tolerance() {
        let err = ResonanceSettings::modulus(0.0).validate().unwrap_err();
        assert!(format!("{err}").contains("resonance tolerance"));
        let err = ResonanceSettings::modulus(f64::NAN).validate().unwrap_err();
        assert!(format!("{err}").contains("resonance tolerance"));
    }

    #[test]
    fn rejects_zero_patience() {
        let settings = LevenbergMarquardtSettings {
            patience: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        let settings = LevenbergMarquardtSettings {
            gtol: f64::NAN,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn default_metric_is_the_modulus() {
        let settings = ResonanceSettings::default();
        assert_eq!(settings.metric, ResonanceMetric::Modulus);
        assert_eq!(settings.scale, ToleranceScale::RelativeToSpectrum);
    }
}
