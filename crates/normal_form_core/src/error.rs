use thiserror::Error;

/// Precondition violations callers may want to match on.
///
/// These are raised through `anyhow::Error`; recover the variant with
/// `err.downcast_ref::<NormalFormError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalFormError {
    #[error("invalid dimension {0}: must be at least 1")]
    InvalidDimension(usize),

    #[error("invalid degree range {min}..={max}")]
    InvalidDegree { min: usize, max: usize },

    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error(
        "parameter vector has length {actual}, expected {dynamics} dynamics + {transformation} transformation unknowns"
    )]
    ParameterLengthMismatch {
        actual: usize,
        dynamics: usize,
        transformation: usize,
    },
}

impl NormalFormError {
    pub(crate) fn shape(what: &str, expected: impl ToString, actual: impl ToString) -> Self {
        NormalFormError::ShapeMismatch {
            what: what.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
