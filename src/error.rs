// src/error.rs

use thiserror::Error;

/// Errors raised by the weight, decomposition, rotation and goodness-of-fit routines.
///
/// An unsupported model kind is deliberately absent: `gof::r2` answers it with
/// `Ok(None)` so that callers looping over heterogeneous models keep going.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SurveyStatsError {
    #[error("invalid argument `{argument}`: expected {expected}")]
    Input { argument: String, expected: String },

    #[error("{capability} is not available; inject an implementation that provides it")]
    MissingDependency { capability: String },

    #[error("group `{group}` has a total weight of zero, rescaled weights are undefined")]
    DivisionByZero { group: String },

    #[error("type mismatch for `{argument}`: expected {expected}, found {found}")]
    TypeMismatch {
        argument: String,
        expected: String,
        found: String,
    },

    #[error("linear algebra failure: {0}")]
    Linalg(String),
}

pub type Result<T> = std::result::Result<T, SurveyStatsError>;

impl SurveyStatsError {
    pub(crate) fn input(argument: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::Input {
            argument: argument.into(),
            expected: expected.into(),
        }
    }

    pub(crate) fn type_mismatch(
        argument: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            argument: argument.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }
}
