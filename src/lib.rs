// Statistics for social-science survey analysis

#![doc = include_str!("../README.md")]

pub mod error;
pub mod gof;
pub mod linalg_backends;
pub mod pca;
pub mod rotation;
pub mod table;
pub mod weights;

pub use error::{Result, SurveyStatsError};
pub use gof::{cod, r2, r2_against_null, FittedModel, GoodnessOfFit, R2Options};
pub use pca::{summarize, Decomposition, PcaInput, PcaSummary};
pub use rotation::{
    pca_rotate, FactorRotator, RotatedLoadings, RotationConfig, RotationEngine, RotationInput,
    RotationKind,
};
pub use table::{Column, ColumnData, DataTable};
pub use weights::rescale_weights;

#[cfg(test)]
mod pca_tests;
