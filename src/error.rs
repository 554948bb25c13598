//! Error types for factor construction and evaluation.
//!
//! Errors fall into three kinds (see [`ErrorKind`]): precondition
//! violations, insufficient-rank marginalizations, and combinations that
//! are recognized but not implemented. Substitutions that cannot be
//! performed eagerly are never errors; they stay lazy.

use thiserror::Error;

use crate::domain::Domain;
use crate::ops::AssocOp;

/// Coarse classification of a [`FactorError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid shapes, domains, names or operator pairs.
    Precondition,
    /// Marginalizing more real dimensions than the rank supports.
    InsufficientRank,
    /// A valid request this engine does not support yet.
    NotImplemented,
}

/// Errors raised while building or evaluating terms.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FactorError {
    #[error("shape mismatch: expected {expected}, found {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("domain mismatch for '{name}': {expected} vs {actual}")]
    DomainMismatch {
        name: String,
        expected: Domain,
        actual: Domain,
    },

    #[error("variable substitution name conflict: '{0}'")]
    NameConflict(String),

    #[error("operator pair ({red}, {bin}) does not distribute")]
    NonDistributive { red: AssocOp, bin: AssocOp },

    #[error("invalid contraction: {0}")]
    InvalidContraction(String),

    #[error("matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("gaussian is not normalizable (rank {rank}, dim {dim}, negate {negate})")]
    NotNormalizable {
        rank: usize,
        dim: usize,
        negate: bool,
    },

    #[error("index {index} out of range for '{name}' of size {size}")]
    IndexOutOfRange {
        name: String,
        index: i64,
        size: usize,
    },

    #[error("{0}")]
    Precondition(String),

    #[error(
        "too little information to marginalize over {vars:?} (rank {rank} < {dim}); consider adding a prior"
    )]
    InsufficientRank {
        vars: Vec<String>,
        rank: usize,
        dim: usize,
    },

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl FactorError {
    /// Which part of the taxonomy this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FactorError::InsufficientRank { .. } => ErrorKind::InsufficientRank,
            FactorError::NotImplemented(_) => ErrorKind::NotImplemented,
            _ => ErrorKind::Precondition,
        }
    }

    pub(crate) fn shape(expected: impl ToString, actual: impl ToString) -> Self {
        FactorError::ShapeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FactorError>;
