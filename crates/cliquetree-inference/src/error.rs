//! Error types for factor algebra and clique-tree calibration.

use thiserror::Error;

/// Errors that can occur in factor and clique-tree operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PgmError {
    /// Variable id outside the cardinality table, or not covered by any clique
    #[error("Variable not found: {0}")]
    VariableNotFound(usize),

    /// Flat value array or scope of the wrong size
    #[error("Dimension mismatch: expected {expected:?}, got {got:?}")]
    DimensionMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// Two factors disagree on the cardinality of a shared variable
    #[error("Cardinality mismatch for variable {variable}: {left} vs {right}")]
    CardinalityMismatch {
        variable: usize,
        left: usize,
        right: usize,
    },

    /// Malformed clique, separator or adjacency data
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Evidence vector of the wrong length or with out-of-range values
    #[error("Invalid evidence: {0}")]
    InvalidEvidence(String),

    /// Normalizing a factor whose values sum to zero
    #[error("Cannot normalize a factor whose values sum to zero")]
    ZeroPartition,

    /// The observed evidence has probability zero under the current model
    #[error("Evidence has zero probability under the current model")]
    ZeroProbabilityEvidence,

    /// Learner configuration out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PgmError {
    /// Whether a caller can recover by skipping the offending data row.
    pub fn is_zero_probability(&self) -> bool {
        matches!(self, Self::ZeroPartition | Self::ZeroProbabilityEvidence)
    }
}

/// Result type for PGM operations.
pub type Result<T> = std::result::Result<T, PgmError>;
