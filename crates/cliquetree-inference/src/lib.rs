//! Exact inference over discrete probabilistic graphical models on clique trees.
//!
//! This crate provides the calibration engine of a junction-tree inference
//! stack and the discrete-factor algebra it is built on.
//!
//! # Core Concepts
//!
//! - **Assignments**: mixed-radix enumeration of joint values and flat-array addressing
//! - **Factors**: dense tables with product, sum-out, restriction, normalization, division
//! - **Clique trees**: validated tree structure with original and evidence-restricted potentials
//! - **Calibration**: two-pass sum-product message passing yielding exact clique marginals
//! - **Parameter learning**: expectation-maximization driven by repeated calibration
//!
//! # Architecture
//!
//! ```text
//! Assignment/StrideMap → Factor → CliqueTree → Calibration → ExpectationMaximization
//!        ↓                 ↓          ↓             ↓                  ↓
//!   Flat indices      Table algebra  Structure  Clique marginals  Conditional tables
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cliquetree_inference::{CliqueNode, CliqueTree, Evidence, Factor};
//!
//! let card: Arc<[usize]> = Arc::from(vec![2, 2, 2]);
//! let nodes = vec![
//!     CliqueNode::new(vec![0, 1], vec![], vec![1]),
//!     CliqueNode::new(vec![1, 2], vec![1], vec![0]),
//! ];
//! let mut tree = CliqueTree::new(card.clone(), nodes)?;
//! tree.set_potential(0, Factor::new(vec![0, 1], card.clone(), vec![0.3, 0.2, 0.1, 0.4])?)?;
//! tree.set_potential(1, Factor::new(vec![1, 2], card, vec![0.9, 0.5, 0.1, 0.5])?)?;
//!
//! tree.restrict_by_evidence(&Evidence::from_row(&[-1, -1, 0]))?;
//! tree.calibrate()?;
//! let p_evidence = tree.calibrated_potential(tree.root()).sum();
//! assert!((p_evidence - (0.3 * 0.9 + 0.2 * 0.9 + 0.1 * 0.5 + 0.4 * 0.5)).abs() < 1e-12);
//! # Ok::<(), cliquetree_inference::PgmError>(())
//! ```

mod assignment;
mod calibration;
mod clique_tree;
mod error;
mod factor;
pub mod parameter_learning;

pub use assignment::{Assignment, Cardinalities, Evidence, StrideMap};
pub use calibration::Calibration;
pub use clique_tree::{CliqueNode, CliqueTree};
pub use error::{PgmError, Result};
pub use factor::Factor;
pub use parameter_learning::{EmConfig, EmReport, ExpectationMaximization, ExpectedCounts};

/// Log-likelihood of each data row under a tree's current potentials.
///
/// Rows with zero probability yield `Err(PgmError::ZeroProbabilityEvidence)`
/// in their slot; other rows are unaffected.
pub fn row_log_likelihoods(tree: &CliqueTree, rows: &[Evidence]) -> Vec<Result<f64>> {
    rows.iter()
        .map(|row| tree.calibrate_with(Some(row))?.log_probability_of_evidence())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    #[test]
    fn test_row_log_likelihoods() {
        let card: Cardinalities = Arc::from(vec![2, 2]);
        let nodes = vec![CliqueNode::new(vec![0, 1], vec![], vec![])];
        let mut tree = CliqueTree::new(card.clone(), nodes).unwrap();
        tree.set_potential(0, Factor::new(vec![0, 1], card, vec![0.5, 0.0, 0.25, 0.25]).unwrap())
            .unwrap();

        let rows = vec![
            Evidence::from_row(&[0, 0]),
            Evidence::from_row(&[1, 0]),
            Evidence::from_row(&[-1, 1]),
        ];
        let lls = row_log_likelihoods(&tree, &rows);

        assert_abs_diff_eq!(*lls[0].as_ref().unwrap(), 0.5f64.ln(), epsilon = 1e-12);
        assert_eq!(lls[1], Err(PgmError::ZeroProbabilityEvidence));
        assert_abs_diff_eq!(*lls[2].as_ref().unwrap(), 0.5f64.ln(), epsilon = 1e-12);
    }
}
