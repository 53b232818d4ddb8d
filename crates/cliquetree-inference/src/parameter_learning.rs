//! Expectation-maximization over clique-tree potentials.
//!
//! The model is the product of one conditional table per node,
//! P(clique \ separator | separator), which is a normalized joint whenever the
//! tree has the running-intersection property. Each EM iteration:
//!
//! - **E-step**: for every data row, restrict the potentials by the row,
//!   calibrate, and add each node's normalized calibrated potential to that
//!   node's expected-count table.
//! - **M-step**: divide each expected-count table by its own marginal over the
//!   separator to get the new conditional table (0/0 → 0).
//!
//! Rows are independent during the E-step, so they are calibrated in parallel
//! with rayon, each in its own [`Calibration`](crate::Calibration) session.
//!
//! # Examples
//!
//! ```ignore
//! let learner = ExpectationMaximization::new(EmConfig::default().with_tolerance(1e-8))?;
//! learner.initialize_uniform(&mut tree)?;
//! let report = learner.fit(&mut tree, &rows)?;
//! println!("log-likelihood: {:?}", report.final_log_likelihood());
//! ```

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::assignment::Evidence;
use crate::clique_tree::CliqueTree;
use crate::error::{PgmError, Result};
use crate::factor::Factor;

/// Configuration for [`ExpectationMaximization`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmConfig {
    /// Maximum number of E/M iterations
    pub max_iterations: usize,
    /// Stop once the average log-likelihood changes by less than this
    pub tolerance: f64,
    /// Calibrate data rows in parallel during the E-step
    pub parallel: bool,
    /// Skip rows with zero probability instead of failing the run
    pub skip_zero_probability_rows: bool,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            parallel: true,
            skip_zero_probability_rows: true,
        }
    }
}

impl EmConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the convergence tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Enable/disable the parallel E-step.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Choose whether zero-probability rows are skipped or abort the run.
    pub fn with_skip_zero_probability_rows(mut self, skip: bool) -> Self {
        self.skip_zero_probability_rows = skip;
        self
    }

    /// Check that the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(PgmError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.tolerance.is_nan() || self.tolerance < 0.0 {
            return Err(PgmError::InvalidConfig(format!(
                "tolerance must be non-negative, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// Expected sufficient statistics gathered by one E-step.
#[derive(Debug, Clone)]
pub struct ExpectedCounts {
    counts: Vec<Factor>,
    log_likelihood: f64,
    rows_used: usize,
    skipped_rows: usize,
}

impl ExpectedCounts {
    /// Expected-count table of node `idx`, over its clique.
    pub fn counts(&self, idx: usize) -> &Factor {
        &self.counts[idx]
    }

    /// Σ log P(row) over the rows that were used.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Number of rows that contributed.
    pub fn rows_used(&self) -> usize {
        self.rows_used
    }

    /// Number of zero-probability rows that were skipped.
    pub fn skipped_rows(&self) -> usize {
        self.skipped_rows
    }
}

/// Outcome of [`ExpectationMaximization::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct EmReport {
    /// Iterations run
    pub iterations: usize,
    /// Whether the tolerance was reached before the iteration cap
    pub converged: bool,
    /// Average log-likelihood per row, before each M-step
    pub log_likelihood_history: Vec<f64>,
    /// Rows skipped in the last E-step
    pub skipped_rows: usize,
}

impl EmReport {
    /// Last recorded average log-likelihood.
    pub fn final_log_likelihood(&self) -> Option<f64> {
        self.log_likelihood_history.last().copied()
    }
}

/// Normalized calibrated potentials of one row and its log-probability;
/// `None` when the row has probability zero.
type RowStatistics = Option<(Vec<Factor>, f64)>;

/// EM parameter learner for clique-tree potentials.
#[derive(Debug, Clone, Default)]
pub struct ExpectationMaximization {
    config: EmConfig,
}

impl ExpectationMaximization {
    /// Create a learner, validating the configuration.
    pub fn new(config: EmConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The learner's configuration.
    pub fn config(&self) -> &EmConfig {
        &self.config
    }

    /// Set every node's potential to the uniform conditional
    /// P(clique \ separator | separator).
    pub fn initialize_uniform(&self, tree: &mut CliqueTree) -> Result<()> {
        for idx in 0..tree.num_nodes() {
            let node = tree.node(idx);
            let conditional = Factor::ones(node.clique().to_vec(), tree.cardinality().clone())?
                .conditional_on(node.separator())?;
            tree.set_potential(idx, conditional)?;
        }
        Ok(())
    }

    fn row_statistics(tree: &CliqueTree, row: &Evidence) -> Result<RowStatistics> {
        let calibration = tree.calibrate_with(Some(row))?;
        let log_probability = match calibration.log_probability_of_evidence() {
            Ok(lp) => lp,
            Err(e) if e.is_zero_probability() => return Ok(None),
            Err(e) => return Err(e),
        };

        let beliefs = (0..tree.num_nodes())
            .map(|idx| calibration.normalized_belief(idx))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some((beliefs, log_probability)))
    }

    fn collect_rows(&self, tree: &CliqueTree, rows: &[Evidence]) -> Vec<Result<RowStatistics>> {
        if self.config.parallel {
            rows.par_iter()
                .map(|row| Self::row_statistics(tree, row))
                .collect()
        } else {
            rows.iter()
                .map(|row| Self::row_statistics(tree, row))
                .collect()
        }
    }

    /// Gather expected counts for every node under the tree's current potentials.
    pub fn expectation_step(&self, tree: &CliqueTree, rows: &[Evidence]) -> Result<ExpectedCounts> {
        let mut counts = tree
            .nodes()
            .iter()
            .map(|node| Factor::zeros(node.clique().to_vec(), tree.cardinality().clone()))
            .collect::<Result<Vec<_>>>()?;
        let mut log_likelihood = 0.0;
        let mut rows_used = 0;
        let mut skipped_rows = 0;

        for (row_idx, stats) in self.collect_rows(tree, rows).into_iter().enumerate() {
            match stats? {
                Some((beliefs, log_probability)) => {
                    for (count, belief) in counts.iter_mut().zip(&beliefs) {
                        count.accumulate(belief)?;
                    }
                    log_likelihood += log_probability;
                    rows_used += 1;
                }
                None if self.config.skip_zero_probability_rows => {
                    warn!(row = row_idx, "skipping row with zero probability");
                    skipped_rows += 1;
                }
                None => return Err(PgmError::ZeroProbabilityEvidence),
            }
        }

        debug!(rows_used, skipped_rows, log_likelihood, "expectation step done");

        Ok(ExpectedCounts {
            counts,
            log_likelihood,
            rows_used,
            skipped_rows,
        })
    }

    /// Replace each node's potential with its expected counts conditioned on the separator.
    pub fn maximization_step(&self, tree: &mut CliqueTree, counts: &ExpectedCounts) -> Result<()> {
        if counts.counts.len() != tree.num_nodes() {
            return Err(PgmError::DimensionMismatch {
                expected: vec![tree.num_nodes()],
                got: vec![counts.counts.len()],
            });
        }

        for (idx, count) in counts.counts.iter().enumerate() {
            let conditional = count.conditional_on(tree.node(idx).separator())?;
            tree.set_potential(idx, conditional)?;
        }
        Ok(())
    }

    /// Σ log P(row) under the tree's current potentials.
    ///
    /// Zero-probability rows are skipped or rejected per the configuration.
    pub fn log_likelihood(&self, tree: &CliqueTree, rows: &[Evidence]) -> Result<f64> {
        let per_row: Vec<Result<f64>> = if self.config.parallel {
            rows.par_iter()
                .map(|row| tree.calibrate_with(Some(row))?.log_probability_of_evidence())
                .collect()
        } else {
            rows.iter()
                .map(|row| tree.calibrate_with(Some(row))?.log_probability_of_evidence())
                .collect()
        };

        let mut total = 0.0;
        for result in per_row {
            match result {
                Ok(lp) => total += lp,
                Err(e) if e.is_zero_probability() && self.config.skip_zero_probability_rows => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Run EM until convergence or the iteration cap.
    pub fn fit(&self, tree: &mut CliqueTree, rows: &[Evidence]) -> Result<EmReport> {
        if rows.is_empty() {
            return Err(PgmError::InvalidEvidence("no data rows to learn from".to_string()));
        }

        let mut history = Vec::new();
        let mut converged = false;
        let mut skipped_rows = 0;
        let mut prev = f64::NEG_INFINITY;

        for iteration in 0..self.config.max_iterations {
            let counts = self.expectation_step(tree, rows)?;
            if counts.rows_used == 0 {
                return Err(PgmError::ZeroProbabilityEvidence);
            }
            skipped_rows = counts.skipped_rows;

            let average = counts.log_likelihood / counts.rows_used as f64;
            history.push(average);
            info!(iteration, log_likelihood = average, "EM iteration");

            self.maximization_step(tree, &counts)?;

            if (average - prev).abs() < self.config.tolerance {
                converged = true;
                info!(iterations = iteration + 1, "EM converged");
                break;
            }
            prev = average;
        }

        if !converged {
            info!(
                iterations = self.config.max_iterations,
                "EM stopped at the iteration cap"
            );
        }

        Ok(EmReport {
            iterations: history.len(),
            converged,
            log_likelihood_history: history,
            skipped_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::Cardinalities;
    use crate::clique_tree::CliqueNode;
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    fn chain_tree() -> CliqueTree {
        let card: Cardinalities = Arc::from(vec![2, 3, 2]);
        let nodes = vec![
            CliqueNode::new(vec![0, 1], vec![], vec![1]),
            CliqueNode::new(vec![1, 2], vec![1], vec![0]),
        ];
        CliqueTree::new(card, nodes).unwrap()
    }

    fn rows() -> Vec<Evidence> {
        [
            [0i64, 1, 1],
            [0, -1, 1],
            [1, 2, 0],
            [1, -1, 0],
            [0, 0, -1],
            [-1, 1, 1],
        ]
        .iter()
        .map(|r| Evidence::from_row(r))
        .collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(EmConfig::default().validate().is_ok());
        assert!(matches!(
            ExpectationMaximization::new(EmConfig::new().with_max_iterations(0)),
            Err(PgmError::InvalidConfig(_))
        ));
        assert!(matches!(
            EmConfig::new().with_tolerance(f64::NAN).validate(),
            Err(PgmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: EmConfig = serde_json::from_str(r#"{"max_iterations": 5}"#).unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.tolerance, EmConfig::default().tolerance);
        assert!(config.parallel);
    }

    #[test]
    fn test_initialize_uniform() {
        let mut tree = chain_tree();
        let learner = ExpectationMaximization::default();
        learner.initialize_uniform(&mut tree).unwrap();

        assert!(tree.potential(0).values().iter().all(|&v| (v - 1.0 / 6.0).abs() < 1e-12));
        assert!(tree.potential(1).values().iter().all(|&v| (v - 0.5).abs() < 1e-12));

        // The product of conditionals is a normalized joint.
        let calibration = tree.calibrate_with(None).unwrap();
        assert_abs_diff_eq!(calibration.probability_of_evidence(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_expectation_step_counts_rows() {
        let mut tree = chain_tree();
        let learner = ExpectationMaximization::new(EmConfig::new().with_parallel(false)).unwrap();
        learner.initialize_uniform(&mut tree).unwrap();

        let data = rows();
        let counts = learner.expectation_step(&tree, &data).unwrap();
        assert_eq!(counts.rows_used(), data.len());
        assert_eq!(counts.skipped_rows(), 0);
        for idx in 0..tree.num_nodes() {
            assert_abs_diff_eq!(counts.counts(idx).sum(), data.len() as f64, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(
            counts.log_likelihood(),
            learner.log_likelihood(&tree, &data).unwrap(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let mut tree = chain_tree();
        let sequential =
            ExpectationMaximization::new(EmConfig::new().with_parallel(false)).unwrap();
        let parallel = ExpectationMaximization::new(EmConfig::new().with_parallel(true)).unwrap();
        sequential.initialize_uniform(&mut tree).unwrap();

        let data = rows();
        let a = sequential.expectation_step(&tree, &data).unwrap();
        let b = parallel.expectation_step(&tree, &data).unwrap();
        for idx in 0..tree.num_nodes() {
            assert_abs_diff_eq!(
                a.counts(idx).max_abs_diff(b.counts(idx)).unwrap(),
                0.0,
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_fully_observed_mle() {
        // With complete rows, one M-step yields relative frequencies.
        let mut tree = chain_tree();
        let learner = ExpectationMaximization::default();
        learner.initialize_uniform(&mut tree).unwrap();

        let data: Vec<Evidence> = [[0i64, 1, 1], [0, 1, 0], [0, 1, 1], [1, 2, 0]]
            .iter()
            .map(|r| Evidence::from_row(r))
            .collect();
        let counts = learner.expectation_step(&tree, &data).unwrap();
        learner.maximization_step(&mut tree, &counts).unwrap();

        // P(X2 | X1 = 1) = [1/3, 2/3]; stride of X1 is 1, of X2 is 3.
        let cpt = tree.potential(1);
        assert_abs_diff_eq!(cpt.values()[1], 1.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cpt.values()[4], 2.0 / 3.0, epsilon = 1e-12);
        // X1 = 0 never observed: 0/0 -> 0
        assert_eq!(cpt.values()[0], 0.0);
        assert_eq!(cpt.values()[3], 0.0);

        // P(X0, X1) at the root: (0, 1) seen 3 times out of 4
        assert_abs_diff_eq!(tree.potential(0).values()[2], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_probability_rows() {
        let card: Cardinalities = Arc::from(vec![2, 2]);
        let nodes = vec![
            CliqueNode::new(vec![0], vec![], vec![1]),
            CliqueNode::new(vec![0, 1], vec![0], vec![0]),
        ];
        let mut tree = CliqueTree::new(card.clone(), nodes).unwrap();
        tree.set_potential(0, Factor::new(vec![0], card.clone(), vec![1.0, 0.0]).unwrap())
            .unwrap();
        tree.set_potential(
            1,
            Factor::new(vec![0, 1], card, vec![0.5, 0.5, 0.5, 0.5]).unwrap(),
        )
        .unwrap();

        let data = vec![Evidence::from_row(&[0, 1]), Evidence::from_row(&[1, -1])];

        let lenient = ExpectationMaximization::default();
        let counts = lenient.expectation_step(&tree, &data).unwrap();
        assert_eq!(counts.rows_used(), 1);
        assert_eq!(counts.skipped_rows(), 1);

        let strict =
            ExpectationMaximization::new(EmConfig::new().with_skip_zero_probability_rows(false))
                .unwrap();
        assert_eq!(
            strict.expectation_step(&tree, &data).unwrap_err(),
            PgmError::ZeroProbabilityEvidence
        );
        assert_eq!(
            strict.log_likelihood(&tree, &data).unwrap_err(),
            PgmError::ZeroProbabilityEvidence
        );
    }

    #[test]
    fn test_fit_is_monotone() {
        let mut tree = chain_tree();
        let learner =
            ExpectationMaximization::new(EmConfig::new().with_max_iterations(25).with_tolerance(0.0))
                .unwrap();

        // Start from a skewed model so EM has work to do.
        let card = tree.cardinality().clone();
        let skewed = |clique: Vec<usize>, sep: &[usize]| {
            Factor::from_fn(clique, card.clone(), |a| {
                1.0 + a.values().iter().enumerate().map(|(i, v)| (i + 2) * v).sum::<usize>() as f64
            })
            .unwrap()
            .conditional_on(sep)
            .unwrap()
        };
        let root = skewed(vec![0, 1], &[]);
        let child = skewed(vec![1, 2], &[1]);
        tree.set_potentials(vec![root, child]).unwrap();

        let report = learner.fit(&mut tree, &rows()).unwrap();
        assert_eq!(report.iterations, 25);
        assert!(!report.converged);
        for pair in report.log_likelihood_history.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-9, "{:?}", report.log_likelihood_history);
        }
    }

    #[test]
    fn test_fit_rejects_empty_data() {
        let mut tree = chain_tree();
        assert!(matches!(
            ExpectationMaximization::default().fit(&mut tree, &[]),
            Err(PgmError::InvalidEvidence(_))
        ));
    }
}
