//! Clique-tree calibration on a small Bayesian network.
//!
//! # Network Structure
//!
//! ```text
//!   Rain ──► WetGrass ◄── Sprinkler
//!                │
//!                ▼
//!             Slippery
//! ```
//!
//! The clique tree is the path {Rain, Sprinkler} - {Rain, Sprinkler, WetGrass} - {WetGrass, Slippery}.
//!
//! This example shows:
//! 1. Building and validating a clique tree
//! 2. Calibrating with and without evidence
//! 3. Querying marginals
//! 4. Re-learning the conditional tables with EM from partially observed rows
//!
//! Run with `RUST_LOG=debug` to see calibration and EM traces.

use cliquetree_inference::{
    Cardinalities, CliqueNode, CliqueTree, EmConfig, Evidence, ExpectationMaximization, Factor,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const RAIN: usize = 0;
const SPRINKLER: usize = 1;
const WET_GRASS: usize = 2;
const SLIPPERY: usize = 3;

const NAMES: [&str; 4] = ["Rain", "Sprinkler", "WetGrass", "Slippery"];

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Clique Tree Calibration Example ===\n");

    let mut tree = build_tree()?;
    println!("Clique Tree Structure:");
    println!("  Nodes: {}", tree.num_nodes());
    println!("  Treewidth: {}", tree.treewidth());
    println!(
        "  Running Intersection Property: {}",
        tree.verify_running_intersection_property()
    );
    for (idx, node) in tree.nodes().iter().enumerate() {
        let vars: Vec<&str> = node.clique().iter().map(|&v| NAMES[v]).collect();
        println!("  Clique {}: {:?} (parent {:?})", idx, vars, tree.parent(idx));
    }
    println!();

    tree.calibrate()?;
    println!("Prior marginals:");
    print_marginals(&tree)?;

    let evidence = Evidence::from_row(&[-1, -1, -1, 1]);
    tree.restrict_by_evidence(&evidence)?;
    tree.calibrate()?;
    println!(
        "Posterior given Slippery = true (P(evidence) = {:.4}):",
        tree.calibrated_potential(tree.root()).sum()
    );
    print_marginals(&tree)?;

    println!("Learning from rows with WetGrass hidden...");
    let rows: Vec<Evidence> = [
        [1i64, 0, -1, 1],
        [0, 1, -1, 1],
        [0, 0, -1, 0],
        [1, 0, -1, 1],
        [0, 0, -1, 0],
        [0, 1, -1, 0],
        [1, 1, -1, 1],
        [0, 0, -1, 0],
    ]
    .iter()
    .map(|row| Evidence::from_row(row))
    .collect();

    let learner = ExpectationMaximization::new(EmConfig::new().with_max_iterations(50))?;
    tree.clear_evidence();
    let report = learner.fit(&mut tree, &rows)?;
    println!(
        "  {} iterations, converged: {}, average log-likelihood: {:.4}",
        report.iterations,
        report.converged,
        report.final_log_likelihood().unwrap_or(f64::NAN)
    );

    tree.calibrate()?;
    println!("\nLearned marginals:");
    print_marginals(&tree)?;

    Ok(())
}

fn build_tree() -> anyhow::Result<CliqueTree> {
    let card: Cardinalities = Arc::from(vec![2, 2, 2, 2]);
    let nodes = vec![
        CliqueNode::new(vec![RAIN, SPRINKLER], vec![], vec![1]),
        CliqueNode::new(
            vec![RAIN, SPRINKLER, WET_GRASS],
            vec![RAIN, SPRINKLER],
            vec![0, 2],
        ),
        CliqueNode::new(vec![WET_GRASS, SLIPPERY], vec![WET_GRASS], vec![1]),
    ];
    let mut tree = CliqueTree::new(card.clone(), nodes)?;

    // P(Rain) P(Sprinkler)
    let p_rain = Factor::new(vec![RAIN], card.clone(), vec![0.8, 0.2])?;
    let p_sprinkler = Factor::new(vec![SPRINKLER], card.clone(), vec![0.6, 0.4])?;
    // P(WetGrass | Rain, Sprinkler), Rain fastest
    let p_wet = Factor::new(
        vec![RAIN, SPRINKLER, WET_GRASS],
        card.clone(),
        vec![0.99, 0.2, 0.1, 0.01, 0.01, 0.8, 0.9, 0.99],
    )?;
    // P(Slippery | WetGrass)
    let p_slippery = Factor::new(vec![WET_GRASS, SLIPPERY], card, vec![0.95, 0.3, 0.05, 0.7])?;

    tree.set_potentials(vec![p_rain.product(&p_sprinkler)?, p_wet, p_slippery])?;
    Ok(tree)
}

fn print_marginals(tree: &CliqueTree) -> anyhow::Result<()> {
    for (var, name) in NAMES.iter().enumerate() {
        let marginal = tree.query_marginal(var)?;
        println!("  P({} = true) = {:.4}", name, marginal.values()[1]);
    }
    println!();
    Ok(())
}
