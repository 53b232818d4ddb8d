//! Clique trees for exact inference over discrete variables.
//!
//! A clique tree (junction tree) is a tree whose nodes hold overlapping
//! variable clusters. Each node carries a clique, the separator shared with
//! its parent, an adjacency list and a potential. The tree is rooted at node 0;
//! the parent of every other node is its neighbor on the path to the root.
//!
//! # Lifecycle
//!
//! ```text
//! builder ──► CliqueTree::new ──► set_potentials ──► restrict_by_evidence ──► calibrate
//!  (cliques,       (validated        (original)          (current)            (calibrated)
//!   separators,     structure)
//!   adjacency)
//! ```
//!
//! Original potentials are never modified by evidence or calibration, so the
//! same tree can be re-restricted and re-calibrated for every data row.
//!
//! # References
//!
//! - Koller & Friedman, "Probabilistic Graphical Models", Chapter 10
//! - Shafer & Shenoy, "Probability Propagation" (1990)

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::assignment::{Cardinalities, Evidence};
use crate::calibration::Calibration;
use crate::error::{PgmError, Result};
use crate::factor::Factor;

/// One cluster of the tree as supplied by the tree builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliqueNode {
    clique: Vec<usize>,
    separator: Vec<usize>,
    neighbors: Vec<usize>,
}

impl CliqueNode {
    /// Create a node from its clique, its separator with the parent, and
    /// the indices of its neighbors.
    pub fn new(clique: Vec<usize>, separator: Vec<usize>, neighbors: Vec<usize>) -> Self {
        Self {
            clique,
            separator,
            neighbors,
        }
    }

    /// Variables of the clique, in potential layout order.
    pub fn clique(&self) -> &[usize] {
        &self.clique
    }

    /// Variables shared with the parent (empty at the root).
    pub fn separator(&self) -> &[usize] {
        &self.separator
    }

    /// Neighbor node indices, in adjacency order.
    pub fn neighbors(&self) -> &[usize] {
        &self.neighbors
    }

    /// Number of neighbors.
    pub fn degree(&self) -> usize {
        self.neighbors.len()
    }

    /// Whether `var` is in the clique.
    pub fn contains(&self, var: usize) -> bool {
        self.clique.contains(&var)
    }

    /// Variables introduced relative to the parent: clique \ separator.
    pub fn introduced_variables(&self) -> Vec<usize> {
        self.clique
            .iter()
            .copied()
            .filter(|v| !self.separator.contains(v))
            .collect()
    }
}

/// A validated clique tree with per-node potentials.
#[derive(Debug, Clone)]
pub struct CliqueTree {
    cardinality: Cardinalities,
    nodes: Vec<CliqueNode>,
    parents: Vec<Option<usize>>,
    /// Baseline potentials, untouched by evidence
    original: Vec<Factor>,
    /// Potentials restricted by the current evidence
    current: Vec<Factor>,
    /// Calibrated potentials from the last `calibrate` call, if still valid
    calibrated: Option<Vec<Factor>>,
}

const ROOT: usize = 0;

impl CliqueTree {
    /// Build a clique tree from the builder's nodes.
    ///
    /// Validates that the adjacency lists describe a tree over all nodes,
    /// that every clique is a set of known variables, and that each node's
    /// separator equals its clique intersected with its parent's clique when
    /// rooted at node 0. Potentials start as all-ones factors.
    ///
    /// The running-intersection property is *not* checked here; see
    /// [`verify_running_intersection_property`](Self::verify_running_intersection_property).
    pub fn new(cardinality: Cardinalities, nodes: Vec<CliqueNode>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(PgmError::InvalidGraph("clique tree has no nodes".to_string()));
        }

        let parents = Self::validate_structure(&cardinality, &nodes)?;

        let original = nodes
            .iter()
            .map(|node| Factor::ones(node.clique.clone(), cardinality.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            cardinality,
            nodes,
            parents,
            current: original.clone(),
            original,
            calibrated: None,
        })
    }

    /// Check adjacency, connectivity and separators; return each node's parent.
    fn validate_structure(cardinality: &[usize], nodes: &[CliqueNode]) -> Result<Vec<Option<usize>>> {
        let n = nodes.len();
        let mut degree_sum = 0;

        for (idx, node) in nodes.iter().enumerate() {
            let mut members = HashSet::new();
            for &var in &node.clique {
                if var >= cardinality.len() {
                    return Err(PgmError::VariableNotFound(var));
                }
                if !members.insert(var) {
                    return Err(PgmError::InvalidGraph(format!(
                        "node {} lists variable {} twice",
                        idx, var
                    )));
                }
            }

            let mut seen = HashSet::new();
            for &nbr in &node.neighbors {
                if nbr >= n || nbr == idx {
                    return Err(PgmError::InvalidGraph(format!(
                        "node {} has invalid neighbor {}",
                        idx, nbr
                    )));
                }
                if !seen.insert(nbr) {
                    return Err(PgmError::InvalidGraph(format!(
                        "node {} lists neighbor {} twice",
                        idx, nbr
                    )));
                }
                if !nodes[nbr].neighbors.contains(&idx) {
                    return Err(PgmError::InvalidGraph(format!(
                        "edge {} -> {} has no reverse edge",
                        idx, nbr
                    )));
                }
            }
            degree_sum += node.neighbors.len();
        }

        if degree_sum != 2 * (n - 1) {
            return Err(PgmError::InvalidGraph(format!(
                "{} nodes need {} edges to form a tree, found {}",
                n,
                n - 1,
                degree_sum / 2
            )));
        }

        // Root the tree at node 0.
        let mut parents = vec![None; n];
        let mut visited = vec![false; n];
        let mut queue = VecDeque::from([ROOT]);
        visited[ROOT] = true;
        while let Some(current) = queue.pop_front() {
            for &nbr in &nodes[current].neighbors {
                if !visited[nbr] {
                    visited[nbr] = true;
                    parents[nbr] = Some(current);
                    queue.push_back(nbr);
                }
            }
        }
        if let Some(unreached) = visited.iter().position(|&v| !v) {
            return Err(PgmError::InvalidGraph(format!(
                "node {} is not connected to the root",
                unreached
            )));
        }

        for (idx, node) in nodes.iter().enumerate() {
            let separator: HashSet<usize> = node.separator.iter().copied().collect();
            if separator.len() != node.separator.len() {
                return Err(PgmError::InvalidGraph(format!(
                    "node {} separator has duplicates",
                    idx
                )));
            }
            let expected: HashSet<usize> = match parents[idx] {
                Some(parent) => node
                    .clique
                    .iter()
                    .copied()
                    .filter(|v| nodes[parent].clique.contains(v))
                    .collect(),
                None => HashSet::new(),
            };
            if separator != expected {
                return Err(PgmError::InvalidGraph(format!(
                    "node {} separator {:?} does not match clique ∩ parent clique {:?}",
                    idx, node.separator, expected
                )));
            }
        }

        Ok(parents)
    }

    /// The shared cardinality table.
    pub fn cardinality(&self) -> &Cardinalities {
        &self.cardinality
    }

    /// Number of variables in the problem.
    pub fn num_variables(&self) -> usize {
        self.cardinality.len()
    }

    /// Number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes.
    pub fn nodes(&self) -> &[CliqueNode] {
        &self.nodes
    }

    /// Node `idx`.
    pub fn node(&self, idx: usize) -> &CliqueNode {
        &self.nodes[idx]
    }

    /// The root node index.
    pub fn root(&self) -> usize {
        ROOT
    }

    /// Parent of `idx`, `None` for the root.
    pub fn parent(&self, idx: usize) -> Option<usize> {
        self.parents[idx]
    }

    /// Neighbors of `idx` other than its parent, in adjacency order.
    pub fn children(&self, idx: usize) -> Vec<usize> {
        let parent = self.parents[idx];
        self.nodes[idx]
            .neighbors
            .iter()
            .copied()
            .filter(|&n| Some(n) != parent)
            .collect()
    }

    /// Clique \ separator of node `idx`.
    pub fn introduced_variables(&self, idx: usize) -> Vec<usize> {
        self.nodes[idx].introduced_variables()
    }

    /// Original (evidence-free) potential of node `idx`.
    pub fn potential(&self, idx: usize) -> &Factor {
        &self.original[idx]
    }

    /// Potentials as last restricted by evidence.
    pub fn current_potentials(&self) -> &[Factor] {
        &self.current
    }

    /// Replace the potential of one node.
    ///
    /// The factor must range over exactly the node's clique (any variable
    /// order; it is re-laid out in clique order). Evidence on this node is
    /// cleared and any stored calibration is invalidated.
    pub fn set_potential(&mut self, idx: usize, factor: Factor) -> Result<()> {
        let node = self.nodes.get(idx).ok_or_else(|| {
            PgmError::InvalidGraph(format!(
                "node {} out of range for a tree of {} nodes",
                idx,
                self.nodes.len()
            ))
        })?;

        for &var in factor.variables() {
            let right = factor.cardinality()[var];
            match self.cardinality.get(var) {
                None => return Err(PgmError::VariableNotFound(var)),
                Some(&left) if left != right => {
                    return Err(PgmError::CardinalityMismatch {
                        variable: var,
                        left,
                        right,
                    })
                }
                Some(_) => {}
            }
        }

        let aligned = factor.reorder(&node.clique)?;
        let potential = Factor::new(
            node.clique.clone(),
            self.cardinality.clone(),
            aligned.values().to_vec(),
        )?;

        self.current[idx] = potential.clone();
        self.original[idx] = potential;
        self.calibrated = None;
        Ok(())
    }

    /// Replace every node's potential (one factor per node, in node order).
    pub fn set_potentials(&mut self, factors: Vec<Factor>) -> Result<()> {
        if factors.len() != self.nodes.len() {
            return Err(PgmError::DimensionMismatch {
                expected: vec![self.nodes.len()],
                got: vec![factors.len()],
            });
        }
        for (idx, factor) in factors.into_iter().enumerate() {
            self.set_potential(idx, factor)?;
        }
        Ok(())
    }

    /// Restrict every original potential by `evidence` into the current potentials.
    pub fn restrict_by_evidence(&mut self, evidence: &Evidence) -> Result<()> {
        evidence.validate(&self.cardinality)?;
        self.current = self
            .original
            .iter()
            .map(|potential| potential.restrict(evidence))
            .collect();
        self.calibrated = None;
        Ok(())
    }

    /// Drop any evidence: current potentials go back to the originals.
    pub fn clear_evidence(&mut self) {
        self.current = self.original.clone();
        self.calibrated = None;
    }

    /// Calibrate the current potentials and keep the result in the tree.
    pub fn calibrate(&mut self) -> Result<()> {
        let calibration = Calibration::run(self, &self.current)?;
        self.calibrated = Some(calibration.into_beliefs());
        Ok(())
    }

    /// Calibrate without touching the tree.
    ///
    /// With `Some(evidence)` the original potentials are restricted first;
    /// with `None` the current potentials are used as they are. Each call
    /// owns its scratch state, so many sessions can run concurrently over a
    /// shared `&CliqueTree`.
    pub fn calibrate_with(&self, evidence: Option<&Evidence>) -> Result<Calibration> {
        match evidence {
            Some(evidence) => {
                evidence.validate(&self.cardinality)?;
                let restricted: Vec<Factor> = self
                    .original
                    .iter()
                    .map(|potential| potential.restrict(evidence))
                    .collect();
                Calibration::run(self, &restricted)
            }
            None => Calibration::run(self, &self.current),
        }
    }

    /// Whether calibrated potentials are available.
    pub fn is_calibrated(&self) -> bool {
        self.calibrated.is_some()
    }

    /// Calibrated potential of node `idx`: the marginal of the joint over its clique.
    ///
    /// # Panics
    ///
    /// Panics if the tree has not been calibrated since its potentials or
    /// evidence last changed.
    pub fn calibrated_potential(&self, idx: usize) -> &Factor {
        &self.calibrated_potentials()[idx]
    }

    /// All calibrated potentials, in node order.
    ///
    /// # Panics
    ///
    /// Panics if the tree has not been calibrated since its potentials or
    /// evidence last changed.
    pub fn calibrated_potentials(&self) -> &[Factor] {
        match &self.calibrated {
            Some(beliefs) => beliefs,
            None => panic!("clique tree must be calibrated before reading calibrated potentials"),
        }
    }

    /// Normalized marginal of a single variable from the calibrated tree.
    pub fn query_marginal(&self, var: usize) -> Result<Factor> {
        let beliefs = self.calibrated.as_ref().ok_or_else(|| {
            PgmError::InvalidGraph("Tree must be calibrated before querying".to_string())
        })?;
        let idx = self.smallest_clique_containing(var)?;
        beliefs[idx]
            .marginalize(&[var])
            .normalized()
            .map_err(|_| PgmError::ZeroProbabilityEvidence)
    }

    pub(crate) fn smallest_clique_containing(&self, var: usize) -> Result<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.contains(var))
            .min_by_key(|(_, node)| node.clique.len())
            .map(|(idx, _)| idx)
            .ok_or(PgmError::VariableNotFound(var))
    }

    /// Size of the largest clique minus one.
    pub fn treewidth(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| node.clique.len())
            .max()
            .unwrap_or(0)
            .saturating_sub(1)
    }

    /// Check the running-intersection property.
    ///
    /// For every variable, the nodes whose clique contains it must form a
    /// connected subtree. Calibration is only exact when this holds.
    pub fn verify_running_intersection_property(&self) -> bool {
        (0..self.cardinality.len()).all(|var| {
            let holders: Vec<usize> = (0..self.nodes.len())
                .filter(|&idx| self.nodes[idx].contains(var))
                .collect();
            self.is_connected_subgraph(&holders, var)
        })
    }

    /// Whether `members` (all holding `var`) form a connected subgraph.
    fn is_connected_subgraph(&self, members: &[usize], var: usize) -> bool {
        let Some(&start) = members.first() else {
            return true;
        };

        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &nbr in &self.nodes[current].neighbors {
                if self.nodes[nbr].contains(var) && visited.insert(nbr) {
                    queue.push_back(nbr);
                }
            }
        }

        visited.len() == members.len()
    }
}
