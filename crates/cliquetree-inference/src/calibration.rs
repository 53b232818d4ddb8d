//! Two-pass sum-product calibration of a clique tree.
//!
//! Calibration turns every node's potential into the marginal, over the
//! node's clique, of the joint defined by the product of all potentials.
//!
//! ```text
//! collect (post-order)                     distribute (pre-order)
//!   prefix[v][0] = φ_v                       belief_v = prefix[v][k] · M_v
//!   prefix[v][i] = prefix[v][i-1] · m_cᵢ     to cᵢ:   prefix[v][i-1] · suffix_i · M_v
//!   m_v→p       = Σ_{C_v \ C_p} prefix[v][k]  suffix_i = m_cᵢ₊₁ · … · m_c_k
//! ```
//!
//! The prefix products from the upward pass and suffix products built on the
//! way down give every child its "all factors but yours" product with a
//! constant number of factor products per child, instead of one full product
//! per child.
//!
//! Each run owns its scratch state in a [`CalibrationContext`]; the tree is
//! only read, so independent sessions can run concurrently.

use tracing::{debug, trace};

use crate::clique_tree::CliqueTree;
use crate::error::{PgmError, Result};
use crate::factor::Factor;

/// The calibrated potentials produced by one calibration run.
#[derive(Debug, Clone)]
pub struct Calibration {
    beliefs: Vec<Factor>,
    root: usize,
}

/// Per-run scratch state, indexed by node.
struct CalibrationContext<'a> {
    tree: &'a CliqueTree,
    potentials: &'a [Factor],
    /// Running products φ_v · m_c₁ · … · m_cᵢ over the children of v
    prefixes: Vec<Vec<Factor>>,
    /// Message from each non-root node to its parent
    upward: Vec<Option<Factor>>,
    beliefs: Vec<Option<Factor>>,
}

impl<'a> CalibrationContext<'a> {
    fn new(tree: &'a CliqueTree, potentials: &'a [Factor]) -> Self {
        let n = tree.num_nodes();
        Self {
            tree,
            potentials,
            prefixes: vec![Vec::new(); n],
            upward: vec![None; n],
            beliefs: vec![None; n],
        }
    }

    fn upward_message(&self, child: usize) -> Result<&Factor> {
        self.upward[child].as_ref().ok_or_else(|| {
            PgmError::InvalidGraph(format!("no upward message from node {}", child))
        })
    }

    /// Upward pass rooted at `node`.
    fn collect(&mut self, node: usize) -> Result<()> {
        let children = self.tree.children(node);

        let mut prefix = Vec::with_capacity(children.len() + 1);
        prefix.push(self.potentials[node].clone());
        for &child in &children {
            self.collect(child)?;
            let next = prefix[prefix.len() - 1].product(self.upward_message(child)?)?;
            prefix.push(next);
        }

        if let Some(parent) = self.tree.parent(node) {
            let message = prefix[prefix.len() - 1].marginalize(self.tree.node(parent).clique());
            trace!(
                from = node,
                to = parent,
                scope = ?message.variables(),
                "upward message"
            );
            self.upward[node] = Some(message);
        }

        self.prefixes[node] = prefix;
        Ok(())
    }

    /// Downward pass from `node`, given the message from its parent.
    fn distribute(&mut self, node: usize, incoming: Option<Factor>) -> Result<()> {
        let prefix = std::mem::take(&mut self.prefixes[node]);
        let children = self.tree.children(node);

        let gathered = &prefix[children.len()];
        let belief = match &incoming {
            Some(message) => gathered.product(message)?,
            None => gathered.clone(),
        };
        self.beliefs[node] = Some(belief);

        if children.is_empty() {
            return Ok(());
        }

        let mut outgoing: Vec<Option<Factor>> = vec![None; children.len()];
        let mut suffix = incoming;
        for (i, &child) in children.iter().enumerate().rev() {
            let excluded = match &suffix {
                Some(rest) => prefix[i].product(rest)?,
                None => prefix[i].clone(),
            };
            let message = excluded.marginalize(self.tree.node(child).clique());
            trace!(
                from = node,
                to = child,
                scope = ?message.variables(),
                "downward message"
            );
            outgoing[i] = Some(message);

            if i > 0 {
                let from_child = self.upward_message(child)?;
                suffix = Some(match suffix {
                    Some(rest) => rest.product(from_child)?,
                    None => from_child.clone(),
                });
            }
        }

        for (&child, message) in children.iter().zip(outgoing) {
            self.distribute(child, message)?;
        }
        Ok(())
    }
}

impl Calibration {
    /// Calibrate `tree` using `potentials` (one per node, in node order).
    pub(crate) fn run(tree: &CliqueTree, potentials: &[Factor]) -> Result<Self> {
        let n = tree.num_nodes();
        if potentials.len() != n {
            return Err(PgmError::DimensionMismatch {
                expected: vec![n],
                got: vec![potentials.len()],
            });
        }

        let root = tree.root();
        let mut ctx = CalibrationContext::new(tree, potentials);
        ctx.collect(root)?;
        ctx.distribute(root, None)?;

        let beliefs = ctx
            .beliefs
            .into_iter()
            .enumerate()
            .map(|(idx, belief)| {
                belief.ok_or_else(|| {
                    PgmError::InvalidGraph(format!("node {} not reached by calibration", idx))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            nodes = n,
            probability_of_evidence = beliefs[root].sum(),
            "clique tree calibrated"
        );

        Ok(Self { beliefs, root })
    }

    /// Calibrated potential of node `idx`.
    pub fn belief(&self, idx: usize) -> &Factor {
        &self.beliefs[idx]
    }

    /// All calibrated potentials, in node order.
    pub fn beliefs(&self) -> &[Factor] {
        &self.beliefs
    }

    /// Consume the session, keeping the calibrated potentials.
    pub fn into_beliefs(self) -> Vec<Factor> {
        self.beliefs
    }

    /// Total mass of the root's calibrated potential.
    ///
    /// When the potentials form a normalized model, this is the probability
    /// of the evidence the potentials were restricted by.
    pub fn probability_of_evidence(&self) -> f64 {
        self.beliefs[self.root].sum()
    }

    /// Natural log of [`probability_of_evidence`](Self::probability_of_evidence).
    pub fn log_probability_of_evidence(&self) -> Result<f64> {
        let probability = self.probability_of_evidence();
        if probability <= 0.0 || probability.is_nan() {
            return Err(PgmError::ZeroProbabilityEvidence);
        }
        Ok(probability.ln())
    }

    /// Calibrated potential of node `idx`, normalized to a distribution.
    pub fn normalized_belief(&self, idx: usize) -> Result<Factor> {
        self.beliefs[idx]
            .normalized()
            .map_err(|_| PgmError::ZeroProbabilityEvidence)
    }

    /// Unnormalized marginal of a single variable.
    pub fn marginal(&self, tree: &CliqueTree, var: usize) -> Result<Factor> {
        let idx = tree.smallest_clique_containing(var)?;
        Ok(self.beliefs[idx].marginalize(&[var]))
    }
}
