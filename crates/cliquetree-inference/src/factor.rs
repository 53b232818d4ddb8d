//! Dense discrete factors and their algebra.
//!
//! A [`Factor`] is a flat table over a scope of variables, addressed through
//! the scope's [`StrideMap`] (first scope variable fastest-varying). Every
//! derived factor (product, division) is laid out over the *ascending* union
//! of its inputs' scopes; sum-out and marginalization keep the relative order
//! of the surviving variables. Operations never mutate their inputs.

use scirs2_core::ndarray::{Array1, ArrayD};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::assignment::{Assignment, Cardinalities, Evidence, StrideMap};
use crate::error::{PgmError, Result};

/// A non-negative table φ(X₁, …, Xₖ) over discrete variables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "FactorRepr", try_from = "FactorRepr")]
pub struct Factor {
    variables: Vec<usize>,
    cardinality: Cardinalities,
    strides: StrideMap,
    values: Array1<f64>,
}

/// Serialized form; validated through [`Factor::new`] on the way back in.
#[derive(Serialize, Deserialize)]
struct FactorRepr {
    variables: Vec<usize>,
    cardinality: Vec<usize>,
    values: Vec<f64>,
}

impl From<Factor> for FactorRepr {
    fn from(factor: Factor) -> Self {
        Self {
            variables: factor.variables,
            cardinality: factor.cardinality.to_vec(),
            values: factor.values.to_vec(),
        }
    }
}

impl TryFrom<FactorRepr> for Factor {
    type Error = PgmError;

    fn try_from(repr: FactorRepr) -> Result<Self> {
        Factor::new(repr.variables, Arc::from(repr.cardinality), repr.values)
    }
}

/// Number of cells of a table over `variables`.
fn table_size(variables: &[usize], cardinality: &[usize]) -> usize {
    variables.iter().map(|&v| cardinality[v]).product()
}

fn validate_scope(variables: &[usize], cardinality: &[usize]) -> Result<()> {
    let mut seen = HashSet::with_capacity(variables.len());
    for &var in variables {
        if var >= cardinality.len() {
            return Err(PgmError::VariableNotFound(var));
        }
        if !seen.insert(var) {
            return Err(PgmError::InvalidGraph(format!(
                "variable {} appears twice in a factor scope",
                var
            )));
        }
    }
    Ok(())
}

/// Visit every combination of `scope` (first variable fastest), handing the
/// visitor the flat offset of that combination under each target stride map.
///
/// This is [`Assignment::index`] computed incrementally: each step adjusts the
/// offsets by the strides of the digits that changed instead of re-summing.
fn walk_aligned<const N: usize>(
    scope: &[usize],
    cardinality: &[usize],
    targets: [&StrideMap; N],
    mut visit: impl FnMut([usize; N]),
) {
    let cards: Vec<usize> = scope.iter().map(|&v| cardinality[v]).collect();
    let strides: Vec<[usize; N]> = scope
        .iter()
        .map(|&v| targets.map(|t| t.stride(v)))
        .collect();
    let total: usize = cards.iter().product();

    let mut digits = vec![0usize; scope.len()];
    let mut offsets = [0usize; N];

    for _ in 0..total {
        visit(offsets);

        for (pos, digit) in digits.iter_mut().enumerate() {
            *digit += 1;
            if *digit < cards[pos] {
                for (offset, stride) in offsets.iter_mut().zip(strides[pos]) {
                    *offset += stride;
                }
                break;
            }
            *digit = 0;
            for (offset, stride) in offsets.iter_mut().zip(strides[pos]) {
                *offset -= (cards[pos] - 1) * stride;
            }
        }
    }
}

impl Factor {
    /// Create a factor from an explicit flat value array.
    ///
    /// `values[i]` is the weight of the combination whose flat index under
    /// the stride map of `variables` (in the given order) is `i`.
    pub fn new(variables: Vec<usize>, cardinality: Cardinalities, values: Vec<f64>) -> Result<Self> {
        validate_scope(&variables, &cardinality)?;

        let expected = table_size(&variables, &cardinality);
        if values.len() != expected {
            return Err(PgmError::DimensionMismatch {
                expected: vec![expected],
                got: vec![values.len()],
            });
        }

        Ok(Self::from_parts(variables, cardinality, Array1::from_vec(values)))
    }

    /// Create a zero-initialized factor.
    pub fn zeros(variables: Vec<usize>, cardinality: Cardinalities) -> Result<Self> {
        validate_scope(&variables, &cardinality)?;
        let size = table_size(&variables, &cardinality);
        Ok(Self::from_parts(variables, cardinality, Array1::zeros(size)))
    }

    /// Create a factor with every cell equal to one (the neutral potential).
    pub fn ones(variables: Vec<usize>, cardinality: Cardinalities) -> Result<Self> {
        validate_scope(&variables, &cardinality)?;
        let size = table_size(&variables, &cardinality);
        Ok(Self::from_parts(variables, cardinality, Array1::ones(size)))
    }

    /// Create a uniform distribution over the scope.
    pub fn uniform(variables: Vec<usize>, cardinality: Cardinalities) -> Result<Self> {
        validate_scope(&variables, &cardinality)?;
        let size = table_size(&variables, &cardinality);
        let value = if size == 0 { 0.0 } else { 1.0 / size as f64 };
        Ok(Self::from_parts(
            variables,
            cardinality,
            Array1::from_elem(size, value),
        ))
    }

    /// Create a factor by evaluating `f` on every combination of the scope.
    pub fn from_fn(
        variables: Vec<usize>,
        cardinality: Cardinalities,
        mut f: impl FnMut(&Assignment) -> f64,
    ) -> Result<Self> {
        let mut factor = Self::zeros(variables, cardinality)?;
        let mut assignment = Assignment::new(&factor.variables, &factor.cardinality)?;
        while assignment.advance() {
            let value = f(&assignment);
            factor.set(&assignment, value);
        }
        Ok(factor)
    }

    fn from_parts(variables: Vec<usize>, cardinality: Cardinalities, values: Array1<f64>) -> Self {
        let strides = StrideMap::new(&variables, &cardinality);
        Self {
            variables,
            cardinality,
            strides,
            values,
        }
    }

    /// Scope of the factor, in layout order.
    pub fn variables(&self) -> &[usize] {
        &self.variables
    }

    /// The shared cardinality table.
    pub fn cardinality(&self) -> &Cardinalities {
        &self.cardinality
    }

    /// Stride map of the scope.
    pub fn strides(&self) -> &StrideMap {
        &self.strides
    }

    /// Flat value array.
    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the table has no cells (only possible with a zero cardinality).
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether `var` is in the scope.
    pub fn contains(&self, var: usize) -> bool {
        self.variables.contains(&var)
    }

    /// Sum of all cells.
    pub fn sum(&self) -> f64 {
        self.values.sum()
    }

    /// Value at the cell addressed by `assignment`.
    ///
    /// The assignment may range over a superset of the scope; variables
    /// outside the scope are ignored.
    pub fn get(&self, assignment: &Assignment) -> f64 {
        self.values[assignment.index(&self.strides)]
    }

    /// Overwrite the cell addressed by `assignment`.
    pub fn set(&mut self, assignment: &Assignment, value: f64) {
        let idx = assignment.index(&self.strides);
        self.values[idx] = value;
    }

    /// Accumulate into the cell addressed by `assignment`.
    pub fn add(&mut self, assignment: &Assignment, value: f64) {
        let idx = assignment.index(&self.strides);
        self.values[idx] += value;
    }

    /// Check that `other` agrees with this factor's cardinality table on its scope.
    fn check_compatible(&self, other: &Factor) -> Result<()> {
        if Arc::ptr_eq(&self.cardinality, &other.cardinality) {
            return Ok(());
        }
        for &var in &other.variables {
            let right = other.cardinality[var];
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
        Ok(())
    }

    fn union_scope(&self, other: &Factor) -> Vec<usize> {
        let mut scope: Vec<usize> = self
            .variables
            .iter()
            .chain(&other.variables)
            .copied()
            .collect();
        scope.sort_unstable();
        scope.dedup();
        scope
    }

    /// Natural join of two factors: φ₁(X₁) · φ₂(X₂) = φ(X₁ ∪ X₂).
    ///
    /// The result's scope is the ascending union of both scopes.
    pub fn product(&self, other: &Factor) -> Result<Factor> {
        self.check_compatible(other)?;

        let scope = self.union_scope(other);
        let mut values = Vec::with_capacity(table_size(&scope, &self.cardinality));
        walk_aligned(
            &scope,
            &self.cardinality,
            [&self.strides, &other.strides],
            |[i, j]| values.push(self.values[i] * other.values[j]),
        );

        Ok(Self::from_parts(
            scope,
            self.cardinality.clone(),
            Array1::from_vec(values),
        ))
    }

    /// Elementwise division broadcast over the natural join of both scopes.
    ///
    /// Any cell whose divisor is zero yields zero (the 0/0 → 0 convention):
    /// a zero divisor only arises where the numerator is structurally zero too.
    pub fn divide(&self, other: &Factor) -> Result<Factor> {
        self.check_compatible(other)?;

        let scope = self.union_scope(other);
        let mut values = Vec::with_capacity(table_size(&scope, &self.cardinality));
        walk_aligned(
            &scope,
            &self.cardinality,
            [&self.strides, &other.strides],
            |[i, j]| {
                let divisor = other.values[j];
                values.push(if divisor == 0.0 {
                    0.0
                } else {
                    self.values[i] / divisor
                });
            },
        );

        Ok(Self::from_parts(
            scope,
            self.cardinality.clone(),
            Array1::from_vec(values),
        ))
    }

    /// Sum out a single variable. A variable outside the scope is a no-op.
    pub fn sum_out(&self, var: usize) -> Factor {
        self.sum_out_vars(&[var])
    }

    /// Sum out a set of variables in one pass.
    ///
    /// Variables outside the scope are ignored.
    pub fn sum_out_vars(&self, vars: &[usize]) -> Factor {
        let kept: Vec<usize> = self
            .variables
            .iter()
            .copied()
            .filter(|v| !vars.contains(v))
            .collect();

        if kept.len() == self.variables.len() {
            return self.clone();
        }

        let out_strides = StrideMap::new(&kept, &self.cardinality);
        let mut values = Array1::<f64>::zeros(table_size(&kept, &self.cardinality));
        walk_aligned(
            &self.variables,
            &self.cardinality,
            [&self.strides, &out_strides],
            |[i, o]| values[o] += self.values[i],
        );

        Self::from_parts(kept, self.cardinality.clone(), values)
    }

    /// Marginal onto `keep`: sums out every scope variable not listed.
    ///
    /// The result's scope is `scope ∩ keep`, in this factor's order.
    pub fn marginalize(&self, keep: &[usize]) -> Factor {
        let eliminate: Vec<usize> = self
            .variables
            .iter()
            .copied()
            .filter(|v| !keep.contains(v))
            .collect();
        self.sum_out_vars(&eliminate)
    }

    /// Zero every cell inconsistent with `evidence`.
    ///
    /// The scope and size are unchanged; consistent cells are copied as is.
    pub fn restrict(&self, evidence: &Evidence) -> Factor {
        // (stride, cardinality, observed value) per observed scope variable
        let observed: Vec<(usize, usize, usize)> = self
            .variables
            .iter()
            .filter_map(|&v| {
                evidence
                    .get(v)
                    .map(|obs| (self.strides.stride(v), self.cardinality[v], obs))
            })
            .collect();

        let mut restricted = self.clone();
        if observed.is_empty() {
            return restricted;
        }

        for (idx, value) in restricted.values.iter_mut().enumerate() {
            if observed
                .iter()
                .any(|&(stride, card, obs)| (idx / stride) % card != obs)
            {
                *value = 0.0;
            }
        }
        restricted
    }

    /// Rescale in place so the values sum to one.
    pub fn normalize(&mut self) -> Result<()> {
        let sum = self.sum();
        if sum <= 0.0 || sum.is_nan() {
            return Err(PgmError::ZeroPartition);
        }
        self.values /= sum;
        Ok(())
    }

    /// Normalized copy of this factor.
    pub fn normalized(&self) -> Result<Factor> {
        let mut factor = self.clone();
        factor.normalize()?;
        Ok(factor)
    }

    /// Conditional table `self / Σ_{scope \ given} self`.
    ///
    /// Turns a joint (expected-count) table over the scope into
    /// P(scope \ given | given). Rows whose marginal is zero stay zero.
    pub fn conditional_on(&self, given: &[usize]) -> Result<Factor> {
        let conditional = self.divide(&self.marginalize(given))?;
        conditional.reorder(&self.variables)
    }

    /// Re-lay the table out over the same scope in a different variable order.
    pub fn reorder(&self, order: &[usize]) -> Result<Factor> {
        if order == self.variables.as_slice() {
            return Ok(self.clone());
        }
        validate_scope(order, &self.cardinality)?;
        if order.len() != self.variables.len() || !order.iter().all(|v| self.contains(*v)) {
            return Err(PgmError::DimensionMismatch {
                expected: self.variables.clone(),
                got: order.to_vec(),
            });
        }

        let out_strides = StrideMap::new(order, &self.cardinality);
        let mut values = Array1::<f64>::zeros(self.values.len());
        walk_aligned(
            &self.variables,
            &self.cardinality,
            [&self.strides, &out_strides],
            |[i, o]| values[o] = self.values[i],
        );

        Ok(Self::from_parts(
            order.to_vec(),
            self.cardinality.clone(),
            values,
        ))
    }

    /// Add another factor over the same scope (any order) into this one.
    pub fn accumulate(&mut self, other: &Factor) -> Result<()> {
        self.check_compatible(other)?;
        let aligned = other.reorder(&self.variables)?;
        self.values += &aligned.values;
        Ok(())
    }

    /// Largest absolute cell difference to a factor over the same scope.
    pub fn max_abs_diff(&self, other: &Factor) -> Result<f64> {
        self.check_compatible(other)?;
        let aligned = other.reorder(&self.variables)?;
        Ok(self
            .values
            .iter()
            .zip(aligned.values.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max))
    }

    /// Export as an n-dimensional table with axis `i` indexing `variables()[i]`.
    pub fn to_table(&self) -> Result<ArrayD<f64>> {
        // C-order over the reversed scope puts the first variable last (fastest),
        // matching the flat layout; reversing the axes restores scope order.
        let shape: Vec<usize> = self
            .variables
            .iter()
            .rev()
            .map(|&v| self.cardinality[v])
            .collect();
        let table = ArrayD::from_shape_vec(shape, self.values.to_vec())
            .map_err(|e| PgmError::InvalidGraph(format!("Array creation failed: {}", e)))?;
        Ok(table.reversed_axes())
    }
}
