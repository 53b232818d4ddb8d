//! Mixed-radix enumeration of joint assignments and flat-array addressing.
//!
//! Every table in this crate is a flat array addressed through a [`StrideMap`]:
//! for a scope `[v0, v1, ..., vm]` the stride of `v0` is 1 and each following
//! variable's stride is the previous stride times the previous cardinality.
//! The flat index of a combination is `Σ value[i] * stride[var[i]]`, so the
//! first variable of a scope is the fastest-varying digit.
//!
//! [`Assignment`] walks all combinations of a scope in exactly that order and
//! can project the current combination onto any other stride map, which is
//! how factors over different scopes are aligned.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{PgmError, Result};

/// Cardinality table shared by every factor of a problem, indexed by variable id.
pub type Cardinalities = Arc<[usize]>;

/// Dense per-variable stride table.
///
/// Indexed directly by variable id; variables outside the scope the map was
/// built from have stride 0 and therefore contribute nothing to an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrideMap {
    strides: Vec<usize>,
}

impl StrideMap {
    /// Build the stride map of `variables` (in list order) over `cardinality`.
    ///
    /// # Panics
    ///
    /// Panics if a variable id is not a valid index into `cardinality`.
    /// Factor and assignment constructors validate scopes before building one.
    pub fn new(variables: &[usize], cardinality: &[usize]) -> Self {
        let mut strides = vec![0; cardinality.len()];
        let mut stride = 1;
        for &var in variables {
            strides[var] = stride;
            stride *= cardinality[var];
        }
        Self { strides }
    }

    /// Stride of a variable, 0 if it is not part of the mapped scope.
    #[inline]
    pub fn stride(&self, var: usize) -> usize {
        self.strides.get(var).copied().unwrap_or(0)
    }
}

/// Position of an [`Assignment`] in its enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    BeforeStart,
    Active,
    Exhausted,
}

/// Lazy enumeration of every joint value combination of an ordered scope.
///
/// A fresh assignment is positioned before the first combination; each call to
/// [`advance`](Assignment::advance) moves to the next one, with position 0 the
/// fastest-varying digit. Once exhausted, further calls are no-ops returning
/// `false`. To restart, build a new assignment.
#[derive(Debug, Clone)]
pub struct Assignment {
    variables: Vec<usize>,
    cards: Vec<usize>,
    values: Vec<usize>,
    cursor: Cursor,
}

impl Assignment {
    /// Create an enumeration over `variables` using the global cardinality table.
    pub fn new(variables: &[usize], cardinality: &[usize]) -> Result<Self> {
        let cards = variables
            .iter()
            .map(|&var| {
                cardinality
                    .get(var)
                    .copied()
                    .ok_or(PgmError::VariableNotFound(var))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            variables: variables.to_vec(),
            values: vec![0; cards.len()],
            cards,
            cursor: Cursor::BeforeStart,
        })
    }

    /// Move to the next combination. Returns `false` once all are exhausted.
    pub fn advance(&mut self) -> bool {
        match self.cursor {
            Cursor::Exhausted => false,
            Cursor::BeforeStart => {
                if self.cards.contains(&0) {
                    self.cursor = Cursor::Exhausted;
                    return false;
                }
                self.cursor = Cursor::Active;
                true
            }
            Cursor::Active => {
                for (value, &card) in self.values.iter_mut().zip(&self.cards) {
                    *value += 1;
                    if *value < card {
                        return true;
                    }
                    *value = 0;
                }
                self.cursor = Cursor::Exhausted;
                false
            }
        }
    }

    /// Whether the assignment currently holds a valid combination.
    pub fn is_active(&self) -> bool {
        self.cursor == Cursor::Active
    }

    /// Number of variables in the scope.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// Whether the scope is empty.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Variable at position `i`.
    pub fn variable(&self, i: usize) -> usize {
        self.variables[i]
    }

    /// Current value at position `i`, `None` outside an active combination.
    pub fn value(&self, i: usize) -> Option<usize> {
        self.is_active().then(|| self.values[i])
    }

    /// The ordered scope.
    pub fn variables(&self) -> &[usize] {
        &self.variables
    }

    /// Current values, parallel to [`variables`](Assignment::variables).
    pub fn values(&self) -> &[usize] {
        &self.values
    }

    /// Flat index of the current combination under an external stride map.
    ///
    /// Variables the map does not cover contribute zero.
    pub fn index(&self, strides: &StrideMap) -> usize {
        self.variables
            .iter()
            .zip(&self.values)
            .map(|(&var, &value)| value * strides.stride(var))
            .sum()
    }

    /// Whether the current combination agrees with a sparse partial assignment.
    pub fn consistent(&self, evidence: &Evidence) -> bool {
        self.is_active()
            && self
                .variables
                .iter()
                .zip(&self.values)
                .all(|(&var, &value)| evidence.get(var).map_or(true, |obs| obs == value))
    }
}

/// Observed values for the variables of a problem.
///
/// One entry per problem variable; `None` marks an unobserved variable.
/// Variables past the end of the vector are treated as unobserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    values: Vec<Option<usize>>,
}

impl Evidence {
    /// Evidence over `num_variables` variables with nothing observed.
    pub fn unobserved(num_variables: usize) -> Self {
        Self {
            values: vec![None; num_variables],
        }
    }

    /// Build evidence from explicit per-variable observations.
    pub fn from_values(values: Vec<Option<usize>>) -> Self {
        Self { values }
    }

    /// Build evidence from a data row where negative entries mean "unobserved".
    pub fn from_row(row: &[i64]) -> Self {
        Self {
            values: row.iter().map(|&v| usize::try_from(v).ok()).collect(),
        }
    }

    /// Observe `var = value`, growing the vector if needed.
    pub fn observe(&mut self, var: usize, value: usize) -> &mut Self {
        if var >= self.values.len() {
            self.values.resize(var + 1, None);
        }
        self.values[var] = Some(value);
        self
    }

    /// Forget the observation of `var`.
    pub fn unobserve(&mut self, var: usize) -> &mut Self {
        if let Some(slot) = self.values.get_mut(var) {
            *slot = None;
        }
        self
    }

    /// Observed value of `var`, if any.
    #[inline]
    pub fn get(&self, var: usize) -> Option<usize> {
        self.values.get(var).copied().flatten()
    }

    /// Whether `var` is observed.
    pub fn is_observed(&self, var: usize) -> bool {
        self.get(var).is_some()
    }

    /// Number of observed variables.
    pub fn num_observed(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Length of the underlying vector.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the underlying vector is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Check the evidence against a problem's cardinality table.
    pub fn validate(&self, cardinality: &[usize]) -> Result<()> {
        if self.values.len() != cardinality.len() {
            return Err(PgmError::InvalidEvidence(format!(
                "expected {} entries, got {}",
                cardinality.len(),
                self.values.len()
            )));
        }

        for (var, (value, &card)) in self.values.iter().zip(cardinality).enumerate() {
            if let Some(value) = *value {
                if value >= card {
                    return Err(PgmError::InvalidEvidence(format!(
                        "value {} out of range for variable {} with cardinality {}",
                        value, var, card
                    )));
                }
            }
        }

        Ok(())
    }
}
