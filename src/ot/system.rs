//! The operation algebra every application diff type plugs into.
//!
//! An [`OTSystem`] only has to describe how two *single* operations
//! interact. Sequence transformation, squashing and inversion are derived
//! from those primitives by the provided methods, so applications rarely
//! need to override them.

use std::error::Error;
use std::fmt;

/// The outcome of transforming two concurrent operation sequences.
///
/// `right` is the right-hand sequence rewritten so that it applies on top
/// of the left-hand input, and `left` is the left-hand sequence rewritten
/// to apply on top of the right-hand input. Both routes end in the same
/// state:
///
/// ```text
///   state --left--> A --result.right--> S
///   state --right-> B --result.left---> S
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformResult<D> {
    pub left: Vec<D>,
    pub right: Vec<D>,
}

impl<D> TransformResult<D> {
    pub fn new(left: Vec<D>, right: Vec<D>) -> Self {
        Self { left, right }
    }

    /// Neither side needs follow-up operations.
    pub fn empty() -> Self {
        Self {
            left: Vec::new(),
            right: Vec::new(),
        }
    }

    /// The left side wins: `catch_up` takes the right branch to the left
    /// branch's outcome, while the left branch stays as it is.
    pub fn left_wins(catch_up: Vec<D>) -> Self {
        Self {
            left: catch_up,
            right: Vec::new(),
        }
    }

    /// The right side wins: `catch_up` takes the left branch to the right
    /// branch's outcome.
    pub fn right_wins(catch_up: Vec<D>) -> Self {
        Self {
            left: Vec::new(),
            right: catch_up,
        }
    }
}

/// Two concurrent operations could not be reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformError {
    message: String,
}

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transform failed: {}", self.message)
    }
}

impl Error for TransformError {}

/// Transform, squash and invert over an application diff type `D`.
///
/// Implementations must satisfy the convergence property for every pair of
/// operations `l` and `r` that apply to the same state:
/// `apply(apply(s, l), transform_op(l, r).right) == apply(apply(s, r), transform_op(l, r).left)`.
pub trait OTSystem<D: Clone> {
    /// Reconciles two concurrent single operations.
    fn transform_op(&self, left: &D, right: &D) -> Result<TransformResult<D>, TransformError>;

    /// Combines two consecutive operations into one, if they can be.
    fn try_squash(&self, first: &D, second: &D) -> Option<D>;

    /// Operations that undo `op`.
    fn invert_op(&self, op: &D) -> Vec<D>;

    /// Whether applying `op` has no effect.
    fn is_empty(&self, op: &D) -> bool;

    /// Transforms two concurrent operation sequences.
    ///
    /// The left sequence is consumed one operation at a time; each step
    /// rebases one left operation over the whole right sequence.
    fn transform(&self, left: &[D], right: &[D]) -> Result<TransformResult<D>, TransformError> {
        let mut rebased_right = right.to_vec();
        let mut rebased_left = Vec::with_capacity(left.len());
        for op in left {
            let step = self.transform_one(op, &rebased_right)?;
            rebased_left.extend(step.left);
            rebased_right = step.right;
        }
        Ok(TransformResult::new(rebased_left, rebased_right))
    }

    /// Transforms a single left operation against a right sequence.
    fn transform_one(&self, left: &D, right: &[D]) -> Result<TransformResult<D>, TransformError> {
        // `carried` applies after the prefix of `right` handled so far.
        let mut carried = vec![left.clone()];
        let mut rebased_right = Vec::with_capacity(right.len());
        for op in right {
            let step = if carried.len() == 1 {
                self.transform_op(&carried[0], op)?
            } else {
                self.transform(&carried, std::slice::from_ref(op))?
            };
            carried = step.left;
            rebased_right.extend(step.right);
        }
        Ok(TransformResult::new(carried, rebased_right))
    }

    /// Reduces `ops` to a shorter equivalent sequence without empty ops.
    fn squash(&self, ops: &[D]) -> Vec<D> {
        let mut result = Vec::with_capacity(ops.len());
        let mut iter = ops.iter();
        let Some(first) = iter.next() else {
            return result;
        };
        let mut current = first.clone();
        for next in iter {
            match self.try_squash(&current, next) {
                Some(squashed) => current = squashed,
                None => {
                    if !self.is_empty(&current) {
                        result.push(current);
                    }
                    current = next.clone();
                }
            }
        }
        if !self.is_empty(&current) {
            result.push(current);
        }
        result
    }

    /// Operations undoing the whole sequence, last operation first.
    fn invert(&self, ops: &[D]) -> Vec<D> {
        ops.iter().rev().flat_map(|op| self.invert_op(op)).collect()
    }

    /// Whether every operation in `ops` is empty.
    fn is_empty_seq(&self, ops: &[D]) -> bool {
        ops.iter().all(|op| self.is_empty(op))
    }
}

impl<D: Clone, S: OTSystem<D> + ?Sized> OTSystem<D> for &S {
    fn transform_op(&self, left: &D, right: &D) -> Result<TransformResult<D>, TransformError> {
        (**self).transform_op(left, right)
    }

    fn try_squash(&self, first: &D, second: &D) -> Option<D> {
        (**self).try_squash(first, second)
    }

    fn invert_op(&self, op: &D) -> Vec<D> {
        (**self).invert_op(op)
    }

    fn is_empty(&self, op: &D) -> bool {
        (**self).is_empty(op)
    }
}

/// A diff made of two independent component sequences.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergedDiff<D1, D2> {
    pub first: Vec<D1>,
    pub second: Vec<D2>,
}

impl<D1, D2> MergedDiff<D1, D2> {
    pub fn new(first: Vec<D1>, second: Vec<D2>) -> Self {
        Self { first, second }
    }
}

/// Runs two systems side by side over [`MergedDiff`] operations.
///
/// The components never interact; each one is transformed, squashed and
/// inverted by its own system.
#[derive(Debug, Clone)]
pub struct MergedOTSystem<S1, S2> {
    first: S1,
    second: S2,
}

impl<S1, S2> MergedOTSystem<S1, S2> {
    pub fn new(first: S1, second: S2) -> Self {
        Self { first, second }
    }
}

impl<D1, D2, S1, S2> OTSystem<MergedDiff<D1, D2>> for MergedOTSystem<S1, S2>
where
    D1: Clone,
    D2: Clone,
    S1: OTSystem<D1>,
    S2: OTSystem<D2>,
{
    fn transform_op(
        &self,
        left: &MergedDiff<D1, D2>,
        right: &MergedDiff<D1, D2>,
    ) -> Result<TransformResult<MergedDiff<D1, D2>>, TransformError> {
        let first = self.first.transform(&left.first, &right.first)?;
        let second = self.second.transform(&left.second, &right.second)?;
        Ok(TransformResult::new(
            vec![MergedDiff::new(first.left, second.left)],
            vec![MergedDiff::new(first.right, second.right)],
        ))
    }

    fn try_squash(
        &self,
        first: &MergedDiff<D1, D2>,
        second: &MergedDiff<D1, D2>,
    ) -> Option<MergedDiff<D1, D2>> {
        let mut firsts = first.first.clone();
        firsts.extend(second.first.iter().cloned());
        let mut seconds = first.second.clone();
        seconds.extend(second.second.iter().cloned());
        Some(MergedDiff::new(
            self.first.squash(&firsts),
            self.second.squash(&seconds),
        ))
    }

    fn invert_op(&self, op: &MergedDiff<D1, D2>) -> Vec<MergedDiff<D1, D2>> {
        vec![MergedDiff::new(
            self.first.invert(&op.first),
            self.second.invert(&op.second),
        )]
    }

    fn is_empty(&self, op: &MergedDiff<D1, D2>) -> bool {
        self.first.is_empty_seq(&op.first) && self.second.is_empty_seq(&op.second)
    }
}
