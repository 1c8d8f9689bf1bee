//! Predicates driving the quorum and blocking-set searches.
//!
//! A predicate is an immutable value. Testing a peer's message either
//! fails or yields the successor predicate to use for the next peer, so a
//! search branch that fails is backtracked by simply dropping the
//! successor and continuing with the predicate held before the branch.

use std::fmt;

use crate::{ballot::ValueSet, message::Msg, traits::Value};

/// Acceptance test applied to a peer's latest message during a search.
pub trait Predicate<V: Value>: Clone {
    /// Tests `msg`. On success returns the predicate to apply to the next
    /// peer visited, possibly narrowed by what `msg` claims.
    fn test(&self, msg: &Msg<V>) -> Option<Self>;
}

/// Stateless predicate wrapping a plain function.
#[derive(Clone)]
pub struct FnPredicate<F> {
    f: F,
}

impl<F> FnPredicate<F> {
    /// Wraps `f`.
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

impl<V, F> Predicate<V> for FnPredicate<F>
where
    V: Value,
    F: Fn(&Msg<V>) -> bool + Clone,
{
    fn test(&self, msg: &Msg<V>) -> Option<Self> {
        (self.f)(msg).then(|| self.clone())
    }
}

impl<F> fmt::Debug for FnPredicate<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPredicate").finish_non_exhaustive()
    }
}

/// Predicate narrowing a set of candidate values.
///
/// The narrowing function maps a message and the current candidates to the
/// subset the message supports. The test fails once no candidate is left.
#[derive(Clone)]
pub struct ValueSetPredicate<V: Ord, F> {
    values: ValueSet<V>,
    narrow: F,
}

impl<V: Value, F> ValueSetPredicate<V, F>
where
    F: Fn(&Msg<V>, &ValueSet<V>) -> ValueSet<V> + Clone,
{
    /// Creates a predicate starting from `values`.
    pub const fn new(values: ValueSet<V>, narrow: F) -> Self {
        Self { values, narrow }
    }

    /// Candidates that survived every message tested so far.
    pub const fn values(&self) -> &ValueSet<V> {
        &self.values
    }

    /// Consumes the predicate, returning the surviving candidates.
    pub fn into_values(self) -> ValueSet<V> {
        self.values
    }
}

impl<V, F> Predicate<V> for ValueSetPredicate<V, F>
where
    V: Value,
    F: Fn(&Msg<V>, &ValueSet<V>) -> ValueSet<V> + Clone,
{
    fn test(&self, msg: &Msg<V>) -> Option<Self> {
        if self.values.is_empty() {
            return None;
        }
        let values = (self.narrow)(msg, &self.values);
        if values.is_empty() {
            return None;
        }
        Some(Self { values, narrow: self.narrow.clone() })
    }
}

impl<V: Value, F> fmt::Debug for ValueSetPredicate<V, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueSetPredicate").field("values", &self.values).finish_non_exhaustive()
    }
}

/// Predicate narrowing an inclusive counter range `[min, max]`.
///
/// The narrowing function intersects the current range with what a message
/// supports, returning `None` when they are disjoint.
#[derive(Clone)]
pub struct RangePredicate<F> {
    min: u32,
    max: u32,
    narrow: F,
}

impl<F> RangePredicate<F> {
    /// Creates a predicate over `[min, max]`.
    pub const fn new(min: u32, max: u32, narrow: F) -> Self {
        Self { min, max, narrow }
    }

    /// Lower bound that survived every message tested so far.
    pub const fn min(&self) -> u32 {
        self.min
    }

    /// Upper bound that survived every message tested so far.
    pub const fn max(&self) -> u32 {
        self.max
    }

    /// Returns the surviving bounds.
    pub const fn bounds(&self) -> (u32, u32) {
        (self.min, self.max)
    }
}

impl<V, F> Predicate<V> for RangePredicate<F>
where
    V: Value,
    F: Fn(&Msg<V>, u32, u32) -> Option<(u32, u32)> + Clone,
{
    fn test(&self, msg: &Msg<V>) -> Option<Self> {
        if self.min > self.max {
            return None;
        }
        let (min, max) = (self.narrow)(msg, self.min, self.max)?;
        Some(Self { min, max, narrow: self.narrow.clone() })
    }
}

impl<F> fmt::Debug for RangePredicate<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangePredicate")
            .field("min", &self.min)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ballot::Ballot,
        message::{CommitTopic, NomTopic, Topic},
        quorum::QuorumSlices,
        types::NodeId,
    };

    #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct Val(u32);

    impl Value for Val {
        fn combine(&self, other: &Self) -> Self {
            Self(self.0.max(other.0))
        }

        fn bytes(&self) -> Vec<u8> {
            self.0.to_be_bytes().to_vec()
        }
    }

    fn msg(topic: Topic<Val>) -> Msg<Val> {
        Msg::new(NodeId::from("peer"), 1, QuorumSlices::default(), topic)
    }

    fn nom(x: &[u32]) -> Msg<Val> {
        msg(Topic::Nominate(NomTopic {
            x: x.iter().copied().map(Val).collect(),
            y: ValueSet::new(),
        }))
    }

    fn commit(cn: u32, hn: u32) -> Msg<Val> {
        msg(Topic::Commit(CommitTopic { b: Ballot::new(hn, Val(1)), pn: hn, hn, cn }))
    }

    #[test]
    fn test_fn_predicate_is_stateless() {
        let pred = FnPredicate::new(|m: &Msg<Val>| m.topic.votes_or_accepts_nominated(&Val(1)));
        assert!(pred.test(&nom(&[1, 2])).is_some());
        assert!(pred.test(&nom(&[2])).is_none());
        // A failed test leaves the original usable.
        assert!(pred.test(&nom(&[1])).is_some());
    }

    #[test]
    fn test_value_set_predicate_narrows() {
        let start: ValueSet<Val> = [Val(1), Val(2), Val(3)].into_iter().collect();
        let pred = ValueSetPredicate::new(start, |m: &Msg<Val>, vals: &ValueSet<Val>| {
            vals.iter().filter(|v| m.topic.votes_or_accepts_nominated(v)).cloned().collect()
        });

        let first = pred.test(&nom(&[1, 2])).unwrap();
        assert_eq!(first.values().len(), 2);

        let second = first.test(&nom(&[2, 3])).unwrap();
        assert_eq!(second.into_values().into_iter().collect::<Vec<_>>(), vec![Val(2)]);

        // Branching off `first` again is unaffected by `second`.
        assert!(first.test(&nom(&[3])).is_none());
        assert_eq!(first.values().len(), 2);
    }

    #[test]
    fn test_range_predicate_narrows() {
        let pred = RangePredicate::new(1, 10, |m: &Msg<Val>, min: u32, max: u32| {
            m.topic.accepts_commit(&Val(1), min, max)
        });

        let first = pred.test(&commit(3, 12)).unwrap();
        assert_eq!(first.bounds(), (3, 10));

        let second = first.test(&commit(1, 7)).unwrap();
        assert_eq!((second.min(), second.max()), (3, 7));

        assert!(second.test(&commit(8, 9)).is_none());
        assert_eq!(pred.bounds(), (1, 10));
    }

    #[test]
    fn test_range_predicate_empty_range_fails() {
        let pred = RangePredicate::new(5, 4, |_: &Msg<Val>, min: u32, max: u32| Some((min, max)));
        assert!(pred.test(&commit(1, 10)).is_none());
    }
}
