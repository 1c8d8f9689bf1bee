//! Ballots and ordered value/ballot sets.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use crate::traits::Value;

/// Counter standing in for an unbounded upper end of a commit range.
pub const INFINITY: u32 = u32::MAX;

/// A `(counter, value)` pair that balloting operates on.
///
/// Ordered by counter, then by value. "No ballot yet" is modelled as
/// `Option<Ballot<V>>::None` rather than a zero ballot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot<V> {
    /// Ballot counter.
    pub counter: u32,
    /// Ballot value.
    pub value: V,
}

impl<V: Value> Ballot<V> {
    /// Creates a new ballot.
    pub const fn new(counter: u32, value: V) -> Self {
        Self { counter, value }
    }

    /// Returns true if this ballot is incompatible with `other`: their
    /// values differ and this ballot's counter does not exceed `other`'s.
    pub fn aborts(&self, other: &Self) -> bool {
        self.value != other.value && self.counter <= other.counter
    }
}

impl<V: fmt::Debug> fmt::Display for Ballot<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{},{:?}>", self.counter, self.value)
    }
}

/// Sorted set with unique members.
///
/// Backs both [`ValueSet`] and [`BallotSet`]; iteration is always in
/// ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedSet<T: Ord>(BTreeSet<T>);

/// A sorted set of values.
pub type ValueSet<V> = OrderedSet<V>;

/// A sorted set of ballots.
pub type BallotSet<V> = OrderedSet<Ballot<V>>;

impl<T: Ord> Default for OrderedSet<T> {
    fn default() -> Self {
        Self(BTreeSet::new())
    }
}

impl<T: Ord + Clone> OrderedSet<T> {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Adds a member. Returns true if it was not already present.
    pub fn add(&mut self, item: T) -> bool {
        self.0.insert(item)
    }

    /// Removes a member. Returns true if it was present.
    pub fn remove(&mut self, item: &T) -> bool {
        self.0.remove(item)
    }

    /// Returns true if `item` is a member.
    pub fn contains(&self, item: &T) -> bool {
        self.0.contains(item)
    }

    /// Returns the union of two sets.
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Returns true if every member of `self` is in `other`.
    pub fn is_subset(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Returns the largest member.
    pub fn last(&self) -> Option<&T> {
        self.0.last()
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates members in ascending order.
    pub fn iter(&self) -> std::collections::btree_set::Iter<'_, T> {
        self.0.iter()
    }
}

impl<V: Value> OrderedSet<V> {
    /// Folds every member into one value with [`Value::combine`], in
    /// ascending order. The empty set combines to `None`.
    pub fn combine(&self) -> Option<V> {
        let mut iter = self.0.iter();
        let first = iter.next()?.clone();
        Some(iter.fold(first, |acc, v| acc.combine(v)))
    }
}

impl<T: Ord> FromIterator<T> for OrderedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<T: Ord> Extend<T> for OrderedSet<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl<T: Ord> IntoIterator for OrderedSet<T> {
    type Item = T;
    type IntoIter = std::collections::btree_set::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a, T: Ord> IntoIterator for &'a OrderedSet<T> {
    type Item = &'a T;
    type IntoIter = std::collections::btree_set::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<T: Ord + fmt::Debug> fmt::Display for OrderedSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    struct Sum(u32);

    impl Value for Sum {
        fn combine(&self, other: &Self) -> Self {
            Self(self.0 + other.0)
        }

        fn bytes(&self) -> Vec<u8> {
            self.0.to_be_bytes().to_vec()
        }
    }

    fn ballot(counter: u32, value: u32) -> Ballot<Sum> {
        Ballot::new(counter, Sum(value))
    }

    #[test]
    fn test_ballot_total_order() {
        let ballots = [ballot(0, 9), ballot(1, 1), ballot(1, 2), ballot(2, 0)];
        for (i, a) in ballots.iter().enumerate() {
            for (j, b) in ballots.iter().enumerate() {
                assert_eq!(a < b, i < j, "{a} < {b}");
                assert_eq!(a == b, i == j);
            }
        }
    }

    #[rstest]
    #[case::same_value(ballot(1, 1), ballot(2, 1), false)]
    #[case::lower_counter(ballot(1, 1), ballot(2, 2), true)]
    #[case::equal_counter(ballot(2, 1), ballot(2, 2), true)]
    #[case::higher_counter(ballot(3, 1), ballot(2, 2), false)]
    fn test_ballot_aborts(#[case] a: Ballot<Sum>, #[case] b: Ballot<Sum>, #[case] expected: bool) {
        assert_eq!(a.aborts(&b), expected);
    }

    #[test]
    fn test_value_set_combine_is_order_independent() {
        let mut forward = ValueSet::new();
        forward.add(Sum(3));
        forward.add(Sum(5));

        let mut backward = ValueSet::new();
        backward.add(Sum(5));
        backward.add(Sum(3));

        assert_eq!(forward.combine(), Some(Sum(8)));
        assert_eq!(forward.combine(), backward.combine());
    }

    #[test]
    fn test_value_set_empty_combine() {
        assert_eq!(ValueSet::<Sum>::new().combine(), None);
    }

    #[test]
    fn test_value_set_membership() {
        let mut set: ValueSet<Sum> = [Sum(4), Sum(1), Sum(4)].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![&Sum(1), &Sum(4)]);
        assert!(!set.add(Sum(1)));
        assert!(set.remove(&Sum(1)));
        assert!(!set.contains(&Sum(1)));
        assert_eq!(set.last(), Some(&Sum(4)));

        let other: ValueSet<Sum> = [Sum(7)].into_iter().collect();
        let union = set.union(&other);
        assert!(set.is_subset(&union));
        assert!(!union.is_subset(&set));
    }

    #[test]
    fn test_ballot_set_is_sorted_by_counter_then_value() {
        let set: BallotSet<Sum> = [ballot(2, 1), ballot(1, 9), ballot(2, 0)].into_iter().collect();
        let order: Vec<_> = set.iter().cloned().collect();
        assert_eq!(order, vec![ballot(1, 9), ballot(2, 0), ballot(2, 1)]);
        assert_eq!(set.last(), Some(&ballot(2, 1)));
    }
}
