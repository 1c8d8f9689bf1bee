//! Quorum slices and the federated searches over them.
//!
//! Both searches run against a slot's map of the latest message received
//! from each peer. Messages carry their sender's slices, so the quorum
//! search can follow trust transitively through nodes this node has never
//! configured directly.
//!
//! Visitation order is deterministic: slices are tried in declaration
//! order and members within a slice in [`NodeId`] order.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    message::{Acceptance, Msg},
    predicate::Predicate,
    traits::Value,
    types::{ConfigError, NodeId, Weight},
};

/// A set of node ids, iterated in order.
pub type NodeSet = BTreeSet<NodeId>;

/// Latest message received from each peer.
pub type PeerMessages<V> = BTreeMap<NodeId, Msg<V>>;

/// A node's quorum slices.
///
/// Each slice implicitly includes the owning node. Slices received from
/// peers are taken as-is; slices for a local node are checked with
/// [`QuorumSlices::new`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuorumSlices(Vec<NodeSet>);

impl QuorumSlices {
    /// Validates and builds the slices owned by `owner`.
    ///
    /// # Errors
    ///
    /// Fails if there are no slices, if a slice is empty, or if a slice
    /// names `owner` itself.
    pub fn new<I, S>(owner: &NodeId, slices: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: IntoIterator<Item = NodeId>,
    {
        let slices: Vec<NodeSet> =
            slices.into_iter().map(|slice| slice.into_iter().collect()).collect();
        if slices.is_empty() {
            return Err(ConfigError::NoSlices);
        }
        for (index, slice) in slices.iter().enumerate() {
            if slice.is_empty() {
                return Err(ConfigError::EmptySlice { index });
            }
            if slice.contains(owner) {
                return Err(ConfigError::SelfInSlice { index });
            }
        }
        Ok(Self(slices))
    }

    /// Number of slices.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no slices.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates slices in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, NodeSet> {
        self.0.iter()
    }

    /// Every node named in any slice.
    pub fn members(&self) -> NodeSet {
        self.0.iter().flatten().cloned().collect()
    }

    /// Fraction of slices that contain `id`.
    pub fn weight(&self, id: &NodeId) -> Weight {
        let count = self.0.iter().filter(|slice| slice.contains(id)).count();
        Weight { count, total: self.0.len() }
    }
}

impl<S: IntoIterator<Item = NodeId>> FromIterator<S> for QuorumSlices {
    /// Builds slices without validation, as when decoding a peer's claim.
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(|slice| slice.into_iter().collect()).collect())
    }
}

impl<'a> IntoIterator for &'a QuorumSlices {
    type Item = &'a NodeSet;
    type IntoIter = std::slice::Iter<'a, NodeSet>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Finds one peer per slice whose latest message satisfies `pred`.
///
/// Returns the blocking set together with the final predicate, or `None`
/// if some slice has no satisfying member. A peer already chosen for an
/// earlier slice also covers any later slice containing it.
pub fn find_blocking_set<V, P>(
    slices: &QuorumSlices,
    messages: &PeerMessages<V>,
    pred: P,
) -> Option<(NodeSet, P)>
where
    V: Value,
    P: Predicate<V>,
{
    let mut found = NodeSet::new();
    let mut pred = pred;
    'slices: for slice in slices {
        if slice.iter().any(|id| found.contains(id)) {
            continue;
        }
        for id in slice {
            let Some(msg) = messages.get(id) else { continue };
            if let Some(next) = pred.test(msg) {
                pred = next;
                found.insert(id.clone());
                continue 'slices;
            }
        }
        return None;
    }
    Some((found, pred))
}

/// Finds a quorum containing `owner` in which every other member's latest
/// message satisfies `pred`.
///
/// Returns the quorum together with the final predicate, or `None`.
pub fn find_quorum<V, P>(
    owner: &NodeId,
    slices: &QuorumSlices,
    messages: &PeerMessages<V>,
    pred: P,
) -> Option<(NodeSet, P)>
where
    V: Value,
    P: Predicate<V>,
{
    let seed = NodeSet::from([owner.clone()]);
    node_quorum(slices, messages, &pred, &seed)
}

/// Federated acceptance: a blocking set that accepts, else a quorum that
/// votes for or accepts.
///
/// `statement` builds the predicate for each strength. Returns the set
/// found and its final predicate.
pub fn find_blocking_set_or_quorum<V, P, F>(
    owner: &NodeId,
    slices: &QuorumSlices,
    messages: &PeerMessages<V>,
    statement: F,
) -> Option<(NodeSet, P)>
where
    V: Value,
    P: Predicate<V>,
    F: Fn(Acceptance) -> P,
{
    find_blocking_set(slices, messages, statement(Acceptance::Accepts))
        .or_else(|| find_quorum(owner, slices, messages, statement(Acceptance::VotesOrAccepts)))
}

/// Tries each slice in turn, keeping the first that closes into a quorum.
fn node_quorum<V, P>(
    slices: &QuorumSlices,
    messages: &PeerMessages<V>,
    pred: &P,
    sofar: &NodeSet,
) -> Option<(NodeSet, P)>
where
    V: Value,
    P: Predicate<V>,
{
    slices.iter().find_map(|slice| slice_quorum(slice, messages, pred, sofar))
}

/// Requires every new member of `slice` to satisfy the predicate, then
/// recurses into each new member's own slices.
fn slice_quorum<V, P>(
    slice: &NodeSet,
    messages: &PeerMessages<V>,
    pred: &P,
    sofar: &NodeSet,
) -> Option<(NodeSet, P)>
where
    V: Value,
    P: Predicate<V>,
{
    let mut pred = pred.clone();
    let mut fresh = Vec::new();
    for id in slice.iter().filter(|id| !sofar.contains(*id)) {
        let msg = messages.get(id)?;
        pred = pred.test(msg)?;
        fresh.push(msg);
    }
    if fresh.is_empty() {
        return Some((sofar.clone(), pred));
    }

    let mut quorum = sofar.clone();
    quorum.extend(fresh.iter().map(|msg| msg.sender.clone()));
    for msg in fresh {
        let (grown, next) = node_quorum(&msg.slices, messages, &pred, &quorum)?;
        quorum = grown;
        pred = next;
    }
    Some((quorum, pred))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        ballot::{Ballot, ValueSet},
        message::{CommitTopic, NomTopic, Topic},
        predicate::{FnPredicate, RangePredicate},
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

    fn id(name: &str) -> NodeId {
        NodeId::from(name)
    }

    fn slices(spec: &[&[&str]]) -> QuorumSlices {
        spec.iter().map(|slice| slice.iter().map(|name| id(name))).collect()
    }

    fn nom(sender: &str, peer_slices: &[&[&str]], x: &[u32]) -> Msg<Val> {
        let topic = Topic::Nominate(NomTopic {
            x: x.iter().copied().map(Val).collect(),
            y: ValueSet::new(),
        });
        Msg::new(id(sender), 1, slices(peer_slices), topic)
    }

    fn messages(msgs: Vec<Msg<Val>>) -> PeerMessages<Val> {
        msgs.into_iter().map(|m| (m.sender.clone(), m)).collect()
    }

    fn votes(v: u32) -> impl Fn(&Msg<Val>) -> bool + Clone {
        move |m: &Msg<Val>| m.topic.votes_or_accepts_nominated(&Val(v))
    }

    #[rstest]
    #[case::both_slices(&["b", "d"], Some(vec!["b", "d"]))]
    #[case::first_satisfier_wins(&["b", "c", "d", "e"], Some(vec!["b", "d"]))]
    #[case::later_members(&["c", "e"], Some(vec!["c", "e"]))]
    #[case::second_slice_empty(&["b", "c"], None)]
    #[case::first_slice_empty(&["d"], None)]
    #[case::nobody(&[], None)]
    fn test_find_blocking_set(#[case] voters: &[&str], #[case] expected: Option<Vec<&str>>) {
        let q = slices(&[&["b", "c"], &["d", "e"]]);
        let msgs = messages(
            ["b", "c", "d", "e"]
                .iter()
                .map(|name| nom(name, &[&["a"]], if voters.contains(name) { &[1] } else { &[2] }))
                .collect(),
        );

        let found = find_blocking_set(&q, &msgs, FnPredicate::new(votes(1))).map(|(set, _)| set);
        let expected = expected.map(|names| names.into_iter().map(id).collect::<NodeSet>());
        assert_eq!(found, expected);
    }

    #[test]
    fn test_find_blocking_set_shared_member() {
        let q = slices(&[&["b", "c"], &["b", "d"]]);
        let msgs = messages(vec![nom("b", &[&["a"]], &[1])]);
        let (set, _) = find_blocking_set(&q, &msgs, FnPredicate::new(votes(1))).unwrap();
        assert_eq!(set, NodeSet::from([id("b")]));
    }

    #[test]
    fn test_find_quorum_two_nodes() {
        let q = slices(&[&["b"]]);
        let msgs = messages(vec![nom("b", &[&["a"]], &[1])]);

        let (quorum, _) = find_quorum(&id("a"), &q, &msgs, FnPredicate::new(votes(1))).unwrap();
        assert_eq!(quorum, NodeSet::from([id("a"), id("b")]));

        let silent = messages(vec![nom("b", &[&["a"]], &[2])]);
        assert!(find_quorum(&id("a"), &q, &silent, FnPredicate::new(votes(1))).is_none());
        assert!(find_quorum(&id("a"), &q, &PeerMessages::new(), FnPredicate::new(votes(1)))
            .is_none());
    }

    #[test]
    fn test_find_quorum_is_transitive() {
        // a trusts b, b trusts c, c trusts b.
        let q = slices(&[&["b"]]);
        let msgs = messages(vec![nom("b", &[&["c"]], &[1]), nom("c", &[&["b"]], &[1])]);
        let (quorum, _) = find_quorum(&id("a"), &q, &msgs, FnPredicate::new(votes(1))).unwrap();
        assert_eq!(quorum, NodeSet::from([id("a"), id("b"), id("c")]));

        // c disagrees, so b's only slice fails and so does a's.
        let msgs = messages(vec![nom("b", &[&["c"]], &[1]), nom("c", &[&["b"]], &[2])]);
        assert!(find_quorum(&id("a"), &q, &msgs, FnPredicate::new(votes(1))).is_none());
    }

    #[test]
    fn test_find_quorum_backtracks_to_next_slice() {
        // First slice {b} leads to c, who disagrees; second slice {d} closes.
        let q = slices(&[&["b"], &["d"]]);
        let msgs = messages(vec![
            nom("b", &[&["c"]], &[1]),
            nom("c", &[&["b"]], &[2]),
            nom("d", &[&["a"]], &[1]),
        ]);
        let (quorum, _) = find_quorum(&id("a"), &q, &msgs, FnPredicate::new(votes(1))).unwrap();
        assert_eq!(quorum, NodeSet::from([id("a"), id("d")]));
    }

    #[test]
    fn test_find_quorum_narrows_range_along_path() {
        let commit = |sender: &str, peer: &[&str], cn: u32, hn: u32| {
            let topic = Topic::Commit(CommitTopic { b: Ballot::new(hn, Val(1)), pn: hn, hn, cn });
            Msg::new(id(sender), 1, slices(&[peer]), topic)
        };
        let q = slices(&[&["b", "c"]]);
        let msgs = messages(vec![commit("b", &["a"], 2, 9), commit("c", &["a"], 4, 12)]);

        let pred = RangePredicate::new(1, 10, |m: &Msg<Val>, min: u32, max: u32| {
            m.topic.accepts_commit(&Val(1), min, max)
        });
        let (quorum, pred) = find_quorum(&id("a"), &q, &msgs, pred).unwrap();
        assert_eq!(quorum.len(), 3);
        assert_eq!(pred.bounds(), (4, 9));
    }

    #[test]
    fn test_find_blocking_set_or_quorum_uses_strengths() {
        let q = slices(&[&["b"]]);
        // b only votes: no blocking set accepts, but the quorum votes.
        let msgs = messages(vec![nom("b", &[&["a"]], &[1])]);
        let statement = |acceptance: Acceptance| {
            FnPredicate::new(move |m: &Msg<Val>| m.topic.nominated(acceptance, &Val(1)))
        };
        assert!(find_blocking_set(&q, &msgs, statement(Acceptance::Accepts)).is_none());
        let (set, _) = find_blocking_set_or_quorum(&id("a"), &q, &msgs, statement).unwrap();
        assert_eq!(set, NodeSet::from([id("a"), id("b")]));
    }

    #[rstest]
    #[case::valid(&[&["b", "c"][..], &["d"][..]], Ok(2))]
    #[case::no_slices(&[], Err(ConfigError::NoSlices))]
    #[case::empty_slice(&[&["b"][..], &[][..]], Err(ConfigError::EmptySlice { index: 1 }))]
    #[case::self_inclusion(&[&["a", "b"][..]], Err(ConfigError::SelfInSlice { index: 0 }))]
    fn test_quorum_slices_validation(
        #[case] spec: &[&[&str]],
        #[case] expected: Result<usize, ConfigError>,
    ) {
        let built =
            QuorumSlices::new(&id("a"), spec.iter().map(|slice| slice.iter().map(|name| id(name))));
        assert_eq!(built.map(|q| q.len()), expected);
    }

    #[test]
    fn test_quorum_slices_weight_and_members() {
        let q = slices(&[&["b", "c"], &["b", "d"], &["e"]]);
        assert_eq!(q.weight(&id("b")), Weight { count: 2, total: 3 });
        assert_eq!(q.weight(&id("z")), Weight { count: 0, total: 3 });
        assert_eq!(q.members().len(), 4);
    }
}
