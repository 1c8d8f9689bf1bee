//! Protocol messages and the federated-voting statements they support.
//!
//! Every message carries its sender's quorum slices, so recipients learn
//! the trust graph incrementally from the traffic they see.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    ballot::{Ballot, INFINITY, ValueSet},
    quorum::QuorumSlices,
    traits::Value,
    types::{NodeId, Phase, SlotId},
};

/// Strength of a federated-voting statement being tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Acceptance {
    /// The peer must have accepted the statement.
    Accepts,
    /// The peer must have voted for or accepted the statement.
    VotesOrAccepts,
}

/// Nomination state: voted (`x`) and accepted (`y`) nominated values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NomTopic<V: Ord> {
    /// Voted-nominated values.
    pub x: ValueSet<V>,
    /// Accepted-nominated values.
    pub y: ValueSet<V>,
}

/// Prepare-phase ballot state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepTopic<V> {
    /// Current ballot.
    pub b: Ballot<V>,
    /// Highest accepted-prepared ballot.
    pub p: Option<Ballot<V>>,
    /// Highest accepted-prepared ballot with a value differing from `p`.
    pub pp: Option<Ballot<V>>,
    /// Counter of the highest confirmed-prepared ballot, 0 if none.
    pub hn: u32,
    /// Counter of the lowest ballot being voted to commit, 0 if none.
    pub cn: u32,
}

/// Commit-phase ballot state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitTopic<V> {
    /// Current ballot.
    pub b: Ballot<V>,
    /// Counter of the highest accepted-prepared ballot.
    pub pn: u32,
    /// Upper end of the accepted commit range.
    pub hn: u32,
    /// Lower end of the accepted commit range.
    pub cn: u32,
}

/// Decided ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtTopic<V> {
    /// The committed ballot.
    pub c: Ballot<V>,
    /// Upper end of the confirmed commit range. Always finite: a range left
    /// open by externalized peers is closed at the local `H` counter.
    pub hn: u32,
}

/// Phase-specific message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic<V: Ord> {
    /// Nomination.
    Nominate(NomTopic<V>),
    /// Prepare.
    Prepare(PrepTopic<V>),
    /// Commit.
    Commit(CommitTopic<V>),
    /// Externalize.
    Externalize(ExtTopic<V>),
}

/// A protocol message about one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg<V: Ord> {
    /// Sending node.
    pub sender: NodeId,
    /// Slot the message is about.
    pub slot: SlotId,
    /// The sender's quorum slices.
    pub slices: QuorumSlices,
    /// Phase-specific body.
    pub topic: Topic<V>,
}

impl<V: Value> Msg<V> {
    /// Creates a new message.
    pub const fn new(sender: NodeId, slot: SlotId, slices: QuorumSlices, topic: Topic<V>) -> Self {
        Self { sender, slot, slices, topic }
    }

    /// Returns the phase the message belongs to.
    pub const fn phase(&self) -> Phase {
        self.topic.phase()
    }

    /// Returns the ballot counter the message carries.
    pub const fn counter(&self) -> u32 {
        self.topic.counter()
    }

    /// Returns true if `other` supersedes this message from the same sender.
    pub fn is_older_than(&self, other: &Self) -> bool {
        self.topic.is_older_than(&other.topic)
    }
}

impl<V: Value> fmt::Display for Msg<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(V={} I={}: {})", self.sender, self.slot, self.topic)
    }
}

impl<V: Value> Topic<V> {
    /// Returns the phase of this topic.
    pub const fn phase(&self) -> Phase {
        match self {
            Self::Nominate(_) => Phase::Nominate,
            Self::Prepare(_) => Phase::Prepare,
            Self::Commit(_) => Phase::Commit,
            Self::Externalize(_) => Phase::Externalize,
        }
    }

    /// Ballot counter carried by this topic; 0 while nominating.
    pub const fn counter(&self) -> u32 {
        match self {
            Self::Nominate(_) => 0,
            Self::Prepare(t) => t.b.counter,
            Self::Commit(t) => t.b.counter,
            Self::Externalize(t) => t.c.counter,
        }
    }

    /// Returns true if `other` is strictly newer than `self`.
    ///
    /// Topics in later phases are newer. Within nomination, newer means
    /// the value sets only grew (or moved from `x` to `y`). Ballot topics
    /// compare lexicographically on their fields. An externalize topic is
    /// never superseded.
    pub fn is_older_than(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nominate(a), Self::Nominate(b)) => {
                a.x.union(&a.y).is_subset(&b.x.union(&b.y)) && a.y.is_subset(&b.y) && a != b
            }
            (Self::Prepare(a), Self::Prepare(b)) => {
                (&a.b, &a.p, &a.pp, a.hn, a.cn) < (&b.b, &b.p, &b.pp, b.hn, b.cn)
            }
            (Self::Commit(a), Self::Commit(b)) => {
                (&a.b, a.pn, a.hn, a.cn) < (&b.b, b.pn, b.hn, b.cn)
            }
            (Self::Externalize(_), Self::Externalize(_)) => false,
            _ => self.phase() < other.phase(),
        }
    }

    /// Tests "nominate(v)" at the given strength.
    pub fn nominated(&self, acceptance: Acceptance, v: &V) -> bool {
        match acceptance {
            Acceptance::Accepts => self.accepts_nominated(v),
            Acceptance::VotesOrAccepts => self.votes_or_accepts_nominated(v),
        }
    }

    /// True if the sender accepted `v` as nominated.
    ///
    /// A ballot in a later phase counts as acceptance of its value.
    pub fn accepts_nominated(&self, v: &V) -> bool {
        match self {
            Self::Nominate(t) => t.y.contains(v),
            _ => self.ballot_carries(v),
        }
    }

    /// True if the sender voted for or accepted `v` as nominated.
    pub fn votes_or_accepts_nominated(&self, v: &V) -> bool {
        match self {
            Self::Nominate(t) => t.x.contains(v) || t.y.contains(v),
            _ => self.ballot_carries(v),
        }
    }

    fn ballot_carries(&self, v: &V) -> bool {
        match self {
            Self::Nominate(_) => false,
            Self::Prepare(t) => {
                &t.b.value == v
                    || t.p.as_ref().is_some_and(|p| &p.value == v)
                    || t.pp.as_ref().is_some_and(|pp| &pp.value == v)
            }
            Self::Commit(t) => &t.b.value == v,
            Self::Externalize(t) => &t.c.value == v,
        }
    }

    /// Tests "prepared(b)" at the given strength.
    pub fn prepared(&self, acceptance: Acceptance, b: &Ballot<V>) -> bool {
        match acceptance {
            Acceptance::Accepts => self.accepts_prepared(b),
            Acceptance::VotesOrAccepts => self.votes_or_accepts_prepared(b),
        }
    }

    /// True if the sender accepted `b` as prepared.
    pub fn accepts_prepared(&self, b: &Ballot<V>) -> bool {
        match self {
            Self::Nominate(_) => false,
            Self::Prepare(t) => {
                t.p.as_ref() == Some(b)
                    || t.pp.as_ref() == Some(b)
                    || (t.cn != 0 && t.b.value == b.value && t.cn <= b.counter && b.counter <= t.hn)
            }
            Self::Commit(t) => {
                t.b.value == b.value && (t.pn == b.counter || (t.cn != 0 && t.cn <= b.counter))
            }
            Self::Externalize(t) => t.c.value == b.value && t.c.counter <= b.counter,
        }
    }

    /// True if the sender voted for or accepted `b` as prepared.
    pub fn votes_or_accepts_prepared(&self, b: &Ballot<V>) -> bool {
        match self {
            Self::Prepare(t) if &t.b == b => true,
            Self::Commit(t) if &t.b == b => true,
            _ => self.accepts_prepared(b),
        }
    }

    /// Tests "commit(v)" over `[min, max]` at the given strength.
    pub fn commit(&self, acceptance: Acceptance, v: &V, min: u32, max: u32) -> Option<(u32, u32)> {
        match acceptance {
            Acceptance::Accepts => self.accepts_commit(v, min, max),
            Acceptance::VotesOrAccepts => self.votes_or_accepts_commit(v, min, max),
        }
    }

    /// Narrows `[min, max]` to the counters over which the sender accepted
    /// committing `v`. `None` if the value differs or the ranges are
    /// disjoint.
    pub fn accepts_commit(&self, v: &V, min: u32, max: u32) -> Option<(u32, u32)> {
        match self {
            Self::Nominate(_) | Self::Prepare(_) => None,
            Self::Commit(t) => {
                if &t.b.value != v {
                    return None;
                }
                intersect(min, max, t.cn, t.hn)
            }
            Self::Externalize(t) => {
                if &t.c.value != v {
                    return None;
                }
                intersect(min, max, t.c.counter, INFINITY)
            }
        }
    }

    /// Narrows `[min, max]` to the counters over which the sender voted for
    /// or accepted committing `v`.
    pub fn votes_or_accepts_commit(&self, v: &V, min: u32, max: u32) -> Option<(u32, u32)> {
        match self {
            Self::Nominate(_) => None,
            Self::Prepare(t) => {
                if &t.b.value != v || t.cn == 0 {
                    return None;
                }
                intersect(min, max, t.cn, t.hn)
            }
            Self::Commit(t) => {
                if &t.b.value != v {
                    return None;
                }
                self.accepts_commit(v, min, max).or_else(|| intersect(min, max, t.cn, INFINITY))
            }
            Self::Externalize(_) => self.accepts_commit(v, min, max),
        }
    }
}

/// Intersection of two inclusive ranges; `None` when empty.
const fn intersect(min: u32, max: u32, lo: u32, hi: u32) -> Option<(u32, u32)> {
    let lo = if lo > min { lo } else { min };
    let hi = if hi < max { hi } else { max };
    if lo > hi {
        None
    } else {
        Some((lo, hi))
    }
}

impl<V: Value> fmt::Display for Topic<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nominate(t) => write!(f, "NOM X={} Y={}", t.x, t.y),
            Self::Prepare(t) => {
                write!(f, "PREP B={}", t.b)?;
                if let Some(p) = &t.p {
                    write!(f, " P={p}")?;
                }
                if let Some(pp) = &t.pp {
                    write!(f, " PP={pp}")?;
                }
                write!(f, " HN={} CN={}", t.hn, t.cn)
            }
            Self::Commit(t) => write!(f, "COMMIT B={} PN={} HN={} CN={}", t.b, t.pn, t.hn, t.cn),
            Self::Externalize(t) => write!(f, "EXT C={} HN={}", t.c, t.hn),
        }
    }
}
