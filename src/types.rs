//! Core types for the fbas engine.
//!
//! This module contains identifiers, the slot phase, error types, and
//! other small shared types used throughout the crate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Slot identifier type.
///
/// A slot is the unit of agreement: one decided value per slot id,
/// analogous to a log position.
pub type SlotId = u64;

/// Opaque node identifier.
///
/// Ordered so that searches over the quorum graph visit peers in a
/// deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the raw bytes of the id, as fed into priority hashing.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Protocol phase of a slot.
///
/// Phases only ever move forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Phase {
    /// Nominating candidate values.
    #[default]
    Nominate,
    /// Balloting: preparing a ballot.
    Prepare,
    /// Balloting: committing a ballot.
    Commit,
    /// Decided. Terminal.
    Externalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nominate => "NOM",
            Self::Prepare => "PREP",
            Self::Commit => "COMMIT",
            Self::Externalize => "EXT",
        };
        f.write_str(name)
    }
}

/// Generation token identifying one arming of a slot's deferred timer.
///
/// A firing is applied only while its token is still the one armed on the
/// slot, so a timer that was cancelled or replaced can never mutate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken(u64);

impl TimerToken {
    /// Creates a token for the given generation.
    pub const fn new(generation: u64) -> Self {
        Self(generation)
    }

    /// Returns the generation number.
    pub const fn generation(self) -> u64 {
        self.0
    }
}

/// Trust weight a node assigns to a peer.
///
/// The fraction of the node's own quorum slices that contain the peer,
/// kept as an exact ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Weight {
    /// Number of slices containing the peer.
    pub count: usize,
    /// Total number of slices.
    pub total: usize,
}

impl Weight {
    /// The weight a node always assigns to itself.
    pub const FULL: Self = Self { count: 1, total: 1 };

    /// Returns the weight as a float, for display.
    pub fn as_f64(self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count as f64 / self.total as f64
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count, self.total)
    }
}

/// Errors that can occur while handling a protocol message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    /// Priority hashing for a slot needs the value decided in the
    /// previous slot, which this node has not externalized.
    #[error("missing externalized value for previous slot {slot}")]
    MissingPreviousValue {
        /// The slot whose decided value is missing.
        slot: SlotId,
    },
}

/// Errors in a node's quorum configuration.
///
/// These are rejected when the node is constructed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The node declared no quorum slices at all.
    #[error("no quorum slices configured")]
    NoSlices,

    /// A quorum slice has no members.
    #[error("quorum slice {index} is empty")]
    EmptySlice {
        /// Position of the offending slice.
        index: usize,
    },

    /// A quorum slice lists the owning node, which is always implied.
    #[error("quorum slice {index} contains the node itself")]
    SelfInSlice {
        /// Position of the offending slice.
        index: usize,
    },
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_phase_is_monotonic_order() {
        assert!(Phase::Nominate < Phase::Prepare);
        assert!(Phase::Prepare < Phase::Commit);
        assert!(Phase::Commit < Phase::Externalize);
        assert_eq!(Phase::default(), Phase::Nominate);
    }

    #[test]
    fn test_node_id_display_and_order() {
        let a = NodeId::from("alice");
        let b = NodeId::new(String::from("bob"));
        assert!(a < b);
        assert_eq!(a.to_string(), "alice");
        assert_eq!(b.as_bytes(), b"bob");
    }

    #[rstest]
    #[case::full(Weight::FULL, 1.0)]
    #[case::half(Weight { count: 1, total: 2 }, 0.5)]
    #[case::none(Weight { count: 0, total: 3 }, 0.0)]
    #[case::degenerate(Weight { count: 0, total: 0 }, 0.0)]
    fn test_weight_as_f64(#[case] weight: Weight, #[case] expected: f64) {
        assert!((weight.as_f64() - expected).abs() < f64::EPSILON);
    }

    #[rstest]
    #[case::no_slices(ConfigError::NoSlices, "no quorum slices configured")]
    #[case::empty(ConfigError::EmptySlice { index: 2 }, "quorum slice 2 is empty")]
    #[case::self_in(ConfigError::SelfInSlice { index: 0 }, "quorum slice 0 contains the node itself")]
    fn test_config_error_display(#[case] error: ConfigError, #[case] expected: &str) {
        assert_eq!(format!("{error}"), expected);
    }

    #[test]
    fn test_node_error_display() {
        let err = NodeError::MissingPreviousValue { slot: 4 };
        assert_eq!(format!("{err}"), "missing externalized value for previous slot 4");
    }
}
