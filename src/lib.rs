#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/refcell/fbas/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod ballot;
pub use ballot::{Ballot, BallotSet, OrderedSet, ValueSet, INFINITY};

mod conductor;
pub use conductor::{Conductor, ConductorConfig};

mod message;
pub use message::{Acceptance, CommitTopic, ExtTopic, Msg, NomTopic, PrepTopic, Topic};

mod node;
pub use node::{Node, NodeConfig, RankedPeer, SlotStatus};

mod predicate;
pub use predicate::{FnPredicate, Predicate, RangePredicate, ValueSetPredicate};

mod providers;
pub use providers::{ArmedTimer, ManualClock, ManualScheduler, NoopScheduler, SystemClock};

mod quorum;
pub use quorum::{
    find_blocking_set, find_blocking_set_or_quorum, find_quorum, NodeSet, PeerMessages,
    QuorumSlices,
};

mod simulation;
pub use simulation::Simulation;

mod slot;

mod timers;
pub use timers::{TimerFired, TimerManager};

mod traits;
pub use traits::{Clock, Scheduler, Value};

mod types;
pub use types::{ConfigError, NodeError, NodeId, Phase, SlotId, TimerToken, Weight};
