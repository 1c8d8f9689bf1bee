//! Per-slot protocol state machine.
//!
//! A slot moves through nomination, prepare, commit and externalize. Every
//! inbound message is folded into the slot's view of its peers, the
//! federated-voting searches are re-run, and the slot answers with a
//! single message describing its full current state.

use std::time::Instant;

use tracing::{debug, trace};

use crate::{
    ballot::{Ballot, BallotSet, INFINITY, ValueSet},
    message::{CommitTopic, ExtTopic, Msg, NomTopic, PrepTopic, Topic},
    node::Core,
    predicate::{FnPredicate, RangePredicate},
    quorum::{find_blocking_set, find_blocking_set_or_quorum, find_quorum, PeerMessages},
    traits::Value,
    types::{NodeError, Phase, SlotId, TimerToken},
};

/// State of one slot on one node.
#[derive(Debug)]
pub(crate) struct Slot<V: Value> {
    id: SlotId,
    phase: Phase,
    created: Instant,
    /// Latest message from each peer.
    messages: PeerMessages<V>,
    /// Voted-nominated values.
    x: ValueSet<V>,
    /// Accepted-nominated values.
    y: ValueSet<V>,
    /// Confirmed-nominated values.
    z: ValueSet<V>,
    /// Values this node proposed. Voted for in rounds it leads.
    candidates: ValueSet<V>,
    b: Option<Ballot<V>>,
    p: Option<Ballot<V>>,
    pp: Option<Ballot<V>>,
    c: Option<Ballot<V>>,
    h: Option<Ballot<V>>,
    /// Accepted-prepared ballots not yet confirmed.
    accepted_prepared: BallotSet<V>,
    confirmed_prepared: BallotSet<V>,
    timer: Option<TimerToken>,
    timer_generation: u64,
}

impl<V: Value> Slot<V> {
    pub(crate) fn new(id: SlotId, created: Instant) -> Self {
        Self {
            id,
            phase: Phase::Nominate,
            created,
            messages: PeerMessages::new(),
            x: ValueSet::new(),
            y: ValueSet::new(),
            z: ValueSet::new(),
            candidates: ValueSet::new(),
            b: None,
            p: None,
            pp: None,
            c: None,
            h: None,
            accepted_prepared: BallotSet::new(),
            confirmed_prepared: BallotSet::new(),
            timer: None,
            timer_generation: 0,
        }
    }

    pub(crate) const fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) const fn ballot(&self) -> Option<&Ballot<V>> {
        self.b.as_ref()
    }

    pub(crate) const fn messages(&self) -> &PeerMessages<V> {
        &self.messages
    }

    pub(crate) const fn created(&self) -> Instant {
        self.created
    }

    /// The decided ballot, once externalized.
    pub(crate) fn decision(&self) -> Option<ExtTopic<V>> {
        if self.phase != Phase::Externalize {
            return None;
        }
        let c = self.c.clone()?;
        Some(ExtTopic { c, hn: counter_of(&self.h) })
    }

    /// Processes one inbound message and returns the slot's new state.
    ///
    /// Fails only when the nomination leader cannot be computed, in which
    /// case the slot is left untouched.
    pub(crate) fn handle(
        &mut self,
        core: &Core<V>,
        msg: Msg<V>,
    ) -> Result<Option<Msg<V>>, NodeError> {
        let from_self = msg.sender == core.id;
        if !from_self
            && self.messages.get(&msg.sender).is_some_and(|have| !have.is_older_than(&msg))
        {
            trace!(slot = self.id, sender = %msg.sender, "ignoring stale message");
            return Ok(None);
        }

        let from_leader = match msg.topic {
            Topic::Nominate(_) if self.nominating() => {
                let round = core.round(self.created);
                core.leader(self.id, round)?.as_ref() == Some(&msg.sender)
            }
            _ => false,
        };

        trace!(slot = self.id, phase = %self.phase, %msg, from_leader, "handling");
        let topic = if from_self {
            match msg.topic {
                Topic::Nominate(nom) => {
                    self.candidates.extend(nom.x);
                    Topic::Nominate(NomTopic { x: self.candidates.clone(), y: ValueSet::new() })
                }
                topic => topic,
            }
        } else {
            let topic = msg.topic.clone();
            self.messages.insert(msg.sender.clone(), msg);
            topic
        };

        let entered = self.phase;
        match entered {
            Phase::Nominate => self.on_nominating(core, topic, from_leader),
            Phase::Prepare => self.on_preparing(core, topic, from_leader),
            Phase::Commit => self.on_committing(core),
            Phase::Externalize => {}
        }
        self.settle(core, entered);

        Ok(self.response(core))
    }

    /// Applies the deferred ballot-counter update armed with `token`.
    ///
    /// Returns the refreshed state message, or `None` if the token is no
    /// longer the armed one.
    pub(crate) fn fire_timer(&mut self, core: &Core<V>, token: TimerToken) -> Option<Msg<V>> {
        if self.timer != Some(token) {
            trace!(slot = self.id, token = token.generation(), "ignoring stale timer");
            return None;
        }
        self.timer = None;
        core.scheduler.cancel(self.id, token);
        if self.phase != Phase::Prepare {
            return None;
        }

        if let Some(b) = self.b.as_mut() {
            b.counter = b.counter.saturating_add(1);
        }
        self.set_ballot_value();
        debug!(slot = self.id, ballot = ?self.b, "deferred ballot update");
        self.advance_prepare(core);
        self.settle(core, Phase::Prepare);
        self.response(core)
    }

    /// Re-checks the leader of the current nomination round and votes for
    /// what it nominated, or for this node's own candidates when it leads.
    ///
    /// Returns the new state if that added a vote.
    pub(crate) fn renominate(&mut self, core: &Core<V>) -> Option<Msg<V>> {
        if !self.nominating() {
            return None;
        }
        let leader = core.leader(self.id, core.round(self.created)).ok().flatten()?;
        let proposed: Vec<V> = if leader == core.id {
            self.candidates.iter().cloned().collect()
        } else {
            match self.messages.get(&leader).map(|m| &m.topic) {
                Some(Topic::Nominate(nom)) => nom.x.iter().chain(&nom.y).cloned().collect(),
                _ => return None,
            }
        };

        let mut voted = false;
        for v in proposed {
            voted |= self.vote_nominated(v);
        }
        if !voted {
            return None;
        }
        trace!(slot = self.id, node = %core.id, %leader, "renominating");
        let entered = self.phase;
        self.refresh_nominations(core);
        self.settle(core, entered);
        self.response(core)
    }

    const fn nominating(&self) -> bool {
        match self.phase {
            Phase::Nominate => true,
            Phase::Prepare => self.h.is_none(),
            Phase::Commit | Phase::Externalize => false,
        }
    }

    /// Keeps evaluating while the phase moves, so a single message carries
    /// the slot as far as the stored messages allow.
    fn settle(&mut self, core: &Core<V>, mut from: Phase) {
        while self.phase != from {
            from = self.phase;
            match from {
                Phase::Prepare => self.advance_prepare(core),
                Phase::Commit => self.on_committing(core),
                Phase::Nominate | Phase::Externalize => {}
            }
        }
    }

    fn on_nominating(&mut self, core: &Core<V>, topic: Topic<V>, from_leader: bool) {
        match topic {
            Topic::Nominate(nom) => {
                if from_leader {
                    self.adopt_leader_values(nom);
                }
            }
            Topic::Prepare(t) => {
                self.vote_nominated(t.b.value);
                if let Some(p) = t.p {
                    self.vote_nominated(p.value);
                }
                if let Some(pp) = t.pp {
                    self.vote_nominated(pp.value);
                }
            }
            Topic::Commit(t) => {
                self.vote_nominated(t.b.value);
            }
            Topic::Externalize(t) => {
                self.vote_nominated(t.c.value);
            }
        }
        self.refresh_nominations(core);
    }

    fn on_preparing(&mut self, core: &Core<V>, topic: Topic<V>, from_leader: bool) {
        match topic {
            Topic::Nominate(nom) if self.h.is_none() => {
                if from_leader {
                    self.adopt_leader_values(nom);
                }
                self.refresh_nominations(core);
            }
            _ => self.advance_prepare(core),
        }
    }

    /// Promotes nominations and starts, or re-values, the first ballot
    /// from the confirmed ones.
    fn refresh_nominations(&mut self, core: &Core<V>) {
        self.update_nominations(core);
        let Some(value) = self.z.combine() else { return };
        match self.phase {
            Phase::Nominate => {
                self.phase = Phase::Prepare;
                self.b = Some(Ballot::new(1, value));
                debug!(slot = self.id, node = %core.id, ballot = ?self.b, "entering prepare");
            }
            Phase::Prepare => {
                if let Some(b) = self.b.as_mut() {
                    b.value = value;
                }
            }
            Phase::Commit | Phase::Externalize => {}
        }
    }

    fn advance_prepare(&mut self, core: &Core<V>) {
        let Some(b) = self.b.clone() else { return };
        self.update_accepted_prepared(core, &b);

        let prepared = self.accepted_prepared.union(&self.confirmed_prepared);
        if let Some(top) = prepared.last() {
            self.pp = prepared.iter().rev().skip(1).find(|ballot| ballot.value != top.value).cloned();
            self.p = Some(top.clone());
        }

        let confirmed: Vec<Ballot<V>> = self
            .accepted_prepared
            .iter()
            .filter(|ballot| {
                let accepts = FnPredicate::new(|m: &Msg<V>| m.topic.accepts_prepared(ballot));
                find_quorum(&core.id, &core.slices, &self.messages, accepts).is_some()
            })
            .cloned()
            .collect();
        for ballot in confirmed {
            self.accepted_prepared.remove(&ballot);
            self.confirmed_prepared.add(ballot);
        }
        if let Some(top) = self.confirmed_prepared.last() {
            self.h = Some(top.clone());
        }

        let raised = match (&self.b, &self.h) {
            (Some(b), Some(h)) if b < h => Some(h.clone()),
            _ => None,
        };
        if let Some(h) = raised {
            self.b = Some(h);
            self.cancel_timer(core);
        } else {
            self.update_ballot_counter(core);
        }

        if let Some(c) = &self.c {
            let supersedes =
                |ballot: &Option<Ballot<V>>| ballot.as_ref().is_some_and(|x| c < x && x.value != c.value);
            if supersedes(&self.p) || supersedes(&self.pp) {
                self.c = None;
            }
        }
        if self.c.is_none() {
            if let Some(h) = &self.h {
                let aborts = |ballot: &Option<Ballot<V>>| ballot.as_ref().is_some_and(|x| x.aborts(h));
                if !aborts(&self.p) && !aborts(&self.pp) {
                    self.c = self.b.clone();
                }
            }
        }

        let bounds = match (&self.b, &self.c, &self.h) {
            (Some(b), Some(c), Some(h)) => {
                let value = &b.value;
                find_blocking_set_or_quorum(&core.id, &core.slices, &self.messages, |acceptance| {
                    RangePredicate::new(c.counter, h.counter, move |m: &Msg<V>, min: u32, max: u32| {
                        m.topic.commit(acceptance, value, min, max)
                    })
                })
                .map(|(_, pred)| pred.bounds())
            }
            _ => None,
        };
        if let Some((cn, hn)) = bounds {
            self.enter_commit(core, cn, hn);
        }
    }

    fn enter_commit(&mut self, core: &Core<V>, cn: u32, hn: u32) {
        let Some(value) = self.b.as_ref().map(|b| b.value.clone()) else { return };
        self.c = Some(Ballot::new(cn, value.clone()));
        self.h = Some(Ballot::new(hn, value));
        self.phase = Phase::Commit;
        self.cancel_timer(core);
        debug!(slot = self.id, node = %core.id, cn, hn, "entering commit");
    }

    fn on_committing(&mut self, core: &Core<V>) {
        let Some(b) = self.b.clone() else { return };
        self.update_accepted_prepared(core, &b);
        if let Some(top) = self.accepted_prepared.union(&self.confirmed_prepared).last() {
            self.p = Some(top.clone());
        }

        let Some(cn) = self.c.as_ref().map(|c| c.counter) else { return };
        let value = &b.value;

        let extended = find_blocking_set_or_quorum(&core.id, &core.slices, &self.messages, |acceptance| {
            RangePredicate::new(cn, INFINITY, move |m: &Msg<V>, min: u32, max: u32| {
                m.topic.commit(acceptance, value, min, max)
            })
        });
        if let Some((_, pred)) = extended {
            let (cn, hn) = pred.bounds();
            // Externalized peers leave the range open; keep our own upper end.
            let hn = if hn == INFINITY {
                self.h.as_ref().map_or(cn, |h| h.counter.max(cn))
            } else {
                hn
            };
            self.set_commit_bounds((cn, hn));
        }

        let (Some(c), Some(h)) = (&self.c, &self.h) else { return };
        let accepts = RangePredicate::new(c.counter, h.counter, move |m: &Msg<V>, min: u32, max: u32| {
            m.topic.accepts_commit(value, min, max)
        });
        if let Some((_, pred)) = find_quorum(&core.id, &core.slices, &self.messages, accepts) {
            self.set_commit_bounds(pred.bounds());
            self.phase = Phase::Externalize;
            self.cancel_timer(core);
            debug!(slot = self.id, node = %core.id, ballot = ?self.c, "externalizing");
        }
    }

    fn set_commit_bounds(&mut self, (cn, hn): (u32, u32)) {
        if let Some(c) = self.c.as_mut() {
            c.counter = cn;
        }
        if let Some(h) = self.h.as_mut() {
            h.counter = hn;
        }
    }

    /// Adds `v` to the voted set unless it is already accepted. Returns
    /// true if the vote is new.
    fn vote_nominated(&mut self, v: V) -> bool {
        !self.y.contains(&v) && self.x.add(v)
    }

    fn adopt_leader_values(&mut self, nom: NomTopic<V>) {
        for v in nom.x.into_iter().chain(nom.y) {
            self.vote_nominated(v);
        }
    }

    /// Promotes voted values to accepted, and accepted values to confirmed.
    fn update_nominations(&mut self, core: &Core<V>) {
        let accepted: Vec<V> = self
            .x
            .iter()
            .filter(|v| {
                find_blocking_set_or_quorum(&core.id, &core.slices, &self.messages, |acceptance| {
                    FnPredicate::new(move |m: &Msg<V>| m.topic.nominated(acceptance, v))
                })
                .is_some()
            })
            .cloned()
            .collect();
        for v in accepted {
            self.x.remove(&v);
            self.y.add(v);
        }

        let confirmed: Vec<V> = self
            .y
            .iter()
            .filter(|v| !self.z.contains(v))
            .filter(|v| {
                let accepts = FnPredicate::new(|m: &Msg<V>| m.topic.accepts_nominated(v));
                find_quorum(&core.id, &core.slices, &self.messages, accepts).is_some()
            })
            .cloned()
            .collect();
        self.z.extend(confirmed);
    }

    /// Adds the current ballot to the accepted-prepared set if a blocking
    /// set accepts or a quorum votes for it.
    fn update_accepted_prepared(&mut self, core: &Core<V>, b: &Ballot<V>) {
        if self.accepted_prepared.contains(b) || self.confirmed_prepared.contains(b) {
            return;
        }
        let accepted = find_blocking_set_or_quorum(&core.id, &core.slices, &self.messages, |acceptance| {
            FnPredicate::new(move |m: &Msg<V>| m.topic.prepared(acceptance, b))
        })
        .is_some();
        if accepted {
            self.accepted_prepared.add(b.clone());
        }
    }

    /// Arms the deferred update when a quorum has caught up with the local
    /// counter, and jumps ahead when a blocking set is strictly ahead.
    fn update_ballot_counter(&mut self, core: &Core<V>) {
        let Some(counter) = self.b.as_ref().map(|b| b.counter) else { return };

        if self.timer.is_none() {
            let caught_up = FnPredicate::new(move |m: &Msg<V>| m.counter() >= counter);
            if find_quorum(&core.id, &core.slices, &self.messages, caught_up).is_some() {
                self.arm_timer(core, counter);
            }
        }

        let ahead = FnPredicate::new(move |m: &Msg<V>| m.counter() > counter);
        let Some((blocking, _)) = find_blocking_set(&core.slices, &self.messages, ahead) else {
            return;
        };
        let Some(jump) = blocking.iter().filter_map(|id| self.messages.get(id)).map(Msg::counter).min()
        else {
            return;
        };
        self.cancel_timer(core);
        if let Some(b) = self.b.as_mut() {
            b.counter = jump;
        }
        self.set_ballot_value();
        debug!(slot = self.id, node = %core.id, counter = jump, "ballot counter jumped");
    }

    /// Picks the ballot value: the highest confirmed-prepared value, else
    /// the combined confirmed nominations.
    fn set_ballot_value(&mut self) {
        if self.phase >= Phase::Commit {
            return;
        }
        let value = match self.confirmed_prepared.last() {
            Some(top) => Some(top.value.clone()),
            None => self.z.combine(),
        };
        if let (Some(b), Some(value)) = (self.b.as_mut(), value) {
            b.value = value;
        }
    }

    fn arm_timer(&mut self, core: &Core<V>, counter: u32) {
        self.timer_generation += 1;
        let token = TimerToken::new(self.timer_generation);
        let delay = core
            .config
            .deferred_update_interval
            .checked_mul(counter.saturating_add(1))
            .unwrap_or(std::time::Duration::MAX);
        core.scheduler.schedule(self.id, token, delay);
        self.timer = Some(token);
    }

    pub(crate) fn cancel_timer(&mut self, core: &Core<V>) {
        if let Some(token) = self.timer.take() {
            core.scheduler.cancel(self.id, token);
        }
    }

    /// Full current state as an outbound message.
    fn response(&self, core: &Core<V>) -> Option<Msg<V>> {
        let topic = match self.phase {
            Phase::Nominate => {
                if self.x.is_empty() && self.y.is_empty() {
                    return None;
                }
                Topic::Nominate(NomTopic { x: self.x.clone(), y: self.y.clone() })
            }
            Phase::Prepare => Topic::Prepare(PrepTopic {
                b: self.b.clone()?,
                p: self.p.clone(),
                pp: self.pp.clone(),
                hn: counter_of(&self.h),
                cn: counter_of(&self.c),
            }),
            Phase::Commit => Topic::Commit(CommitTopic {
                b: self.b.clone()?,
                pn: counter_of(&self.p),
                hn: counter_of(&self.h),
                cn: counter_of(&self.c),
            }),
            Phase::Externalize => Topic::Externalize(self.decision()?),
        };
        Some(core.message(self.id, topic))
    }
}

fn counter_of<V>(ballot: &Option<Ballot<V>>) -> u32 {
    ballot.as_ref().map_or(0, |b| b.counter)
}
