// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The per-beacon DKG lifecycle: a pure transition function over the persisted
//! state, driven by operator commands and packets from other nodes. No I/O
//! happens here; transitions consume the current state and return the next
//! one, or an error and the state untouched.

mod proposal;

pub use proposal::{FirstProposalOptions, ProposalOptions, ProposalTerms};

use crate::errors::{Error, Result};
use crate::group::{DistKeyShare, Group};
use crate::identity::{self, Identity};
use crate::minimum_threshold;
use crate::scheme::Scheme;

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Where a beacon's DKG currently stands.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
pub enum Status {
    /// Nothing has happened yet for this beacon.
    Fresh,
    /// This node is leading a proposal and collecting responses.
    Proposing,
    /// This node received a proposal it has not answered yet.
    Proposed,
    /// This node accepted the proposal and awaits the kick-off.
    Accepted,
    /// This node rejected the proposal.
    Rejected,
    /// The leader or a failure aborted the proposal.
    Aborted,
    /// The verifiable-secret-sharing protocol is running.
    Executing,
    /// The protocol finished; a final group and key share are stored.
    Complete,
    /// The timeout passed before the DKG completed.
    TimedOut,
    /// This node joined the proposal as a new committee member.
    Joined,
    /// This node left the committee without participating further.
    Left,
    /// The protocol finished without this node in the qualified set.
    Evicted,
}

// The transition table. Everything not listed is an invalid state change.
fn valid_status_change(from: Status, to: Status) -> bool {
    use Status::*;
    match from {
        Fresh => matches!(to, Proposing | Proposed | Joined),
        Proposing => matches!(to, Executing | Aborted | TimedOut),
        Proposed => matches!(to, Accepted | Rejected | Aborted | TimedOut | Left | Joined),
        Accepted => matches!(to, Executing | Aborted | TimedOut),
        Rejected => matches!(to, Aborted | TimedOut),
        Joined => matches!(to, Executing | Left | Aborted | TimedOut),
        Left => matches!(to, Joined | Aborted | Proposed),
        Executing => matches!(to, Complete | TimedOut | Evicted),
        Evicted => matches!(to, Joined | Proposed),
        Complete | Aborted | TimedOut => matches!(to, Proposing | Proposed),
    }
}

/// The persisted DKG state of one beacon.
///
/// Exclusively owned by the store; transitions consume a snapshot and return
/// a new one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DkgState {
    beacon_id: String,
    epoch: u32,
    status: Status,
    threshold: u32,
    timeout: SystemTime,
    scheme: Scheme,
    genesis_time: SystemTime,
    genesis_seed: Vec<u8>,
    transition_time: SystemTime,
    catchup_period: Duration,
    beacon_period: Duration,
    leader: Option<Identity>,
    joining: Vec<Identity>,
    remaining: Vec<Identity>,
    leaving: Vec<Identity>,
    acceptors: Vec<Identity>,
    rejectors: Vec<Identity>,
    final_group: Option<Group>,
    key_share: Option<DistKeyShare>,
}

impl DkgState {
    /// The state of a beacon nothing has happened for: status `Fresh` and a
    /// zero timeout.
    pub fn fresh(beacon_id: &str) -> Self {
        Self {
            beacon_id: beacon_id.to_string(),
            epoch: 0,
            status: Status::Fresh,
            threshold: 0,
            timeout: UNIX_EPOCH,
            scheme: Scheme::default(),
            genesis_time: UNIX_EPOCH,
            genesis_seed: vec![],
            transition_time: UNIX_EPOCH,
            catchup_period: Duration::ZERO,
            beacon_period: Duration::ZERO,
            leader: None,
            joining: vec![],
            remaining: vec![],
            leaving: vec![],
            acceptors: vec![],
            rejectors: vec![],
            final_group: None,
            key_share: None,
        }
    }

    /// The leader's own transition when it proposes new terms.
    pub fn proposing(self, me: &Identity, terms: &ProposalTerms) -> Result<Self> {
        self.ensure_can_change_to(Status::Proposing)?;
        if terms.leader != *me {
            return Err(Error::CannotProposeAsNonLeader);
        }
        let scheme = self.validate_proposal(terms)?;
        Ok(self.apply_terms(Status::Proposing, scheme, terms))
    }

    /// A node's transition when terms arrive from a leader.
    pub fn proposed(self, sender: &Identity, me: &Identity, terms: &ProposalTerms) -> Result<Self> {
        self.ensure_can_change_to(Status::Proposed)?;
        if terms.leader != *sender {
            return Err(Error::CannotProposeAsNonLeader);
        }
        let scheme = self.validate_proposal(terms)?;
        if !terms.participants().any(|participant| participant == me) {
            return Err(Error::SelfMissingFromProposal);
        }
        Ok(self.apply_terms(Status::Proposed, scheme, terms))
    }

    /// A joiner signs up for the proposal. After the first epoch a group
    /// file for the previous epoch is required, since a joiner has no
    /// completed state of its own to reshare from.
    pub fn joined(mut self, me: &Identity, prev_group: Option<&Group>) -> Result<Self> {
        self.ensure_can_change_to(Status::Joined)?;
        self.ensure_not_timed_out()?;
        if !identity::contains(&self.joining, me) {
            return Err(Error::CannotJoinIfNotInJoining);
        }
        if self.epoch > 1 && prev_group.is_none() {
            return Err(Error::JoiningAfterFirstEpochNeedsGroupFile);
        }
        self.status = Status::Joined;
        Ok(self)
    }

    /// A remainer accepts the proposal.
    pub fn accepted(mut self, me: &Identity) -> Result<Self> {
        self.ensure_can_change_to(Status::Accepted)?;
        self.ensure_not_timed_out()?;
        if identity::contains(&self.leaving, me) {
            return Err(Error::CannotAcceptProposalWhereLeaving);
        }
        if identity::contains(&self.joining, me) {
            return Err(Error::CannotAcceptProposalWhereJoining);
        }
        self.status = Status::Accepted;
        Ok(self)
    }

    /// A remainer rejects the proposal.
    pub fn rejected(mut self, me: &Identity) -> Result<Self> {
        self.ensure_can_change_to(Status::Rejected)?;
        self.ensure_not_timed_out()?;
        if identity::contains(&self.leaving, me) {
            return Err(Error::CannotRejectProposalWhereLeaving);
        }
        if identity::contains(&self.joining, me) {
            return Err(Error::CannotRejectProposalWhereJoining);
        }
        self.status = Status::Rejected;
        Ok(self)
    }

    /// The proposal is abandoned; the same epoch may be retried.
    pub fn aborted(mut self) -> Result<Self> {
        self.ensure_can_change_to(Status::Aborted)?;
        self.status = Status::Aborted;
        Ok(self)
    }

    /// The timeout passed before the DKG completed.
    pub fn timed_out(mut self) -> Result<Self> {
        self.ensure_can_change_to(Status::TimedOut)?;
        self.status = Status::TimedOut;
        Ok(self)
    }

    /// The kick-off signal arrived. Leavers drop out silently to `Left`;
    /// everybody else must be a joiner or remainer and moves to `Executing`.
    pub fn start_executing(mut self, me: &Identity) -> Result<Self> {
        self.ensure_not_timed_out()?;
        if identity::contains(&self.leaving, me) {
            self.ensure_can_change_to(Status::Left)?;
            self.status = Status::Left;
            return Ok(self);
        }
        if !identity::contains(&self.remaining, me) && !identity::contains(&self.joining, me) {
            return Err(Error::CannotExecuteIfNotJoinerOrRemainer);
        }
        self.ensure_can_change_to(Status::Executing)?;
        self.status = Status::Executing;
        Ok(self)
    }

    /// The protocol finished successfully. Freezes the genesis seed to the
    /// group hash when this was the first epoch.
    pub fn complete(mut self, final_group: Group, share: DistKeyShare) -> Result<Self> {
        self.ensure_can_change_to(Status::Complete)?;
        let mut final_group = final_group;
        let seed = final_group.genesis_seed();
        if self.genesis_seed.is_empty() {
            self.genesis_seed = seed;
        }
        self.status = Status::Complete;
        self.final_group = Some(final_group);
        self.key_share = Some(share);
        Ok(self)
    }

    /// Reflects an elapsed timeout lazily: a stalled attempt becomes
    /// `TimedOut` the next time anybody looks, which is what lets the same
    /// epoch be proposed again.
    pub fn timed_out_if_expired(mut self) -> Self {
        if self.status != Status::Fresh
            && valid_status_change(self.status, Status::TimedOut)
            && SystemTime::now() >= self.timeout
        {
            debug!(
                "DKG for beacon {} timed out while {}",
                self.beacon_id, self.status
            );
            self.status = Status::TimedOut;
        }
        self
    }

    /// The protocol finished without this node in the qualified set.
    pub fn evicted(mut self) -> Result<Self> {
        self.ensure_can_change_to(Status::Evicted)?;
        self.status = Status::Evicted;
        Ok(self)
    }

    /// The leader collects an acceptance. A node that rejected earlier moves
    /// buckets; a repeated acceptance is an error.
    pub fn received_acceptance(mut self, them: &Identity) -> Result<Self> {
        if self.status != Status::Proposing {
            return Err(Error::InvalidStateChange(self.status, Status::Proposing));
        }
        self.ensure_not_timed_out()?;
        if !identity::contains(&self.remaining, them) {
            return Err(Error::UnknownAcceptor);
        }
        if identity::contains(&self.acceptors, them) {
            return Err(Error::DuplicateAcceptance);
        }
        self.acceptors.push(them.clone());
        self.rejectors = identity::without(&self.rejectors, them);
        Ok(self)
    }

    /// The leader collects a rejection; the mirror of `received_acceptance`.
    pub fn received_rejection(mut self, them: &Identity) -> Result<Self> {
        if self.status != Status::Proposing {
            return Err(Error::InvalidStateChange(self.status, Status::Proposing));
        }
        self.ensure_not_timed_out()?;
        if !identity::contains(&self.remaining, them) {
            return Err(Error::UnknownRejector);
        }
        if identity::contains(&self.rejectors, them) {
            return Err(Error::DuplicateRejection);
        }
        self.rejectors.push(them.clone());
        self.acceptors = identity::without(&self.acceptors, them);
        Ok(self)
    }

    // Enforces everything a proposal must satisfy against the current state.
    // Returns the parsed scheme so the caller does not resolve it twice.
    fn validate_proposal(&self, terms: &ProposalTerms) -> Result<Scheme> {
        if terms.beacon_id != self.beacon_id {
            return Err(Error::InvalidBeaconId);
        }
        let scheme = Scheme::from_id(&terms.scheme_id)?;
        if SystemTime::now() >= terms.timeout {
            return Err(Error::TimeoutReached);
        }

        let node_count = terms.joining.len() + terms.remaining.len();
        if terms.threshold as usize > node_count {
            return Err(Error::ThresholdHigherThanNodeCount);
        }
        if (terms.threshold as usize) < minimum_threshold(node_count) {
            return Err(Error::ThresholdTooLow);
        }

        self.validate_epoch(terms.epoch)?;

        if terms.epoch == 1 {
            if !terms.remaining.is_empty() || !terms.leaving.is_empty() {
                return Err(Error::OnlyJoinersAllowedForFirstEpoch);
            }
            if !identity::contains(&terms.joining, &terms.leader) {
                return Err(Error::LeaderNotJoining);
            }
            if !terms.genesis_seed.is_empty() {
                return Err(Error::NoGenesisSeedForFirstEpoch);
            }
            if terms.transition_time != terms.genesis_time {
                return Err(Error::TransitionTimeBeforeGenesis);
            }
            return Ok(scheme);
        }

        if identity::contains(&terms.joining, &terms.leader) {
            return Err(Error::LeaderCantJoinAfterFirstEpoch);
        }
        if !identity::contains(&terms.remaining, &terms.leader) {
            return Err(Error::LeaderNotRemaining);
        }
        if terms.transition_time < terms.genesis_time {
            return Err(Error::TransitionTimeBeforeGenesis);
        }
        if self.genesis_time != UNIX_EPOCH && terms.genesis_time != self.genesis_time {
            return Err(Error::GenesisTimeNotConsistent);
        }
        if !self.genesis_seed.is_empty() && terms.genesis_seed != self.genesis_seed {
            return Err(Error::GenesisSeedNotConsistent);
        }

        // Membership continuity is only checkable against a completed
        // previous epoch; a node joining mid-history has nothing to compare
        // with.
        if let Some(previous) = &self.final_group {
            if terms.epoch == self.epoch + 1 {
                let previous: Vec<&Identity> = previous
                    .nodes()
                    .iter()
                    .map(|node| node.identity())
                    .collect();
                let all_previous_kept = previous.iter().all(|participant| {
                    identity::contains(&terms.remaining, participant)
                        || identity::contains(&terms.leaving, participant)
                });
                if !all_previous_kept {
                    return Err(Error::MissingNodesInProposal);
                }
                let no_strangers = terms
                    .remaining
                    .iter()
                    .chain(terms.leaving.iter())
                    .all(|participant| previous.iter().any(|node| *node == participant));
                if !no_strangers {
                    return Err(Error::UnknownNodesInProposal);
                }
            }
        }

        Ok(scheme)
    }

    // Epoch rules: one step forward, except that an aborted or timed-out
    // attempt may be retried at the same epoch, and a node with no stake in
    // the history may skip forward.
    fn validate_epoch(&self, epoch: u32) -> Result<()> {
        if epoch < 1 || epoch < self.epoch {
            return Err(Error::InvalidEpoch);
        }
        if epoch == self.epoch && !matches!(self.status, Status::Aborted | Status::TimedOut) {
            return Err(Error::InvalidEpoch);
        }
        if epoch > self.epoch + 1
            && !matches!(self.status, Status::Fresh | Status::Left | Status::Evicted)
        {
            return Err(Error::InvalidEpoch);
        }
        Ok(())
    }

    fn apply_terms(self, status: Status, scheme: Scheme, terms: &ProposalTerms) -> Self {
        Self {
            beacon_id: self.beacon_id,
            epoch: terms.epoch,
            status,
            threshold: terms.threshold,
            timeout: terms.timeout,
            scheme,
            genesis_time: terms.genesis_time,
            genesis_seed: terms.genesis_seed.clone(),
            transition_time: terms.transition_time,
            catchup_period: terms.catchup_period,
            beacon_period: terms.beacon_period,
            leader: Some(terms.leader.clone()),
            joining: terms.joining.clone(),
            remaining: terms.remaining.clone(),
            leaving: terms.leaving.clone(),
            acceptors: vec![],
            rejectors: vec![],
            final_group: None,
            key_share: None,
        }
    }

    fn ensure_can_change_to(&self, to: Status) -> Result<()> {
        if valid_status_change(self.status, to) {
            Ok(())
        } else {
            Err(Error::InvalidStateChange(self.status, to))
        }
    }

    fn ensure_not_timed_out(&self) -> Result<()> {
        if SystemTime::now() >= self.timeout {
            Err(Error::TimeoutReached)
        } else {
            Ok(())
        }
    }

    /// The beacon this state belongs to.
    pub fn beacon_id(&self) -> &str {
        &self.beacon_id
    }

    /// The epoch the state is at; 0 until a first proposal lands.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Where the lifecycle currently stands.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The proposed signing threshold.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// The instant this DKG attempt is abandoned.
    pub fn timeout(&self) -> SystemTime {
        self.timeout
    }

    /// The scheme this beacon runs under.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Wall-clock time of the first beacon round.
    pub fn genesis_time(&self) -> SystemTime {
        self.genesis_time
    }

    /// Hash of the first group; empty until the first epoch completes.
    pub fn genesis_seed(&self) -> &[u8] {
        &self.genesis_seed
    }

    /// When the new epoch's shares begin producing beacons.
    pub fn transition_time(&self) -> SystemTime {
        self.transition_time
    }

    /// Interval between beacon rounds while catching up.
    pub fn catchup_period(&self) -> Duration {
        self.catchup_period
    }

    /// Interval between beacon rounds.
    pub fn beacon_period(&self) -> Duration {
        self.beacon_period
    }

    /// The node leading the current proposal, if any.
    pub fn leader(&self) -> Option<&Identity> {
        self.leader.as_ref()
    }

    /// Nodes entering the committee this epoch.
    pub fn joining(&self) -> &[Identity] {
        &self.joining
    }

    /// Nodes staying on from the previous epoch.
    pub fn remaining(&self) -> &[Identity] {
        &self.remaining
    }

    /// Nodes leaving the committee this epoch.
    pub fn leaving(&self) -> &[Identity] {
        &self.leaving
    }

    /// Remainers that accepted the proposal so far.
    pub fn acceptors(&self) -> &[Identity] {
        &self.acceptors
    }

    /// Remainers that rejected the proposal so far.
    pub fn rejectors(&self) -> &[Identity] {
        &self.rejectors
    }

    /// Every node involved in this epoch.
    pub fn participants(&self) -> Vec<Identity> {
        self.joining
            .iter()
            .chain(self.remaining.iter())
            .chain(self.leaving.iter())
            .cloned()
            .collect()
    }

    /// The final group of a completed state. A `Complete` state without one
    /// is a bug, not a recoverable situation.
    pub fn final_group(&self) -> Result<&Group> {
        self.final_group
            .as_ref()
            .ok_or(Error::FinalGroupCannotBeEmpty)
    }

    /// The key share of a completed state.
    pub fn key_share(&self) -> Result<&DistKeyShare> {
        self.key_share.as_ref().ok_or(Error::KeyShareCannotBeEmpty)
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::identity::Keypair;
    use crate::scheme::DEFAULT_SCHEME_ID;

    pub(crate) fn test_keypairs(count: usize) -> Vec<Keypair> {
        (0..count)
            .map(|index| {
                Keypair::new(
                    format!("127.0.0.1:{}", 8000 + index),
                    Scheme::PedersenBlsChained,
                )
            })
            .collect()
    }

    pub(crate) fn first_epoch_terms(beacon_id: &str, joining: Vec<Identity>) -> ProposalTerms {
        let genesis_time = SystemTime::now() + Duration::from_secs(30);
        ProposalTerms {
            beacon_id: beacon_id.to_string(),
            epoch: 1,
            leader: joining[0].clone(),
            threshold: crate::minimum_threshold(joining.len()) as u32,
            timeout: SystemTime::now() + Duration::from_secs(60),
            catchup_period: Duration::from_secs(5),
            beacon_period: Duration::from_secs(10),
            scheme_id: DEFAULT_SCHEME_ID.to_string(),
            genesis_time,
            genesis_seed: vec![],
            transition_time: genesis_time,
            joining,
            remaining: vec![],
            leaving: vec![],
        }
    }
}
