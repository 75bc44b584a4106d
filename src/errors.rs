// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::state::Status;

use std::io;
use thiserror::Error;

/// The type returned by the DKG lifecycle and execution methods.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal error.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("invalid transition attempt from {0} to {1}")]
    InvalidStateChange(Status, Status),
    #[error("timeout has been reached")]
    TimeoutReached,
    #[error("the beacon id of the proposal does not match this node's")]
    InvalidBeaconId,
    #[error("the scheme proposed does not exist")]
    InvalidScheme,
    #[error("the epoch proposed is invalid for the current state")]
    InvalidEpoch,
    #[error("the threshold is higher than the count of participants it could be composed of")]
    ThresholdHigherThanNodeCount,
    #[error("the threshold is below the majority required for the count of participants")]
    ThresholdTooLow,
    #[error("the transition time must not be before the genesis time")]
    TransitionTimeBeforeGenesis,
    #[error("the first epoch must take a proposal consisting of only joiners")]
    OnlyJoinersAllowedForFirstEpoch,
    #[error("the leader must be in the joining list for the first epoch")]
    LeaderNotJoining,
    #[error("the leader must be in the remaining list after the first epoch")]
    LeaderNotRemaining,
    #[error("the leader cannot be a joiner after the first epoch")]
    LeaderCantJoinAfterFirstEpoch,
    #[error("the genesis seed must be empty for the first epoch")]
    NoGenesisSeedForFirstEpoch,
    #[error("the genesis time must not change between epochs")]
    GenesisTimeNotConsistent,
    #[error("the genesis seed must not change after the first epoch")]
    GenesisSeedNotConsistent,
    #[error("some previous participants are missing from the remaining and leaving lists")]
    MissingNodesInProposal,
    #[error("the remaining and leaving lists may only contain previous participants")]
    UnknownNodesInProposal,
    #[error("this node was not included in the proposal")]
    SelfMissingFromProposal,
    #[error("cannot propose a DKG this node is not leading")]
    CannotProposeAsNonLeader,
    #[error("only the leader of the DKG may abort it")]
    OnlyLeaderCanAbort,
    #[error("only the leader of the DKG may kick off the execution")]
    OnlyLeaderCanExecute,
    #[error("cannot join a DKG this node is not in the joining list of")]
    CannotJoinIfNotInJoining,
    #[error("joining after the first epoch requires a group file for the previous epoch")]
    JoiningAfterFirstEpochNeedsGroupFile,
    #[error("a node in the leaving list cannot accept the proposal")]
    CannotAcceptProposalWhereLeaving,
    #[error("a node in the joining list joins rather than accepts the proposal")]
    CannotAcceptProposalWhereJoining,
    #[error("a node in the leaving list cannot reject the proposal")]
    CannotRejectProposalWhereLeaving,
    #[error("a node in the joining list joins rather than rejects the proposal")]
    CannotRejectProposalWhereJoining,
    #[error("the acceptor is not in the remaining list of the proposal")]
    UnknownAcceptor,
    #[error("this node already received an acceptance from that acceptor")]
    DuplicateAcceptance,
    #[error("the rejector is not in the remaining list of the proposal")]
    UnknownRejector,
    #[error("this node already received a rejection from that rejector")]
    DuplicateRejection,
    #[error("cannot execute a DKG this node is neither a joiner nor a remainer of")]
    CannotExecuteIfNotJoinerOrRemainer,
    #[error("the final group cannot be empty")]
    FinalGroupCannotBeEmpty,
    #[error("the key share cannot be empty")]
    KeyShareCannotBeEmpty,
    #[error("the DKG timed out before the protocol completed")]
    DkgTimedOut,
    #[error("this node was evicted from the qualified set")]
    Evicted,
    #[error("no DKG in execution phase")]
    NoDkgInProgress,
    #[error("the broadcaster requires at least one participant")]
    NoParticipantsForBroadcast,
    #[error("no keypair found for beacon {0}")]
    MissingKeypair(String),
    #[error("there is no previous group to reshare from")]
    PreviousGroupMissing,
    #[error("invalid group descriptor: {0}")]
    InvalidGroup(String),
    #[error("the identity self-signature is invalid")]
    InvalidIdentitySignature,
    #[error("invalid signature on packet from node {0}")]
    InvalidPacketSignature(u32),
    #[error("packet carries an unknown node index {0}")]
    UnknownPacketSender(u32),
    #[error("packet nonce does not match this DKG session")]
    InvalidPacketNonce,
    #[error("dealer {0} sent an invalid public polynomial")]
    InvalidPublicPolynomial(u32),
    #[error("dealer {0} did not commit to its previous share")]
    ReshareCommitmentMismatch(u32),
    #[error("not enough valid deals: got {0}, wanted at least {1}")]
    NotEnoughValidDeals(usize, usize),
    #[error("not enough qualified participants: got {0}, wanted at least {1}")]
    NotEnoughQualified(usize, usize),
    #[error("missing the share dealt by qualified dealer {0}")]
    MissingDealtShare(u32),
    #[error("failed to recover a scalar from the provided evaluations")]
    InvalidRecovery,
    #[error("failed to send a message to {0}")]
    FailedSend(String),
    #[error("the state for this beacon was nuked; restart the daemon to use it again")]
    BeaconNuked,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Bincode error.
    #[error("bincode error:: {0}")]
    Bincode(#[from] bincode::Error),
    /// Sled error.
    #[error("sled error:: {0}")]
    Sled(#[from] sled::Error),
}

impl Error {
    /// Connection-establishment failures are tolerated by the
    /// connection-error-ignoring send variant; semantic errors are not.
    pub(crate) fn is_connection_error(&self) -> bool {
        matches!(self, Error::FailedSend(_))
    }
}
