// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::identity::Identity;

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// An epoch's candidate membership and parameters, as disseminated by the
/// leader. Every node validates the terms against its own current state
/// before adopting them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalTerms {
    /// The beacon this proposal concerns.
    pub beacon_id: String,
    /// The DKG cycle these terms propose; the first epoch is 1.
    pub epoch: u32,
    /// The node driving the proposal.
    pub leader: Identity,
    /// The signing threshold of the resulting group.
    pub threshold: u32,
    /// The instant the whole DKG is abandoned if not complete.
    pub timeout: SystemTime,
    /// Interval between beacon rounds while catching up.
    pub catchup_period: Duration,
    /// Interval between beacon rounds.
    pub beacon_period: Duration,
    /// Wire identifier of the cryptographic scheme.
    pub scheme_id: String,
    /// Wall-clock time of the first beacon round, fixed at epoch 1.
    pub genesis_time: SystemTime,
    /// Hash of the first group; empty at epoch 1, frozen thereafter.
    pub genesis_seed: Vec<u8>,
    /// When the new epoch's shares begin producing beacons.
    pub transition_time: SystemTime,
    /// Nodes entering the committee this epoch.
    pub joining: Vec<Identity>,
    /// Nodes staying on from the previous epoch.
    pub remaining: Vec<Identity>,
    /// Nodes leaving the committee this epoch.
    pub leaving: Vec<Identity>,
}

impl ProposalTerms {
    /// Every node named by the proposal, in list order.
    pub fn participants(&self) -> impl Iterator<Item = &Identity> {
        self.joining
            .iter()
            .chain(self.remaining.iter())
            .chain(self.leaving.iter())
    }
}

/// Operator input for proposing the first epoch of a beacon.
#[derive(Clone, Debug)]
pub struct FirstProposalOptions {
    /// The instant the DKG is abandoned if not complete.
    pub timeout: SystemTime,
    /// The signing threshold of the resulting group.
    pub threshold: u32,
    /// Interval between beacon rounds.
    pub period: Duration,
    /// Wire identifier of the cryptographic scheme.
    pub scheme_id: String,
    /// Interval between beacon rounds while catching up.
    pub catchup_period: Duration,
    /// Wall-clock time of the first beacon round.
    pub genesis_time: SystemTime,
    /// The founding committee, leader included.
    pub joining: Vec<Identity>,
}

/// Operator input for proposing a reshare; the epoch and the genesis data
/// are carried over from the last completed DKG.
#[derive(Clone, Debug)]
pub struct ProposalOptions {
    /// The instant the DKG is abandoned if not complete.
    pub timeout: SystemTime,
    /// The signing threshold of the resulting group.
    pub threshold: u32,
    /// Interval between beacon rounds while catching up.
    pub catchup_period: Duration,
    /// Nodes entering the committee this epoch.
    pub joining: Vec<Identity>,
    /// Nodes staying on from the previous epoch.
    pub remaining: Vec<Identity>,
    /// Nodes leaving the committee this epoch.
    pub leaving: Vec<Identity>,
}
