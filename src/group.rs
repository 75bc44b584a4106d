// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::crypto::{self, serde_scalar};
use crate::errors::{Error, Result};
use crate::identity::Identity;
use crate::minimum_threshold;
use crate::scheme::Scheme;

pub use crate::crypto::PublicPoly;

use blstrs::Scalar;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tiny_keccak::{Hasher, Sha3};

/// A committee member at its assigned share index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    index: u32,
    identity: Identity,
}

impl Node {
    pub(crate) fn new(index: u32, identity: Identity) -> Self {
        Self { index, identity }
    }

    /// The index this node's share is evaluated at.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The member's identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// The committee descriptor produced by a successful DKG: who holds a share,
/// under which index, and the public polynomial their shares verify against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    beacon_id: String,
    threshold: u32,
    period: Duration,
    catchup_period: Duration,
    scheme: Scheme,
    genesis_time: SystemTime,
    transition_time: SystemTime,
    genesis_seed: Vec<u8>,
    nodes: Vec<Node>,
    public_key: PublicPoly,
}

impl Group {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        beacon_id: String,
        threshold: u32,
        period: Duration,
        catchup_period: Duration,
        scheme: Scheme,
        genesis_time: SystemTime,
        transition_time: SystemTime,
        genesis_seed: Vec<u8>,
        nodes: Vec<Node>,
        public_key: PublicPoly,
    ) -> Self {
        Self {
            beacon_id,
            threshold,
            period,
            catchup_period,
            scheme,
            genesis_time,
            transition_time,
            genesis_seed,
            nodes,
            public_key,
        }
    }

    /// The beacon this group serves.
    pub fn beacon_id(&self) -> &str {
        &self.beacon_id
    }

    /// The number of shares needed to produce a beacon signature.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Interval between beacon rounds.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Interval between rounds while catching up after downtime.
    pub fn catchup_period(&self) -> Duration {
        self.catchup_period
    }

    /// The scheme this group's keys live on.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Wall-clock time of the first beacon round.
    pub fn genesis_time(&self) -> SystemTime {
        self.genesis_time
    }

    /// Wall-clock time this group's shares start producing beacons.
    pub fn transition_time(&self) -> SystemTime {
        self.transition_time
    }

    /// The members of this group, in index order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The public polynomial; its first coefficient is the distributed public
    /// key.
    pub fn public_key(&self) -> &PublicPoly {
        &self.public_key
    }

    /// Finds the member with the given identity.
    pub fn node_of(&self, identity: &Identity) -> Option<&Node> {
        self.nodes.iter().find(|node| node.identity() == identity)
    }

    /// The genesis seed, frozen to the group hash on first access when the
    /// group was created without one.
    pub fn genesis_seed(&mut self) -> Vec<u8> {
        if self.genesis_seed.is_empty() {
            self.genesis_seed = self.hash().to_vec();
        }
        self.genesis_seed.clone()
    }

    pub(crate) fn raw_genesis_seed(&self) -> &[u8] {
        &self.genesis_seed
    }

    /// A digest over every field that defines the group. Nodes are hashed in
    /// index order, so the digest does not depend on insertion order. An
    /// unset genesis seed is excluded, since the seed of the first group is
    /// this very hash.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha3::v256();
        hasher.update(self.beacon_id.as_bytes());
        hasher.update(self.scheme.id().as_bytes());
        hasher.update(&self.threshold.to_be_bytes());
        hasher.update(&unix_seconds(self.genesis_time).to_be_bytes());
        hasher.update(&unix_seconds(self.transition_time).to_be_bytes());
        hasher.update(&self.period.as_secs().to_be_bytes());
        hasher.update(&self.catchup_period.as_secs().to_be_bytes());

        for node in self.nodes.iter().sorted_by_key(|node| node.index()) {
            hasher.update(&node.index().to_be_bytes());
            hasher.update(&node.identity().key().to_bytes());
        }

        hasher.update(&self.public_key.to_bytes());
        if !self.genesis_seed.is_empty() {
            hasher.update(&self.genesis_seed);
        }

        let mut hash = [0u8; 32];
        hasher.finalize(&mut hash);
        hash
    }

    /// Serializes the group for distribution as a group file.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parses and validates a group file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let group: Group = bincode::deserialize(bytes)?;
        group.validate()?;
        Ok(group)
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::InvalidGroup("no nodes".to_string()));
        }
        let node_count = self.nodes.len();
        if self.threshold as usize > node_count {
            return Err(Error::InvalidGroup(
                "threshold larger than the node count".to_string(),
            ));
        }
        if (self.threshold as usize) < minimum_threshold(node_count) {
            return Err(Error::InvalidGroup(
                "threshold below the majority of the node count".to_string(),
            ));
        }
        if self.public_key.threshold() != self.threshold as usize {
            return Err(Error::InvalidGroup(
                "public polynomial does not match the threshold".to_string(),
            ));
        }
        let mut indices: Vec<u32> = self.nodes.iter().map(Node::index).collect();
        indices.sort_unstable();
        indices.dedup();
        if indices.len() != node_count {
            return Err(Error::InvalidGroup("duplicate node index".to_string()));
        }
        Ok(())
    }
}

/// What a node privately holds after a successful DKG: the evaluation of the
/// secret polynomial at its index, and the commitments it verifies against.
/// The value never leaves the owning node.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DistKeyShare {
    index: u32,
    #[serde(with = "serde_scalar")]
    value: Scalar,
    commits: PublicPoly,
}

impl DistKeyShare {
    pub(crate) fn new(index: u32, value: Scalar, commits: PublicPoly) -> Self {
        Self {
            index,
            value,
            commits,
        }
    }

    /// The share index, matching this node's position in the group.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The public commitments, a copy of the group's public polynomial.
    pub fn commitments(&self) -> &PublicPoly {
        &self.commits
    }

    pub(crate) fn value(&self) -> &Scalar {
        &self.value
    }
}

impl Debug for DistKeyShare {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        formatter
            .debug_struct("DistKeyShare")
            .field("index", &self.index)
            .field("value", &"<redacted>")
            .field("commits", &self.commits)
            .finish()
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Verifies a share against the public polynomial it claims membership of.
pub(crate) fn share_matches_commitments(share: &DistKeyShare) -> bool {
    let expected = share.commits.eval(&crypto::eval_point(share.index));
    crypto::share_commitment(share.value()) == expected
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::crypto::PrivatePoly;
    use crate::identity::Keypair;

    pub(crate) fn test_group(beacon_id: &str, node_count: usize, threshold: u32) -> Group {
        let nodes = (0..node_count)
            .map(|index| {
                let keypair = Keypair::new(
                    format!("127.0.0.1:{}", 9000 + index),
                    Scheme::PedersenBlsChained,
                );
                Node::new(index as u32, keypair.public().clone())
            })
            .collect();

        let poly = PrivatePoly::random(threshold as usize - 1, rand::thread_rng());
        Group::new(
            beacon_id.to_string(),
            threshold,
            Duration::from_secs(30),
            Duration::from_secs(10),
            Scheme::PedersenBlsChained,
            UNIX_EPOCH + Duration::from_secs(1_650_000_000),
            UNIX_EPOCH + Duration::from_secs(1_650_000_000),
            vec![],
            nodes,
            poly.commitment(),
        )
    }
}
