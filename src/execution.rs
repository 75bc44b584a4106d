// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The executor: runs the verifiable-secret-sharing protocol once a beacon's
//! state reaches `Executing`, times its phases, and turns the protocol's
//! output into the persisted final group and key share.

use crate::broadcast::EchoBroadcast;
use crate::errors::{Error, Result};
use crate::group::{Group, Node};
use crate::identity::{self, Identity};
use crate::process::{DkgCompletion, DkgProcess};
use crate::protocol::{self, Board, Protocol};

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::SystemTime;

impl DkgProcess {
    /// Runs the execution on its own task; the outcome lands in the store
    /// and on the completion stream.
    pub(crate) fn spawn_execution(self: Arc<Self>, beacon_id: &str) {
        let process = self;
        let beacon_id = beacon_id.to_string();
        let _handle = tokio::spawn(async move {
            match process.execute_and_finish(&beacon_id).await {
                Ok(()) => info!("DKG completed for beacon {}", beacon_id),
                Err(error) => error!("DKG for beacon {} ended with: {}", beacon_id, error),
            }
        });
    }

    async fn execute_and_finish(&self, beacon_id: &str) -> Result<()> {
        let keypair = self.keys().keypair_for(beacon_id)?;
        let me = keypair.public().clone();

        let (current, previous_finished) = {
            let _guard = self.lock().lock().await;
            (
                self.store().get_current(beacon_id)?,
                self.store().get_finished(beacon_id)?,
            )
        };

        // The previous group: our own completed epoch when we have it, the
        // adopted group file when we joined mid-history.
        let previous_group = match &previous_finished {
            Some(finished) if finished.epoch() + 1 == current.epoch() => {
                Some(finished.final_group()?.clone())
            }
            _ => self.adopted_group(beacon_id),
        };
        if current.epoch() > 1 && previous_group.is_none() {
            return Err(Error::PreviousGroupMissing);
        }
        // Only a remainer reshares its existing key material; a joiner deals
        // nothing.
        let previous_share = if identity::contains(current.remaining(), &me) {
            previous_finished
                .as_ref()
                .and_then(|finished| finished.key_share().ok().cloned())
        } else {
            None
        };

        let new_nodes = sorted_nodes(current.remaining(), current.joining());
        let old_nodes: Vec<Node> = previous_group
            .as_ref()
            .map(|group| group.nodes().to_vec())
            .unwrap_or_default();
        let nonce = session_nonce(current.epoch());

        let config = protocol::Config {
            beacon_id: beacon_id.to_string(),
            nonce,
            me: keypair,
            old_threshold: previous_group
                .as_ref()
                .map(Group::threshold)
                .unwrap_or(0),
            threshold: current.threshold(),
            previous_public: previous_group.map(|group| group.public_key().clone()),
            previous_share,
            old_nodes,
            new_nodes,
            fast_sync: true,
        };

        // The broadcaster must be reachable before the first packet can
        // arrive, so it goes into the execution map before the grace period
        // starts ticking.
        let broadcaster = EchoBroadcast::new(
            self.client(),
            beacon_id,
            me,
            nonce,
            config.dealers().to_vec(),
            config.holders().to_vec(),
        )?;
        self.register_execution(beacon_id, broadcaster.clone());
        let packets = broadcaster.subscribe();

        // Give the other nodes time to set their broadcasters up, or the
        // first phase's packets would be silently dropped.
        tokio::time::sleep(self.config().kickoff_grace_period).await;

        let phases = protocol::start_phaser(self.config().time_between_phases);
        let board: Arc<dyn Board> = broadcaster.clone();
        let session = Protocol::new(config, board, packets, phases);

        debug!(
            "executing DKG for beacon {} at epoch {}",
            beacon_id,
            current.epoch()
        );
        let outcome = match current.timeout().duration_since(SystemTime::now()) {
            Ok(remaining) => tokio::select! {
                outcome = session.run() => outcome,
                _ = tokio::time::sleep(remaining) => Err(Error::DkgTimedOut),
            },
            Err(_already_past) => Err(Error::DkgTimedOut),
        };

        self.unregister_execution(beacon_id);
        broadcaster.close();

        let _guard = self.lock().lock().await;
        let current = self.store().get_current(beacon_id)?;
        match outcome {
            Ok(output) => {
                let share = output.share.clone();
                let final_group = Group::new(
                    current.beacon_id().to_string(),
                    current.threshold(),
                    current.beacon_period(),
                    current.catchup_period(),
                    current.scheme(),
                    current.genesis_time(),
                    current.transition_time(),
                    current.genesis_seed().to_vec(),
                    output.qual,
                    share.commitments().clone(),
                );
                let next = current.complete(final_group, share)?;
                self.store().save_finished(&next)?;
                self.emit_completion(DkgCompletion {
                    beacon_id: beacon_id.to_string(),
                    old: previous_finished,
                    new: next,
                });
                Ok(())
            }
            Err(Error::Evicted) => {
                warn!("this node was evicted from the DKG for beacon {}", beacon_id);
                let next = current.evicted()?;
                self.store().save_current(&next)?;
                Err(Error::Evicted)
            }
            Err(error) => {
                let next = current.timed_out()?;
                self.store().save_current(&next)?;
                Err(error)
            }
        }
    }
}

// Canonical participant ordering: everybody computes the same indices or the
// protocol's share evaluations diverge.
pub(crate) fn sorted_nodes(remaining: &[Identity], joining: &[Identity]) -> Vec<Node> {
    let mut members: Vec<Identity> = remaining.iter().chain(joining.iter()).cloned().collect();
    members.sort_by_key(|identity| identity.key().to_bytes());
    members
        .into_iter()
        .enumerate()
        .map(|(index, identity)| Node::new(index as u32, identity))
        .collect()
}

// Deterministic per-epoch nonce; packets from one epoch can never replay
// into another.
pub(crate) fn session_nonce(epoch: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(u64::from(epoch).to_be_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::scheme::Scheme;

    #[test]
    fn nonce_is_deterministic_per_epoch() {
        assert_eq!(session_nonce(1), session_nonce(1));
        assert_ne!(session_nonce(1), session_nonce(2));
    }

    #[test]
    fn node_ordering_is_independent_of_list_order() {
        let keypairs: Vec<Keypair> = (0..5)
            .map(|index| {
                Keypair::new(
                    format!("127.0.0.1:{}", 4000 + index),
                    Scheme::PedersenBlsChained,
                )
            })
            .collect();
        let identities: Vec<Identity> =
            keypairs.iter().map(|kp| kp.public().clone()).collect();

        let forward = sorted_nodes(&identities[..3], &identities[3..]);
        let mut reversed = identities.clone();
        reversed.reverse();
        let backward = sorted_nodes(&reversed[..2], &reversed[2..]);

        assert_eq!(forward, backward);
        for (index, node) in forward.iter().enumerate() {
            assert_eq!(node.index(), index as u32);
        }
    }
}
