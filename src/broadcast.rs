// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Echo broadcast for protocol packets: every packet a node submits or sees
//! for the first time is forwarded once to every other participant, so a
//! packet reaching one honest node eventually reaches all of them. Packets
//! are deduplicated by (author, phase, content hash) and verified against the
//! author's identity key before they propagate.

use crate::errors::{Error, Result};
use crate::group::Node;
use crate::identity::Identity;
use crate::messaging::DkgPacket;
use crate::network::{self, DkgRpc};
use crate::protocol::{self, Board, ProtocolPacket};

use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;

// Per-listener buffer; sized so a full session's worth of unique packets fits
// without ever blocking the inbound side.
const LISTENER_BUFFER: usize = 256;

/// The per-beacon gossip hub used while a DKG executes. Single writer (the
/// executor submits), many readers (inbound RPCs deliver concurrently).
pub struct EchoBroadcast {
    beacon_id: String,
    me: Identity,
    nonce: [u8; 32],
    dealers: Vec<Node>,
    holders: Vec<Node>,
    participants: Vec<Identity>,
    client: Arc<dyn DkgRpc>,
    seen: DashSet<(u32, u8, [u8; 32])>,
    listeners: Mutex<Vec<mpsc::Sender<ProtocolPacket>>>,
}

impl EchoBroadcast {
    /// Builds the broadcaster for one session. The participant set is the
    /// union of the previous and current committees; it must not be empty.
    pub(crate) fn new(
        client: Arc<dyn DkgRpc>,
        beacon_id: &str,
        me: Identity,
        nonce: [u8; 32],
        dealers: Vec<Node>,
        holders: Vec<Node>,
    ) -> Result<Arc<Self>> {
        let mut participants: Vec<Identity> = Vec::new();
        for node in dealers.iter().chain(holders.iter()) {
            if !participants.contains(node.identity()) {
                participants.push(node.identity().clone());
            }
        }
        if participants.is_empty() {
            return Err(Error::NoParticipantsForBroadcast);
        }

        Ok(Arc::new(Self {
            beacon_id: beacon_id.to_string(),
            me,
            nonce,
            dealers,
            holders,
            participants,
            client,
            seen: DashSet::new(),
            listeners: Mutex::new(Vec::new()),
        }))
    }

    /// Registers a listener for verified, deduplicated packets. The channel
    /// is closed when the session tears down, so readers unblock.
    pub(crate) fn subscribe(&self) -> mpsc::Receiver<ProtocolPacket> {
        let (packet_tx, packet_rx) = mpsc::channel(LISTENER_BUFFER);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(packet_tx);
        }
        packet_rx
    }

    /// A packet from a peer. Verified, delivered to listeners and
    /// re-forwarded to everybody but its author; duplicates die here.
    pub async fn receive(&self, packet: ProtocolPacket) -> Result<()> {
        let author = self.verify(&packet)?.clone();
        if !self.mark_seen(&packet)? {
            trace!(
                "dropping duplicate {:?} packet from {} for beacon {}",
                packet.phase(),
                author,
                self.beacon_id
            );
            return Ok(());
        }

        self.deliver(&packet);
        self.forward(&packet, &author).await;
        Ok(())
    }

    fn deliver(&self, packet: &ProtocolPacket) {
        if let Ok(listeners) = self.listeners.lock() {
            for listener in listeners.iter() {
                // A full listener means it fell a whole session behind; the
                // packet is unique, so losing it is the listener's failure,
                // not a protocol one.
                if let Err(error) = listener.try_send(packet.clone()) {
                    warn!(
                        "dropping packet for a lagging listener on beacon {}: {}",
                        self.beacon_id, error
                    );
                }
            }
        }
    }

    async fn forward(&self, packet: &ProtocolPacket, author: &Identity) {
        let dkg_packet = DkgPacket {
            beacon_id: self.beacon_id.clone(),
            packet: packet.clone(),
        };
        let recipients: Vec<&Identity> = self
            .participants
            .iter()
            .filter(|participant| *participant != author)
            .collect();
        // Gossip is best effort; a peer that is not set up yet will catch the
        // packet on the next echo.
        if let Err(error) = network::send_to_peers(&self.me, recipients, |recipient| {
            let client = self.client.clone();
            let dkg_packet = dkg_packet.clone();
            async move { client.broadcast_dkg(&recipient, dkg_packet).await }
        })
        .await
        {
            debug!(
                "echo forward on beacon {} reached fewer peers than hoped: {}",
                self.beacon_id, error
            );
        }
    }

    // True when this is the first sighting of the packet.
    fn mark_seen(&self, packet: &ProtocolPacket) -> Result<bool> {
        let key = (
            packet.signer_index(),
            phase_byte(packet),
            packet.hash()?,
        );
        Ok(self.seen.insert(key))
    }

    fn verify(&self, packet: &ProtocolPacket) -> Result<&Identity> {
        if packet.nonce() != &self.nonce {
            return Err(Error::InvalidPacketNonce);
        }
        let index = packet.signer_index();
        let signers = match packet.phase() {
            protocol::Phase::Response => &self.holders,
            _ => &self.dealers,
        };
        let author = signers
            .iter()
            .find(|node| node.index() == index)
            .map(Node::identity)
            .ok_or(Error::UnknownPacketSender(index))?;
        protocol::verify_packet(author.key(), packet)?;
        Ok(author)
    }

    /// Tears the session down: listeners are closed, not abandoned, so
    /// readers unblock.
    pub(crate) fn close(&self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.clear();
        }
    }
}

impl std::fmt::Debug for EchoBroadcast {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter
            .debug_struct("EchoBroadcast")
            .field("beacon_id", &self.beacon_id)
            .field("participants", &self.participants.len())
            .finish()
    }
}

// The executor publishes its own packets here: they count as seen (so echoes
// of them are not re-forwarded) and go out to every other participant.
#[async_trait]
impl Board for EchoBroadcast {
    async fn publish(&self, packet: ProtocolPacket) -> Result<()> {
        let _first = self.mark_seen(&packet)?;
        self.forward(&packet, &self.me).await;
        Ok(())
    }
}

fn phase_byte(packet: &ProtocolPacket) -> u8 {
    match packet.phase() {
        protocol::Phase::Deal => 0,
        protocol::Phase::Response => 1,
        protocol::Phase::Justification => 2,
        protocol::Phase::Finish => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::messaging::{AbortDkg, AcceptProposal, RejectProposal, StartExecution};
    use crate::scheme::Scheme;
    use crate::state::ProposalTerms;
    use assert_matches::assert_matches;
    use eyre::Result as TestResult;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingClient {
        forwards: Mutex<BTreeMap<String, usize>>,
        total: AtomicUsize,
    }

    #[async_trait]
    impl DkgRpc for CountingClient {
        async fn propose(&self, _to: &Identity, _terms: ProposalTerms) -> Result<()> {
            Ok(())
        }
        async fn accept(&self, _to: &Identity, _acceptance: AcceptProposal) -> Result<()> {
            Ok(())
        }
        async fn reject(&self, _to: &Identity, _rejection: RejectProposal) -> Result<()> {
            Ok(())
        }
        async fn abort(&self, _to: &Identity, _abort: AbortDkg) -> Result<()> {
            Ok(())
        }
        async fn execute(&self, _to: &Identity, _kickoff: StartExecution) -> Result<()> {
            Ok(())
        }
        async fn broadcast_dkg(&self, to: &Identity, _packet: DkgPacket) -> Result<()> {
            if let Ok(mut forwards) = self.forwards.lock() {
                *forwards.entry(to.address().to_string()).or_insert(0) += 1;
            }
            let _count = self.total.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const NONCE: [u8; 32] = [3u8; 32];

    fn committee(count: usize) -> (Vec<Keypair>, Vec<Node>) {
        let mut keypairs: Vec<Keypair> = (0..count)
            .map(|index| {
                Keypair::new(
                    format!("127.0.0.1:{}", 5000 + index),
                    Scheme::PedersenBlsChained,
                )
            })
            .collect();
        keypairs.sort_by_key(|keypair| keypair.public().key().to_bytes());
        let nodes = keypairs
            .iter()
            .enumerate()
            .map(|(index, keypair)| Node::new(index as u32, keypair.public().clone()))
            .collect();
        (keypairs, nodes)
    }

    fn signed_response(author: &Keypair, index: u32) -> ProtocolPacket {
        protocol::test_utils::signed_response_packet(author, index, NONCE)
    }

    #[tokio::test]
    async fn duplicate_packets_forward_exactly_once() -> TestResult<()> {
        let (keypairs, nodes) = committee(4);
        let client = Arc::new(CountingClient::default());
        let broadcaster = EchoBroadcast::new(
            client.clone(),
            "default",
            keypairs[0].public().clone(),
            NONCE,
            nodes.clone(),
            nodes,
        )?;

        let packet = signed_response(&keypairs[1], 1);
        broadcaster.receive(packet.clone()).await?;
        broadcaster.receive(packet).await?;

        // Forwarded to everybody except the author and ourselves, once.
        assert_eq!(client.total.load(Ordering::SeqCst), 2);
        if let Ok(forwards) = client.forwards.lock() {
            assert!(forwards
                .get(keypairs[1].public().address())
                .is_none());
            assert!(forwards
                .get(keypairs[0].public().address())
                .is_none());
        }
        Ok(())
    }

    #[tokio::test]
    async fn listeners_see_each_unique_packet_once() -> TestResult<()> {
        let (keypairs, nodes) = committee(3);
        let client = Arc::new(CountingClient::default());
        let broadcaster = EchoBroadcast::new(
            client,
            "default",
            keypairs[0].public().clone(),
            NONCE,
            nodes.clone(),
            nodes,
        )?;

        let mut listener = broadcaster.subscribe();
        let packet = signed_response(&keypairs[1], 1);
        broadcaster.receive(packet.clone()).await?;
        broadcaster.receive(packet).await?;
        broadcaster.close();

        let first = listener.recv().await;
        assert!(first.is_some());
        assert!(listener.recv().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn forged_packets_are_rejected() -> TestResult<()> {
        let (keypairs, nodes) = committee(3);
        let client = Arc::new(CountingClient::default());
        let broadcaster = EchoBroadcast::new(
            client.clone(),
            "default",
            keypairs[0].public().clone(),
            NONCE,
            nodes.clone(),
            nodes,
        )?;

        // Signed by node 1 but claiming node 2's index.
        let forged = signed_response(&keypairs[1], 2);
        assert_matches!(
            broadcaster.receive(forged).await,
            Err(Error::InvalidPacketSignature(2))
        );
        assert_eq!(client.total.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn own_packets_are_not_echoed_back_to_listeners() -> TestResult<()> {
        let (keypairs, nodes) = committee(3);
        let client = Arc::new(CountingClient::default());
        let broadcaster = EchoBroadcast::new(
            client.clone(),
            "default",
            keypairs[0].public().clone(),
            NONCE,
            nodes.clone(),
            nodes,
        )?;

        let mut listener = broadcaster.subscribe();
        let own = signed_response(&keypairs[0], 0);
        broadcaster.publish(own.clone()).await?;
        // The echo of our own packet coming back from a peer.
        broadcaster.receive(own).await?;
        broadcaster.close();

        assert_eq!(client.total.load(Ordering::SeqCst), 2);
        assert!(listener.recv().await.is_none());
        Ok(())
    }

    #[test]
    fn broadcaster_requires_a_participant() {
        let (keypairs, _nodes) = committee(1);
        let client = Arc::new(CountingClient::default());
        let result = EchoBroadcast::new(
            client,
            "default",
            keypairs[0].public().clone(),
            NONCE,
            vec![],
            vec![],
        );
        assert_matches!(result.err(), Some(Error::NoParticipantsForBroadcast));
    }
}
