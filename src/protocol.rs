// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The Pedersen verifiable-secret-sharing protocol: dealers evaluate a secret
//! polynomial and encrypt one share per receiver, receivers accept or
//! complain, dealers justify complaints by revealing the disputed share. A
//! status matrix tracks who accepted whom; the qualified set falls out of it.
//!
//! A fresh DKG has every participant dealing a random polynomial. A reshare
//! has the previous committee dealing polynomials whose constant term is
//! their existing share, so the distributed public key survives the
//! membership change.

use crate::crypto::{self, serde_scalar, PrivatePoly, PublicPoly};
use crate::errors::{Error, Result};
use crate::group::{DistKeyShare, Node};
use crate::identity::Keypair;

use async_trait::async_trait;
use blstrs::Scalar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tiny_keccak::{Hasher, Sha3};
use tokio::sync::mpsc;

/// The phases the protocol walks through, either early when a phase's packet
/// set completes, or on the phaser's timed ticks as a fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Phase {
    Deal,
    Response,
    Justification,
    Finish,
}

/// Emits each phase in order on a fixed interval, the first immediately.
pub(crate) fn start_phaser(period: Duration) -> mpsc::Receiver<Phase> {
    let (phase_tx, phase_rx) = mpsc::channel(4);
    let _handle = tokio::spawn(async move {
        for phase in [
            Phase::Deal,
            Phase::Response,
            Phase::Justification,
            Phase::Finish,
        ] {
            if phase_tx.send(phase).await.is_err() {
                return;
            }
            if phase != Phase::Finish {
                tokio::time::sleep(period).await;
            }
        }
    });
    phase_rx
}

/// Where the executor publishes packets. The echo broadcaster implements
/// this; tests wire engines together with channels instead.
#[async_trait]
pub(crate) trait Board: Send + Sync {
    async fn publish(&self, packet: ProtocolPacket) -> Result<()>;
}

/// Everything the protocol needs to run one session.
pub(crate) struct Config {
    pub(crate) beacon_id: String,
    /// Derived from the epoch; prevents cross-epoch packet replay.
    pub(crate) nonce: [u8; 32],
    pub(crate) me: Keypair,
    /// The previous committee in its group order; empty for a fresh DKG.
    pub(crate) old_nodes: Vec<Node>,
    /// The new committee, ordered by public key bytes.
    pub(crate) new_nodes: Vec<Node>,
    /// The previous threshold; 0 for a fresh DKG.
    pub(crate) old_threshold: u32,
    /// The threshold of the new sharing.
    pub(crate) threshold: u32,
    /// The previous public polynomial; `None` for a fresh DKG.
    pub(crate) previous_public: Option<PublicPoly>,
    /// The previous share, for remainers during a reshare.
    pub(crate) previous_share: Option<DistKeyShare>,
    /// Advance phases as soon as their packet set completes.
    pub(crate) fast_sync: bool,
}

impl Config {
    pub(crate) fn is_reshare(&self) -> bool {
        !self.old_nodes.is_empty()
    }

    /// The nodes that deal shares: the previous committee for a reshare,
    /// everybody for a fresh DKG.
    pub(crate) fn dealers(&self) -> &[Node] {
        if self.is_reshare() {
            &self.old_nodes
        } else {
            &self.new_nodes
        }
    }

    /// The nodes that receive shares: always the new committee.
    pub(crate) fn holders(&self) -> &[Node] {
        &self.new_nodes
    }

    pub(crate) fn our_holder_index(&self) -> Option<u32> {
        self.new_nodes
            .iter()
            .find(|node| node.identity() == self.me.public())
            .map(Node::index)
    }

    pub(crate) fn our_dealer_index(&self) -> Option<u32> {
        if self.is_reshare() && self.previous_share.is_none() {
            // A joiner sits in the new committee but has nothing to deal.
            return None;
        }
        self.dealers()
            .iter()
            .find(|node| node.identity() == self.me.public())
            .map(Node::index)
    }

    fn dealer(&self, index: u32) -> Option<&Node> {
        self.dealers().iter().find(|node| node.index() == index)
    }

    fn holder(&self, index: u32) -> Option<&Node> {
        self.holders().iter().find(|node| node.index() == index)
    }
}

impl Debug for Config {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        formatter
            .debug_struct("Config")
            .field("beacon_id", &self.beacon_id)
            .field("old_nodes", &self.old_nodes.len())
            .field("new_nodes", &self.new_nodes.len())
            .field("old_threshold", &self.old_threshold)
            .field("threshold", &self.threshold)
            .field("reshare", &self.is_reshare())
            .finish()
    }
}

/// One share, encrypted against its holder's identity key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedShare {
    holder_index: u32,
    cipher: bls::Ciphertext,
}

/// A dealer's contribution: its polynomial commitment and one encrypted
/// share per member of the new committee.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DealBundle {
    dealer_index: u32,
    nonce: [u8; 32],
    commitments: PublicPoly,
    shares: Vec<EncryptedShare>,
    signature: bls::Signature,
}

/// Whether a holder accepted a dealer's share.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// The share decrypted and matched the dealer's commitment.
    Success,
    /// The share was missing, unreadable or inconsistent.
    Complaint,
}

/// A holder's verdict on one dealer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Response {
    dealer_index: u32,
    status: ResponseStatus,
}

/// A holder's verdicts on every dealer. All statuses are published, not just
/// complaints, so phases can move on as soon as everybody reported.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseBundle {
    holder_index: u32,
    nonce: [u8; 32],
    responses: Vec<Response>,
    signature: bls::Signature,
}

/// A disputed share, revealed in plaintext.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Justification {
    holder_index: u32,
    #[serde(with = "serde_scalar")]
    share: Scalar,
}

/// A dealer's answer to the complaints against it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JustificationBundle {
    dealer_index: u32,
    nonce: [u8; 32],
    justifications: Vec<Justification>,
    signature: bls::Signature,
}

/// A protocol packet as gossiped between nodes during execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProtocolPacket {
    /// First phase: a dealer's encrypted shares.
    Deal(DealBundle),
    /// Second phase: a holder's accept/complain verdicts.
    Response(ResponseBundle),
    /// Third phase: a dealer's re-disclosures.
    Justification(JustificationBundle),
}

impl ProtocolPacket {
    pub(crate) fn phase(&self) -> Phase {
        match self {
            ProtocolPacket::Deal(_) => Phase::Deal,
            ProtocolPacket::Response(_) => Phase::Response,
            ProtocolPacket::Justification(_) => Phase::Justification,
        }
    }

    /// The index of the node that authored and signed the packet.
    pub(crate) fn signer_index(&self) -> u32 {
        match self {
            ProtocolPacket::Deal(bundle) => bundle.dealer_index,
            ProtocolPacket::Response(bundle) => bundle.holder_index,
            ProtocolPacket::Justification(bundle) => bundle.dealer_index,
        }
    }

    pub(crate) fn nonce(&self) -> &[u8; 32] {
        match self {
            ProtocolPacket::Deal(bundle) => &bundle.nonce,
            ProtocolPacket::Response(bundle) => &bundle.nonce,
            ProtocolPacket::Justification(bundle) => &bundle.nonce,
        }
    }

    pub(crate) fn signature(&self) -> &bls::Signature {
        match self {
            ProtocolPacket::Deal(bundle) => &bundle.signature,
            ProtocolPacket::Response(bundle) => &bundle.signature,
            ProtocolPacket::Justification(bundle) => &bundle.signature,
        }
    }

    /// Digest over the canonical encoding of everything but the signature.
    /// Signed by the author, and the deduplication key of the echo
    /// broadcast.
    pub(crate) fn hash(&self) -> Result<[u8; 32]> {
        let encoded = match self {
            ProtocolPacket::Deal(bundle) => bincode::serialize(&(
                "deal",
                &bundle.nonce,
                bundle.dealer_index,
                &bundle.commitments,
                &bundle.shares,
            ))?,
            ProtocolPacket::Response(bundle) => bincode::serialize(&(
                "response",
                &bundle.nonce,
                bundle.holder_index,
                &bundle.responses,
            ))?,
            ProtocolPacket::Justification(bundle) => bincode::serialize(&(
                "justification",
                &bundle.nonce,
                bundle.dealer_index,
                &bundle.justifications,
            ))?,
        };
        let mut hasher = Sha3::v256();
        hasher.update(&encoded);
        let mut hash = [0u8; 32];
        hasher.finalize(&mut hash);
        Ok(hash)
    }
}

// Tracks, per dealer, which holders accepted its share. Starts out
// optimistic: a holder that never reports keeps its `Success` slots, so an
// absentee cannot disqualify every dealer.
struct StatusMatrix {
    grid: BTreeMap<u32, BTreeMap<u32, bool>>,
}

impl StatusMatrix {
    fn new(dealers: impl Iterator<Item = u32>, holders: &[u32]) -> Self {
        let grid = dealers
            .map(|dealer| {
                let row = holders.iter().map(|holder| (*holder, true)).collect();
                (dealer, row)
            })
            .collect();
        Self { grid }
    }

    fn set(&mut self, dealer: u32, holder: u32, accepted: bool) {
        if let Some(row) = self.grid.get_mut(&dealer) {
            if let Some(slot) = row.get_mut(&holder) {
                *slot = accepted;
            }
        }
    }

    fn get(&self, dealer: u32, holder: u32) -> bool {
        self.grid
            .get(&dealer)
            .and_then(|row| row.get(&holder))
            .copied()
            .unwrap_or(false)
    }

    fn row_clear(&self, dealer: u32) -> bool {
        self.grid
            .get(&dealer)
            .map(|row| row.values().all(|accepted| *accepted))
            .unwrap_or(false)
    }

    fn any_complaint(&self) -> bool {
        self.grid
            .values()
            .any(|row| row.values().any(|accepted| !*accepted))
    }

    fn complaining_holders(&self, dealer: u32) -> Vec<u32> {
        self.grid
            .get(&dealer)
            .map(|row| {
                row.iter()
                    .filter(|(_, accepted)| !**accepted)
                    .map(|(holder, _)| *holder)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// What a successful run hands back to the executor.
pub(crate) struct Output {
    /// The qualified members of the new committee, in the order the protocol
    /// settled on.
    pub(crate) qual: Vec<Node>,
    /// Our share of the new distributed key.
    pub(crate) share: DistKeyShare,
}

/// One run of the protocol, fed by the board's packet stream and the timed
/// phase ticks.
pub(crate) struct Protocol {
    config: Config,
    board: Arc<dyn Board>,
    packets: mpsc::Receiver<ProtocolPacket>,
    phases: mpsc::Receiver<Phase>,
    phase: Phase,
    deals: BTreeMap<u32, DealBundle>,
    responses: BTreeMap<u32, ResponseBundle>,
    justifications: BTreeMap<u32, JustificationBundle>,
    statuses: StatusMatrix,
    // Shares dealt to us, by dealer index, after decryption or justification.
    dealt_shares: BTreeMap<u32, Scalar>,
    our_poly: Option<PrivatePoly>,
}

impl Protocol {
    pub(crate) fn new(
        config: Config,
        board: Arc<dyn Board>,
        packets: mpsc::Receiver<ProtocolPacket>,
        phases: mpsc::Receiver<Phase>,
    ) -> Self {
        let holder_indices: Vec<u32> = config.holders().iter().map(Node::index).collect();
        let statuses = StatusMatrix::new(
            config.dealers().iter().map(Node::index),
            &holder_indices,
        );
        Self {
            config,
            board,
            packets,
            phases,
            phase: Phase::Deal,
            deals: BTreeMap::new(),
            responses: BTreeMap::new(),
            justifications: BTreeMap::new(),
            statuses,
            dealt_shares: BTreeMap::new(),
            our_poly: None,
        }
    }

    pub(crate) async fn run(mut self) -> Result<Output> {
        loop {
            let finishable = tokio::select! {
                tick = self.phases.recv() => match tick {
                    Some(Phase::Deal) => {
                        self.send_deals().await?;
                        self.ready_to_finish().await?
                    }
                    Some(Phase::Response) if self.phase < Phase::Response => {
                        self.send_responses().await?;
                        self.ready_to_finish().await?
                    }
                    Some(Phase::Justification) if self.phase < Phase::Justification => {
                        if self.statuses.any_complaint() {
                            self.send_justifications().await?;
                            self.ready_to_finish().await?
                        } else {
                            true
                        }
                    }
                    Some(Phase::Finish) | None => true,
                    Some(_stale) => false,
                },
                packet = self.packets.recv() => match packet {
                    Some(packet) => {
                        self.handle_packet(packet)?;
                        self.ready_to_finish().await?
                    }
                    // The broadcaster went away under us; execution is being
                    // torn down.
                    None => return Err(Error::DkgTimedOut),
                },
            };
            if finishable {
                return self.finish();
            }
        }
    }

    // Walks the fast-sync ladder: respond as soon as every deal is in,
    // justify as soon as every response is in, finish once no justification
    // is outstanding. The timed ticks remain the fallback for packets that
    // never arrive.
    async fn ready_to_finish(&mut self) -> Result<bool> {
        if !self.config.fast_sync {
            return Ok(false);
        }
        if self.phase == Phase::Deal && self.deals.len() == self.config.dealers().len() {
            self.send_responses().await?;
        }
        if self.phase == Phase::Response && self.responses.len() == self.config.holders().len() {
            if self.statuses.any_complaint() {
                self.send_justifications().await?;
            } else {
                return Ok(true);
            }
        }
        if self.phase == Phase::Justification
            && self.responses.len() == self.config.holders().len()
        {
            let all_justified = self
                .deals
                .keys()
                .filter(|dealer| !self.statuses.complaining_holders(**dealer).is_empty())
                .all(|dealer| self.justifications.contains_key(dealer));
            if all_justified {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn send_deals(&mut self) -> Result<()> {
        let dealer_index = match self.config.our_dealer_index() {
            Some(index) => index,
            None => {
                trace!("not a dealer in this session, waiting for deals");
                return Ok(());
            }
        };

        let degree = self.config.threshold as usize - 1;
        let poly = match self.config.previous_share.as_ref() {
            Some(previous) if self.config.is_reshare() => {
                PrivatePoly::with_constant(*previous.value(), degree, rand::thread_rng())
            }
            _ => PrivatePoly::random(degree, rand::thread_rng()),
        };
        let commitments = poly.commitment();

        let shares = self
            .config
            .holders()
            .iter()
            .map(|holder| {
                let share = poly.eval(&crypto::eval_point(holder.index()));
                let cipher = holder
                    .identity()
                    .key()
                    .encrypt(crypto::scalar_to_bytes(&share));
                EncryptedShare {
                    holder_index: holder.index(),
                    cipher,
                }
            })
            .collect();

        self.our_poly = Some(poly);

        let mut bundle = DealBundle {
            dealer_index,
            nonce: self.config.nonce,
            commitments,
            shares,
            signature: placeholder_signature(&self.config.me),
        };
        bundle.signature = sign_packet(&self.config.me, &ProtocolPacket::Deal(bundle.clone()))?;
        let packet = ProtocolPacket::Deal(bundle);

        trace!(
            "dealing shares for beacon {} as dealer {}",
            self.config.beacon_id,
            dealer_index
        );
        self.handle_packet(packet.clone())?;
        self.board.publish(packet).await
    }

    async fn send_responses(&mut self) -> Result<()> {
        self.phase = Phase::Response;
        let holder_index = match self.config.our_holder_index() {
            Some(index) => index,
            None => return Ok(()),
        };

        let responses = self
            .config
            .dealers()
            .iter()
            .map(|dealer| {
                let status = if self.deals.contains_key(&dealer.index())
                    && self.statuses.get(dealer.index(), holder_index)
                {
                    ResponseStatus::Success
                } else {
                    self.statuses.set(dealer.index(), holder_index, false);
                    ResponseStatus::Complaint
                };
                Response {
                    dealer_index: dealer.index(),
                    status,
                }
            })
            .collect();

        let mut bundle = ResponseBundle {
            holder_index,
            nonce: self.config.nonce,
            responses,
            signature: placeholder_signature(&self.config.me),
        };
        bundle.signature =
            sign_packet(&self.config.me, &ProtocolPacket::Response(bundle.clone()))?;
        let packet = ProtocolPacket::Response(bundle);

        self.handle_packet(packet.clone())?;
        self.board.publish(packet).await
    }

    async fn send_justifications(&mut self) -> Result<()> {
        self.phase = Phase::Justification;
        let dealer_index = match self.config.our_dealer_index() {
            Some(index) => index,
            None => return Ok(()),
        };

        let complaining = self.statuses.complaining_holders(dealer_index);
        if complaining.is_empty() {
            return Ok(());
        }
        let poly = match self.our_poly.as_ref() {
            Some(poly) => poly,
            None => return Ok(()),
        };

        let justifications = complaining
            .into_iter()
            .map(|holder| Justification {
                holder_index: holder,
                share: poly.eval(&crypto::eval_point(holder)),
            })
            .collect();

        let mut bundle = JustificationBundle {
            dealer_index,
            nonce: self.config.nonce,
            justifications,
            signature: placeholder_signature(&self.config.me),
        };
        bundle.signature = sign_packet(
            &self.config.me,
            &ProtocolPacket::Justification(bundle.clone()),
        )?;
        let packet = ProtocolPacket::Justification(bundle);

        self.handle_packet(packet.clone())?;
        self.board.publish(packet).await
    }

    pub(crate) fn handle_packet(&mut self, packet: ProtocolPacket) -> Result<()> {
        if packet.nonce() != &self.config.nonce {
            return Err(Error::InvalidPacketNonce);
        }
        match packet {
            ProtocolPacket::Deal(bundle) => self.handle_deal(bundle),
            ProtocolPacket::Response(bundle) => self.handle_response(bundle),
            ProtocolPacket::Justification(bundle) => self.handle_justification(bundle),
        }
        Ok(())
    }

    fn handle_deal(&mut self, bundle: DealBundle) {
        let dealer = bundle.dealer_index;
        if self.config.dealer(dealer).is_none() {
            trace!("dropping deal from unknown dealer {}", dealer);
            return;
        }
        if self.deals.contains_key(&dealer) {
            return;
        }

        let our_index = match self.config.our_holder_index() {
            Some(index) => index,
            None => {
                // A leaver running down its session only relays.
                let _previous = self.deals.insert(dealer, bundle);
                return;
            }
        };

        let accepted = self.verify_dealt_share(&bundle, our_index);
        self.statuses.set(dealer, our_index, accepted.is_some());
        if let Some(share) = accepted {
            let _previous = self.dealt_shares.insert(dealer, share);
        } else {
            debug!(
                "complaining about dealer {} for beacon {}",
                dealer, self.config.beacon_id
            );
        }
        let _previous = self.deals.insert(dealer, bundle);
    }

    // Checks a deal against its own commitment and, for reshares, against
    // the previous public polynomial. Returns the decrypted share on
    // success.
    fn verify_dealt_share(&self, bundle: &DealBundle, our_index: u32) -> Option<Scalar> {
        if bundle.commitments.threshold() != self.config.threshold as usize {
            return None;
        }
        if let Some(previous_public) = self.config.previous_public.as_ref() {
            let expected = previous_public.eval(&crypto::eval_point(bundle.dealer_index));
            if *bundle.commitments.public_key() != expected {
                return None;
            }
        }
        let encrypted = bundle
            .shares
            .iter()
            .find(|share| share.holder_index == our_index)?;
        let plain = self.config.me.secret().decrypt(&encrypted.cipher)?;
        let share = crypto::scalar_from_bytes(&plain).ok()?;
        let expected = bundle.commitments.eval(&crypto::eval_point(our_index));
        if crypto::share_commitment(&share) != expected {
            return None;
        }
        Some(share)
    }

    fn handle_response(&mut self, bundle: ResponseBundle) {
        let holder = bundle.holder_index;
        if self.config.holder(holder).is_none() {
            trace!("dropping responses from unknown holder {}", holder);
            return;
        }
        if self.responses.contains_key(&holder) {
            return;
        }
        for response in &bundle.responses {
            if self.config.dealer(response.dealer_index).is_none() {
                continue;
            }
            self.statuses.set(
                response.dealer_index,
                holder,
                response.status == ResponseStatus::Success,
            );
        }
        let _previous = self.responses.insert(holder, bundle);
    }

    fn handle_justification(&mut self, bundle: JustificationBundle) {
        let dealer = bundle.dealer_index;
        if self.justifications.contains_key(&dealer) {
            return;
        }
        let commitments = match self.deals.get(&dealer) {
            Some(deal) => deal.commitments.clone(),
            // Without the deal there is nothing to verify against.
            None => return,
        };
        let our_index = self.config.our_holder_index();
        for justification in &bundle.justifications {
            let expected = commitments.eval(&crypto::eval_point(justification.holder_index));
            if crypto::share_commitment(&justification.share) != expected {
                debug!(
                    "justification by dealer {} for holder {} does not verify",
                    dealer, justification.holder_index
                );
                continue;
            }
            self.statuses.set(dealer, justification.holder_index, true);
            if Some(justification.holder_index) == our_index {
                let _previous = self.dealt_shares.insert(dealer, justification.share);
            }
        }
        let _previous = self.justifications.insert(dealer, bundle);
    }

    // Settles the qualified set and computes the final share and public
    // polynomial.
    fn finish(&self) -> Result<Output> {
        let our_index = self
            .config
            .our_holder_index()
            .ok_or(Error::CannotExecuteIfNotJoinerOrRemainer)?;

        // A dealer qualifies when its deal arrived and nobody's complaint
        // stood.
        let valid_dealers: Vec<u32> = self
            .config
            .dealers()
            .iter()
            .map(Node::index)
            .filter(|dealer| self.deals.contains_key(dealer) && self.statuses.row_clear(*dealer))
            .collect();

        if self.config.is_reshare() {
            self.finish_reshare(our_index, valid_dealers)
        } else {
            self.finish_fresh(our_index, valid_dealers)
        }
    }

    fn finish_fresh(&self, our_index: u32, valid_dealers: Vec<u32>) -> Result<Output> {
        let threshold = self.config.threshold as usize;
        if valid_dealers.len() < threshold {
            return Err(Error::NotEnoughQualified(valid_dealers.len(), threshold));
        }
        // Dealers and holders are the same committee here, so the qualified
        // dealers are the qualified set.
        if !valid_dealers.contains(&our_index) {
            return Err(Error::Evicted);
        }

        let mut share = Scalar::from(0u64);
        let mut public = PublicPoly::zero(threshold);
        for dealer in &valid_dealers {
            let dealt = self
                .dealt_shares
                .get(dealer)
                .ok_or(Error::MissingDealtShare(*dealer))?;
            share += dealt;
            let deal = self
                .deals
                .get(dealer)
                .ok_or(Error::MissingDealtShare(*dealer))?;
            public.add(&deal.commitments);
        }

        self.checked_output(our_index, share, public, &valid_dealers)
    }

    fn finish_reshare(&self, our_index: u32, valid_dealers: Vec<u32>) -> Result<Output> {
        let old_threshold = self.config.old_threshold as usize;
        if valid_dealers.len() < old_threshold {
            return Err(Error::NotEnoughValidDeals(
                valid_dealers.len(),
                old_threshold,
            ));
        }

        // The qualified set: holders every valid dealer's share reached.
        let qualified: Vec<u32> = self
            .config
            .holders()
            .iter()
            .map(Node::index)
            .filter(|holder| {
                valid_dealers
                    .iter()
                    .all(|dealer| self.statuses.get(*dealer, *holder))
            })
            .collect();
        let threshold = self.config.threshold as usize;
        if qualified.len() < threshold {
            return Err(Error::NotEnoughQualified(qualified.len(), threshold));
        }
        if !qualified.contains(&our_index) {
            return Err(Error::Evicted);
        }

        // Every node recovers over the same deterministic dealer subset, or
        // the refreshed shares would not lie on one polynomial.
        let chosen: Vec<u32> = valid_dealers.into_iter().take(old_threshold).collect();

        let evals: Vec<(u32, Scalar)> = chosen
            .iter()
            .map(|dealer| {
                self.dealt_shares
                    .get(dealer)
                    .map(|share| (*dealer, *share))
                    .ok_or(Error::MissingDealtShare(*dealer))
            })
            .collect::<Result<_>>()?;
        let share = crypto::recover_at_zero(&evals)?;

        let weights = crypto::lagrange_weights_at_zero(&chosen)?;
        let mut public = PublicPoly::zero(threshold);
        for (dealer, weight) in chosen.iter().zip(&weights) {
            let deal = self
                .deals
                .get(dealer)
                .ok_or(Error::MissingDealtShare(*dealer))?;
            public.add_scaled(weight, &deal.commitments);
        }

        // A reshare must not move the distributed public key.
        if let Some(previous_public) = self.config.previous_public.as_ref() {
            if public.public_key() != previous_public.public_key() {
                return Err(Error::InvalidRecovery);
            }
        }

        self.checked_output(our_index, share, public, &qualified)
    }

    fn checked_output(
        &self,
        our_index: u32,
        share: Scalar,
        public: PublicPoly,
        qualified: &[u32],
    ) -> Result<Output> {
        if crypto::share_commitment(&share) != public.eval(&crypto::eval_point(our_index)) {
            return Err(Error::InvalidRecovery);
        }

        let qual = qualified
            .iter()
            .filter_map(|index| {
                self.config
                    .holder(*index)
                    .map(|node| Node::new(node.index(), node.identity().clone()))
            })
            .collect();

        Ok(Output {
            qual,
            share: DistKeyShare::new(our_index, share, public),
        })
    }
}

pub(crate) fn sign_packet(me: &Keypair, packet: &ProtocolPacket) -> Result<bls::Signature> {
    Ok(me.sign(&packet.hash()?))
}

pub(crate) fn verify_packet(signer: &bls::PublicKey, packet: &ProtocolPacket) -> Result<()> {
    if signer.verify(packet.signature(), packet.hash()?) {
        Ok(())
    } else {
        Err(Error::InvalidPacketSignature(packet.signer_index()))
    }
}

// Bundles are constructed before they can be signed over their hash; this
// fills the signature slot until then.
fn placeholder_signature(me: &Keypair) -> bls::Signature {
    me.sign(b"placeholder")
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    pub(crate) fn signed_response_packet(
        author: &Keypair,
        holder_index: u32,
        nonce: [u8; 32],
    ) -> ProtocolPacket {
        let mut bundle = ResponseBundle {
            holder_index,
            nonce,
            responses: vec![Response {
                dealer_index: 0,
                status: ResponseStatus::Success,
            }],
            signature: placeholder_signature(author),
        };
        bundle.signature = sign_packet(author, &ProtocolPacket::Response(bundle.clone()))
            .expect("signing a response cannot fail");
        ProtocolPacket::Response(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::scheme::Scheme;
    use eyre::{eyre, Result};
    use std::time::Duration;
    use tokio::sync::Mutex;

    const BEACON_ID: &str = "default";
    const NONCE: [u8; 32] = [7u8; 32];

    // A board that fans packets out to every engine's channel except the
    // author's.
    struct ChannelBoard {
        index: u32,
        peers: Mutex<Vec<(u32, mpsc::Sender<ProtocolPacket>)>>,
    }

    #[async_trait]
    impl Board for ChannelBoard {
        async fn publish(&self, packet: ProtocolPacket) -> crate::Result<()> {
            for (peer, sender) in self.peers.lock().await.iter() {
                if *peer != self.index {
                    let _sent = sender.send(packet.clone()).await;
                }
            }
            Ok(())
        }
    }

    fn sorted_keypairs(count: usize) -> Vec<Keypair> {
        let mut keypairs: Vec<Keypair> = (0..count)
            .map(|index| {
                Keypair::new(
                    format!("127.0.0.1:{}", 6000 + index),
                    Scheme::PedersenBlsChained,
                )
            })
            .collect();
        keypairs.sort_by_key(|keypair| keypair.public().key().to_bytes());
        keypairs
    }

    fn nodes_of(keypairs: &[Keypair]) -> Vec<Node> {
        keypairs
            .iter()
            .enumerate()
            .map(|(index, keypair)| Node::new(index as u32, keypair.public().clone()))
            .collect()
    }

    async fn run_session(
        configs: Vec<Config>,
        phase_period: Duration,
    ) -> Result<Vec<Output>> {
        let mut channels = Vec::new();
        let mut receivers = Vec::new();
        for config in &configs {
            let (packet_tx, packet_rx) = mpsc::channel(64);
            channels.push((
                config.our_holder_index().or(config.our_dealer_index()),
                packet_tx,
            ));
            receivers.push(packet_rx);
        }

        let wired: Vec<(u32, mpsc::Sender<ProtocolPacket>)> = channels
            .iter()
            .filter_map(|(index, sender)| index.map(|index| (index, sender.clone())))
            .collect();

        let mut handles = Vec::new();
        for (config, packet_rx) in configs.into_iter().zip(receivers) {
            let index = config
                .our_holder_index()
                .or(config.our_dealer_index())
                .ok_or_else(|| eyre!("node is in neither committee"))?;
            let board = Arc::new(ChannelBoard {
                index,
                peers: Mutex::new(wired.clone()),
            });
            let phases = start_phaser(phase_period);
            let protocol = Protocol::new(config, board, packet_rx, phases);
            handles.push(tokio::spawn(protocol.run()));
        }

        let mut outputs = Vec::new();
        for handle in handles {
            outputs.push(handle.await??);
        }
        Ok(outputs)
    }

    fn fresh_config(keypairs: &[Keypair], me: usize, threshold: u32) -> Config {
        Config {
            beacon_id: BEACON_ID.to_string(),
            nonce: NONCE,
            me: keypairs[me].clone(),
            old_nodes: vec![],
            new_nodes: nodes_of(keypairs),
            old_threshold: 0,
            threshold,
            previous_public: None,
            previous_share: None,
            fast_sync: true,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fresh_dkg_completes_with_consistent_outputs() -> Result<()> {
        let keypairs = sorted_keypairs(4);
        let configs = (0..4).map(|me| fresh_config(&keypairs, me, 3)).collect();

        let outputs = run_session(configs, Duration::from_millis(500)).await?;

        let reference = outputs[0].share.commitments().clone();
        assert_eq!(reference.threshold(), 3);
        for output in &outputs {
            assert_eq!(output.qual.len(), 4);
            assert_eq!(output.share.commitments(), &reference);
            assert!(crate::group::share_matches_commitments(&output.share));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reshare_preserves_the_distributed_key() -> Result<()> {
        let keypairs = sorted_keypairs(4);
        let configs = (0..4).map(|me| fresh_config(&keypairs, me, 3)).collect();
        let outputs = run_session(configs, Duration::from_millis(500)).await?;
        let previous_public = outputs[0].share.commitments().clone();

        // Drop the last node, add a newcomer, rethreshold to 3-of-4.
        let mut next_keypairs: Vec<Keypair> = keypairs[..3].to_vec();
        next_keypairs.push(Keypair::new("127.0.0.1:6990", Scheme::PedersenBlsChained));
        next_keypairs.sort_by_key(|keypair| keypair.public().key().to_bytes());
        let new_nodes = nodes_of(&next_keypairs);

        let previous_share_of = |identity: &Identity| {
            keypairs
                .iter()
                .zip(&outputs)
                .find(|(keypair, _)| keypair.public() == identity)
                .map(|(_, output)| output.share.clone())
        };

        let configs = next_keypairs
            .iter()
            .map(|keypair| Config {
                beacon_id: BEACON_ID.to_string(),
                nonce: [9u8; 32],
                me: keypair.clone(),
                old_nodes: nodes_of(&keypairs),
                new_nodes: new_nodes.clone(),
                old_threshold: 3,
                threshold: 3,
                previous_public: Some(previous_public.clone()),
                previous_share: previous_share_of(keypair.public()),
                fast_sync: true,
            })
            .collect();

        let outputs = run_session(configs, Duration::from_millis(500)).await?;
        for output in &outputs {
            assert_eq!(output.qual.len(), 4);
            assert_eq!(
                output.share.commitments().public_key(),
                previous_public.public_key()
            );
            assert!(crate::group::share_matches_commitments(&output.share));
        }
        Ok(())
    }

    #[tokio::test]
    async fn tampered_deal_draws_a_complaint_and_a_justification() -> Result<()> {
        // Drive two engines by hand: a clean dealer and a victim that
        // receives a garbled share.
        let keypairs = sorted_keypairs(3);
        let mut dealer = protocol_of(fresh_config(&keypairs, 0, 2));
        let mut victim = protocol_of(fresh_config(&keypairs, 1, 2));

        dealer.send_deals().await?;
        let mut bundle = match dealer.deals.get(&0) {
            Some(bundle) => bundle.clone(),
            None => return Err(eyre!("dealer did not record its own deal")),
        };
        // Swap the victim's share for somebody else's ciphertext.
        bundle.shares[1].cipher = bundle.shares[2].cipher.clone();
        bundle.signature = sign_packet(&keypairs[0], &ProtocolPacket::Deal(bundle.clone()))?;

        victim.handle_packet(ProtocolPacket::Deal(bundle))?;
        assert!(!victim.statuses.get(0, 1));

        victim.send_responses().await?;
        let complaint = match victim.responses.get(&1) {
            Some(bundle) => bundle.clone(),
            None => return Err(eyre!("victim did not record its own responses")),
        };
        dealer.handle_packet(ProtocolPacket::Response(complaint))?;
        assert!(!dealer.statuses.row_clear(0));

        dealer.send_justifications().await?;
        let justification = match dealer.justifications.get(&0) {
            Some(bundle) => bundle.clone(),
            None => return Err(eyre!("dealer did not justify")),
        };
        victim.handle_packet(ProtocolPacket::Justification(justification))?;

        // The revealed share verified, so the dealer is whole again and the
        // victim holds its share after all.
        assert!(victim.statuses.get(0, 1));
        assert!(victim.dealt_shares.contains_key(&0));
        Ok(())
    }

    #[tokio::test]
    async fn packets_with_a_foreign_nonce_are_rejected() {
        let keypairs = sorted_keypairs(3);
        let mut engine = protocol_of(fresh_config(&keypairs, 0, 2));

        let mut bundle = ResponseBundle {
            holder_index: 1,
            nonce: [42u8; 32],
            responses: vec![],
            signature: placeholder_signature(&keypairs[1]),
        };
        bundle.signature = sign_packet(&keypairs[1], &ProtocolPacket::Response(bundle.clone()))
            .expect("signing cannot fail");

        let result = engine.handle_packet(ProtocolPacket::Response(bundle));
        assert!(matches!(result, Err(Error::InvalidPacketNonce)));
    }

    #[test]
    fn packet_signatures_verify_and_bind_the_content() -> Result<()> {
        let keypairs = sorted_keypairs(2);
        let mut bundle = ResponseBundle {
            holder_index: 0,
            nonce: NONCE,
            responses: vec![Response {
                dealer_index: 1,
                status: ResponseStatus::Success,
            }],
            signature: placeholder_signature(&keypairs[0]),
        };
        bundle.signature = sign_packet(&keypairs[0], &ProtocolPacket::Response(bundle.clone()))?;
        let packet = ProtocolPacket::Response(bundle.clone());

        verify_packet(keypairs[0].public().key(), &packet)?;

        let mut altered = bundle;
        altered.responses[0].status = ResponseStatus::Complaint;
        let altered = ProtocolPacket::Response(altered);
        assert!(verify_packet(keypairs[0].public().key(), &altered).is_err());
        Ok(())
    }

    fn protocol_of(config: Config) -> Protocol {
        let (_packet_tx, packet_rx) = mpsc::channel(8);
        let (_phase_tx, phase_rx) = mpsc::channel(1);
        let board = Arc::new(NullBoard);
        Protocol::new(config, board, packet_rx, phase_rx)
    }

    struct NullBoard;

    #[async_trait]
    impl Board for NullBoard {
        async fn publish(&self, _packet: ProtocolPacket) -> crate::Result<()> {
            Ok(())
        }
    }
}
