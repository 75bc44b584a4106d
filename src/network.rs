// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The peer messaging fabric: an outbound per-peer RPC surface and the
//! concurrent fan-out used to reach a whole committee at once. The transport
//! behind the trait (QUIC, gRPC, an in-process mesh in tests) is the hosting
//! daemon's concern.

use crate::errors::Result;
use crate::identity::Identity;
use crate::messaging::{AbortDkg, AcceptProposal, DkgPacket, RejectProposal, StartExecution};
use crate::state::ProposalTerms;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;

/// One-shot RPCs to a single peer, one method per lifecycle command. A failed
/// connection surfaces as `Error::FailedSend`; anything else is an error the
/// remote node actually returned.
#[async_trait]
pub trait DkgRpc: Send + Sync {
    /// Delivers proposal terms.
    async fn propose(&self, to: &Identity, terms: ProposalTerms) -> Result<()>;
    /// Delivers an acceptance to the leader.
    async fn accept(&self, to: &Identity, acceptance: AcceptProposal) -> Result<()>;
    /// Delivers a rejection to the leader.
    async fn reject(&self, to: &Identity, rejection: RejectProposal) -> Result<()>;
    /// Tells a peer the proposal is abandoned.
    async fn abort(&self, to: &Identity, abort: AbortDkg) -> Result<()>;
    /// Tells a peer to start executing the protocol.
    async fn execute(&self, to: &Identity, kickoff: StartExecution) -> Result<()>;
    /// Hands a protocol packet to a peer's broadcaster.
    async fn broadcast_dkg(&self, to: &Identity, packet: DkgPacket) -> Result<()>;
}

/// Dispatches `action` concurrently to every recipient except `from` itself,
/// and returns the first error once all calls have come back. No ordering is
/// preserved between recipients.
pub(crate) async fn send_to_peers<'r, F, Fut>(
    from: &Identity,
    recipients: impl IntoIterator<Item = &'r Identity>,
    action: F,
) -> Result<()>
where
    F: Fn(Identity) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut calls: FuturesUnordered<_> = recipients
        .into_iter()
        .filter(|recipient| *recipient != from)
        .map(|recipient| {
            let recipient = recipient.clone();
            let call = action(recipient.clone());
            async move { (recipient, call.await) }
        })
        .collect();

    let mut first_error = None;
    while let Some((recipient, result)) = calls.next().await {
        if let Err(error) = result {
            warn!("send to {} failed: {}", recipient, error);
            if first_error.is_none() {
                first_error = Some(error);
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Like `send_to_peers`, but tolerates peers that cannot be reached at all.
/// A minority being offline at kick-off is expected; errors a peer actually
/// returned still surface.
pub(crate) async fn send_to_peers_ignoring_connection_error<'r, F, Fut>(
    from: &Identity,
    recipients: impl IntoIterator<Item = &'r Identity>,
    action: F,
) -> Result<()>
where
    F: Fn(Identity) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match send_to_peers(from, recipients, action).await {
        Err(error) if error.is_connection_error() => {
            debug!("ignoring connection error during fan-out: {}", error);
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::identity::Keypair;
    use crate::scheme::Scheme;
    use eyre::Result as TestResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identities(count: usize) -> Vec<Identity> {
        (0..count)
            .map(|index| {
                Keypair::new(
                    format!("127.0.0.1:{}", 7000 + index),
                    Scheme::PedersenBlsChained,
                )
                .public()
                .clone()
            })
            .collect()
    }

    #[tokio::test]
    async fn fan_out_skips_the_sender() -> TestResult<()> {
        let peers = identities(4);
        let calls = AtomicUsize::new(0);

        send_to_peers(&peers[0], &peers, |recipient| {
            let calls = &calls;
            let me = peers[0].clone();
            async move {
                assert_ne!(recipient, me);
                let _count = calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await?;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn fan_out_surfaces_an_error_after_all_calls_return() {
        let peers = identities(4);
        let calls = AtomicUsize::new(0);

        let result = send_to_peers(&peers[0], &peers, |recipient| {
            let calls = &calls;
            let unlucky = peers[2].clone();
            async move {
                let _count = calls.fetch_add(1, Ordering::SeqCst);
                if recipient == unlucky {
                    Err(Error::FailedSend(recipient.address().to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(matches!(result, Err(Error::FailedSend(_))));
        // The failure did not short-circuit the other sends.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connection_errors_can_be_tolerated() -> TestResult<()> {
        let peers = identities(3);

        send_to_peers_ignoring_connection_error(&peers[0], &peers, |recipient| async move {
            Err(Error::FailedSend(recipient.address().to_string()))
        })
        .await?;

        let semantic = send_to_peers_ignoring_connection_error(&peers[0], &peers, |_recipient| {
            async move { Err(Error::InvalidBeaconId) }
        })
        .await;
        assert!(matches!(semantic, Err(Error::InvalidBeaconId)));
        Ok(())
    }
}
