// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Distributed key generation for a threshold BLS randomness beacon.
//!
//! A fixed committee of identified nodes jointly produces a shared distributed
//! public key while each member ends up holding a private share of the secret.
//! This crate covers the full DKG lifecycle: the user-driven proposal state
//! machine, durable per-beacon state, the echo-broadcast gossip layer used
//! while the verifiable-secret-sharing protocol executes, and the executor
//! that times the protocol phases and finalizes the new group descriptor.
//!
//! Producing randomness from the resulting share (the beacon loop itself), the
//! chain store and the public APIs are the hosting daemon's concern; this
//! crate exports the completion event stream and the inbound peer surface.

#![doc(
    html_logo_url = "https://github.com/maidsafe/QA/raw/master/Images/maidsafe_logo.png",
    html_favicon_url = "https://maidsafe.net/img/favicon.ico",
    test(attr(deny(warnings)))
)]
// Forbid some very bad patterns. Forbid is stronger than `deny`, preventing us from suppressing the
// lint with `#[allow(...)]` et-all.
#![forbid(
    arithmetic_overflow,
    mutable_transmutes,
    no_mangle_const_items,
    unknown_crate_types,
    unsafe_code
)]
// Turn on some additional warnings to encourage good style.
#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    clippy::unicode_not_nfc
)]

#[macro_use]
extern crate tracing;

mod broadcast;
mod crypto;
mod errors;
mod execution;
mod group;
mod identity;
mod messaging;
mod network;
mod process;
mod protocol;
mod scheme;
mod state;
mod store;

pub use crate::errors::{Error, Result};
pub use crate::group::{DistKeyShare, Group, Node, PublicPoly};
pub use crate::identity::{Identity, IdentityProvider, Keypair};
pub use crate::messaging::{
    AbortDkg, AcceptProposal, DkgPacket, RejectProposal, StartExecution,
};
pub use crate::network::DkgRpc;
pub use crate::process::{DkgCompletion, DkgProcess, ProcessConfig};
pub use crate::protocol::ProtocolPacket;
pub use crate::scheme::Scheme;
pub use crate::state::{
    DkgState, FirstProposalOptions, ProposalOptions, ProposalTerms, Status,
};
pub use crate::store::DkgStore;

/// Returns the smallest threshold that a group of `node_count` members may
/// legally use: a majority of the committee.
pub fn minimum_threshold(node_count: usize) -> usize {
    node_count / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::minimum_threshold;

    #[test]
    fn minimum_threshold_is_a_majority() {
        assert_eq!(minimum_threshold(1), 1);
        assert_eq!(minimum_threshold(2), 2);
        assert_eq!(minimum_threshold(3), 2);
        assert_eq!(minimum_threshold(4), 3);
        assert_eq!(minimum_threshold(10), 6);
    }
}
