// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Payloads of the six inbound peer methods. Each maps one-to-one onto a
//! lifecycle command; responses are an empty acknowledgment or an error.

use crate::identity::Identity;
use crate::protocol::ProtocolPacket;

use serde::{Deserialize, Serialize};

/// A remainer tells the leader it accepts the proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptProposal {
    /// The beacon the proposal concerns.
    pub beacon_id: String,
    /// The node accepting.
    pub acceptor: Identity,
}

/// A remainer tells the leader it rejects the proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectProposal {
    /// The beacon the proposal concerns.
    pub beacon_id: String,
    /// The node rejecting.
    pub rejector: Identity,
}

/// The leader abandons the proposal; the epoch may be retried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortDkg {
    /// The beacon the proposal concerns.
    pub beacon_id: String,
    /// Why the DKG was abandoned, for the logs of the other nodes.
    pub reason: String,
}

/// The leader kicks off the execution of the protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartExecution {
    /// The beacon the proposal concerns.
    pub beacon_id: String,
}

/// A protocol packet gossiped between nodes while a DKG executes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DkgPacket {
    /// The beacon whose broadcaster should take the packet.
    pub beacon_id: String,
    /// The packet itself.
    pub packet: ProtocolPacket,
}
