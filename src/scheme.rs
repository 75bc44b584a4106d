// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::errors::{Error, Result};

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use tiny_keccak::{Hasher, Sha3};

/// The scheme used when no other is specified.
pub const DEFAULT_SCHEME_ID: &str = "pedersen-bls-chained";

/// A named cryptographic scheme a beacon runs under. The scheme fixes the key
/// group the committee keys live on and the domain used when hashing
/// identities, so two beacons under different schemes can never confuse each
/// other's signatures.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    /// Chained beacon: each signature is over the previous one.
    PedersenBlsChained,
    /// Unchained beacon: each signature is over the round number alone.
    PedersenBlsUnchained,
    /// Unchained beacon with short signatures on G1.
    BlsUnchainedG1,
}

impl Scheme {
    /// Resolves a scheme by its wire identifier.
    pub fn from_id(id: &str) -> Result<Self> {
        match id {
            "pedersen-bls-chained" => Ok(Self::PedersenBlsChained),
            "pedersen-bls-unchained" => Ok(Self::PedersenBlsUnchained),
            "bls-unchained-g1-rfc9380" => Ok(Self::BlsUnchainedG1),
            _ => Err(Error::InvalidScheme),
        }
    }

    /// The wire identifier of this scheme.
    pub fn id(&self) -> &'static str {
        match self {
            Self::PedersenBlsChained => "pedersen-bls-chained",
            Self::PedersenBlsUnchained => "pedersen-bls-unchained",
            Self::BlsUnchainedG1 => "bls-unchained-g1-rfc9380",
        }
    }

    /// Hash of a public key under this scheme's identity domain.
    pub fn identity_hash(&self, key_bytes: &[u8]) -> [u8; 32] {
        let mut hasher = Sha3::v256();
        hasher.update(key_bytes);
        let mut hash = [0u8; 32];
        hasher.finalize(&mut hash);
        hash
    }
}

impl Default for Scheme {
    fn default() -> Self {
        Self::PedersenBlsChained
    }
}

impl Display for Scheme {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        write!(formatter, "{}", self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn known_schemes_resolve() {
        for id in [
            "pedersen-bls-chained",
            "pedersen-bls-unchained",
            "bls-unchained-g1-rfc9380",
        ] {
            let scheme = Scheme::from_id(id).expect("scheme should resolve");
            assert_eq!(scheme.id(), id);
        }
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert_matches!(Scheme::from_id("pedersen-bls-sideways"), Err(Error::InvalidScheme));
    }

    #[test]
    fn default_scheme_matches_the_default_id() {
        assert_eq!(Scheme::default().id(), DEFAULT_SCHEME_ID);
    }
}
