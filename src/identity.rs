// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::errors::{Error, Result};
use crate::scheme::Scheme;

use hex_fmt::HexFmt;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};

/// The self-signed public identity of a committee member: where to reach it
/// and the key it will run the DKG under.
///
/// The transport address is deliberately not covered by the self-signature so
/// a node may relocate without rotating its keys.
#[derive(Clone, Serialize, Deserialize)]
pub struct Identity {
    address: String,
    key: bls::PublicKey,
    scheme: Scheme,
    signature: bls::Signature,
}

impl Identity {
    /// Assembles an identity from its parts. `valid_signature` tells whether
    /// the parts actually belong together.
    pub fn new(
        address: impl Into<String>,
        key: bls::PublicKey,
        scheme: Scheme,
        signature: bls::Signature,
    ) -> Self {
        Self {
            address: address.into(),
            key,
            scheme,
            signature,
        }
    }

    /// The host:port this node is reachable at.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The public key this node runs the DKG under.
    pub fn key(&self) -> &bls::PublicKey {
        &self.key
    }

    /// The scheme the key was created for.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Verifies the self-signature over the scheme name and identity hash.
    pub fn valid_signature(&self) -> Result<()> {
        let message = signable_message(self.scheme, &self.key);
        if self.key.verify(&self.signature, message) {
            Ok(())
        } else {
            Err(Error::InvalidIdentitySignature)
        }
    }

    #[cfg(test)]
    pub(crate) fn with_signature(mut self, signature: bls::Signature) -> Self {
        self.signature = signature;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_key(mut self, key: bls::PublicKey) -> Self {
        self.key = key;
        self
    }
}

// Two identities are the same participant when they share an address and a
// key; the signature is not part of the comparison.
impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.key == other.key
    }
}

impl Eq for Identity {}

impl Debug for Identity {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        write!(
            formatter,
            "Identity({} {:.8})",
            self.address,
            HexFmt(&self.key.to_bytes())
        )
    }
}

impl Display for Identity {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        write!(formatter, "{}", self.address)
    }
}

// The signed message is the scheme name followed by the identity hash of the
// key; the scheme prefix prevents cross-scheme confusion.
fn signable_message(scheme: Scheme, key: &bls::PublicKey) -> Vec<u8> {
    let mut message = scheme.id().as_bytes().to_vec();
    message.extend_from_slice(&scheme.identity_hash(&key.to_bytes()));
    message
}

/// A node's DKG keypair: the private key and the matching self-signed
/// identity.
#[derive(Clone, custom_debug::Debug)]
pub struct Keypair {
    #[debug(skip)]
    secret: bls::SecretKey,
    public: Identity,
}

impl Keypair {
    /// Generates a fresh keypair for the given address and self-signs the
    /// identity.
    pub fn new(address: impl Into<String>, scheme: Scheme) -> Self {
        let secret = bls::SecretKey::random();
        Self::from_secret(secret, address, scheme)
    }

    /// Builds the self-signed identity for an existing private key.
    pub fn from_secret(secret: bls::SecretKey, address: impl Into<String>, scheme: Scheme) -> Self {
        let key = secret.public_key();
        let signature = secret.sign(signable_message(scheme, &key));
        let public = Identity::new(address, key, scheme, signature);
        Self { secret, public }
    }

    /// The self-signed public identity.
    pub fn public(&self) -> &Identity {
        &self.public
    }

    pub(crate) fn secret(&self) -> &bls::SecretKey {
        &self.secret
    }

    pub(crate) fn sign(&self, message: &[u8]) -> bls::Signature {
        self.secret.sign(message)
    }
}

/// Resolves the keypair a beacon runs under. Implemented by the hosting
/// daemon's key store.
pub trait IdentityProvider: Send + Sync {
    /// The keypair for the given beacon id, or an error when this node does
    /// not host that beacon.
    fn keypair_for(&self, beacon_id: &str) -> Result<Keypair>;
}

/// Returns `list` with every occurrence of `exclude` removed, comparing by
/// participant equality.
pub(crate) fn without<'a>(
    list: impl IntoIterator<Item = &'a Identity>,
    exclude: &Identity,
) -> Vec<Identity> {
    list.into_iter()
        .filter(|identity| *identity != exclude)
        .cloned()
        .collect()
}

/// Whether `list` contains `identity` by participant equality.
pub(crate) fn contains(list: &[Identity], identity: &Identity) -> bool {
    list.iter().any(|candidate| candidate == identity)
}
