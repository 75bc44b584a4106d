// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Polynomial arithmetic for the verifiable-secret-sharing layer: secret
//! polynomials over the scalar field, their public commitments on the key
//! group, and the Lagrange interpolation used when shares are refreshed.

use crate::errors::{Error, Result};

use blstrs::{G1Affine, G1Projective, Scalar};
use ff::Field;
use group::{Curve, Group};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Shares are evaluations at `index + 1`; zero is reserved for the secret
/// itself.
pub(crate) fn eval_point(index: u32) -> Scalar {
    Scalar::from(u64::from(index) + 1)
}

/// Commitment to a single share: the share times the group generator.
pub(crate) fn share_commitment(share: &Scalar) -> G1Projective {
    G1Projective::generator() * *share
}

/// A dealer's secret polynomial. Never serialized, never logged.
#[derive(Clone)]
pub(crate) struct PrivatePoly {
    coeffs: Vec<Scalar>,
}

impl PrivatePoly {
    /// A uniformly random polynomial of the given degree.
    pub(crate) fn random(degree: usize, mut rng: impl RngCore) -> Self {
        let coeffs = (0..=degree).map(|_| Scalar::random(&mut rng)).collect();
        Self { coeffs }
    }

    /// A random polynomial of the given degree with a fixed constant term.
    /// Resharing dealers commit to their existing share this way.
    pub(crate) fn with_constant(constant: Scalar, degree: usize, mut rng: impl RngCore) -> Self {
        let mut coeffs = vec![constant];
        coeffs.extend((0..degree).map(|_| Scalar::random(&mut rng)));
        Self { coeffs }
    }

    pub(crate) fn eval(&self, x: &Scalar) -> Scalar {
        let mut value = Scalar::zero();
        for coeff in self.coeffs.iter().rev() {
            value = value * *x + *coeff;
        }
        value
    }

    pub(crate) fn commitment(&self) -> PublicPoly {
        let coeffs = self
            .coeffs
            .iter()
            .map(|coeff| G1Projective::generator() * *coeff)
            .collect();
        PublicPoly { coeffs }
    }
}

/// The public polynomial: commitments to a secret polynomial's coefficients.
/// The first coefficient commits to the secret itself, which makes it the
/// aggregate public key external verifiers use.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublicPoly {
    #[serde(with = "serde_points")]
    coeffs: Vec<G1Projective>,
}

impl PublicPoly {
    pub(crate) fn zero(len: usize) -> Self {
        Self {
            coeffs: vec![G1Projective::identity(); len],
        }
    }

    /// The commitment coefficients; their count equals the threshold.
    pub fn coefficients(&self) -> &[G1Projective] {
        &self.coeffs
    }

    /// The aggregate public key: the commitment to the shared secret.
    pub fn public_key(&self) -> &G1Projective {
        &self.coeffs[0]
    }

    /// The number of coefficients, which is the threshold of the sharing.
    pub fn threshold(&self) -> usize {
        self.coeffs.len()
    }

    /// Evaluates the commitment polynomial, yielding the commitment to the
    /// share at `x`.
    pub(crate) fn eval(&self, x: &Scalar) -> G1Projective {
        let mut value = G1Projective::identity();
        for coeff in self.coeffs.iter().rev() {
            value = value * *x + coeff;
        }
        value
    }

    /// Adds another commitment polynomial of the same degree.
    pub(crate) fn add(&mut self, other: &PublicPoly) {
        debug_assert_eq!(self.coeffs.len(), other.coeffs.len());
        for (ours, theirs) in self.coeffs.iter_mut().zip(&other.coeffs) {
            *ours += theirs;
        }
    }

    /// Adds `weight` times another commitment polynomial.
    pub(crate) fn add_scaled(&mut self, weight: &Scalar, other: &PublicPoly) {
        debug_assert_eq!(self.coeffs.len(), other.coeffs.len());
        for (ours, theirs) in self.coeffs.iter_mut().zip(&other.coeffs) {
            *ours += *theirs * *weight;
        }
    }

    /// Serialized coefficients, used when hashing group descriptors.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        self.coeffs
            .iter()
            .flat_map(|coeff| coeff.to_affine().to_compressed())
            .collect()
    }
}

/// Lagrange basis polynomials over the given share indices, evaluated at
/// zero. Interpolating with these weights recovers a polynomial's constant
/// term from its evaluations.
pub(crate) fn lagrange_weights_at_zero(indices: &[u32]) -> Result<Vec<Scalar>> {
    let xs: Vec<Scalar> = indices.iter().map(|index| eval_point(*index)).collect();
    let mut weights = Vec::with_capacity(xs.len());
    for (i, x_i) in xs.iter().enumerate() {
        let mut numerator = Scalar::one();
        let mut denominator = Scalar::one();
        for (j, x_j) in xs.iter().enumerate() {
            if i == j {
                continue;
            }
            numerator *= *x_j;
            denominator *= *x_j - *x_i;
        }
        let inverse: Option<Scalar> = denominator.invert().into();
        let inverse = inverse.ok_or(Error::InvalidRecovery)?;
        weights.push(numerator * inverse);
    }
    Ok(weights)
}

/// Recovers the constant term of the polynomial running through the given
/// (index, evaluation) pairs.
pub(crate) fn recover_at_zero(evals: &[(u32, Scalar)]) -> Result<Scalar> {
    let indices: Vec<u32> = evals.iter().map(|(index, _)| *index).collect();
    let weights = lagrange_weights_at_zero(&indices)?;
    let mut secret = Scalar::zero();
    for ((_, value), weight) in evals.iter().zip(&weights) {
        secret += *value * *weight;
    }
    Ok(secret)
}

pub(crate) fn scalar_to_bytes(scalar: &Scalar) -> Vec<u8> {
    scalar.to_bytes_be().to_vec()
}

pub(crate) fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidRecovery)?;
    let scalar: Option<Scalar> = Scalar::from_bytes_be(&array).into();
    scalar.ok_or(Error::InvalidRecovery)
}

/// Serde support for scalars, as their canonical big-endian encoding.
pub(crate) mod serde_scalar {
    use super::*;
    use serde::de::Error as DeError;
    use serde::{Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes::Bytes::new(&scalar.to_bytes_be()).serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Scalar, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        scalar_from_bytes(&bytes).map_err(|_| D::Error::custom("invalid scalar encoding"))
    }
}

/// Serde support for commitment coefficients, as concatenated compressed
/// points. This is the canonical binary encoding packet hashes are taken
/// over.
pub(crate) mod serde_points {
    use super::*;
    use serde::de::Error as DeError;
    use serde::{Deserializer, Serializer};

    const POINT_SIZE: usize = 48;

    pub(crate) fn serialize<S: Serializer>(
        points: &[G1Projective],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let bytes: Vec<u8> = points
            .iter()
            .flat_map(|point| point.to_affine().to_compressed())
            .collect();
        serde_bytes::ByteBuf::from(bytes).serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<G1Projective>, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        if bytes.len() % POINT_SIZE != 0 {
            return Err(D::Error::custom("truncated point encoding"));
        }
        bytes
            .chunks(POINT_SIZE)
            .map(|chunk| {
                let array: [u8; POINT_SIZE] = chunk
                    .try_into()
                    .map_err(|_| D::Error::custom("truncated point encoding"))?;
                let affine: Option<G1Affine> = G1Affine::from_compressed(&array).into();
                affine
                    .map(G1Projective::from)
                    .ok_or_else(|| D::Error::custom("point not on the curve"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn shares_match_the_commitment_polynomial() {
        let poly = PrivatePoly::random(2, rand::thread_rng());
        let commitment = poly.commitment();
        assert_eq!(commitment.threshold(), 3);

        for index in 0..5 {
            let x = eval_point(index);
            let share = poly.eval(&x);
            assert_eq!(share_commitment(&share), commitment.eval(&x));
        }
    }

    #[test]
    fn recovery_finds_the_constant_term() -> Result<()> {
        let poly = PrivatePoly::random(3, rand::thread_rng());
        let secret = poly.eval(&Scalar::zero());

        let evals: Vec<(u32, Scalar)> = [7u32, 2, 11, 4]
            .iter()
            .map(|index| (*index, poly.eval(&eval_point(*index))))
            .collect();

        assert_eq!(recover_at_zero(&evals)?, secret);
        Ok(())
    }

    #[test]
    fn refreshed_polynomials_preserve_the_secret() -> Result<()> {
        // Three dealers reshare their shares of a 2-of-3 secret into new
        // degree-1 polynomials; the weighted sum of their commitments must
        // commit to the original secret.
        let original = PrivatePoly::random(1, rand::thread_rng());
        let secret = original.eval(&Scalar::zero());

        let dealer_indices = [0u32, 2];
        let dealt: Vec<PrivatePoly> = dealer_indices
            .iter()
            .map(|index| {
                let share = original.eval(&eval_point(*index));
                PrivatePoly::with_constant(share, 1, rand::thread_rng())
            })
            .collect();

        let weights = lagrange_weights_at_zero(&dealer_indices)?;
        let mut refreshed = PublicPoly::zero(2);
        for (weight, poly) in weights.iter().zip(&dealt) {
            refreshed.add_scaled(weight, &poly.commitment());
        }

        assert_eq!(*refreshed.public_key(), share_commitment(&secret));
        Ok(())
    }

    #[test]
    fn scalar_round_trip() -> Result<()> {
        let poly = PrivatePoly::random(0, rand::thread_rng());
        let scalar = poly.eval(&Scalar::zero());
        let bytes = scalar_to_bytes(&scalar);
        assert_eq!(scalar_from_bytes(&bytes)?, scalar);
        Ok(())
    }
}
