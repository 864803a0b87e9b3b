//! FROST threshold Schnorr signing, via `frost-secp256k1-tr`.
//!
//! The arithmetic is delegated to the `frost-secp256k1-tr` engine. This
//! module adapts it to the custody key model, where a leaf's verifying key is
//! the *sum* of the owner's signing key and the operators' aggregate key:
//!
//! ```text
//! Y = Y_user + Y_operators
//! ```
//!
//! Plain FROST weights each signer's share by its Lagrange coefficient over
//! the signing set. A participant holding an additive share `e` therefore
//! signs with `e * λ⁻¹`, so that the engine's weighting cancels out and the
//! contribution to the group secret is exactly `e`. [`sign_additive`] applies
//! that scaling; [`aggregate`] applies the same scaling to the owner's
//! verifying share. Operators report verifying shares already scaled.
//!
//! Every signature is a BIP340 signature under the BIP341 key-path tweak of
//! `Y`, i.e. it spends a P2TR output with no script tree.

use std::collections::BTreeMap;
use std::fmt;

use bitcoin::secp256k1::{PublicKey, SecretKey};
use frost_secp256k1_tr::{
    Identifier, SigningPackage, VerifyingKey,
    keys::{KeyPackage, PublicKeyPackage, SigningShare, VerifyingShare},
    round1::{SigningCommitments, SigningNonces},
    round2::SignatureShare,
};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{AffinePoint, FieldBytes, ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};

use crate::verifiable_secret_sharing::{lagrange_coefficient, scalar_from_bytes};

/// Empty merkle root: BIP341 key-path spend with no script tree.
const KEY_PATH_MERKLE_ROOT: &[u8] = &[];

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors returned by FROST operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrostError {
    /// Signing round 2 failed (invalid key, nonce, or commitment).
    SigningFailed,

    /// Signature aggregation failed (invalid shares or commitment mismatch).
    AggregationFailed,

    /// An identifier could not be derived or converted.
    InvalidIdentifier,

    /// A signing commitment is invalid or could not be serialized.
    InvalidCommitment,

    /// A key could not be converted between curve libraries.
    InvalidKey,
}

impl fmt::Display for FrostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigningFailed => write!(f, "FROST signing failed"),
            Self::AggregationFailed => write!(f, "FROST signature aggregation failed"),
            Self::InvalidIdentifier => write!(f, "invalid FROST identifier"),
            Self::InvalidCommitment => write!(f, "invalid signing commitment"),
            Self::InvalidKey => write!(f, "invalid key material"),
        }
    }
}

impl std::error::Error for FrostError {}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A nonce pair for FROST signing, including the commitment.
///
/// The nonces are secret and single-use; the commitment is shared with the
/// other signers.
#[derive(Debug, Clone)]
pub struct FrostNoncePair {
    pub nonces: SigningNonces,
    pub commitment: SigningCommitments,
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// The FROST identifier of the leaf owner in every signing round.
///
/// # Errors
///
/// Returns [`FrostError::InvalidIdentifier`] if derivation fails.
pub fn user_identifier() -> Result<Identifier, FrostError> {
    derive_identifier(b"user")
}

/// Derive an identifier from a byte string.
///
/// # Errors
///
/// Returns [`FrostError::InvalidIdentifier`] if derivation fails.
pub fn derive_identifier(name: &[u8]) -> Result<Identifier, FrostError> {
    Identifier::derive(name).map_err(|_| FrostError::InvalidIdentifier)
}

/// Parse an identifier from its 32-byte big-endian serialization.
///
/// # Errors
///
/// Returns [`FrostError::InvalidIdentifier`] for a zero or out-of-range value.
pub fn identifier_from_bytes(bytes: &[u8]) -> Result<Identifier, FrostError> {
    Identifier::deserialize(bytes).map_err(|_| FrostError::InvalidIdentifier)
}

fn identifier_scalar(id: &Identifier) -> Result<Scalar, FrostError> {
    scalar_from_bytes(&id.serialize()).map_err(|_| FrostError::InvalidIdentifier)
}

/// Inverse Lagrange weight of `id` within the signing set `signers`.
///
/// Multiplying an additive share by this value before handing it to the
/// engine makes the engine's Lagrange weighting a no-op.
///
/// # Errors
///
/// Returns [`FrostError::InvalidIdentifier`] if `id` is not in `signers` or
/// an identifier cannot be mapped to a scalar.
pub fn additive_scale<'a>(
    id: &Identifier,
    signers: impl IntoIterator<Item = &'a Identifier>,
) -> Result<Scalar, FrostError> {
    let mut xs = Vec::new();
    let mut found = false;
    for signer in signers {
        found |= signer == id;
        xs.push(identifier_scalar(signer)?);
    }
    if !found {
        return Err(FrostError::InvalidIdentifier);
    }
    let x_j = identifier_scalar(id)?;
    let lambda = lagrange_coefficient(&x_j, &xs).map_err(|_| FrostError::InvalidIdentifier)?;
    lambda
        .invert()
        .into_option()
        .ok_or(FrostError::InvalidIdentifier)
}

// ---------------------------------------------------------------------------
// Key conversion
// ---------------------------------------------------------------------------

/// Scale a secret share, returning the engine's signing share and the
/// matching verifying share.
fn scale_secret(
    secret: &SecretKey,
    factor: &Scalar,
) -> Result<(SigningShare, VerifyingShare), FrostError> {
    let s = scalar_from_bytes(&secret.secret_bytes()).map_err(|_| FrostError::InvalidKey)?;
    let scaled = s * factor;
    let bytes: FieldBytes = scaled.to_bytes();
    let signing_share =
        SigningShare::deserialize(bytes.as_slice()).map_err(|_| FrostError::InvalidKey)?;
    let point = AffinePoint::from(ProjectivePoint::GENERATOR * scaled).to_encoded_point(true);
    let verifying_share =
        VerifyingShare::deserialize(point.as_bytes()).map_err(|_| FrostError::InvalidKey)?;
    Ok((signing_share, verifying_share))
}

/// Multiply a public key by a scalar, returning a compressed SEC1 encoding.
///
/// # Errors
///
/// Returns [`FrostError::InvalidKey`] if the key does not parse or the
/// product is the point at infinity.
pub fn scale_public_key(public_key: &PublicKey, factor: &Scalar) -> Result<PublicKey, FrostError> {
    let point = k256::PublicKey::from_sec1_bytes(&public_key.serialize())
        .map_err(|_| FrostError::InvalidKey)?;
    let scaled = point.to_projective() * factor;
    if scaled == ProjectivePoint::IDENTITY {
        return Err(FrostError::InvalidKey);
    }
    let encoded = AffinePoint::from(scaled).to_encoded_point(true);
    PublicKey::from_slice(encoded.as_bytes()).map_err(|_| FrostError::InvalidKey)
}

fn to_verifying_key(key: &PublicKey) -> Result<VerifyingKey, FrostError> {
    VerifyingKey::deserialize(&key.serialize()).map_err(|_| FrostError::InvalidKey)
}

// ---------------------------------------------------------------------------
// Round 1 -- Nonce generation
// ---------------------------------------------------------------------------

/// Generate a fresh nonce pair bound to `signing_key`.
///
/// # Errors
///
/// Returns [`FrostError::InvalidKey`] if the key is not a valid signing share.
pub fn generate_nonces(
    signing_key: &SecretKey,
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<FrostNoncePair, FrostError> {
    let share = SigningShare::deserialize(&signing_key.secret_bytes())
        .map_err(|_| FrostError::InvalidKey)?;
    let (nonces, commitment) = frost_secp256k1_tr::round1::commit(&share, rng);
    Ok(FrostNoncePair { nonces, commitment })
}

// ---------------------------------------------------------------------------
// Round 2 -- Signing
// ---------------------------------------------------------------------------

/// Create a signature share for a participant holding the additive share
/// `signing_key` of the leaf key `verifying_key`.
///
/// `all_commitments` must contain this participant's commitment and those of
/// every other signer in the round.
///
/// # Errors
///
/// Returns [`FrostError::InvalidIdentifier`] if `participant` is not in the
/// signing set, and [`FrostError::SigningFailed`] if the engine rejects the
/// round.
pub fn sign_additive(
    message: &[u8],
    participant: Identifier,
    signing_key: &SecretKey,
    verifying_key: &PublicKey,
    nonces: &SigningNonces,
    all_commitments: &BTreeMap<Identifier, SigningCommitments>,
) -> Result<SignatureShare, FrostError> {
    let scale = additive_scale(&participant, all_commitments.keys())?;
    let (signing_share, verifying_share) = scale_secret(signing_key, &scale)?;

    let key_package = KeyPackage::new(
        participant,
        signing_share,
        verifying_share,
        to_verifying_key(verifying_key)?,
        all_commitments.len() as u16,
    );
    let signing_package = SigningPackage::new(all_commitments.clone(), message);

    frost_secp256k1_tr::round2::sign_with_tweak(
        &signing_package,
        nonces,
        &key_package,
        Some(KEY_PATH_MERKLE_ROOT),
    )
    .map_err(|_| FrostError::SigningFailed)
}

/// Create the leaf owner's signature share.
///
/// # Errors
///
/// See [`sign_additive`].
pub fn sign_as_user(
    message: &[u8],
    signing_key: &SecretKey,
    verifying_key: &PublicKey,
    nonces: &SigningNonces,
    all_commitments: &BTreeMap<Identifier, SigningCommitments>,
) -> Result<SignatureShare, FrostError> {
    sign_additive(
        message,
        user_identifier()?,
        signing_key,
        verifying_key,
        nonces,
        all_commitments,
    )
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Aggregate the owner's and the operators' shares into a 64-byte BIP340
/// signature.
///
/// `operator_verifying_shares` are the operators' scaled verifying shares as
/// reported with their signature shares; the owner's share is derived from
/// `user_public_key` here.
///
/// # Errors
///
/// Returns [`FrostError::AggregationFailed`] if any share is invalid or the
/// final signature does not verify.
pub fn aggregate(
    message: &[u8],
    all_commitments: BTreeMap<Identifier, SigningCommitments>,
    signature_shares: &BTreeMap<Identifier, SignatureShare>,
    operator_verifying_shares: &BTreeMap<Identifier, PublicKey>,
    user_public_key: &PublicKey,
    verifying_key: &PublicKey,
) -> Result<[u8; 64], FrostError> {
    let user_id = user_identifier()?;
    let user_scale = additive_scale(&user_id, all_commitments.keys())?;
    let user_share = scale_public_key(user_public_key, &user_scale)?;

    let mut verifying_shares = BTreeMap::new();
    for (id, pk) in operator_verifying_shares
        .iter()
        .chain(std::iter::once((&user_id, &user_share)))
    {
        let vs = VerifyingShare::deserialize(&pk.serialize())
            .map_err(|_| FrostError::AggregationFailed)?;
        verifying_shares.insert(*id, vs);
    }

    let public_key_package = PublicKeyPackage::new(verifying_shares, to_verifying_key(verifying_key)?);
    let signing_package = SigningPackage::new(all_commitments, message);

    let signature = frost_secp256k1_tr::aggregate_with_tweak(
        &signing_package,
        signature_shares,
        &public_key_package,
        Some(KEY_PATH_MERKLE_ROOT),
    )
    .map_err(|_| FrostError::AggregationFailed)?;

    signature
        .serialize()
        .map_err(|_| FrostError::AggregationFailed)?
        .try_into()
        .map_err(|_| FrostError::AggregationFailed)
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Serialize a signing commitment to bytes.
///
/// # Errors
///
/// Returns [`FrostError::InvalidCommitment`] if serialization fails.
pub fn serialize_commitment(commitment: &SigningCommitments) -> Result<Vec<u8>, FrostError> {
    commitment
        .serialize()
        .map_err(|_| FrostError::InvalidCommitment)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
