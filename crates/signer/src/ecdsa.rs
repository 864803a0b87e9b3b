//! ECDSA over secp256k1 for identity-key statements.
//!
//! Identity signatures cover a SHA-256 digest the caller computes: the
//! transfer package digest, a deposit address, or an auth challenge.
//! Operators may answer with either DER or 64-byte compact encodings;
//! [`parse_signature`] accepts both.

use std::fmt;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey, Signing, Verification};

/// Errors returned by ECDSA operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcdsaError {
    /// The signature does not verify against the key and digest.
    VerificationFailed,
    /// The bytes are neither DER nor a 64-byte compact signature.
    InvalidEncoding,
}

impl fmt::Display for EcdsaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerificationFailed => write!(f, "ECDSA signature verification failed"),
            Self::InvalidEncoding => write!(f, "invalid ECDSA signature encoding"),
        }
    }
}

impl std::error::Error for EcdsaError {}

/// Signs a 32-byte digest.
pub fn sign_digest(secp: &Secp256k1<impl Signing>, secret_key: &SecretKey, digest: &[u8; 32]) -> Signature {
    secp.sign_ecdsa(&Message::from_digest(*digest), secret_key)
}

/// Hashes `message` with SHA-256 and signs the digest.
pub fn sign_message(secp: &Secp256k1<impl Signing>, secret_key: &SecretKey, message: &[u8]) -> Signature {
    sign_digest(secp, secret_key, sha256::Hash::hash(message).as_byte_array())
}

/// Decodes a DER or compact signature.
///
/// # Errors
///
/// Returns [`EcdsaError::InvalidEncoding`] if neither form parses.
pub fn parse_signature(bytes: &[u8]) -> Result<Signature, EcdsaError> {
    if bytes.len() == 64 {
        Signature::from_compact(bytes).map_err(|_| EcdsaError::InvalidEncoding)
    } else {
        Signature::from_der(bytes).map_err(|_| EcdsaError::InvalidEncoding)
    }
}

/// Verifies an encoded signature over a 32-byte digest.
///
/// High-S signatures are normalized before verification.
///
/// # Errors
///
/// Returns [`EcdsaError::InvalidEncoding`] for undecodable bytes and
/// [`EcdsaError::VerificationFailed`] for a signature that does not verify.
pub fn verify_digest(
    secp: &Secp256k1<impl Verification>,
    public_key: &PublicKey,
    digest: &[u8; 32],
    signature: &[u8],
) -> Result<(), EcdsaError> {
    let mut sig = parse_signature(signature)?;
    sig.normalize_s();
    secp.verify_ecdsa(&Message::from_digest(*digest), &sig, public_key)
        .map_err(|_| EcdsaError::VerificationFailed)
}
