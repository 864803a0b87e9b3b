//! Wallet signing capability used by the SDK.
//!
//! [`WalletSigner`] extends [`Signer`](crate::Signer) with every secret-key
//! operation the custody protocol needs. Secret keys never cross this
//! interface: callers name keys by their public key, and the implementation
//! resolves them in its [`KeyStore`](crate::KeyStore). Derived secrets (key
//! tweaks, decrypted transfer keys) are stored the same way and returned as
//! public keys.

use std::collections::BTreeMap;
use std::fmt;

use bitcoin::secp256k1::PublicKey;
use custody_crypto::verifiable_secret_sharing::VerifiableSecretShare;
use frost_secp256k1_tr::Identifier;
use rand_core::{CryptoRng, RngCore};

use crate::Signer;

pub use frost_secp256k1_tr::round1::{SigningCommitments, SigningNonces};
pub use frost_secp256k1_tr::round2::SignatureShare;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors from wallet signing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletSignerError {
    /// No secret is stored for the requested public key.
    UnknownKey,
    /// No unconsumed nonce matches the commitment.
    NonceNotFound,

    /// FROST round 2 rejected the inputs.
    FrostSigningFailed,
    /// FROST aggregation rejected a share or the final signature.
    FrostAggregationFailed,

    /// ECIES encryption failed.
    EciesEncryptionFailed,
    /// ECIES decryption failed (wrong key or tampered ciphertext).
    EciesDecryptionFailed,
    /// A decrypted payload is not a valid secret key.
    InvalidDecryptedKey,

    /// VSS threshold is zero or exceeds the share count.
    VssInvalidThreshold,
    /// VSS secret is not a valid nonzero scalar.
    VssScalarOutOfRange,

    /// Key arithmetic produced zero.
    KeyArithmeticFailed,
    /// BIP32 derivation failed.
    KeyDerivationFailed,
}

impl fmt::Display for WalletSignerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey => write!(f, "no secret stored for public key"),
            Self::NonceNotFound => write!(f, "no nonce stored for commitment"),
            Self::FrostSigningFailed => write!(f, "FROST signing failed"),
            Self::FrostAggregationFailed => write!(f, "FROST aggregation failed"),
            Self::EciesEncryptionFailed => write!(f, "ECIES encryption failed"),
            Self::EciesDecryptionFailed => write!(f, "ECIES decryption failed"),
            Self::InvalidDecryptedKey => write!(f, "decrypted payload is not a secret key"),
            Self::VssInvalidThreshold => write!(f, "invalid VSS threshold"),
            Self::VssScalarOutOfRange => write!(f, "VSS scalar out of range"),
            Self::KeyArithmeticFailed => write!(f, "secret key arithmetic failed"),
            Self::KeyDerivationFailed => write!(f, "key derivation failed"),
        }
    }
}

impl std::error::Error for WalletSignerError {}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Full wallet signing capability.
///
/// Methods take an explicit RNG so tests can drive them deterministically;
/// library callers pass `OsRng`.
pub trait WalletSigner: Signer {
    /// Returns the identity public key.
    fn identity_public_key(&self) -> PublicKey;

    /// ECDSA-signs a 32-byte digest with the identity key, DER-encoded.
    fn sign_identity_digest(&self, digest: &[u8; 32]) -> Vec<u8>;

    // -- Key material -----------------------------------------------------

    /// Derives the deterministic signing key for `leaf_id` and stores it.
    fn derive_signing_key(&self, leaf_id: &str) -> Result<PublicKey, WalletSignerError>;

    /// Generates and stores a fresh random key.
    fn generate_public_key(
        &self,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<PublicKey, WalletSignerError>;

    /// Stores `a - b` and returns its public key.
    fn subtract_private_keys(
        &self,
        a: &PublicKey,
        b: &PublicKey,
    ) -> Result<PublicKey, WalletSignerError>;

    /// Drops the stored secret for `key`. Unknown keys are ignored.
    fn forget_key(&self, key: &PublicKey);

    /// Splits the stored secret for `key` into `num_shares` verifiable shares.
    fn split_secret_with_proofs(
        &self,
        key: &PublicKey,
        threshold: usize,
        num_shares: usize,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<Vec<VerifiableSecretShare>, WalletSignerError>;

    /// Splits arbitrary 32-byte secret material (e.g. a payment preimage).
    fn split_bytes_with_proofs(
        &self,
        secret: &[u8; 32],
        threshold: usize,
        num_shares: usize,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<Vec<VerifiableSecretShare>, WalletSignerError>;

    // -- ECIES ------------------------------------------------------------

    /// Encrypts the stored secret for `key` to `receiver`.
    fn encrypt_secret_for(
        &self,
        key: &PublicKey,
        receiver: &PublicKey,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<Vec<u8>, WalletSignerError>;

    /// Decrypts a secret addressed to the identity key, stores it, and
    /// returns its public key.
    fn decrypt_secret(&self, ciphertext: &[u8]) -> Result<PublicKey, WalletSignerError>;

    // -- FROST --------------------------------------------------------------

    /// Generates nonces bound to `signing_key`, retains them, and returns
    /// the public commitment.
    fn frost_commit(
        &self,
        signing_key: &PublicKey,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<SigningCommitments, WalletSignerError>;

    /// Drops the nonces behind a commitment that will never be signed.
    fn discard_nonce(&self, commitment: &SigningCommitments);

    /// Produces the owner's signature share.
    ///
    /// Consumes the nonce behind `user_commitment`; a second call with the
    /// same commitment fails with [`WalletSignerError::NonceNotFound`].
    fn frost_sign(
        &self,
        message: &[u8],
        signing_key: &PublicKey,
        verifying_key: &PublicKey,
        user_commitment: &SigningCommitments,
        all_commitments: &BTreeMap<Identifier, SigningCommitments>,
    ) -> Result<SignatureShare, WalletSignerError>;

    /// Aggregates the owner's and operators' shares into a BIP340 signature.
    #[allow(clippy::too_many_arguments)]
    fn frost_aggregate(
        &self,
        message: &[u8],
        all_commitments: BTreeMap<Identifier, SigningCommitments>,
        signature_shares: &BTreeMap<Identifier, SignatureShare>,
        operator_verifying_shares: &BTreeMap<Identifier, PublicKey>,
        user_public_key: &PublicKey,
        verifying_key: &PublicKey,
    ) -> Result<[u8; 64], WalletSignerError>;
}
