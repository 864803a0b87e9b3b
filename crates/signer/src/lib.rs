//! Signing abstractions for the leaf custody client.
//!
//! - [`Signer`] -- identity-key authentication signing
//! - [`WalletSigner`] -- every secret-key operation the custody protocol
//!   needs (FROST rounds, ECIES, VSS, key tweaks), addressed by public key
//! - [`KeyStore`] -- the per-wallet arena of secret keys and nonces
//! - [`SeedSigner`] -- the BIP32 seed-backed implementation
//! - [`ecdsa`] -- ECDSA helpers for identity statements
//!
//! The SDK reaches secret material only through [`WalletSigner`], so a
//! hardware-backed implementation can replace [`SeedSigner`] without
//! touching protocol code.

pub mod ecdsa;
pub mod key_store;
pub mod wallet;
pub mod wallet_signer;

pub use key_store::KeyStore;
pub use wallet::SeedSigner;
pub use wallet_signer::{
    SignatureShare, SigningCommitments, SigningNonces, WalletSigner, WalletSignerError,
};

pub use custody_crypto::verifiable_secret_sharing::VerifiableSecretShare;
pub use frost_secp256k1_tr::Identifier as FrostIdentifier;

/// Compressed secp256k1 public key (33 bytes).
pub type PubKey = [u8; 33];

/// Authentication signing with the wallet identity key.
pub trait Signer: Send + Sync {
    /// Returns the compressed identity public key.
    fn public_key(&self) -> PubKey;

    /// Signs an operator-issued challenge.
    ///
    /// SHA-256 hashes `challenge_bytes`, ECDSA-signs the digest, and returns
    /// the DER encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the key backend cannot sign.
    fn sign_challenge(
        &self,
        challenge_bytes: &[u8],
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
}
