//! Seed-backed wallet signer.
//!
//! [`SeedSigner`] derives its identity key and leaf signing branch from a
//! BIP32 seed at construction time and keeps every other secret (random
//! transfer keys, tweaks, decrypted keys) in its [`KeyStore`].

use std::collections::BTreeMap;

use bitcoin::bip32::Xpriv;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::NetworkKind;
use custody_crypto::derivation_path::{self, KeyPurpose};
use custody_crypto::frost::{self, FrostError};
use custody_crypto::verifiable_secret_sharing::{
    self as vss, VerifiableSecretShare, VssError, SECP256K1_ORDER,
};
use custody_crypto::{ecies, secp};
use frost_secp256k1_tr::Identifier;
use rand_core::{CryptoRng, RngCore};

use crate::key_store::KeyStore;
use crate::wallet_signer::{SignatureShare, SigningCommitments, WalletSigner, WalletSignerError};
use crate::{ecdsa, PubKey, Signer};

// ---------------------------------------------------------------------------
// SeedSigner
// ---------------------------------------------------------------------------

/// Wallet signer backed by a BIP32 seed.
///
/// Holds the identity key pair (`m/8797555'/account'/0'`), the leaf signing
/// branch (`m/8797555'/account'/1'`), and the wallet's [`KeyStore`].
pub struct SeedSigner {
    secp: Secp256k1<All>,
    identity_sk: SecretKey,
    identity_pk: PublicKey,
    signing_branch: Xpriv,
    keys: KeyStore,
}

impl SeedSigner {
    /// Creates a signer from a BIP32 seed (typically the 64-byte BIP39 seed).
    ///
    /// # Errors
    ///
    /// Returns [`WalletSignerError::KeyDerivationFailed`] if the seed or
    /// account index cannot be used.
    pub fn from_seed(
        seed: &[u8],
        network: impl Into<NetworkKind>,
        account: u32,
    ) -> Result<Self, WalletSignerError> {
        let secp = Secp256k1::new();
        let network = network.into();

        let identity =
            derivation_path::derive_branch(&secp, seed, network, account, KeyPurpose::Identity)
                .map_err(|_| WalletSignerError::KeyDerivationFailed)?;
        let signing_branch =
            derivation_path::derive_branch(&secp, seed, network, account, KeyPurpose::Signing)
                .map_err(|_| WalletSignerError::KeyDerivationFailed)?;

        let identity_sk = identity.private_key;
        let identity_pk = PublicKey::from_secret_key(&secp, &identity_sk);

        Ok(Self {
            secp,
            identity_sk,
            identity_pk,
            signing_branch,
            keys: KeyStore::new(),
        })
    }

    /// The wallet's key and nonce arena.
    pub fn key_store(&self) -> &KeyStore {
        &self.keys
    }

    fn secret(&self, public: &PublicKey) -> Result<SecretKey, WalletSignerError> {
        self.keys.get(public).ok_or(WalletSignerError::UnknownKey)
    }

    fn store(&self, secret: SecretKey) -> PublicKey {
        let public = PublicKey::from_secret_key(&self.secp, &secret);
        self.keys.insert(&public, secret);
        public
    }
}

fn map_vss(err: VssError) -> WalletSignerError {
    match err {
        VssError::InvalidThreshold { .. } => WalletSignerError::VssInvalidThreshold,
        _ => WalletSignerError::VssScalarOutOfRange,
    }
}

fn map_frost(err: FrostError) -> WalletSignerError {
    match err {
        FrostError::AggregationFailed => WalletSignerError::FrostAggregationFailed,
        _ => WalletSignerError::FrostSigningFailed,
    }
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

impl Signer for SeedSigner {
    fn public_key(&self) -> PubKey {
        self.identity_pk.serialize()
    }

    fn sign_challenge(
        &self,
        challenge_bytes: &[u8],
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let sig = ecdsa::sign_message(&self.secp, &self.identity_sk, challenge_bytes);
        Ok(sig.serialize_der().to_vec())
    }
}

// ---------------------------------------------------------------------------
// WalletSigner
// ---------------------------------------------------------------------------

impl WalletSigner for SeedSigner {
    fn identity_public_key(&self) -> PublicKey {
        self.identity_pk
    }

    fn sign_identity_digest(&self, digest: &[u8; 32]) -> Vec<u8> {
        ecdsa::sign_digest(&self.secp, &self.identity_sk, digest)
            .serialize_der()
            .to_vec()
    }

    fn derive_signing_key(&self, leaf_id: &str) -> Result<PublicKey, WalletSignerError> {
        let sk = derivation_path::derive_leaf_key(&self.secp, &self.signing_branch, leaf_id)
            .map_err(|_| WalletSignerError::KeyDerivationFailed)?;
        Ok(self.store(sk))
    }

    fn generate_public_key(
        &self,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<PublicKey, WalletSignerError> {
        let mut bytes = [0u8; 32];
        let sk = loop {
            rng.fill_bytes(&mut bytes);
            if let Ok(sk) = SecretKey::from_slice(&bytes) {
                break sk;
            }
        };
        Ok(self.store(sk))
    }

    fn subtract_private_keys(
        &self,
        a: &PublicKey,
        b: &PublicKey,
    ) -> Result<PublicKey, WalletSignerError> {
        let diff = secp::subtract_secret_keys(&self.secret(a)?, &self.secret(b)?)
            .map_err(|_| WalletSignerError::KeyArithmeticFailed)?;
        Ok(self.store(diff))
    }

    fn forget_key(&self, key: &PublicKey) {
        self.keys.remove(key);
    }

    fn split_secret_with_proofs(
        &self,
        key: &PublicKey,
        threshold: usize,
        num_shares: usize,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<Vec<VerifiableSecretShare>, WalletSignerError> {
        let secret = self.secret(key)?;
        self.split_bytes_with_proofs(&secret.secret_bytes(), threshold, num_shares, rng)
    }

    fn split_bytes_with_proofs(
        &self,
        secret: &[u8; 32],
        threshold: usize,
        num_shares: usize,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<Vec<VerifiableSecretShare>, WalletSignerError> {
        let scalar = vss::scalar_from_bytes(secret).map_err(map_vss)?;
        vss::split_secret_with_proofs(&scalar, &SECP256K1_ORDER, threshold, num_shares, rng)
            .map_err(map_vss)
    }

    fn encrypt_secret_for(
        &self,
        key: &PublicKey,
        receiver: &PublicKey,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<Vec<u8>, WalletSignerError> {
        let secret = self.secret(key)?;
        ecies::encrypt(&self.secp, receiver, &secret.secret_bytes(), rng)
            .map_err(|_| WalletSignerError::EciesEncryptionFailed)
    }

    fn decrypt_secret(&self, ciphertext: &[u8]) -> Result<PublicKey, WalletSignerError> {
        let plaintext = ecies::decrypt(&self.secp, &self.identity_sk, ciphertext)
            .map_err(|_| WalletSignerError::EciesDecryptionFailed)?;
        let sk =
            SecretKey::from_slice(&plaintext).map_err(|_| WalletSignerError::InvalidDecryptedKey)?;
        Ok(self.store(sk))
    }

    fn frost_commit(
        &self,
        signing_key: &PublicKey,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<SigningCommitments, WalletSignerError> {
        let pair = frost::generate_nonces(&self.secret(signing_key)?, rng).map_err(map_frost)?;
        if !self.keys.store_nonce(&pair.commitment, pair.nonces) {
            return Err(WalletSignerError::FrostSigningFailed);
        }
        Ok(pair.commitment)
    }

    fn discard_nonce(&self, commitment: &SigningCommitments) {
        self.keys.take_nonce(commitment);
    }

    fn frost_sign(
        &self,
        message: &[u8],
        signing_key: &PublicKey,
        verifying_key: &PublicKey,
        user_commitment: &SigningCommitments,
        all_commitments: &BTreeMap<Identifier, SigningCommitments>,
    ) -> Result<SignatureShare, WalletSignerError> {
        let secret = self.secret(signing_key)?;
        let nonces = self
            .keys
            .take_nonce(user_commitment)
            .ok_or(WalletSignerError::NonceNotFound)?;
        frost::sign_as_user(message, &secret, verifying_key, &nonces, all_commitments)
            .map_err(map_frost)
    }

    fn frost_aggregate(
        &self,
        message: &[u8],
        all_commitments: BTreeMap<Identifier, SigningCommitments>,
        signature_shares: &BTreeMap<Identifier, SignatureShare>,
        operator_verifying_shares: &BTreeMap<Identifier, PublicKey>,
        user_public_key: &PublicKey,
        verifying_key: &PublicKey,
    ) -> Result<[u8; 64], WalletSignerError> {
        frost::aggregate(
            message,
            all_commitments,
            signature_shares,
            operator_verifying_shares,
            user_public_key,
            verifying_key,
        )
        .map_err(|_| WalletSignerError::FrostAggregationFailed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
