//! Wallet-scoped arena for secret keys and signing nonces.
//!
//! Secret keys are indexed by their 33-byte compressed public key so that
//! callers only ever pass public keys around. Nonces are indexed by the
//! serialized commitment they were published under and are single-use:
//! [`KeyStore::take_nonce`] removes the entry in the same critical section
//! that reads it, so two rounds can never sign with one nonce.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bitcoin::secp256k1::{PublicKey, SecretKey};
use frost_secp256k1_tr::round1::{SigningCommitments, SigningNonces};

/// Map key for stored secrets.
pub type KeyId = [u8; 33];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Secret keys and outstanding nonces owned by one wallet.
#[derive(Default)]
pub struct KeyStore {
    keys: Mutex<HashMap<KeyId, SecretKey>>,
    nonces: Mutex<HashMap<Vec<u8>, SigningNonces>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `secret` under `public`, replacing any previous entry.
    pub fn insert(&self, public: &PublicKey, secret: SecretKey) {
        lock(&self.keys).insert(public.serialize(), secret);
    }

    /// Returns a copy of the secret for `public`.
    pub fn get(&self, public: &PublicKey) -> Option<SecretKey> {
        lock(&self.keys).get(&public.serialize()).copied()
    }

    /// Removes and returns the secret for `public`.
    pub fn remove(&self, public: &PublicKey) -> Option<SecretKey> {
        lock(&self.keys).remove(&public.serialize())
    }

    pub fn contains(&self, public: &PublicKey) -> bool {
        lock(&self.keys).contains_key(&public.serialize())
    }

    /// Number of stored secret keys.
    pub fn len(&self) -> usize {
        lock(&self.keys).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records the nonces behind a published commitment.
    ///
    /// Returns `false` if the commitment cannot be serialized; the nonces
    /// are dropped in that case.
    pub fn store_nonce(&self, commitment: &SigningCommitments, nonces: SigningNonces) -> bool {
        match commitment.serialize() {
            Ok(key) => {
                lock(&self.nonces).insert(key, nonces);
                true
            }
            Err(_) => false,
        }
    }

    /// Removes and returns the nonces for `commitment`.
    pub fn take_nonce(&self, commitment: &SigningCommitments) -> Option<SigningNonces> {
        let key = commitment.serialize().ok()?;
        lock(&self.nonces).remove(&key)
    }

    /// Number of nonces committed but not yet consumed.
    pub fn pending_nonces(&self) -> usize {
        lock(&self.nonces).len()
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("keys", &self.len())
            .field("nonces", &self.pending_nonces())
            .finish()
    }
}
