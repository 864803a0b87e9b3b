//! secp256k1 ECIES used to hand intermediate leaf keys to a transfer receiver.
//!
//! Ciphertext layout: `ephemeral_pk(65, uncompressed) || nonce(16) || tag(16) || body`.
//! The symmetric key is HKDF-SHA256 (zero salt, empty info) over
//! `ephemeral_pk || shared_point`, both uncompressed, and the body is
//! AES-256-GCM with a 16-byte nonce.

use std::fmt;

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, KeyInit};
use bitcoin::hashes::{hmac, sha256, Hash, HashEngine};
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey, Signing, Verification};
use rand_core::{CryptoRng, RngCore};

type Aes256Gcm16 = AesGcm<Aes256, U16>;

const KEY_SIZE: usize = 65;
const NONCE_SIZE: usize = 16;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = KEY_SIZE + NONCE_SIZE + TAG_SIZE;

/// Errors returned by ECIES operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EciesError {
    /// The receiver public key is not a valid point.
    InvalidPublicKey,
    /// The ciphertext is shorter than its fixed header.
    Truncated { len: usize },
    /// AES-GCM rejected the symmetric key or failed to seal.
    EncryptionFailed,
    /// Authentication failed: wrong key or tampered ciphertext.
    DecryptionFailed,
}

impl fmt::Display for EciesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPublicKey => write!(f, "invalid public key"),
            Self::Truncated { len } => {
                write!(f, "ciphertext of {len} bytes is shorter than the {HEADER_SIZE}-byte header")
            }
            Self::EncryptionFailed => write!(f, "encryption failed"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for EciesError {}

fn hkdf_sha256(ikm: &[u8]) -> [u8; 32] {
    let mut extract = hmac::HmacEngine::<sha256::Hash>::new(&[0u8; 32]);
    extract.input(ikm);
    let prk = hmac::Hmac::from_engine(extract);

    // a single expand block covers the 32-byte output
    let mut expand = hmac::HmacEngine::<sha256::Hash>::new(prk.as_byte_array());
    expand.input(&[1u8]);
    hmac::Hmac::<sha256::Hash>::from_engine(expand).to_byte_array()
}

fn shared_key<C: Verification>(
    secp: &Secp256k1<C>,
    ephemeral_pk: &PublicKey,
    point: &PublicKey,
    secret: &SecretKey,
) -> Result<[u8; 32], EciesError> {
    let shared = point
        .mul_tweak(secp, &Scalar::from(*secret))
        .map_err(|_| EciesError::InvalidPublicKey)?;
    let mut ikm = [0u8; KEY_SIZE * 2];
    ikm[..KEY_SIZE].copy_from_slice(&ephemeral_pk.serialize_uncompressed());
    ikm[KEY_SIZE..].copy_from_slice(&shared.serialize_uncompressed());
    Ok(hkdf_sha256(&ikm))
}

fn cipher(key: &[u8; 32]) -> Result<Aes256Gcm16, EciesError> {
    Aes256Gcm16::new_from_slice(key).map_err(|_| EciesError::EncryptionFailed)
}

/// Encrypts `msg` to `receiver`.
///
/// # Errors
///
/// Returns [`EciesError::EncryptionFailed`] if sealing fails.
#[allow(deprecated)]
pub fn encrypt<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    receiver: &PublicKey,
    msg: &[u8],
    rng: &mut (impl CryptoRng + RngCore),
) -> Result<Vec<u8>, EciesError> {
    let ephemeral_sk = loop {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        if let Ok(sk) = SecretKey::from_slice(&bytes) {
            break sk;
        }
    };
    let ephemeral_pk = PublicKey::from_secret_key(secp, &ephemeral_sk);
    let key = shared_key(secp, &ephemeral_pk, receiver, &ephemeral_sk)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    let mut out = Vec::with_capacity(HEADER_SIZE + msg.len());
    out.extend_from_slice(&ephemeral_pk.serialize_uncompressed());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&[0u8; TAG_SIZE]);
    out.extend_from_slice(msg);

    let tag = cipher(&key)?
        .encrypt_in_place_detached((&nonce).into(), &[], &mut out[HEADER_SIZE..])
        .map_err(|_| EciesError::EncryptionFailed)?;
    out[KEY_SIZE + NONCE_SIZE..HEADER_SIZE].copy_from_slice(tag.as_slice());
    Ok(out)
}

/// Decrypts a ciphertext produced by [`encrypt`] for `receiver_sk`.
///
/// # Errors
///
/// Returns [`EciesError::Truncated`] for a short input and
/// [`EciesError::DecryptionFailed`] when authentication fails.
#[allow(deprecated)]
pub fn decrypt<C: Verification>(
    secp: &Secp256k1<C>,
    receiver_sk: &SecretKey,
    ciphertext: &[u8],
) -> Result<Vec<u8>, EciesError> {
    if ciphertext.len() < HEADER_SIZE {
        return Err(EciesError::Truncated {
            len: ciphertext.len(),
        });
    }
    let (ephemeral, rest) = ciphertext.split_at(KEY_SIZE);
    let (nonce, rest) = rest.split_at(NONCE_SIZE);
    let (tag, body) = rest.split_at(TAG_SIZE);

    let ephemeral_pk = PublicKey::from_slice(ephemeral).map_err(|_| EciesError::DecryptionFailed)?;
    let key = shared_key(secp, &ephemeral_pk, &ephemeral_pk, receiver_sk)?;

    let mut plaintext = body.to_vec();
    cipher(&key)?
        .decrypt_in_place_detached(nonce.into(), &[], &mut plaintext, tag.into())
        .map_err(|_| EciesError::DecryptionFailed)?;
    Ok(plaintext)
}
