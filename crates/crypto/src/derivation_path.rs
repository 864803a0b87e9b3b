//! Hierarchical key derivation for wallet keys.
//!
//! All keys live under the hardened purpose `8797555'`:
//!
//! | path | key |
//! |------|-----|
//! | `m/8797555'/account'/0'` | identity |
//! | `m/8797555'/account'/1'` | leaf signing master |
//! | `m/8797555'/account'/1'/leaf'` | per-leaf signing key |
//!
//! The leaf component is `sha256(leaf_id)[..4]` as big-endian, reduced
//! modulo `2^31`.

use std::fmt;

use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{Secp256k1, SecretKey, Signing};
use bitcoin::NetworkKind;

/// Hardened purpose index shared by every wallet key.
pub const PURPOSE: u32 = 8_797_555;

/// Errors returned by key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationError {
    /// The seed cannot produce a BIP32 master key.
    InvalidSeed,
    /// The account index is not below `2^31`.
    InvalidAccount(u32),
    /// BIP32 derivation failed along the path.
    DerivationFailed,
}

impl fmt::Display for DerivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSeed => write!(f, "invalid seed"),
            Self::InvalidAccount(i) => write!(f, "account index {i} out of range"),
            Self::DerivationFailed => write!(f, "key derivation failed"),
        }
    }
}

impl std::error::Error for DerivationError {}

/// Which branch of the account a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    Identity,
    Signing,
}

impl KeyPurpose {
    fn child(self) -> ChildNumber {
        let index = match self {
            Self::Identity => 0,
            Self::Signing => 1,
        };
        ChildNumber::Hardened { index }
    }
}

/// Maps a leaf identifier to its hardened child number.
pub fn leaf_child(leaf_id: &str) -> ChildNumber {
    let hash = sha256::Hash::hash(leaf_id.as_bytes());
    let bytes = hash.as_byte_array();
    let index = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) % 0x8000_0000;
    ChildNumber::Hardened { index }
}

/// Returns the three-segment path `purpose'/account'/kind'`.
///
/// # Errors
///
/// Returns [`DerivationError::InvalidAccount`] for `account >= 2^31`.
pub fn account_path(account: u32, purpose: KeyPurpose) -> Result<[ChildNumber; 3], DerivationError> {
    let account_child =
        ChildNumber::from_hardened_idx(account).map_err(|_| DerivationError::InvalidAccount(account))?;
    Ok([
        ChildNumber::Hardened { index: PURPOSE },
        account_child,
        purpose.child(),
    ])
}

/// Derives the extended key at `m/8797555'/account'/kind'`.
///
/// # Errors
///
/// Returns [`DerivationError::InvalidSeed`] if the seed is unusable, or
/// [`DerivationError::InvalidAccount`] for an out-of-range account.
pub fn derive_branch<C: Signing>(
    secp: &Secp256k1<C>,
    seed: &[u8],
    network: NetworkKind,
    account: u32,
    purpose: KeyPurpose,
) -> Result<Xpriv, DerivationError> {
    let master = Xpriv::new_master(network, seed).map_err(|_| DerivationError::InvalidSeed)?;
    master
        .derive_priv(secp, &account_path(account, purpose)?)
        .map_err(|_| DerivationError::DerivationFailed)
}

/// Derives the per-leaf signing key below a signing branch.
///
/// # Errors
///
/// Returns [`DerivationError::DerivationFailed`] if BIP32 derivation fails.
pub fn derive_leaf_key<C: Signing>(
    secp: &Secp256k1<C>,
    signing_branch: &Xpriv,
    leaf_id: &str,
) -> Result<SecretKey, DerivationError> {
    signing_branch
        .derive_priv(secp, &[leaf_child(leaf_id)])
        .map(|xpriv| xpriv.private_key)
        .map_err(|_| DerivationError::DerivationFailed)
}
