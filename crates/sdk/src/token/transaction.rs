//! Token transaction model.
//!
//! A token transaction either mints new units (signed by the issuer) or
//! spends earlier outputs. Operators complete a creator's partial
//! transaction by assigning output ids, revocation commitments, and
//! withdrawal parameters; see [`super::hash`] for how the two forms are
//! hashed.

use custody_config::constants::MAX_TOKEN_AMOUNT_BYTES;
use custody_config::Network;

use super::validate::TokenValidationError;

/// Compressed secp256k1 key bytes. Token keys are not required to be valid
/// curve points (the burn key is not).
pub type TokenPublicKey = [u8; 33];

/// Owner key that provably nobody controls.
pub const BURN_PUBLIC_KEY: TokenPublicKey = {
    let mut key = [0xFF; 33];
    key[0] = 0x02;
    key
};

// ---------------------------------------------------------------------------
// TokenAmount
// ---------------------------------------------------------------------------

/// A token amount as big-endian bytes, at most 16 wide.
///
/// Amounts arrive from operators as raw bytes, so the width is checked
/// when the value is read rather than at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TokenAmount(Vec<u8>);

impl TokenAmount {
    /// Wraps raw big-endian bytes.
    pub fn from_be_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Left-pads to exactly 16 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TokenValidationError::AmountTooLarge`] (with index 0) if
    /// the amount is wider than 16 bytes.
    pub fn to_padded(&self) -> Result<[u8; MAX_TOKEN_AMOUNT_BYTES], TokenValidationError> {
        if self.0.len() > MAX_TOKEN_AMOUNT_BYTES {
            return Err(TokenValidationError::AmountTooLarge { index: 0 });
        }
        let mut out = [0u8; MAX_TOKEN_AMOUNT_BYTES];
        out[MAX_TOKEN_AMOUNT_BYTES - self.0.len()..].copy_from_slice(&self.0);
        Ok(out)
    }

    /// # Errors
    ///
    /// Returns [`TokenValidationError::AmountTooLarge`] if the amount does
    /// not fit in 16 bytes.
    pub fn to_u128(&self) -> Result<u128, TokenValidationError> {
        Ok(u128::from_be_bytes(self.to_padded()?))
    }
}

impl From<u128> for TokenAmount {
    fn from(value: u128) -> Self {
        Self(value.to_be_bytes().to_vec())
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Reference to an output of an earlier token transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputRef {
    pub prev_token_transaction_hash: [u8; 32],
    pub prev_vout: u32,
}

/// Where the value of a token transaction comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenInputs {
    /// New units created by the issuer.
    Mint {
        issuer_public_key: TokenPublicKey,
        /// UNIX seconds chosen by the issuer; makes repeated mints distinct.
        issuer_timestamp: u64,
    },
    /// Spends earlier outputs.
    Transfer { outputs_to_spend: Vec<OutputRef> },
}

/// One output of a token transaction.
///
/// `id`, `revocation_commitment`, and the withdrawal fields are empty in a
/// creator's partial transaction and filled by the operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOutput {
    pub id: Option<String>,
    pub owner_public_key: TokenPublicKey,
    pub revocation_commitment: Option<[u8; 33]>,
    pub withdraw_bond_sats: Option<u64>,
    pub withdraw_relative_block_locktime: Option<u64>,
    pub token_public_key: TokenPublicKey,
    pub amount: TokenAmount,
}

impl TokenOutput {
    /// A partial output as a transaction creator builds it.
    pub fn new(owner_public_key: TokenPublicKey, token_public_key: TokenPublicKey, amount: u128) -> Self {
        Self {
            id: None,
            owner_public_key,
            revocation_commitment: None,
            withdraw_bond_sats: None,
            withdraw_relative_block_locktime: None,
            token_public_key,
            amount: TokenAmount::from(amount),
        }
    }
}

/// A token transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransaction {
    pub network: Network,
    pub inputs: TokenInputs,
    pub outputs: Vec<TokenOutput>,
    /// Identity keys of the operators expected to sign.
    pub operator_identity_public_keys: Vec<[u8; 33]>,
}

/// Which operators hold the revocation keyshares of a transaction, and
/// how many of them are needed to reveal one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyshareInfo {
    pub owner_identifiers: Vec<String>,
    pub threshold: usize,
}
