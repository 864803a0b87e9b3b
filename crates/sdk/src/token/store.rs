//! Token store trait and owned output types.

use super::transaction::TokenPublicKey;
use crate::SdkError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Unique identifier for a token output lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(pub u64);

/// A token output owned by this wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedTokenOutput {
    /// Operator-assigned output ID.
    pub id: String,

    /// Owner's identity public key (33 bytes, compressed).
    pub owner_public_key: TokenPublicKey,

    /// Issuer key identifying the token.
    pub token_public_key: TokenPublicKey,

    pub amount: u128,

    /// Final hash of the transaction that created this output.
    pub previous_transaction_hash: [u8; 32],

    /// Output index in the creating transaction.
    pub previous_transaction_vout: u32,

    pub withdraw_bond_sats: u64,

    pub withdraw_relative_block_locktime: u64,
}

/// A set of acquired (locked) token outputs.
#[derive(Debug)]
pub struct AcquiredOutputs {
    /// Lock identifier (used to release or spend).
    pub lock_id: LockId,

    /// The locked outputs.
    pub outputs: Vec<OwnedTokenOutput>,

    /// Total amount of the locked outputs.
    pub total_amount: u128,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Storage for the wallet's token outputs.
///
/// Acquired outputs are excluded from balance and selection until the lock
/// is released (the transaction failed) or spent (it succeeded).
pub trait TokenStore: Send + Sync {
    /// Replace all outputs for the tokens present in `outputs` with the
    /// operators' view.
    fn set_outputs(&self, outputs: &[OwnedTokenOutput]) -> Result<(), SdkError>;

    /// Add outputs created by a transaction this wallet completed.
    fn insert_outputs(&self, outputs: &[OwnedTokenOutput]) -> Result<(), SdkError>;

    /// Select and lock outputs of `token_public_key` covering `amount`.
    ///
    /// Returns [`SdkError::InsufficientTokenBalance`] if the unlocked
    /// outputs cannot cover the requested amount.
    fn acquire_outputs(
        &self,
        token_public_key: &TokenPublicKey,
        amount: u128,
    ) -> Result<AcquiredOutputs, SdkError>;

    /// Release a lock, returning its outputs to available.
    fn release_outputs(&self, lock_id: LockId) -> Result<(), SdkError>;

    /// Remove the outputs held by a lock; they have been spent.
    fn spend_outputs(&self, lock_id: LockId) -> Result<(), SdkError>;

    /// Available (unlocked) balance of a token.
    fn get_balance(&self, token_public_key: &TokenPublicKey) -> Result<u128, SdkError>;

    /// Every token with at least one known output.
    fn list_tokens(&self) -> Result<Vec<TokenPublicKey>, SdkError>;
}
