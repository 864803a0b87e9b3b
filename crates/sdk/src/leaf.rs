//! Leaf custody model.
//!
//! A leaf is a Bitcoin output locked to `Y = Y_owner + Y_operators`, with a
//! pre-signed refund transaction that returns its value to the owner after
//! a relative timelock. Every change of owner re-signs the refund with a
//! smaller timelock, so the newest owner's refund always confirms first:
//!
//! ```text
//! sequence = SEQUENCE_FLAG | timelock     (timelock in the low 16 bits)
//! 2000 -> 1900 -> ... -> 100 -> exhausted
//! ```

use std::fmt;

use bitcoin::secp256k1::PublicKey;
use bitcoin::Transaction;
use custody_config::constants::{INITIAL_TIMELOCK, SEQUENCE_FLAG, TIMELOCK_INTERVAL, TIMELOCK_MASK};

use crate::bitcoin_tx::{first_input_sequence, parse_tx};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors from leaf invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafError {
    /// The refund timelock cannot be decremented again.
    TimelockExhausted { timelock: u32 },
    /// The refund transaction is missing or malformed.
    InvalidRefundTx,
    /// The node transaction is missing or malformed.
    InvalidNodeTx,
    /// A re-key attempted to change the verifying key.
    VerifyingKeyChanged,
}

impl fmt::Display for LeafError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimelockExhausted { timelock } => {
                write!(f, "refund timelock {timelock} cannot be decremented")
            }
            Self::InvalidRefundTx => write!(f, "invalid refund transaction"),
            Self::InvalidNodeTx => write!(f, "invalid node transaction"),
            Self::VerifyingKeyChanged => write!(f, "verifying key must not change"),
        }
    }
}

impl std::error::Error for LeafError {}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

/// Sequence of the first refund of a new leaf.
pub const fn initial_sequence() -> u32 {
    SEQUENCE_FLAG | INITIAL_TIMELOCK as u32
}

/// Sequence for the next refund re-signature.
///
/// Decrements the timelock field by [`TIMELOCK_INTERVAL`] and keeps the
/// flag bits.
///
/// # Errors
///
/// Returns [`LeafError::TimelockExhausted`] if the result would be zero.
pub fn next_refund_sequence(current_sequence: u32) -> Result<u32, LeafError> {
    let timelock = current_sequence & TIMELOCK_MASK;
    let interval = u32::from(TIMELOCK_INTERVAL);
    if timelock <= interval {
        return Err(LeafError::TimelockExhausted { timelock });
    }
    Ok((current_sequence & !TIMELOCK_MASK) | (timelock - interval))
}

// ---------------------------------------------------------------------------
// Leaf
// ---------------------------------------------------------------------------

/// Lifecycle of a leaf in the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeafStatus {
    /// Spendable and selectable.
    Available,
    /// Part of an outgoing transfer; excluded from selection.
    TransferLocked,
    /// Ownership has moved on.
    Spent,
}

/// A value unit held jointly by the owner and the operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub id: String,
    pub tree_id: String,
    /// Value in satoshis.
    pub value: u64,
    /// Serialized node transaction holding the leaf output.
    pub node_tx: Vec<u8>,
    /// Serialized, signed refund transaction.
    pub refund_tx: Vec<u8>,
    /// Aggregate key `Y`. Fixed for the lifetime of the leaf.
    pub verifying_public_key: PublicKey,
    /// The owner's share of `Y`.
    pub signing_public_key: PublicKey,
    pub owner_identity_public_key: PublicKey,
    /// Output index of the leaf in `node_tx`.
    pub vout: u32,
    pub status: LeafStatus,
}

impl Leaf {
    /// Sequence of the current refund input.
    ///
    /// # Errors
    ///
    /// Returns [`LeafError::InvalidRefundTx`] if the refund does not parse.
    pub fn refund_sequence(&self) -> Result<u32, LeafError> {
        let tx = parse_tx(&self.refund_tx).map_err(|_| LeafError::InvalidRefundTx)?;
        first_input_sequence(&tx).map_err(|_| LeafError::InvalidRefundTx)
    }

    /// The parsed node transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LeafError::InvalidNodeTx`] if it does not parse.
    pub fn parsed_node_tx(&self) -> Result<Transaction, LeafError> {
        parse_tx(&self.node_tx).map_err(|_| LeafError::InvalidNodeTx)
    }

    /// The relative timelock of the current refund, in blocks.
    ///
    /// # Errors
    ///
    /// Returns [`LeafError::InvalidRefundTx`] if the refund does not parse.
    pub fn refund_timelock(&self) -> Result<u32, LeafError> {
        Ok(self.refund_sequence()? & TIMELOCK_MASK)
    }

    /// Returns a copy owned by `signing_public_key`.
    ///
    /// `verifying_public_key` is the key the operators report for the
    /// re-keyed leaf; it must equal the current one.
    ///
    /// # Errors
    ///
    /// Returns [`LeafError::VerifyingKeyChanged`] if the keys differ.
    pub fn rekey(
        &self,
        signing_public_key: PublicKey,
        verifying_public_key: &PublicKey,
    ) -> Result<Leaf, LeafError> {
        if *verifying_public_key != self.verifying_public_key {
            return Err(LeafError::VerifyingKeyChanged);
        }
        Ok(Leaf {
            signing_public_key,
            ..self.clone()
        })
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
