//! Validation of an operator-completed token transaction.
//!
//! The coordinator answers a submitted partial transaction with the final
//! transaction and the keyshare assignment. Before signing the final hash
//! the wallet checks that the operators changed nothing the creator
//! committed to and filled in exactly the fields they are responsible for.

use std::collections::HashSet;
use std::fmt;

use custody_config::NetworkConfig;
use tracing::error;

use super::transaction::{KeyshareInfo, TokenInputs, TokenTransaction};
use crate::utils::hex_decode;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// A failed token transaction check. One variant per check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    /// The transaction has no outputs.
    EmptyOutputs,
    /// An output amount is wider than 16 bytes.
    AmountTooLarge { index: usize },
    NetworkMismatch,
    /// One transaction mints and the other transfers.
    InputTypeMismatch,
    InputCountMismatch,
    IssuerMismatch,
    SpentOutputMismatch { index: usize },
    OutputCountMismatch,
    OwnerMismatch { index: usize },
    TokenMismatch { index: usize },
    AmountMismatch { index: usize },
    MissingOutputId { index: usize },
    MissingRevocationCommitment { index: usize },
    BondMismatch {
        index: usize,
        expected: u64,
        actual: Option<u64>,
    },
    LocktimeMismatch {
        index: usize,
        expected: u64,
        actual: Option<u64>,
    },
    /// The final transaction does not list one key per configured operator.
    OperatorKeyCountMismatch,
    /// An operator key is not one of the configured identity keys.
    UnknownOperatorKey { index: usize },
    DuplicateOperatorKey { index: usize },
    DuplicateKeyshareOperator(String),
    KeyshareOperatorCountMismatch,
    UnknownKeyshareOperator(String),
    ThresholdMismatch,
}

impl fmt::Display for TokenValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyOutputs => write!(f, "transaction has no outputs"),
            Self::AmountTooLarge { index } => {
                write!(f, "output {index}: amount wider than 16 bytes")
            }
            Self::NetworkMismatch => write!(f, "network changed"),
            Self::InputTypeMismatch => write!(f, "input type changed"),
            Self::InputCountMismatch => write!(f, "number of spent outputs changed"),
            Self::IssuerMismatch => write!(f, "mint issuer or timestamp changed"),
            Self::SpentOutputMismatch { index } => write!(f, "spent output {index} changed"),
            Self::OutputCountMismatch => write!(f, "number of outputs changed"),
            Self::OwnerMismatch { index } => write!(f, "output {index}: owner changed"),
            Self::TokenMismatch { index } => write!(f, "output {index}: token changed"),
            Self::AmountMismatch { index } => write!(f, "output {index}: amount changed"),
            Self::MissingOutputId { index } => write!(f, "output {index}: missing id"),
            Self::MissingRevocationCommitment { index } => {
                write!(f, "output {index}: missing revocation commitment")
            }
            Self::BondMismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "output {index}: withdraw bond {actual:?}, expected {expected}"
            ),
            Self::LocktimeMismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "output {index}: withdraw locktime {actual:?}, expected {expected}"
            ),
            Self::OperatorKeyCountMismatch => write!(f, "operator key count mismatch"),
            Self::UnknownOperatorKey { index } => write!(f, "operator key {index} is unknown"),
            Self::DuplicateOperatorKey { index } => {
                write!(f, "operator key {index} repeats an earlier key")
            }
            Self::DuplicateKeyshareOperator(id) => {
                write!(f, "keyshare operator {id} listed twice")
            }
            Self::KeyshareOperatorCountMismatch => write!(f, "keyshare operator count mismatch"),
            Self::UnknownKeyshareOperator(id) => write!(f, "keyshare operator {id} is unknown"),
            Self::ThresholdMismatch => write!(f, "keyshare threshold mismatch"),
        }
    }
}

impl std::error::Error for TokenValidationError {}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check `final_tx` against the `partial_tx` the wallet submitted.
///
/// # Errors
///
/// Returns the first failed check as a [`TokenValidationError`]; the
/// failure is also logged.
pub fn validate_token_transaction(
    final_tx: &TokenTransaction,
    partial_tx: &TokenTransaction,
    signing_operators: &NetworkConfig,
    keyshare_info: &KeyshareInfo,
    expected_withdraw_bond_sats: u64,
    expected_withdraw_relative_block_locktime: u64,
) -> Result<(), TokenValidationError> {
    check(
        final_tx,
        partial_tx,
        signing_operators,
        keyshare_info,
        expected_withdraw_bond_sats,
        expected_withdraw_relative_block_locktime,
    )
    .inspect_err(|e| error!(check = %e, "token transaction rejected"))
}

fn check(
    final_tx: &TokenTransaction,
    partial_tx: &TokenTransaction,
    signing_operators: &NetworkConfig,
    keyshare_info: &KeyshareInfo,
    expected_bond: u64,
    expected_locktime: u64,
) -> Result<(), TokenValidationError> {
    use TokenValidationError as E;

    if final_tx.outputs.is_empty() {
        return Err(E::EmptyOutputs);
    }
    if final_tx.network != partial_tx.network {
        return Err(E::NetworkMismatch);
    }

    match (&final_tx.inputs, &partial_tx.inputs) {
        (
            TokenInputs::Mint {
                issuer_public_key: final_issuer,
                issuer_timestamp: final_ts,
            },
            TokenInputs::Mint {
                issuer_public_key: partial_issuer,
                issuer_timestamp: partial_ts,
            },
        ) => {
            if final_issuer != partial_issuer || final_ts != partial_ts {
                return Err(E::IssuerMismatch);
            }
        }
        (
            TokenInputs::Transfer {
                outputs_to_spend: final_spent,
            },
            TokenInputs::Transfer {
                outputs_to_spend: partial_spent,
            },
        ) => {
            if final_spent.len() != partial_spent.len() {
                return Err(E::InputCountMismatch);
            }
            if let Some(index) = final_spent
                .iter()
                .zip(partial_spent)
                .position(|(a, b)| a != b)
            {
                return Err(E::SpentOutputMismatch { index });
            }
        }
        _ => return Err(E::InputTypeMismatch),
    }

    if final_tx.outputs.len() != partial_tx.outputs.len() {
        return Err(E::OutputCountMismatch);
    }
    for (index, (out, expected)) in final_tx.outputs.iter().zip(&partial_tx.outputs).enumerate() {
        if out.owner_public_key != expected.owner_public_key {
            return Err(E::OwnerMismatch { index });
        }
        if out.token_public_key != expected.token_public_key {
            return Err(E::TokenMismatch { index });
        }
        let amount = out.amount.to_u128().map_err(|_| E::AmountTooLarge { index })?;
        let expected_amount = expected
            .amount
            .to_u128()
            .map_err(|_| E::AmountTooLarge { index })?;
        if amount != expected_amount {
            return Err(E::AmountMismatch { index });
        }
        if out.id.as_deref().map_or(true, str::is_empty) {
            return Err(E::MissingOutputId { index });
        }
        if out.revocation_commitment.is_none() {
            return Err(E::MissingRevocationCommitment { index });
        }
        if out.withdraw_bond_sats != Some(expected_bond) {
            return Err(E::BondMismatch {
                index,
                expected: expected_bond,
                actual: out.withdraw_bond_sats,
            });
        }
        if out.withdraw_relative_block_locktime != Some(expected_locktime) {
            return Err(E::LocktimeMismatch {
                index,
                expected: expected_locktime,
                actual: out.withdraw_relative_block_locktime,
            });
        }
    }

    let operator_keys = &final_tx.operator_identity_public_keys;
    if operator_keys.len() != partial_tx.operator_identity_public_keys.len()
        || operator_keys.len() != signing_operators.num_operators()
    {
        return Err(E::OperatorKeyCountMismatch);
    }
    let mut seen_keys = HashSet::with_capacity(operator_keys.len());
    if let Some(index) = operator_keys
        .iter()
        .position(|key| !seen_keys.insert(key.as_slice()))
    {
        return Err(E::DuplicateOperatorKey { index });
    }
    let configured_keys: HashSet<Vec<u8>> = signing_operators
        .operators()
        .iter()
        .filter_map(|op| hex_decode(&op.identity_public_key))
        .collect();
    if let Some(index) = operator_keys
        .iter()
        .position(|key| !configured_keys.contains(key.as_slice()))
    {
        return Err(E::UnknownOperatorKey { index });
    }

    let mut seen = HashSet::with_capacity(keyshare_info.owner_identifiers.len());
    for id in &keyshare_info.owner_identifiers {
        if !seen.insert(id.as_str()) {
            return Err(E::DuplicateKeyshareOperator(id.clone()));
        }
    }
    if keyshare_info.owner_identifiers.len() != signing_operators.num_operators() {
        return Err(E::KeyshareOperatorCountMismatch);
    }
    if let Some(unknown) = keyshare_info
        .owner_identifiers
        .iter()
        .find(|id| signing_operators.operator(id).is_none())
    {
        return Err(E::UnknownKeyshareOperator(unknown.clone()));
    }
    if keyshare_info.threshold != signing_operators.threshold {
        return Err(E::ThresholdMismatch);
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
