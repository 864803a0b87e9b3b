//! Canonical token transaction hash.
//!
//! Every operator and every client must derive the same 32-byte digest for
//! the same transaction, so the encoding is fixed field by field. The digest
//! is SHA-256 over a concatenation of per-component SHA-256 sub-hashes:
//!
//! | Component      | Sub-hash input                                             |
//! |----------------|------------------------------------------------------------|
//! | mint input     | `issuer_pk ‖ timestamp (u64 LE)`                           |
//! | spent output   | `prev_tx_hash ‖ prev_vout (u32 BE)`, one per output        |
//! | output         | `[id] ‖ owner ‖ [revocation ‖ bond BE ‖ locktime BE] ‖ token_pk ‖ amount (16 B)` |
//! | operator key   | `key`, one per key, keys sorted byte-wise                  |
//! | network        | `network (u32 BE)`                                         |
//!
//! Bracketed fields are operator-assigned and omitted from the *partial*
//! hash. The creator signs the partial hash when submitting; once the
//! operators have filled in the remaining fields, the *final* hash is what
//! gets signed for the transaction to take effect.

use bitcoin::hashes::{sha256, Hash, HashEngine};

use super::transaction::{TokenInputs, TokenOutput, TokenTransaction};
use super::validate::TokenValidationError;

fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    for part in parts {
        engine.input(part);
    }
    sha256::Hash::from_engine(engine).to_byte_array()
}

fn hash_output(
    index: usize,
    output: &TokenOutput,
    partial: bool,
) -> Result<[u8; 32], TokenValidationError> {
    let amount = output
        .amount
        .to_padded()
        .map_err(|_| TokenValidationError::AmountTooLarge { index })?;

    let mut engine = sha256::Hash::engine();
    if !partial {
        if let Some(id) = &output.id {
            engine.input(id.as_bytes());
        }
    }
    engine.input(&output.owner_public_key);
    if !partial {
        if let Some(revocation) = &output.revocation_commitment {
            engine.input(revocation);
        }
        if let Some(bond) = output.withdraw_bond_sats {
            engine.input(&bond.to_be_bytes());
        }
        if let Some(locktime) = output.withdraw_relative_block_locktime {
            engine.input(&locktime.to_be_bytes());
        }
    }
    engine.input(&output.token_public_key);
    engine.input(&amount);
    Ok(sha256::Hash::from_engine(engine).to_byte_array())
}

/// Compute the canonical hash of `tx`.
///
/// With `partial` set, operator-assigned output fields are left out.
///
/// # Errors
///
/// Returns [`TokenValidationError::EmptyOutputs`] for a transaction without
/// outputs and [`TokenValidationError::AmountTooLarge`] for an amount wider
/// than 16 bytes.
pub fn hash_token_transaction(
    tx: &TokenTransaction,
    partial: bool,
) -> Result<[u8; 32], TokenValidationError> {
    if tx.outputs.is_empty() {
        return Err(TokenValidationError::EmptyOutputs);
    }

    let mut sub_hashes: Vec<[u8; 32]> = Vec::new();

    match &tx.inputs {
        TokenInputs::Mint {
            issuer_public_key,
            issuer_timestamp,
        } => sub_hashes.push(sha256_parts(&[
            issuer_public_key.as_slice(),
            &issuer_timestamp.to_le_bytes(),
        ])),
        TokenInputs::Transfer { outputs_to_spend } => {
            for spent in outputs_to_spend {
                sub_hashes.push(sha256_parts(&[
                    spent.prev_token_transaction_hash.as_slice(),
                    &spent.prev_vout.to_be_bytes(),
                ]));
            }
        }
    }

    for (index, output) in tx.outputs.iter().enumerate() {
        sub_hashes.push(hash_output(index, output, partial)?);
    }

    let mut operator_keys = tx.operator_identity_public_keys.clone();
    operator_keys.sort_unstable();
    for key in &operator_keys {
        sub_hashes.push(sha256_parts(&[key.as_slice()]));
    }

    sub_hashes.push(sha256_parts(&[&tx.network.wire_value().to_be_bytes()]));

    let mut engine = sha256::Hash::engine();
    for sub_hash in &sub_hashes {
        engine.input(sub_hash);
    }
    Ok(sha256::Hash::from_engine(engine).to_byte_array())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
