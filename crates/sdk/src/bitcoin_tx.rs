//! Bitcoin transaction utilities for leaf operations.
//!
//! Node and refund transaction construction, Taproot key-spend sighashes,
//! and signature attachment. Every leaf output is a P2TR key-path output
//! whose internal key is a plain secp256k1 public key (no script tree).

use bitcoin::consensus::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{schnorr, Message, PublicKey, Secp256k1, Verification, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::{
    absolute, transaction, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors from transaction utilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// Failed to deserialize a raw transaction.
    DeserializeFailed,
    /// Failed to compute sighash.
    SighashFailed,
    /// The transaction is missing required data (input, output, witness).
    MissingData,
    /// A key-spend signature does not verify.
    InvalidSignature,
}

impl core::fmt::Display for TxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DeserializeFailed => write!(f, "transaction deserialization failed"),
            Self::SighashFailed => write!(f, "sighash computation failed"),
            Self::MissingData => write!(f, "transaction missing required data"),
            Self::InvalidSignature => write!(f, "key-spend signature does not verify"),
        }
    }
}

impl std::error::Error for TxError {}

// ---------------------------------------------------------------------------
// Parse / Serialize
// ---------------------------------------------------------------------------

/// Deserialize a Bitcoin transaction from consensus-encoded bytes.
///
/// # Errors
///
/// Returns [`TxError::DeserializeFailed`] if the bytes are not a valid transaction.
pub fn parse_tx(raw: &[u8]) -> Result<Transaction, TxError> {
    deserialize(raw).map_err(|_| TxError::DeserializeFailed)
}

/// Serialize a Bitcoin transaction to consensus-encoded bytes.
pub fn serialize_tx(tx: &Transaction) -> Vec<u8> {
    serialize(tx)
}

/// Sequence of the first input.
///
/// # Errors
///
/// Returns [`TxError::MissingData`] for a transaction without inputs.
pub fn first_input_sequence(tx: &Transaction) -> Result<u32, TxError> {
    tx.input
        .first()
        .map(|input| input.sequence.to_consensus_u32())
        .ok_or(TxError::MissingData)
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// BIP-431 ephemeral anchor: `OP_1 OP_PUSHBYTES_2 0x4e73`.
fn anchor_script() -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0x51, 0x02, 0x4e, 0x73])
}

/// P2TR key-path script paying to `key` with no script tree.
pub fn p2tr_script(key: &PublicKey) -> ScriptBuf {
    let secp = Secp256k1::verification_only();
    ScriptBuf::new_p2tr(&secp, key.x_only_public_key().0, None)
}

/// The BIP341 output key committed to by [`p2tr_script`].
pub fn tweaked_output_key<C: Verification>(secp: &Secp256k1<C>, key: &PublicKey) -> XOnlyPublicKey {
    let (tweaked, _) = key.x_only_public_key().0.tap_tweak(secp, None);
    tweaked.to_inner()
}

/// Extract the x-only output key from a P2TR script.
///
/// Returns `None` if the script is not P2TR.
pub fn xonly_from_p2tr_script(script: &ScriptBuf) -> Option<XOnlyPublicKey> {
    if !script.is_p2tr() {
        return None;
    }
    // OP_1 OP_PUSHBYTES_32 <32-byte x-only key>
    XOnlyPublicKey::from_slice(&script.as_bytes()[2..]).ok()
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

fn single_input_tx(previous_output: OutPoint, sequence: Sequence, output: Vec<TxOut>) -> Transaction {
    Transaction {
        version: transaction::Version::non_standard(3),
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::default(),
        }],
        output,
    }
}

/// Create a node transaction spending `prev` into a leaf output.
///
///   - `output[0]`: P2TR to the leaf's verifying key, carrying `value`
///   - `output[1]`: P2A ephemeral anchor
pub fn create_node_tx(prev: OutPoint, value: Amount, verifying_key: &PublicKey) -> Transaction {
    single_input_tx(
        prev,
        Sequence::MAX,
        vec![
            TxOut {
                value,
                script_pubkey: p2tr_script(verifying_key),
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: anchor_script(),
            },
        ],
    )
}

/// Create a **CPFP** refund transaction (2 outputs: P2TR + P2A anchor).
///
///   - `output[0]`: P2TR to `receiver`
///   - `output[1]`: P2A ephemeral anchor
///
/// The relative timelock lives in the input's `sequence`.
pub fn create_cpfp_refund_tx(
    prev_txid: Txid,
    prev_vout: u32,
    value: Amount,
    sequence: Sequence,
    receiver: &PublicKey,
) -> Transaction {
    single_input_tx(
        OutPoint::new(prev_txid, prev_vout),
        sequence,
        vec![
            TxOut {
                value,
                script_pubkey: p2tr_script(receiver),
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: anchor_script(),
            },
        ],
    )
}

// ---------------------------------------------------------------------------
// Taproot Sighash / Signatures
// ---------------------------------------------------------------------------

/// Compute the BIP341 Taproot key-spend sighash for a transaction input.
///
/// Uses `SIGHASH_DEFAULT`. `prev_outs` must list every output spent by
/// `tx`, in input order.
///
/// # Errors
///
/// Returns [`TxError::SighashFailed`] if sighash computation fails.
pub fn taproot_sighash(
    tx: &Transaction,
    input_idx: usize,
    prev_outs: &[TxOut],
) -> Result<[u8; 32], TxError> {
    let mut cache = SighashCache::new(tx);
    let hash = cache
        .taproot_key_spend_signature_hash(
            input_idx,
            &Prevouts::All(prev_outs),
            TapSighashType::Default,
        )
        .map_err(|_| TxError::SighashFailed)?;
    Ok(hash.to_byte_array())
}

/// Sighash of input 0 of a transaction that spends `prev_tx.output[vout]`.
///
/// # Errors
///
/// Returns [`TxError::MissingData`] if `vout` is out of range.
pub fn spend_sighash(tx: &Transaction, prev_tx: &Transaction, vout: u32) -> Result<[u8; 32], TxError> {
    let prev_out = prev_tx
        .output
        .get(vout as usize)
        .ok_or(TxError::MissingData)?;
    taproot_sighash(tx, 0, std::slice::from_ref(prev_out))
}

/// Returns `tx` with a key-spend witness on input 0.
pub fn with_key_spend_signature(mut tx: Transaction, signature: &[u8; 64]) -> Transaction {
    if let Some(input) = tx.input.first_mut() {
        input.witness = Witness::from_slice(&[signature.as_slice()]);
    }
    tx
}

/// Verifies the key-spend witness on input 0 of `tx` against the leaf key
/// `internal_key` of the spent output.
///
/// # Errors
///
/// Returns [`TxError::MissingData`] if there is no 64-byte witness and
/// [`TxError::InvalidSignature`] if it does not verify.
pub fn verify_key_spend<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    prev_tx: &Transaction,
    vout: u32,
    internal_key: &PublicKey,
) -> Result<(), TxError> {
    let sighash = spend_sighash(tx, prev_tx, vout)?;
    let witness = tx
        .input
        .first()
        .and_then(|input| input.witness.nth(0))
        .ok_or(TxError::MissingData)?;
    let signature = schnorr::Signature::from_slice(witness).map_err(|_| TxError::MissingData)?;
    secp.verify_schnorr(
        &signature,
        &Message::from_digest(sighash),
        &tweaked_output_key(secp, internal_key),
    )
    .map_err(|_| TxError::InvalidSignature)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
