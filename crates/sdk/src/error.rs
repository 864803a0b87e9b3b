//! SDK error types.
//!
//! [`SdkError`] is the unified error type for all wallet operations.
//! Lower-layer errors convert into it with `From`; quorum failures are
//! collected into a [`QuorumError`] once, at the fan-out boundary.

use std::fmt;

use custody_crypto::verifiable_secret_sharing::VssError;
use custody_signer::WalletSignerError;

use crate::leaf::LeafError;
use crate::token::TokenValidationError;
use crate::transfer::TransferStatus;

// ---------------------------------------------------------------------------
// QuorumError
// ---------------------------------------------------------------------------

/// Fewer operators than required answered a fan-out successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumError {
    /// Successful responses needed.
    pub required: usize,
    /// Successful responses received before the fan-out was exhausted.
    pub succeeded: usize,
    /// Per-operator failures, in completion order.
    pub failures: Vec<(String, SdkError)>,
}

impl fmt::Display for QuorumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "quorum not reached: {} of {} required operators succeeded",
            self.succeeded, self.required
        )?;
        for (operator, err) in &self.failures {
            write!(f, "; {operator}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for QuorumError {}

// ---------------------------------------------------------------------------
// SdkError
// ---------------------------------------------------------------------------

/// Errors from SDK operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    // -- Validation -------------------------------------------------------
    /// A token transaction failed validation.
    Token(TokenValidationError),
    /// A decrypted transfer key does not match the key the sender claimed.
    KeyMismatch { transfer_id: String, leaf_id: String },
    /// Operators reported a different verifying key than expected.
    VerifyingKeyMismatch { leaf_id: String },
    /// A deposit address failed one of its checks.
    InvalidDepositAddress { reason: String },
    /// An operator returned a malformed or inconsistent response.
    InvalidOperatorResponse { operator: String, reason: String },

    // -- Quorum -----------------------------------------------------------
    /// A fan-out did not collect enough successful responses.
    Quorum(QuorumError),
    /// Fewer operator signature shares than the threshold.
    QuorumNotMet { required: usize, got: usize },

    // -- State ------------------------------------------------------------
    /// The sender's key tweak has already been applied; the transfer can
    /// no longer be cancelled.
    TransferAlreadyTweaked { transfer_id: String },
    /// The transfer cannot move between these states.
    InvalidTransferState {
        transfer_id: String,
        from: TransferStatus,
        to: TransferStatus,
    },
    /// A leaf-level invariant failed.
    Leaf { leaf_id: String, source: LeafError },
    /// Only the sender may perform this operation.
    NotTransferSender,

    // -- Crypto -----------------------------------------------------------
    /// No unconsumed nonce matches the signing commitment.
    NonceNotFound,
    /// The signature engine rejected the aggregated signature.
    AggregationFailed { leaf_id: String },
    /// A verifiable secret share did not validate.
    InvalidShare(VssError),
    /// A signature did not verify.
    InvalidSignature { context: &'static str },
    /// The wallet signer failed.
    Signing(WalletSignerError),

    // -- Infrastructure ---------------------------------------------------
    /// The wallet has been shut down (cancellation token fired).
    Cancelled,
    /// A call to an operator failed.
    Transport { operator: String, reason: String },
    /// The challenge/verify handshake failed.
    AuthFailed,
    /// Not enough available leaves to satisfy the request.
    InsufficientBalance,
    /// Not enough token outputs to satisfy the request.
    InsufficientTokenBalance,
    /// No leaf with this id is known.
    LeafNotFound(String),
    /// The token output lock was not found or already released.
    LockNotFound,
    /// The request parameters are invalid.
    InvalidRequest(String),
}

impl SdkError {
    /// Whether a fresh attempt with new nonces and shares may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Quorum(_)
                | Self::QuorumNotMet { .. }
                | Self::Transport { .. }
                | Self::InvalidOperatorResponse { .. }
        )
    }

    pub(crate) fn operator_response(operator: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOperatorResponse {
            operator: operator.to_owned(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SdkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(e) => write!(f, "token transaction invalid: {e}"),
            Self::KeyMismatch {
                transfer_id,
                leaf_id,
            } => write!(
                f,
                "transfer {transfer_id}: decrypted key for leaf {leaf_id} does not match"
            ),
            Self::VerifyingKeyMismatch { leaf_id } => {
                write!(f, "verifying key mismatch for leaf {leaf_id}")
            }
            Self::InvalidDepositAddress { reason } => {
                write!(f, "invalid deposit address: {reason}")
            }
            Self::InvalidOperatorResponse { operator, reason } => {
                write!(f, "invalid response from operator {operator}: {reason}")
            }
            Self::Quorum(e) => write!(f, "{e}"),
            Self::QuorumNotMet { required, got } => {
                write!(f, "quorum not met: {got} of {required} signature shares")
            }
            Self::TransferAlreadyTweaked { transfer_id } => {
                write!(f, "transfer {transfer_id} already key-tweaked")
            }
            Self::InvalidTransferState {
                transfer_id,
                from,
                to,
            } => write!(f, "transfer {transfer_id} cannot move from {from} to {to}"),
            Self::Leaf { leaf_id, source } => write!(f, "leaf {leaf_id}: {source}"),
            Self::NotTransferSender => write!(f, "wallet is not the transfer sender"),
            Self::NonceNotFound => write!(f, "signing nonce not found"),
            Self::AggregationFailed { leaf_id } => {
                write!(f, "signature aggregation failed for leaf {leaf_id}")
            }
            Self::InvalidShare(e) => write!(f, "invalid secret share: {e}"),
            Self::InvalidSignature { context } => write!(f, "invalid signature: {context}"),
            Self::Signing(e) => write!(f, "signing failed: {e}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Transport { operator, reason } => {
                write!(f, "operator {operator} call failed: {reason}")
            }
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::InsufficientBalance => write!(f, "insufficient balance"),
            Self::InsufficientTokenBalance => write!(f, "insufficient token balance"),
            Self::LeafNotFound(id) => write!(f, "leaf {id} not found"),
            Self::LockNotFound => write!(f, "lock not found"),
            Self::InvalidRequest(reason) => write!(f, "invalid request: {reason}"),
        }
    }
}

impl std::error::Error for SdkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Token(e) => Some(e),
            Self::Quorum(e) => Some(e),
            Self::Leaf { source, .. } => Some(source),
            Self::InvalidShare(e) => Some(e),
            Self::Signing(e) => Some(e),
            _ => None,
        }
    }
}

impl From<QuorumError> for SdkError {
    fn from(e: QuorumError) -> Self {
        Self::Quorum(e)
    }
}

impl From<TokenValidationError> for SdkError {
    fn from(e: TokenValidationError) -> Self {
        Self::Token(e)
    }
}

impl From<VssError> for SdkError {
    fn from(e: VssError) -> Self {
        Self::InvalidShare(e)
    }
}

impl From<WalletSignerError> for SdkError {
    fn from(e: WalletSignerError) -> Self {
        match e {
            WalletSignerError::NonceNotFound => Self::NonceNotFound,
            other => Self::Signing(other),
        }
    }
}
