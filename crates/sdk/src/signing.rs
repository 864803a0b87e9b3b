//! Signing round coordination.
//!
//! A leaf transaction is signed jointly by the owner and a threshold of
//! operators. The owner commits to a nonce pair (kept in the signer's key
//! store), the operators return their commitments and shares, and the
//! owner either aggregates everything into a BIP340 signature
//! ([`SigningCoordinator::sign_and_aggregate`]) or hands only its own share
//! to the coordinating operator ([`SigningCoordinator::sign_share`]).
//!
//! Nonces are single-use. Producing a share consumes the nonce behind the
//! owner's commitment, even if aggregation fails afterwards.

use std::collections::BTreeMap;

use bitcoin::secp256k1::PublicKey;
use custody_crypto::frost::user_identifier;
use custody_signer::{SignatureShare, SigningCommitments, WalletSigner, WalletSignerError};
use frost_secp256k1_tr::Identifier;
use rand_core::OsRng;
use tracing::error;

use crate::operator::OperatorSigningResult;
use crate::SdkError;

/// One transaction for the owner to sign.
#[derive(Debug, Clone)]
pub struct SigningJob {
    /// Leaf the transaction belongs to, for error reporting.
    pub leaf_id: String,
    /// Sighash of the transaction input.
    pub message: [u8; 32],
    /// The owner's key share.
    pub signing_public_key: PublicKey,
    /// The leaf key `Y` the signature must verify under.
    pub verifying_public_key: PublicKey,
    pub user_commitment: SigningCommitments,
}

/// Drives the owner's side of signing rounds.
pub struct SigningCoordinator<'a, W> {
    signer: &'a W,
    threshold: usize,
}

impl<'a, W: WalletSigner> SigningCoordinator<'a, W> {
    pub fn new(signer: &'a W, threshold: usize) -> Self {
        Self { signer, threshold }
    }

    /// Commits to a fresh nonce pair for `signing_public_key`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Signing`] if the key is unknown to the signer.
    pub fn commit(&self, signing_public_key: &PublicKey) -> Result<SigningCommitments, SdkError> {
        Ok(self.signer.frost_commit(signing_public_key, &mut OsRng)?)
    }

    /// Drops the nonces behind commitments a failed round never signed.
    /// Commitments whose nonce was already consumed are skipped.
    pub fn discard<'c>(&self, commitments: impl IntoIterator<Item = &'c SigningCommitments>) {
        for commitment in commitments {
            self.signer.discard_nonce(commitment);
        }
    }

    /// Produces only the owner's share, for an operator to aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::NonceNotFound`] if the commitment's nonce was
    /// already consumed, and [`SdkError::Signing`] if signing fails.
    pub fn sign_share(
        &self,
        job: &SigningJob,
        operator_commitments: &BTreeMap<Identifier, SigningCommitments>,
    ) -> Result<SignatureShare, SdkError> {
        let all_commitments = with_user_commitment(operator_commitments, job)?;
        self.user_share(job, &all_commitments)
    }

    /// Produces the owner's share and aggregates it with the operators'.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::QuorumNotMet`] if fewer than the threshold of
    /// operator shares are present, [`SdkError::NonceNotFound`] if the
    /// nonce was already consumed, and [`SdkError::AggregationFailed`] if
    /// the engine rejects the result.
    pub fn sign_and_aggregate(
        &self,
        job: &SigningJob,
        operators: &OperatorSigningResult,
    ) -> Result<[u8; 64], SdkError> {
        let got = operators.signature_shares.len();
        if got < self.threshold {
            error!(leaf_id = %job.leaf_id, required = self.threshold, got, "not enough operator shares");
            return Err(SdkError::QuorumNotMet {
                required: self.threshold,
                got,
            });
        }

        let all_commitments = with_user_commitment(&operators.commitments, job)?;
        let user_share = self.user_share(job, &all_commitments)?;

        let mut shares = operators.signature_shares.clone();
        shares.insert(user_id()?, user_share);

        self.signer
            .frost_aggregate(
                &job.message,
                all_commitments,
                &shares,
                &operators.verifying_shares,
                &job.signing_public_key,
                &job.verifying_public_key,
            )
            .map_err(|e| {
                error!(leaf_id = %job.leaf_id, error = %e, "signature aggregation failed");
                SdkError::AggregationFailed {
                    leaf_id: job.leaf_id.clone(),
                }
            })
    }

    fn user_share(
        &self,
        job: &SigningJob,
        all_commitments: &BTreeMap<Identifier, SigningCommitments>,
    ) -> Result<SignatureShare, SdkError> {
        self.signer
            .frost_sign(
                &job.message,
                &job.signing_public_key,
                &job.verifying_public_key,
                &job.user_commitment,
                all_commitments,
            )
            .map_err(|e| {
                if e != WalletSignerError::NonceNotFound {
                    error!(leaf_id = %job.leaf_id, error = %e, "user signature share failed");
                }
                SdkError::from(e)
            })
    }
}

fn user_id() -> Result<Identifier, SdkError> {
    user_identifier().map_err(|_| SdkError::Signing(WalletSignerError::FrostSigningFailed))
}

fn with_user_commitment(
    operator_commitments: &BTreeMap<Identifier, SigningCommitments>,
    job: &SigningJob,
) -> Result<BTreeMap<Identifier, SigningCommitments>, SdkError> {
    let mut all = operator_commitments.clone();
    all.insert(user_id()?, job.user_commitment.clone());
    Ok(all)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
