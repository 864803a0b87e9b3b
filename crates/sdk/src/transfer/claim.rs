//! Claiming an incoming transfer.
//!
//! The receiver replaces the intermediate key with its own leaf key:
//!
//! 1. **Tweak**: split `intermediate - final` and send every operator its
//!    share. All operators must apply it, or some would still hold the
//!    sender-side key material.
//! 2. **Sign refunds**: a threshold of operators co-sign a refund to the
//!    receiver with the next smaller timelock; the receiver aggregates.
//! 3. **Finalize**: hand the signed refunds back and store the leaves.
//!
//! [`Wallet::claim_transfer`] skips the steps the operators already report
//! as done, so an interrupted claim can be resumed.

use std::collections::{BTreeMap, HashMap};

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, Sequence, Transaction};
use custody_signer::{SigningCommitments, WalletSigner};
use rand_core::OsRng;
use tracing::{debug, error, info};

use super::{Transfer, TransferLeaf, TransferStatus};
use crate::bitcoin_tx::{
    create_cpfp_refund_tx, first_input_sequence, parse_tx, serialize_tx, spend_sighash,
    with_key_spend_signature,
};
use crate::leaf::{next_refund_sequence, Leaf, LeafError, LeafStatus};
use crate::operator::{
    ClaimLeafKeyTweak, ClaimTransferSignRefundsRequest, ClaimTransferTweakKeysRequest,
    FinalizeNodeSignaturesRequest, LeafSigningJob, NodeSignatures, OperatorClient, SigningIntent,
    UserSigningJob,
};
use crate::signing::{SigningCoordinator, SigningJob};
use crate::token::TokenStore;
use crate::tree::TreeStore;
use crate::utils::unix_now;
use crate::{SdkError, Wallet};

/// A receiver refund awaiting the operators' shares.
struct PendingRefund {
    job: SigningJob,
    refund: Transaction,
}

impl<C, W, T, K> Wallet<C, W, T, K>
where
    C: OperatorClient,
    W: WalletSigner,
    T: TreeStore,
    K: TokenStore,
{
    /// Claims an incoming transfer and stores its leaves.
    ///
    /// A transfer that looks expired locally, or whose sender tweak is
    /// still pending, is re-queried first: the operators' view decides.
    /// Steps already reported as done are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InvalidTransferState`] if the transfer is not
    /// claimable, and verification errors from
    /// [`Wallet::verify_pending_transfer`].
    pub async fn claim_transfer(&self, transfer: &Transfer) -> Result<Transfer, SdkError> {
        self.check_cancelled()?;
        if transfer.receiver_identity_public_key != self.identity_public_key() {
            return Err(SdkError::InvalidRequest(format!(
                "transfer {} is addressed to another wallet",
                transfer.id
            )));
        }

        let mut current = transfer.clone();
        if current.is_expired(unix_now()) || current.status == TransferStatus::SenderKeyTweakPending
        {
            debug!(transfer_id = %current.id, status = %current.status, "refreshing transfer before claim");
            current = self.query_transfer(&current.id).await?;
        }
        if !current.status.is_claimable() {
            return Err(SdkError::InvalidTransferState {
                transfer_id: current.id.clone(),
                from: current.status,
                to: TransferStatus::Completed,
            });
        }

        let keys = self.verify_pending_transfer(&current)?;

        if matches!(
            current.status,
            TransferStatus::SenderKeyTweakPending | TransferStatus::SenderKeyTweaked
        ) {
            self.claim_transfer_tweak_keys(&current, &keys).await?;
            current.status = TransferStatus::ReceiverKeyTweaked;
        } else {
            for intermediate in keys.values() {
                self.inner.signer.forget_key(intermediate);
            }
        }

        let leaves = if current.status == TransferStatus::ReceiverKeyTweaked {
            let leaves = self.claim_transfer_sign_refunds(&current).await?;
            current.status = TransferStatus::ReceiverRefundSigned;
            leaves
        } else {
            // Refunds were signed and finalized by an earlier attempt; the
            // operators report the leaves in their final state.
            current
                .leaves
                .iter()
                .map(|tl| self.claimed_leaf(tl, &tl.leaf.refund_tx))
                .collect::<Result<Vec<_>, _>>()?
        };

        self.inner.tree_store.insert_leaves(&leaves)?;
        current.status = TransferStatus::Completed;
        info!(
            transfer_id = %current.id,
            leaves = leaves.len(),
            value = current.total_value(),
            "transfer claimed"
        );
        Ok(current)
    }

    /// Moves every leaf of `transfer` from its intermediate key to this
    /// wallet's leaf key, at all operators.
    ///
    /// `intermediate_keys` is the output of
    /// [`Wallet::verify_pending_transfer`].
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InvalidTransferState`] unless the sender tweak
    /// is pending or applied, and [`SdkError::Quorum`] unless every
    /// operator applies the tweak.
    pub async fn claim_transfer_tweak_keys(
        &self,
        transfer: &Transfer,
        intermediate_keys: &BTreeMap<String, PublicKey>,
    ) -> Result<(), SdkError> {
        self.check_cancelled()?;
        if !matches!(
            transfer.status,
            TransferStatus::SenderKeyTweakPending | TransferStatus::SenderKeyTweaked
        ) {
            return Err(SdkError::InvalidTransferState {
                transfer_id: transfer.id.clone(),
                from: transfer.status,
                to: TransferStatus::ReceiverKeyTweaked,
            });
        }

        let signer = &self.inner.signer;
        let operators = self.inner.config.network.operators();
        let mut per_operator: HashMap<String, Vec<ClaimLeafKeyTweak>> = HashMap::new();

        for transfer_leaf in &transfer.leaves {
            let leaf_id = &transfer_leaf.leaf.id;
            let intermediate =
                intermediate_keys
                    .get(leaf_id)
                    .ok_or_else(|| SdkError::KeyMismatch {
                        transfer_id: transfer.id.clone(),
                        leaf_id: leaf_id.clone(),
                    })?;
            let final_key = signer.derive_signing_key(leaf_id)?;
            let tweak = signer.subtract_private_keys(intermediate, &final_key)?;
            let shares = signer.split_secret_with_proofs(
                &tweak,
                self.threshold(),
                self.num_operators(),
                &mut OsRng,
            );
            signer.forget_key(&tweak);
            for (op, share) in operators.iter().zip(shares?) {
                per_operator
                    .entry(op.id.clone())
                    .or_default()
                    .push(ClaimLeafKeyTweak {
                        leaf_id: leaf_id.clone(),
                        secret_share_tweak: share,
                    });
            }
        }

        let client = &self.inner.client;
        let owner = self.identity_public_key();
        let per_operator = &per_operator;
        self.fan_out(self.num_operators(), |operator, token| {
            let req = per_operator
                .get(&operator)
                .cloned()
                .map(|leaves| ClaimTransferTweakKeysRequest {
                    transfer_id: transfer.id.clone(),
                    owner_identity_public_key: owner,
                    leaves,
                })
                .ok_or_else(|| SdkError::operator_response(&operator, "no key tweak for operator"));
            async move { client.claim_transfer_tweak_keys(&operator, &token, req?).await }
        })
        .await?;

        // Every operator now holds the receiver's key material.
        for intermediate in intermediate_keys.values() {
            signer.forget_key(intermediate);
        }
        debug!(transfer_id = %transfer.id, "receiver key tweak applied");
        Ok(())
    }

    /// Signs refunds for the re-keyed leaves and finalizes them with the
    /// operators. Returns the leaves as this wallet now owns them.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InvalidTransferState`] unless the receiver tweak
    /// has been applied, [`SdkError::VerifyingKeyMismatch`] if the
    /// operators report another leaf key, and signing errors.
    pub async fn claim_transfer_sign_refunds(
        &self,
        transfer: &Transfer,
    ) -> Result<Vec<Leaf>, SdkError> {
        self.check_cancelled()?;
        if transfer.status != TransferStatus::ReceiverKeyTweaked {
            return Err(SdkError::InvalidTransferState {
                transfer_id: transfer.id.clone(),
                from: transfer.status,
                to: TransferStatus::ReceiverRefundSigned,
            });
        }

        let coordinator = SigningCoordinator::new(&self.inner.signer, self.threshold());
        let mut commitments = Vec::with_capacity(transfer.leaves.len());
        let result = self
            .sign_receiver_refunds(transfer, &coordinator, &mut commitments)
            .await;
        if result.is_err() {
            coordinator.discard(&commitments);
        }
        result
    }

    /// The refund round of [`Wallet::claim_transfer_sign_refunds`]. Every
    /// owner commitment made lands in `commitments`.
    async fn sign_receiver_refunds(
        &self,
        transfer: &Transfer,
        coordinator: &SigningCoordinator<'_, W>,
        commitments: &mut Vec<SigningCommitments>,
    ) -> Result<Vec<Leaf>, SdkError> {
        let identity = self.identity_public_key();

        let mut pending = BTreeMap::new();
        let mut signing_jobs = Vec::with_capacity(transfer.leaves.len());
        for transfer_leaf in &transfer.leaves {
            let refund = self.receiver_refund(transfer_leaf, &identity, coordinator)?;
            commitments.push(refund.job.user_commitment.clone());
            signing_jobs.push(LeafSigningJob {
                leaf_id: refund.job.leaf_id.clone(),
                job: UserSigningJob {
                    signing_public_key: refund.job.signing_public_key,
                    raw_tx: serialize_tx(&refund.refund),
                    commitment: refund.job.user_commitment.clone(),
                },
            });
            pending.insert(refund.job.leaf_id.clone(), refund);
        }

        let coordinator_id = self.coordinator().id.clone();
        let token = self.session_token(&coordinator_id).await?;
        let results = self
            .inner
            .client
            .claim_transfer_sign_refunds(
                &coordinator_id,
                &token,
                ClaimTransferSignRefundsRequest {
                    transfer_id: transfer.id.clone(),
                    owner_identity_public_key: identity,
                    signing_jobs,
                },
            )
            .await?;
        if results.len() != pending.len() {
            return Err(SdkError::operator_response(
                &coordinator_id,
                format!("{} signing results for {} leaves", results.len(), pending.len()),
            ));
        }

        let mut signed = BTreeMap::new();
        let mut node_signatures = Vec::with_capacity(results.len());
        for result in results {
            let refund = pending.remove(&result.leaf_id).ok_or_else(|| {
                SdkError::operator_response(
                    &coordinator_id,
                    format!("unexpected leaf {}", result.leaf_id),
                )
            })?;
            if result.verifying_public_key != refund.job.verifying_public_key {
                error!(leaf_id = %result.leaf_id, "operators report a different leaf key");
                return Err(SdkError::VerifyingKeyMismatch {
                    leaf_id: result.leaf_id,
                });
            }
            let signature = coordinator.sign_and_aggregate(&refund.job, &result.result)?;
            node_signatures.push(NodeSignatures {
                node_id: result.leaf_id.clone(),
                node_tx_signature: None,
                refund_tx_signature: Some(signature),
            });
            signed.insert(
                result.leaf_id,
                serialize_tx(&with_key_spend_signature(refund.refund, &signature)),
            );
        }

        let finalized = self
            .inner
            .client
            .finalize_node_signatures(
                &coordinator_id,
                &token,
                FinalizeNodeSignaturesRequest {
                    intent: SigningIntent::Transfer,
                    node_signatures,
                },
            )
            .await?;
        if finalized.len() != transfer.leaves.len() {
            return Err(SdkError::operator_response(
                &coordinator_id,
                format!("{} leaves finalized of {}", finalized.len(), transfer.leaves.len()),
            ));
        }

        transfer
            .leaves
            .iter()
            .map(|tl| {
                let refund = signed.get(&tl.leaf.id).ok_or_else(|| {
                    SdkError::operator_response(&coordinator_id, format!("leaf {} not signed", tl.leaf.id))
                })?;
                self.claimed_leaf(tl, refund)
            })
            .collect()
    }

    /// Builds the refund to `owner` for one claimed leaf and commits to a
    /// nonce for it.
    fn receiver_refund(
        &self,
        transfer_leaf: &TransferLeaf,
        owner: &PublicKey,
        coordinator: &SigningCoordinator<'_, W>,
    ) -> Result<PendingRefund, SdkError> {
        let leaf = &transfer_leaf.leaf;
        let leaf_err = |source| SdkError::Leaf {
            leaf_id: leaf.id.clone(),
            source,
        };

        let final_key = self.inner.signer.derive_signing_key(&leaf.id)?;
        let node_tx = leaf.parsed_node_tx().map_err(leaf_err)?;
        let intermediate = parse_tx(&transfer_leaf.intermediate_refund_tx)
            .map_err(|_| leaf_err(LeafError::InvalidRefundTx))?;
        let current = first_input_sequence(&intermediate)
            .map_err(|_| leaf_err(LeafError::InvalidRefundTx))?;
        let sequence = next_refund_sequence(current).map_err(leaf_err)?;

        let refund = create_cpfp_refund_tx(
            node_tx.compute_txid(),
            leaf.vout,
            Amount::from_sat(leaf.value),
            Sequence::from_consensus(sequence),
            owner,
        );
        let message = spend_sighash(&refund, &node_tx, leaf.vout)
            .map_err(|_| leaf_err(LeafError::InvalidNodeTx))?;
        let user_commitment = coordinator.commit(&final_key)?;

        Ok(PendingRefund {
            job: SigningJob {
                leaf_id: leaf.id.clone(),
                message,
                signing_public_key: final_key,
                verifying_public_key: leaf.verifying_public_key,
                user_commitment,
            },
            refund,
        })
    }

    /// The leaf as this wallet owns it after the claim.
    fn claimed_leaf(&self, transfer_leaf: &TransferLeaf, refund_tx: &[u8]) -> Result<Leaf, SdkError> {
        let leaf = &transfer_leaf.leaf;
        let final_key = self.inner.signer.derive_signing_key(&leaf.id)?;
        let rekeyed = leaf
            .rekey(final_key, &leaf.verifying_public_key)
            .map_err(|source| SdkError::Leaf {
                leaf_id: leaf.id.clone(),
                source,
            })?;
        Ok(Leaf {
            refund_tx: refund_tx.to_vec(),
            owner_identity_public_key: self.identity_public_key(),
            status: LeafStatus::Available,
            ..rekeyed
        })
    }
}
