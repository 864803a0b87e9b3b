//! Sending side of a transfer.
//!
//! The sender hands each leaf to the receiver through an intermediate key:
//!
//! 1. Generate the intermediate key and split `old - intermediate` into
//!    t-of-n shares, one per operator.
//! 2. Encrypt the intermediate key to the receiver and sign the package.
//! 3. Sign the receiver's refund (the sender only contributes its share;
//!    the coordinator aggregates).
//! 4. Hand everything to the coordinator in one `start_transfer`.
//!
//! The leaves stay reserved until the operators report the sender's tweak
//! as applied ([`Wallet::query_transfer`]) or the transfer is cancelled.

use std::collections::{BTreeMap, HashMap};
use std::sync::{MutexGuard, PoisonError};
use std::time::Duration;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, Sequence};
use custody_signer::{SigningCommitments, WalletSigner};
use frost_secp256k1_tr::Identifier;
use rand_core::OsRng;
use tracing::{debug, error, info, warn};

use super::{leaf_package_digest, Transfer, TransferStatus};
use crate::bitcoin_tx::{create_cpfp_refund_tx, serialize_tx, spend_sighash};
use crate::leaf::{next_refund_sequence, Leaf, LeafError};
use crate::operator::{
    OperatorClient, SigningCommitmentsRequest, StartTransferRequest, TransferLeafRequest,
};
use crate::signing::{SigningCoordinator, SigningJob};
use crate::token::TokenStore;
use crate::tree::{ReservationId, TreeStore};
use crate::utils::{generate_uuid_v4, unix_now};
use crate::{SdkError, Wallet};

impl<C, W, T, K> Wallet<C, W, T, K>
where
    C: OperatorClient,
    W: WalletSigner,
    T: TreeStore,
    K: TokenStore,
{
    /// Sends `leaf_ids` to `receiver`.
    ///
    /// The leaves are reserved for the lifetime of the transfer. Transient
    /// failures are retried up to `send_attempts` times, each attempt with
    /// a fresh transfer id, fresh nonces, and fresh key tweak shares.
    ///
    /// An attempt the coordinator accepted but whose reply fails the checks
    /// is cancelled at the coordinator before its leaves are released or
    /// retried. If that cancel fails too, the leaves stay reserved under the
    /// accepted transfer id (see [`Wallet::outgoing_transfer_ids`]) until
    /// [`Wallet::query_transfer`] settles it.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::LeafNotFound`] or [`SdkError::InsufficientBalance`]
    /// if a leaf cannot be reserved, and the last attempt's error otherwise.
    pub async fn send_transfer(
        &self,
        leaf_ids: &[&str],
        receiver: &PublicKey,
        expiry: Duration,
    ) -> Result<Transfer, SdkError> {
        self.check_cancelled()?;
        if leaf_ids.is_empty() {
            return Err(SdkError::InvalidRequest("no leaves to send".into()));
        }

        let reservation = self.inner.tree_store.reserve_leaves(leaf_ids)?;
        let expiry_time = unix_now().saturating_add(expiry.as_secs());
        let attempts = self.inner.config.send_attempts.max(1);

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let transfer_id = generate_uuid_v4(&mut OsRng);
            let err = match self
                .start_attempt(&transfer_id, &reservation.leaves, receiver, expiry_time)
                .await
            {
                Ok(started) => {
                    match self.check_started(&transfer_id, &reservation.leaves, receiver, &started) {
                        Ok(()) => break Ok(started),
                        Err(e) => {
                            if !self.withdraw_started(&transfer_id).await {
                                self.track_outgoing(&transfer_id, reservation.id);
                                error!(
                                    transfer_id = %transfer_id,
                                    error = %e,
                                    "rejected transfer is still live at the coordinator, leaves stay reserved"
                                );
                                return Err(e);
                            }
                            e
                        }
                    }
                }
                Err(e) => e,
            };
            if err.is_retryable() && attempt < attempts {
                warn!(transfer_id = %transfer_id, attempt, error = %err, "send attempt failed, retrying");
            } else {
                break Err(err);
            }
        };

        match result {
            Ok(transfer) => {
                self.track_outgoing(&transfer.id, reservation.id);
                info!(
                    transfer_id = %transfer.id,
                    leaves = transfer.leaves.len(),
                    value = transfer.total_value(),
                    "transfer sent"
                );
                Ok(transfer)
            }
            Err(e) => {
                error!(attempts = attempt, error = %e, "transfer failed, releasing leaves");
                self.inner.tree_store.cancel_reservation(reservation.id)?;
                Err(e)
            }
        }
    }

    /// Sends exactly `amount` satoshis to `receiver`, choosing leaves with
    /// the configured [`LeafSelector`](crate::tree::LeafSelector).
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InsufficientBalance`] if no selection reaches the
    /// amount and [`SdkError::InvalidRequest`] if the selection overshoots.
    /// Leaves are indivisible, so an overshoot cannot be settled here.
    pub async fn send_sats(&self, amount: u64, receiver: &PublicKey) -> Result<Transfer, SdkError> {
        self.check_cancelled()?;
        if amount == 0 {
            return Err(SdkError::InvalidRequest("amount must be positive".into()));
        }

        let available = self.inner.tree_store.get_available_leaves()?;
        let selector = self.leaf_selector();
        let (selected, total) = selector
            .select(&available, amount)
            .ok_or(SdkError::InsufficientBalance)?;
        if total != amount {
            return Err(SdkError::InvalidRequest(format!(
                "no leaf combination matches {amount} sats exactly (closest {total})"
            )));
        }

        let ids: Vec<&str> = selected.iter().map(|l| l.id.as_str()).collect();
        debug!(amount, leaves = ids.len(), "leaves selected");
        self.send_transfer(&ids, receiver, self.inner.config.transfer_expiry)
            .await
    }

    /// Cancels an outgoing transfer whose sender tweak is still pending.
    ///
    /// On success the reserved leaves return to the available set.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::NotTransferSender`] for a transfer this wallet did
    /// not send and [`SdkError::TransferAlreadyTweaked`] once the sender's
    /// key tweak has been applied.
    pub async fn cancel_send_transfer(&self, transfer: &Transfer) -> Result<Transfer, SdkError> {
        self.check_cancelled()?;
        if transfer.sender_identity_public_key != self.identity_public_key() {
            return Err(SdkError::NotTransferSender);
        }
        if transfer.status.is_sender_tweaked() {
            return Err(SdkError::TransferAlreadyTweaked {
                transfer_id: transfer.id.clone(),
            });
        }
        if !transfer.status.can_transition_to(TransferStatus::Cancelled) {
            return Err(SdkError::InvalidTransferState {
                transfer_id: transfer.id.clone(),
                from: transfer.status,
                to: TransferStatus::Cancelled,
            });
        }

        let coordinator = self.coordinator().id.clone();
        let token = self.session_token(&coordinator).await?;
        let updated = self
            .inner
            .client
            .cancel_transfer(&coordinator, &token, &transfer.id)
            .await?;

        match updated.status {
            TransferStatus::Cancelled => {
                self.release_outgoing(&updated.id)?;
                info!(transfer_id = %updated.id, "transfer cancelled");
                Ok(updated)
            }
            status if status.is_sender_tweaked() => {
                // The tweak landed first: the leaves are gone.
                self.finalize_outgoing(&updated.id)?;
                Err(SdkError::TransferAlreadyTweaked {
                    transfer_id: updated.id,
                })
            }
            status => Err(SdkError::InvalidTransferState {
                transfer_id: updated.id,
                from: status,
                to: TransferStatus::Cancelled,
            }),
        }
    }

    /// Fetches a transfer from the coordinator and settles the local
    /// reservation of an outgoing one.
    pub async fn query_transfer(&self, transfer_id: &str) -> Result<Transfer, SdkError> {
        self.check_cancelled()?;
        let coordinator = self.coordinator().id.clone();
        let token = self.session_token(&coordinator).await?;
        let transfer = self
            .inner
            .client
            .query_transfer(&coordinator, &token, transfer_id)
            .await?;

        if transfer.status.is_sender_tweaked() {
            self.finalize_outgoing(&transfer.id)?;
        } else if matches!(
            transfer.status,
            TransferStatus::Cancelled | TransferStatus::Expired
        ) {
            self.release_outgoing(&transfer.id)?;
        }
        Ok(transfer)
    }

    /// Ids of outgoing transfers whose leaves are still reserved.
    pub fn outgoing_transfer_ids(&self) -> Vec<String> {
        self.outgoing().keys().cloned().collect()
    }

    /// Cancels a transfer the coordinator accepted but this wallet
    /// rejected. Returns whether the coordinator reports it cancelled.
    async fn withdraw_started(&self, transfer_id: &str) -> bool {
        let coordinator = self.coordinator().id.clone();
        let cancelled = match self.session_token(&coordinator).await {
            Ok(token) => {
                self.inner
                    .client
                    .cancel_transfer(&coordinator, &token, transfer_id)
                    .await
            }
            Err(e) => Err(e),
        };
        match cancelled {
            Ok(transfer) if transfer.id == transfer_id && transfer.status == TransferStatus::Cancelled => {
                debug!(transfer_id, "rejected transfer cancelled at the coordinator");
                true
            }
            Ok(transfer) => {
                warn!(transfer_id, status = %transfer.status, "coordinator did not cancel the rejected transfer");
                false
            }
            Err(e) => {
                warn!(transfer_id, error = %e, "cancelling the rejected transfer failed");
                false
            }
        }
    }

    /// Builds and submits one attempt. The coordinator's reply is returned
    /// unchecked.
    async fn start_attempt(
        &self,
        transfer_id: &str,
        leaves: &[Leaf],
        receiver: &PublicKey,
        expiry_time: u64,
    ) -> Result<Transfer, SdkError> {
        self.check_cancelled()?;
        let operator_commitments = self.leaf_commitments(leaves).await?;

        let mut scratch = Vec::with_capacity(2 * leaves.len());
        let mut commitments = Vec::with_capacity(leaves.len());
        let built = self.transfer_requests(
            transfer_id,
            leaves,
            receiver,
            operator_commitments,
            &mut scratch,
            &mut commitments,
        );
        // The receiver gets the intermediate key encrypted; the sender keeps
        // neither it nor the tweak.
        for key in &scratch {
            self.inner.signer.forget_key(key);
        }
        let requests = built.inspect_err(|_| {
            SigningCoordinator::new(&self.inner.signer, self.threshold()).discard(&commitments);
        })?;

        let coordinator_id = self.coordinator().id.clone();
        let token = self.session_token(&coordinator_id).await?;
        self.inner
            .client
            .start_transfer(
                &coordinator_id,
                &token,
                StartTransferRequest {
                    transfer_id: transfer_id.to_owned(),
                    owner_identity_public_key: self.identity_public_key(),
                    receiver_identity_public_key: *receiver,
                    expiry_time,
                    leaves: requests,
                },
            )
            .await
    }

    /// Per leaf: intermediate key, tweak shares, cipher, package signature,
    /// and the sender's share of the receiver refund. Every key generated
    /// lands in `scratch` and every commitment in `commitments`, also when
    /// a later leaf fails.
    fn transfer_requests(
        &self,
        transfer_id: &str,
        leaves: &[Leaf],
        receiver: &PublicKey,
        operator_commitments: Vec<BTreeMap<Identifier, SigningCommitments>>,
        scratch: &mut Vec<PublicKey>,
        commitments: &mut Vec<SigningCommitments>,
    ) -> Result<Vec<TransferLeafRequest>, SdkError> {
        let signer = &self.inner.signer;
        let threshold = self.threshold();
        let num_operators = self.num_operators();
        let coordinator = SigningCoordinator::new(signer, threshold);

        let mut requests = Vec::with_capacity(leaves.len());
        for (leaf, operator_commitments) in leaves.iter().zip(operator_commitments) {
            let leaf_err = |source| SdkError::Leaf {
                leaf_id: leaf.id.clone(),
                source,
            };

            let intermediate = signer.generate_public_key(&mut OsRng)?;
            scratch.push(intermediate);
            let tweak = signer.subtract_private_keys(&leaf.signing_public_key, &intermediate)?;
            scratch.push(tweak);
            let shares =
                signer.split_secret_with_proofs(&tweak, threshold, num_operators, &mut OsRng)?;
            let key_tweak_shares = self
                .inner
                .config
                .network
                .operators()
                .iter()
                .map(|op| op.id.clone())
                .zip(shares)
                .collect::<BTreeMap<_, _>>();

            let secret_cipher = signer.encrypt_secret_for(&intermediate, receiver, &mut OsRng)?;
            let signature = signer.sign_identity_digest(&leaf_package_digest(
                &leaf.id,
                transfer_id,
                &secret_cipher,
            ));

            let node_tx = leaf.parsed_node_tx().map_err(leaf_err)?;
            let sequence = next_refund_sequence(leaf.refund_sequence().map_err(leaf_err)?)
                .map_err(leaf_err)?;
            let refund = create_cpfp_refund_tx(
                node_tx.compute_txid(),
                leaf.vout,
                Amount::from_sat(leaf.value),
                Sequence::from_consensus(sequence),
                receiver,
            );
            let message = spend_sighash(&refund, &node_tx, leaf.vout)
                .map_err(|_| leaf_err(LeafError::InvalidNodeTx))?;

            let user_commitment = coordinator.commit(&leaf.signing_public_key)?;
            commitments.push(user_commitment.clone());
            let job = SigningJob {
                leaf_id: leaf.id.clone(),
                message,
                signing_public_key: leaf.signing_public_key,
                verifying_public_key: leaf.verifying_public_key,
                user_commitment,
            };
            let user_signature_share = coordinator.sign_share(&job, &operator_commitments)?;

            requests.push(TransferLeafRequest {
                leaf_id: leaf.id.clone(),
                old_signing_public_key: leaf.signing_public_key,
                new_signing_public_key: intermediate,
                secret_cipher,
                signature,
                refund_tx: serialize_tx(&refund),
                user_commitment: job.user_commitment,
                user_signature_share,
                operator_commitments,
                key_tweak_shares,
            });
        }
        Ok(requests)
    }

    /// One fresh operator commitment per leaf, from a threshold of
    /// operators.
    async fn leaf_commitments(
        &self,
        leaves: &[Leaf],
    ) -> Result<Vec<BTreeMap<Identifier, SigningCommitments>>, SdkError> {
        let client = &self.inner.client;
        let request = SigningCommitmentsRequest {
            node_ids: leaves.iter().map(|l| l.id.clone()).collect(),
        };
        let responses = self
            .fan_out(self.threshold(), |operator, token| {
                let req = request.clone();
                async move { client.get_signing_commitments(&operator, &token, req).await }
            })
            .await?;

        let mut per_leaf = vec![BTreeMap::new(); leaves.len()];
        for (operator, commitments) in responses {
            if commitments.len() != leaves.len() {
                return Err(SdkError::operator_response(
                    &operator,
                    format!(
                        "{} commitments for {} leaves",
                        commitments.len(),
                        leaves.len()
                    ),
                ));
            }
            let identifier = self.operator_identifier(&operator)?;
            for (slot, commitment) in per_leaf.iter_mut().zip(commitments) {
                slot.insert(identifier, commitment);
            }
        }
        Ok(per_leaf)
    }

    /// The coordinator must echo the transfer it was asked to start, with
    /// every intermediate refund signed under its leaf key.
    fn check_started(
        &self,
        transfer_id: &str,
        leaves: &[Leaf],
        receiver: &PublicKey,
        transfer: &Transfer,
    ) -> Result<(), SdkError> {
        let coordinator = self.coordinator().id.as_str();
        if transfer.id != transfer_id
            || transfer.receiver_identity_public_key != *receiver
            || transfer.leaves.len() != leaves.len()
            || !transfer.status.is_claimable()
        {
            error!(transfer_id, status = %transfer.status, "coordinator returned a different transfer");
            return Err(SdkError::operator_response(
                coordinator,
                "start_transfer returned a different transfer",
            ));
        }
        for leaf in leaves {
            let sent = transfer
                .leaves
                .iter()
                .find(|t| t.leaf.id == leaf.id)
                .ok_or_else(|| {
                    SdkError::operator_response(coordinator, format!("leaf {} missing", leaf.id))
                })?;
            self.verify_intermediate_refund(leaf, &sent.intermediate_refund_tx)?;
        }
        Ok(())
    }

    fn track_outgoing(&self, transfer_id: &str, reservation: ReservationId) {
        self.outgoing().insert(transfer_id.to_owned(), reservation);
    }

    /// The transfer completed on the sender's side; drop its leaves.
    fn finalize_outgoing(&self, transfer_id: &str) -> Result<(), SdkError> {
        let reservation = self.outgoing().remove(transfer_id);
        if let Some(id) = reservation {
            self.inner.tree_store.finalize_reservation(id)?;
            debug!(transfer_id, "outgoing leaves spent");
        }
        Ok(())
    }

    /// The transfer will not happen; the leaves are spendable again.
    fn release_outgoing(&self, transfer_id: &str) -> Result<(), SdkError> {
        let reservation = self.outgoing().remove(transfer_id);
        if let Some(id) = reservation {
            self.inner.tree_store.cancel_reservation(id)?;
            debug!(transfer_id, "outgoing leaves released");
        }
        Ok(())
    }

    fn outgoing(&self) -> MutexGuard<'_, HashMap<String, ReservationId>> {
        self.inner
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
