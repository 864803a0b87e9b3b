//! Deposits: address generation and tree-root creation.
//!
//! A deposit address is the P2TR key-path address of `Y = signing_pk +
//! operator_pk`. Before handing it out, the wallet checks that the operators
//! actually hold `operator_pk` (proof of possession), that the address
//! commits to `Y`, and that every non-coordinator operator vouches for the
//! address. Once funds arrive, [`Wallet::claim_deposit`] turns the output
//! into a leaf: a root node transaction plus a refund, both co-signed.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{MutexGuard, PoisonError};

use bitcoin::address::NetworkUnchecked;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{schnorr, Message, PublicKey};
use bitcoin::{Address, OutPoint, Sequence};
use custody_crypto::secp::subtract_public_keys;
use custody_signer::{ecdsa, SigningCommitments, WalletSigner};
use rand_core::OsRng;
use tracing::{debug, error, info};

use crate::bitcoin_tx::{
    create_cpfp_refund_tx, create_node_tx, p2tr_script, parse_tx, serialize_tx, spend_sighash,
    tweaked_output_key, with_key_spend_signature,
};
use crate::leaf::{initial_sequence, Leaf, LeafStatus};
use crate::operator::{
    DepositAddress, FinalizeNodeSignaturesRequest, GenerateDepositAddressRequest, NodeSignatures,
    OperatorClient, SigningIntent, StartTreeCreationRequest, UserSigningJob,
};
use crate::signing::{SigningCoordinator, SigningJob};
use crate::token::TokenStore;
use crate::tree::TreeStore;
use crate::utils::{bitcoin_network, generate_uuid_v4, hex_decode_pubkey};
use crate::{SdkError, Wallet};

/// A validated deposit address awaiting funds.
#[derive(Debug, Clone)]
pub(crate) struct TrackedDeposit {
    pub leaf_id: String,
    pub signing_public_key: PublicKey,
    pub verifying_public_key: PublicKey,
}

/// Digest the operators' proof of possession signs.
pub fn proof_of_possession_digest(
    identity_public_key: &PublicKey,
    operator_public_key: &PublicKey,
    address: &str,
) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(&identity_public_key.serialize());
    engine.input(&operator_public_key.serialize());
    engine.input(address.as_bytes());
    sha256::Hash::from_engine(engine).to_byte_array()
}

/// Digest each non-coordinator operator signs to vouch for an address.
pub fn address_digest(address: &str) -> [u8; 32] {
    sha256::Hash::hash(address.as_bytes()).to_byte_array()
}

impl<C, W, T, K> Wallet<C, W, T, K>
where
    C: OperatorClient,
    W: WalletSigner,
    T: TreeStore,
    K: TokenStore,
{
    /// A fresh deposit address, keyed to a new leaf id.
    pub async fn get_deposit_address(&self) -> Result<DepositAddress, SdkError> {
        self.check_cancelled()?;
        let leaf_id = generate_uuid_v4(&mut OsRng);
        let signing_public_key = self.inner.signer.derive_signing_key(&leaf_id)?;
        self.generate_deposit_address(&signing_public_key, &leaf_id)
            .await
    }

    /// Requests and validates a deposit address for `signing_public_key`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InvalidDepositAddress`] if any check fails; no
    /// address is returned or tracked in that case.
    pub async fn generate_deposit_address(
        &self,
        signing_public_key: &PublicKey,
        leaf_id: &str,
    ) -> Result<DepositAddress, SdkError> {
        self.check_cancelled()?;
        let coordinator = self.coordinator().id.clone();
        let token = self.session_token(&coordinator).await?;
        let address = self
            .inner
            .client
            .generate_deposit_address(
                &coordinator,
                &token,
                GenerateDepositAddressRequest {
                    signing_public_key: *signing_public_key,
                    identity_public_key: self.identity_public_key(),
                    network: self.inner.config.network.network,
                    leaf_id: leaf_id.to_owned(),
                },
            )
            .await?;

        let script = self
            .validate_deposit_address(&address, signing_public_key, leaf_id)
            .map_err(|reason| {
                error!(address = %address.address, reason, "deposit address rejected");
                SdkError::InvalidDepositAddress {
                    reason: reason.to_owned(),
                }
            })?;

        self.deposits().insert(
            script,
            TrackedDeposit {
                leaf_id: leaf_id.to_owned(),
                signing_public_key: *signing_public_key,
                verifying_public_key: address.verifying_public_key,
            },
        );
        info!(address = %address.address, leaf_id, "deposit address issued");
        Ok(address)
    }

    /// Turns a confirmed deposit to a tracked address into a leaf.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InvalidRequest`] if the output does not pay a
    /// tracked address.
    pub async fn claim_deposit(&self, deposit_tx: &[u8], vout: u32) -> Result<Leaf, SdkError> {
        self.check_cancelled()?;
        let tx = parse_tx(deposit_tx)
            .map_err(|_| SdkError::InvalidRequest("deposit transaction does not parse".into()))?;
        let output = tx
            .output
            .get(vout as usize)
            .ok_or_else(|| SdkError::InvalidRequest(format!("deposit has no output {vout}")))?;
        let script = output.script_pubkey.to_bytes();
        let tracked = self.deposits().get(&script).cloned().ok_or_else(|| {
            SdkError::InvalidRequest("output does not pay a tracked deposit address".into())
        })?;

        let leaf = self
            .create_tree_root(
                &tracked.signing_public_key,
                &tracked.verifying_public_key,
                deposit_tx,
                vout,
            )
            .await?;
        self.deposits().remove(&script);
        debug!(leaf_id = %tracked.leaf_id, "tracked deposit claimed");
        Ok(leaf)
    }

    /// Creates the root leaf for a deposit output locked to
    /// `verifying_key`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::VerifyingKeyMismatch`] if the operators report a
    /// different aggregate key, and signing errors from either round.
    pub async fn create_tree_root(
        &self,
        signing_public_key: &PublicKey,
        verifying_key: &PublicKey,
        deposit_tx: &[u8],
        vout: u32,
    ) -> Result<Leaf, SdkError> {
        self.check_cancelled()?;
        let deposit = parse_tx(deposit_tx)
            .map_err(|_| SdkError::InvalidRequest("deposit transaction does not parse".into()))?;
        let output = deposit
            .output
            .get(vout as usize)
            .ok_or_else(|| SdkError::InvalidRequest(format!("deposit has no output {vout}")))?;
        if output.script_pubkey != p2tr_script(verifying_key) {
            return Err(SdkError::InvalidRequest(
                "deposit output is not locked to the verifying key".into(),
            ));
        }
        let value = output.value;
        let identity = self.identity_public_key();

        let root_tx = create_node_tx(
            OutPoint::new(deposit.compute_txid(), vout),
            value,
            verifying_key,
        );
        let refund_tx = create_cpfp_refund_tx(
            root_tx.compute_txid(),
            0,
            value,
            Sequence::from_consensus(initial_sequence()),
            &identity,
        );
        let sighash_err = |_| SdkError::InvalidRequest("sighash computation failed".into());
        let root_message = spend_sighash(&root_tx, &deposit, vout).map_err(sighash_err)?;
        let refund_message = spend_sighash(&refund_tx, &root_tx, 0).map_err(sighash_err)?;

        let coordinator = SigningCoordinator::new(&self.inner.signer, self.threshold());
        let root_commitment = coordinator.commit(signing_public_key)?;
        let refund_commitment = coordinator.commit(signing_public_key).inspect_err(|_| {
            coordinator.discard([&root_commitment]);
        })?;

        let coordinator_id = self.coordinator().id.clone();
        let signed = async {
            let token = self.session_token(&coordinator_id).await?;
            let response = self
                .inner
                .client
                .start_deposit_tree_creation(
                    &coordinator_id,
                    &token,
                    StartTreeCreationRequest {
                        identity_public_key: identity,
                        signing_public_key: *signing_public_key,
                        deposit_tx: deposit_tx.to_vec(),
                        vout,
                        root_tx_signing_job: UserSigningJob {
                            signing_public_key: *signing_public_key,
                            raw_tx: serialize_tx(&root_tx),
                            commitment: root_commitment.clone(),
                        },
                        refund_tx_signing_job: UserSigningJob {
                            signing_public_key: *signing_public_key,
                            raw_tx: serialize_tx(&refund_tx),
                            commitment: refund_commitment.clone(),
                        },
                    },
                )
                .await?;
            let leaf_id = response.root_node_id.clone();
            if response.verifying_public_key != *verifying_key {
                error!(leaf_id = %leaf_id, "operators report a different deposit key");
                return Err(SdkError::VerifyingKeyMismatch { leaf_id });
            }

            let job = |message, user_commitment: &SigningCommitments| SigningJob {
                leaf_id: leaf_id.clone(),
                message,
                signing_public_key: *signing_public_key,
                verifying_public_key: *verifying_key,
                user_commitment: user_commitment.clone(),
            };
            let root_signature = coordinator.sign_and_aggregate(
                &job(root_message, &root_commitment),
                &response.root_tx_signing_result,
            )?;
            let refund_signature = coordinator.sign_and_aggregate(
                &job(refund_message, &refund_commitment),
                &response.refund_tx_signing_result,
            )?;

            let finalized = self
                .inner
                .client
                .finalize_node_signatures(
                    &coordinator_id,
                    &token,
                    FinalizeNodeSignaturesRequest {
                        intent: SigningIntent::Creation,
                        node_signatures: vec![NodeSignatures {
                            node_id: leaf_id.clone(),
                            node_tx_signature: Some(root_signature),
                            refund_tx_signature: Some(refund_signature),
                        }],
                    },
                )
                .await?;
            if !finalized.iter().any(|l| l.id == leaf_id) {
                return Err(SdkError::operator_response(
                    &coordinator_id,
                    format!("root {leaf_id} was not finalized"),
                ));
            }
            Ok::<_, SdkError>((leaf_id, response.tree_id, root_signature, refund_signature))
        }
        .await;
        if signed.is_err() {
            coordinator.discard([&root_commitment, &refund_commitment]);
        }
        let (leaf_id, tree_id, root_signature, refund_signature) = signed?;

        let leaf = Leaf {
            id: leaf_id,
            tree_id,
            value: value.to_sat(),
            node_tx: serialize_tx(&with_key_spend_signature(root_tx, &root_signature)),
            refund_tx: serialize_tx(&with_key_spend_signature(refund_tx, &refund_signature)),
            verifying_public_key: *verifying_key,
            signing_public_key: *signing_public_key,
            owner_identity_public_key: identity,
            vout: 0,
            status: LeafStatus::Available,
        };
        self.inner
            .tree_store
            .insert_leaves(std::slice::from_ref(&leaf))?;
        info!(leaf_id = %leaf.id, value = leaf.value, "deposit leaf created");
        Ok(leaf)
    }

    /// Runs the three deposit address checks and returns the address's
    /// output script.
    fn validate_deposit_address(
        &self,
        address: &DepositAddress,
        signing_public_key: &PublicKey,
        leaf_id: &str,
    ) -> Result<Vec<u8>, &'static str> {
        let secp = &self.inner.secp;
        let verifying_key = &address.verifying_public_key;

        if address.leaf_id != leaf_id {
            return Err("leaf id does not match the request");
        }

        let operator_key = subtract_public_keys(verifying_key, signing_public_key)
            .map_err(|_| "verifying key equals the signing key")?;
        let digest = proof_of_possession_digest(
            &self.identity_public_key(),
            &operator_key,
            &address.address,
        );
        let proof = schnorr::Signature::from_slice(&address.proof.proof_of_possession)
            .map_err(|_| "malformed proof of possession")?;
        secp.verify_schnorr(
            &proof,
            &Message::from_digest(digest),
            &tweaked_output_key(secp, &operator_key),
        )
        .map_err(|_| "proof of possession does not verify")?;

        let script = Address::<NetworkUnchecked>::from_str(&address.address)
            .map_err(|_| "address does not decode")?
            .require_network(bitcoin_network(self.inner.config.network.network))
            .map_err(|_| "address is for another network")?
            .script_pubkey();
        if script != p2tr_script(verifying_key) {
            return Err("address does not commit to the verifying key");
        }

        let digest = address_digest(&address.address);
        for op in self.inner.config.network.non_coordinators() {
            let signature = address
                .proof
                .operator_signatures
                .get(&op.id)
                .ok_or("operator signature missing")?;
            let identity = hex_decode_pubkey(&op.identity_public_key)
                .ok_or("operator identity key is malformed")?;
            ecdsa::verify_digest(secp, &identity, &digest, signature)
                .map_err(|_| "operator signature does not verify")?;
        }

        Ok(script.to_bytes())
    }

    fn deposits(&self) -> MutexGuard<'_, HashMap<Vec<u8>, TrackedDeposit>> {
        self.inner
            .deposits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
