//! Incoming transfers: listing and verification.

use std::collections::BTreeMap;

use bitcoin::secp256k1::PublicKey;
use custody_signer::{ecdsa, WalletSigner};
use tracing::{debug, error};

use super::{leaf_package_digest, Transfer};
use crate::bitcoin_tx::{parse_tx, verify_key_spend};
use crate::leaf::{Leaf, LeafError};
use crate::operator::OperatorClient;
use crate::token::TokenStore;
use crate::tree::TreeStore;
use crate::{SdkError, Wallet};

impl<C, W, T, K> Wallet<C, W, T, K>
where
    C: OperatorClient,
    W: WalletSigner,
    T: TreeStore,
    K: TokenStore,
{
    /// Transfers addressed to this wallet that still await a claim.
    pub async fn query_pending_transfers(&self) -> Result<Vec<Transfer>, SdkError> {
        self.check_cancelled()?;
        let coordinator = self.coordinator().id.clone();
        let token = self.session_token(&coordinator).await?;
        let identity = self.identity_public_key();

        let transfers = self
            .inner
            .client
            .query_pending_transfers(&coordinator, &token)
            .await?;
        let pending: Vec<Transfer> = transfers
            .into_iter()
            .filter(|t| t.receiver_identity_public_key == identity && t.status.is_claimable())
            .collect();
        debug!(count = pending.len(), "pending transfers");
        Ok(pending)
    }

    /// Checks every leaf of an incoming transfer and recovers the
    /// intermediate keys.
    ///
    /// For each leaf: the sender's signature over the package must verify,
    /// the ciphertext must decrypt to the key the sender named, and the
    /// intermediate refund must carry a valid signature under the leaf key.
    /// Returns leaf id -> intermediate key. The decrypted secrets are kept
    /// by the signer, unless a leaf fails: then none are.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InvalidSignature`] for a bad package or refund
    /// signature and [`SdkError::KeyMismatch`] for a ciphertext that does
    /// not match.
    pub fn verify_pending_transfer(
        &self,
        transfer: &Transfer,
    ) -> Result<BTreeMap<String, PublicKey>, SdkError> {
        let mut keys = BTreeMap::new();
        let verified = self.verify_transfer_leaves(transfer, &mut keys);
        if verified.is_err() {
            for key in keys.values() {
                self.inner.signer.forget_key(key);
            }
        }
        verified.map(|()| keys)
    }

    fn verify_transfer_leaves(
        &self,
        transfer: &Transfer,
        keys: &mut BTreeMap<String, PublicKey>,
    ) -> Result<(), SdkError> {
        let secp = &self.inner.secp;
        for transfer_leaf in &transfer.leaves {
            let leaf_id = &transfer_leaf.leaf.id;
            let digest = leaf_package_digest(leaf_id, &transfer.id, &transfer_leaf.secret_cipher);
            ecdsa::verify_digest(
                secp,
                &transfer.sender_identity_public_key,
                &digest,
                &transfer_leaf.signature,
            )
            .map_err(|e| {
                error!(transfer_id = %transfer.id, leaf_id = %leaf_id, error = %e, "sender signature invalid");
                SdkError::InvalidSignature {
                    context: "transfer leaf package",
                }
            })?;

            let key = self
                .inner
                .signer
                .decrypt_secret(&transfer_leaf.secret_cipher)
                .map_err(|e| {
                    error!(transfer_id = %transfer.id, leaf_id = %leaf_id, error = %e, "leaf key did not decrypt");
                    SdkError::KeyMismatch {
                        transfer_id: transfer.id.clone(),
                        leaf_id: leaf_id.clone(),
                    }
                })?;
            if key != transfer_leaf.new_signing_public_key {
                self.inner.signer.forget_key(&key);
                error!(transfer_id = %transfer.id, leaf_id = %leaf_id, "decrypted key does not match");
                return Err(SdkError::KeyMismatch {
                    transfer_id: transfer.id.clone(),
                    leaf_id: leaf_id.clone(),
                });
            }

            keys.insert(leaf_id.clone(), key);
            self.verify_intermediate_refund(&transfer_leaf.leaf, &transfer_leaf.intermediate_refund_tx)?;
        }
        Ok(())
    }

    /// The intermediate refund must spend the leaf output with a valid
    /// key-path signature under the leaf key.
    pub(crate) fn verify_intermediate_refund(
        &self,
        leaf: &Leaf,
        refund_tx: &[u8],
    ) -> Result<(), SdkError> {
        let node_tx = leaf.parsed_node_tx().map_err(|source| SdkError::Leaf {
            leaf_id: leaf.id.clone(),
            source,
        })?;
        let refund = parse_tx(refund_tx).map_err(|_| SdkError::Leaf {
            leaf_id: leaf.id.clone(),
            source: LeafError::InvalidRefundTx,
        })?;
        verify_key_spend(
            &self.inner.secp,
            &refund,
            &node_tx,
            leaf.vout,
            &leaf.verifying_public_key,
        )
        .map_err(|e| {
            error!(leaf_id = %leaf.id, error = %e, "intermediate refund signature invalid");
            SdkError::InvalidSignature {
                context: "intermediate refund",
            }
        })
    }
}
