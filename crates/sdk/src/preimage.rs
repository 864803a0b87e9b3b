//! Preimage escrow.
//!
//! A payment preimage is split t-of-n and one share handed to each
//! operator, so that a threshold of them can later release it to the
//! receiver without any single operator learning it.

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::PublicKey;
use custody_signer::{WalletSigner, WalletSignerError};
use rand_core::OsRng;
use tracing::{error, info};

use crate::operator::{OperatorClient, StorePreimageShareRequest};
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
    /// Escrows `preimage` with the operators for `receiver`.
    ///
    /// Every operator must store its share. The preimage is shared as a
    /// secp256k1 scalar, so a preimage of zero or one at or above the
    /// curve order cannot be escrowed. It is rejected rather than reduced,
    /// since a reduced value would not hash to `payment_hash` on release.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::InvalidRequest`] if `preimage` does not hash to
    /// `payment_hash` or is not a valid scalar, and [`SdkError::Quorum`]
    /// unless all operators accept their share.
    pub async fn escrow_preimage(
        &self,
        payment_hash: &[u8; 32],
        preimage: &[u8; 32],
        receiver: &PublicKey,
    ) -> Result<(), SdkError> {
        self.check_cancelled()?;
        if sha256::Hash::hash(preimage).to_byte_array() != *payment_hash {
            error!("preimage does not match payment hash");
            return Err(SdkError::InvalidRequest(
                "preimage does not match payment hash".into(),
            ));
        }

        let threshold = self.threshold();
        let n = self.num_operators();
        let shares = self
            .inner
            .signer
            .split_bytes_with_proofs(preimage, threshold, n, &mut OsRng)
            .map_err(|e| match e {
                WalletSignerError::VssScalarOutOfRange => {
                    error!("preimage is not a valid secp256k1 scalar");
                    SdkError::InvalidRequest("preimage is not a valid secp256k1 scalar".into())
                }
                other => other.into(),
            })?;
        let shares: Vec<(String, _)> = self
            .inner
            .config
            .network
            .operators()
            .iter()
            .map(|op| op.id.clone())
            .zip(shares)
            .collect();

        let client = &self.inner.client;
        let shares = &shares;
        let user = self.identity_public_key();
        let receiver = *receiver;
        let payment_hash = *payment_hash;
        self.fan_out(n, |operator, token| {
            let req = shares
                .iter()
                .find(|(id, _)| *id == operator)
                .map(|(_, share)| StorePreimageShareRequest {
                    payment_hash,
                    preimage_share: share.clone(),
                    threshold,
                    receiver_identity_public_key: receiver,
                    user_identity_public_key: user,
                })
                .ok_or_else(|| SdkError::operator_response(&operator, "no share for operator"));
            async move { client.store_preimage_share(&operator, &token, req?).await }
        })
        .await?;

        info!(payment_hash = %crate::utils::hex_encode(&payment_hash), operators = n, "preimage escrowed");
        Ok(())
    }
}
