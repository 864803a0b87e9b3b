//! Token operations: transfer, mint, burn, freeze, and sync.
//!
//! Token operations use ECDSA identity key signatures (not FROST).
//!
//! # Transaction Flow
//!
//! 1. Build the partial transaction (inputs, creator-owned output fields)
//! 2. Hash it with `partial = true` and sign once per input
//! 3. `start_token_transaction` on the coordinator; the operators fill in
//!    output ids, revocation commitments, bond, and locktime
//! 4. Validate the final transaction against the partial one
//! 5. Hash the final transaction, sign again, `sign_token_transaction`
//! 6. Check a threshold of operator signatures, then update the store
//!
//! Issuer-only operations are provided by [`IssuerExtensions`].

use std::future::Future;

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::PublicKey;
use custody_signer::{ecdsa, WalletSigner};
use tracing::{debug, error, info};

use super::hash::hash_token_transaction;
use super::store::{OwnedTokenOutput, TokenStore};
use super::transaction::{
    OutputRef, TokenAmount, TokenInputs, TokenOutput, TokenPublicKey, TokenTransaction,
    BURN_PUBLIC_KEY,
};
use super::validate::validate_token_transaction;
use crate::operator::{
    FreezeTokensRequest, FreezeTokensResponse, OperatorClient, SignTokenTransactionRequest,
    StartTokenTransactionRequest,
};
use crate::tree::TreeStore;
use crate::utils::{hex_decode, hex_decode_pubkey, unix_now};
use crate::{SdkError, Wallet};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A token transaction the operators have signed.
#[derive(Debug, Clone)]
pub struct TokenTransactionResult {
    pub final_transaction: TokenTransaction,
    /// The final hash; new outputs reference it.
    pub final_hash: [u8; 32],
}

/// Digest the issuer signs for one operator in a freeze request.
///
/// `sha256(owner ‖ token ‖ should_unfreeze ‖ timestamp_be ‖ operator_identity)`.
/// Binding the operator's identity key keeps a signature for one operator
/// from being replayed to another.
pub fn freeze_payload_digest(
    owner_public_key: &TokenPublicKey,
    token_public_key: &TokenPublicKey,
    should_unfreeze: bool,
    issuer_provided_timestamp: u64,
    operator_identity_public_key: &[u8],
) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(owner_public_key);
    engine.input(token_public_key);
    engine.input(&[u8::from(should_unfreeze)]);
    engine.input(&issuer_provided_timestamp.to_be_bytes());
    engine.input(operator_identity_public_key);
    sha256::Hash::from_engine(engine).to_byte_array()
}

// ---------------------------------------------------------------------------
// IssuerExtensions
// ---------------------------------------------------------------------------

/// Operations only a token's issuer can perform. The issuer's identity key
/// is the token key.
pub trait IssuerExtensions {
    /// Mints `amount` new units to the issuer.
    fn mint_tokens(
        &self,
        amount: TokenAmount,
    ) -> impl Future<Output = Result<TokenTransactionResult, SdkError>>;

    /// Destroys `amount` of the issuer's own units.
    fn burn_tokens(
        &self,
        amount: TokenAmount,
    ) -> impl Future<Output = Result<TokenTransactionResult, SdkError>>;

    /// Freezes every output of the token owned by `owner`.
    fn freeze_tokens(
        &self,
        owner: &PublicKey,
    ) -> impl Future<Output = Result<FreezeTokensResponse, SdkError>>;

    /// Lifts a freeze.
    fn unfreeze_tokens(
        &self,
        owner: &PublicKey,
    ) -> impl Future<Output = Result<FreezeTokensResponse, SdkError>>;
}

impl<C, W, T, K> IssuerExtensions for Wallet<C, W, T, K>
where
    C: OperatorClient,
    W: WalletSigner,
    T: TreeStore,
    K: TokenStore,
{
    async fn mint_tokens(&self, amount: TokenAmount) -> Result<TokenTransactionResult, SdkError> {
        self.check_cancelled()?;
        let amount = positive_amount(&amount)?;
        let issuer = self.identity_public_key().serialize();

        let partial = TokenTransaction {
            network: self.inner.config.network.network,
            inputs: TokenInputs::Mint {
                issuer_public_key: issuer,
                issuer_timestamp: unix_now(),
            },
            outputs: vec![TokenOutput::new(issuer, issuer, amount)],
            operator_identity_public_keys: self.operator_identity_keys()?,
        };
        let result = self.run_token_transaction(partial, 1).await?;
        self.inner
            .token_store
            .insert_outputs(&self.owned_outputs(&result)?)?;
        info!(amount, "tokens minted");
        Ok(result)
    }

    async fn burn_tokens(&self, amount: TokenAmount) -> Result<TokenTransactionResult, SdkError> {
        let token = self.identity_public_key().serialize();
        let result = self.transfer_to(&token, amount, BURN_PUBLIC_KEY).await?;
        info!("tokens burned");
        Ok(result)
    }

    async fn freeze_tokens(&self, owner: &PublicKey) -> Result<FreezeTokensResponse, SdkError> {
        self.set_frozen(owner, false).await
    }

    async fn unfreeze_tokens(&self, owner: &PublicKey) -> Result<FreezeTokensResponse, SdkError> {
        self.set_frozen(owner, true).await
    }
}

// ---------------------------------------------------------------------------
// Wallet impl -- token operations
// ---------------------------------------------------------------------------

impl<C, W, T, K> Wallet<C, W, T, K>
where
    C: OperatorClient,
    W: WalletSigner,
    T: TreeStore,
    K: TokenStore,
{
    /// Sends `amount` of `token_public_key` to `receiver`.
    ///
    /// Outputs are locked while the transaction is in flight. If they
    /// exceed `amount`, a change output is created back to the sender. On
    /// failure the lock is released.
    pub async fn transfer_tokens(
        &self,
        token_public_key: &TokenPublicKey,
        amount: TokenAmount,
        receiver: &PublicKey,
    ) -> Result<TokenTransactionResult, SdkError> {
        let result = self
            .transfer_to(token_public_key, amount, receiver.serialize())
            .await?;
        info!(receiver = %receiver, "tokens sent");
        Ok(result)
    }

    /// Replaces the local token outputs with the operators' view.
    ///
    /// Receivers call this to pick up outputs sent to them.
    pub async fn sync_token_outputs(&self) -> Result<(), SdkError> {
        self.check_cancelled()?;
        let coordinator = self.coordinator().id.clone();
        let token = self.session_token(&coordinator).await?;
        let owner = self.identity_public_key().serialize();
        let outputs = self
            .inner
            .client
            .query_token_outputs(&coordinator, &token, &owner)
            .await?;
        if let Some(foreign) = outputs.iter().find(|o| o.owner_public_key != owner) {
            return Err(SdkError::operator_response(
                &coordinator,
                format!("output {} belongs to another owner", foreign.id),
            ));
        }
        self.inner.token_store.set_outputs(&outputs)?;
        debug!(outputs = outputs.len(), "token outputs synced");
        Ok(())
    }

    async fn transfer_to(
        &self,
        token_public_key: &TokenPublicKey,
        amount: TokenAmount,
        receiver: TokenPublicKey,
    ) -> Result<TokenTransactionResult, SdkError> {
        self.check_cancelled()?;
        let amount = positive_amount(&amount)?;
        let acquired = self
            .inner
            .token_store
            .acquire_outputs(token_public_key, amount)?;

        let sender = self.identity_public_key().serialize();
        let mut outputs = vec![TokenOutput::new(receiver, *token_public_key, amount)];
        if acquired.total_amount > amount {
            outputs.push(TokenOutput::new(
                sender,
                *token_public_key,
                acquired.total_amount - amount,
            ));
        }

        let partial = TokenTransaction {
            network: self.inner.config.network.network,
            inputs: TokenInputs::Transfer {
                outputs_to_spend: acquired
                    .outputs
                    .iter()
                    .map(|o| OutputRef {
                        prev_token_transaction_hash: o.previous_transaction_hash,
                        prev_vout: o.previous_transaction_vout,
                    })
                    .collect(),
            },
            outputs,
            operator_identity_public_keys: self.operator_identity_keys()?,
        };

        let result = match self
            .run_token_transaction(partial, acquired.outputs.len())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.inner.token_store.release_outputs(acquired.lock_id)?;
                return Err(e);
            }
        };

        self.inner.token_store.spend_outputs(acquired.lock_id)?;
        self.inner
            .token_store
            .insert_outputs(&self.owned_outputs(&result)?)?;
        Ok(result)
    }

    /// Runs the start/validate/sign exchange for `partial`, which spends
    /// `input_count` inputs.
    async fn run_token_transaction(
        &self,
        partial: TokenTransaction,
        input_count: usize,
    ) -> Result<TokenTransactionResult, SdkError> {
        let signer = &self.inner.signer;
        let config = &self.inner.config;
        let coordinator = self.coordinator().id.clone();
        let token = self.session_token(&coordinator).await?;

        let partial_hash = hash_token_transaction(&partial, true)?;
        let partial_signature = signer.sign_identity_digest(&partial_hash);
        let started = self
            .inner
            .client
            .start_token_transaction(
                &coordinator,
                &token,
                StartTokenTransactionRequest {
                    identity_public_key: self.identity_public_key(),
                    partial_transaction: partial.clone(),
                    owner_signatures: vec![partial_signature; input_count],
                },
            )
            .await?;
        debug!(operators = started.keyshare_info.owner_identifiers.len(), "token transaction started");

        validate_token_transaction(
            &started.final_transaction,
            &partial,
            &config.network,
            &started.keyshare_info,
            config.expected_withdraw_bond_sats,
            config.expected_withdraw_relative_block_locktime,
        )?;

        let final_hash = hash_token_transaction(&started.final_transaction, false)?;
        let final_signature = signer.sign_identity_digest(&final_hash);
        let signed = self
            .inner
            .client
            .sign_token_transaction(
                &coordinator,
                &token,
                SignTokenTransactionRequest {
                    final_transaction: started.final_transaction.clone(),
                    final_hash,
                    owner_signatures: vec![final_signature; input_count],
                },
            )
            .await?;

        let valid = signed
            .operator_signatures
            .iter()
            .filter(|(operator, signature)| {
                config
                    .network
                    .operator(operator)
                    .and_then(|op| hex_decode_pubkey(&op.identity_public_key))
                    .is_some_and(|key| {
                        ecdsa::verify_digest(&self.inner.secp, &key, &final_hash, signature).is_ok()
                    })
            })
            .count();
        if valid < self.threshold() {
            error!(valid, required = self.threshold(), "not enough operator token signatures");
            return Err(SdkError::QuorumNotMet {
                required: self.threshold(),
                got: valid,
            });
        }

        Ok(TokenTransactionResult {
            final_transaction: started.final_transaction,
            final_hash,
        })
    }

    /// Outputs of a completed transaction that this wallet owns.
    fn owned_outputs(
        &self,
        result: &TokenTransactionResult,
    ) -> Result<Vec<OwnedTokenOutput>, SdkError> {
        let owner = self.identity_public_key().serialize();
        result
            .final_transaction
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.owner_public_key == owner)
            .map(|(vout, o)| {
                Ok(OwnedTokenOutput {
                    id: o.id.clone().unwrap_or_default(),
                    owner_public_key: o.owner_public_key,
                    token_public_key: o.token_public_key,
                    amount: o.amount.to_u128()?,
                    previous_transaction_hash: result.final_hash,
                    previous_transaction_vout: u32::try_from(vout).map_err(|_| {
                        SdkError::InvalidRequest("too many token outputs".into())
                    })?,
                    withdraw_bond_sats: o.withdraw_bond_sats.unwrap_or_default(),
                    withdraw_relative_block_locktime: o
                        .withdraw_relative_block_locktime
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Identity keys of the configured operators, in config order.
    fn operator_identity_keys(&self) -> Result<Vec<[u8; 33]>, SdkError> {
        self.inner
            .config
            .network
            .operators()
            .iter()
            .map(|op| {
                hex_decode(&op.identity_public_key)
                    .and_then(|bytes| <[u8; 33]>::try_from(bytes).ok())
                    .ok_or_else(|| {
                        SdkError::InvalidRequest(format!(
                            "operator {} identity key is malformed",
                            op.id
                        ))
                    })
            })
            .collect()
    }

    /// Freezes or unfreezes `owner`'s outputs of this issuer's token at
    /// every operator. All operators must agree on the impact.
    async fn set_frozen(
        &self,
        owner: &PublicKey,
        should_unfreeze: bool,
    ) -> Result<FreezeTokensResponse, SdkError> {
        self.check_cancelled()?;
        let owner = owner.serialize();
        let token_public_key = self.identity_public_key().serialize();
        let timestamp = unix_now();

        let requests = self
            .inner
            .config
            .network
            .operators()
            .iter()
            .map(|op| {
                let identity = hex_decode(&op.identity_public_key).ok_or_else(|| {
                    SdkError::InvalidRequest(format!("operator {} identity key is malformed", op.id))
                })?;
                let digest = freeze_payload_digest(
                    &owner,
                    &token_public_key,
                    should_unfreeze,
                    timestamp,
                    &identity,
                );
                Ok((
                    op.id.clone(),
                    FreezeTokensRequest {
                        owner_public_key: owner,
                        token_public_key,
                        issuer_provided_timestamp: timestamp,
                        should_unfreeze,
                        issuer_signature: self.inner.signer.sign_identity_digest(&digest),
                    },
                ))
            })
            .collect::<Result<Vec<_>, SdkError>>()?;

        let client = &self.inner.client;
        let requests = &requests;
        let responses = self
            .fan_out(self.num_operators(), |operator, token| {
                let req = requests
                    .iter()
                    .find(|(id, _)| *id == operator)
                    .map(|(_, req)| req.clone())
                    .ok_or_else(|| SdkError::operator_response(&operator, "no request for operator"));
                async move { client.freeze_tokens(&operator, &token, req?).await }
            })
            .await?;

        let mut responses = responses.into_iter();
        let (_, first) = responses
            .next()
            .ok_or_else(|| SdkError::InvalidRequest("no operators configured".into()))?;
        for (operator, response) in responses {
            if response.impacted_amount != first.impacted_amount {
                error!(operator = %operator, "operators disagree on frozen amount");
                return Err(SdkError::operator_response(
                    &operator,
                    "impacted amount differs between operators",
                ));
            }
        }

        info!(
            unfreeze = should_unfreeze,
            outputs = first.impacted_output_ids.len(),
            amount = first.impacted_amount,
            "token freeze updated"
        );
        Ok(first)
    }
}

fn positive_amount(amount: &TokenAmount) -> Result<u128, SdkError> {
    match amount.to_u128()? {
        0 => Err(SdkError::InvalidRequest("amount must be positive".into())),
        amount => Ok(amount),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_digest_binds_operator_and_direction() {
        let owner = [0x02; 33];
        let token = [0x03; 33];
        let base = freeze_payload_digest(&owner, &token, false, 100, &[0x02; 33]);
        assert_ne!(base, freeze_payload_digest(&owner, &token, true, 100, &[0x02; 33]));
        assert_ne!(base, freeze_payload_digest(&owner, &token, false, 101, &[0x02; 33]));
        assert_ne!(base, freeze_payload_digest(&owner, &token, false, 100, &[0x03; 33]));
        assert_ne!(base, freeze_payload_digest(&token, &owner, false, 100, &[0x02; 33]));
    }

    #[test]
    fn zero_amount_is_rejected() {
        assert!(matches!(
            positive_amount(&TokenAmount::from(0u128)),
            Err(SdkError::InvalidRequest(_))
        ));
        assert_eq!(positive_amount(&TokenAmount::from(7u128)).unwrap(), 7);
    }
}
