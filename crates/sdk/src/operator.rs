//! Signing operator RPC surface.
//!
//! [`OperatorClient`] is the wallet's only channel to the operators. Every
//! call names the operator it is addressed to; authenticated calls carry
//! that operator's session token (see [`crate::session`]). Wire encoding is
//! the implementation's concern: requests and responses here are plain
//! domain types.
//!
//! Methods return `impl Future + Send` so a client can be driven from any
//! tokio task and fanned out with [`crate::fanout::quorum_join`].

use std::collections::BTreeMap;
use std::future::Future;

use bitcoin::secp256k1::PublicKey;
use bytes::Bytes;
use custody_config::Network;
use custody_crypto::verifiable_secret_sharing::VerifiableSecretShare;
use custody_signer::{SignatureShare, SigningCommitments};
use frost_secp256k1_tr::Identifier;

use crate::leaf::Leaf;
use crate::token::{KeyshareInfo, OwnedTokenOutput, TokenPublicKey, TokenTransaction};
use crate::transfer::Transfer;
use crate::SdkError;

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// A challenge to be signed with the identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub challenge: Bytes,
    /// UNIX seconds.
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct VerifyChallengeRequest {
    pub challenge: Bytes,
    pub identity_public_key: PublicKey,
    /// DER ECDSA signature over `sha256(challenge)`.
    pub signature: Vec<u8>,
}

/// An authenticated session with one operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: Bytes,
    /// UNIX seconds.
    pub expires_at: i64,
}

// ---------------------------------------------------------------------------
// Signing rounds
// ---------------------------------------------------------------------------

/// The owner's half of a signing job: which transaction to sign, and the
/// owner's nonce commitment.
#[derive(Debug, Clone)]
pub struct UserSigningJob {
    pub signing_public_key: PublicKey,
    /// Unsigned transaction; input 0 spends the leaf output.
    pub raw_tx: Vec<u8>,
    pub commitment: SigningCommitments,
}

/// The operators' half of a signing round.
///
/// All maps are keyed by the operators' FROST identifiers. Verifying
/// shares are already scaled for the signing set.
#[derive(Debug, Clone, Default)]
pub struct OperatorSigningResult {
    pub commitments: BTreeMap<Identifier, SigningCommitments>,
    pub signature_shares: BTreeMap<Identifier, SignatureShare>,
    pub verifying_shares: BTreeMap<Identifier, PublicKey>,
}

// ---------------------------------------------------------------------------
// Deposits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GenerateDepositAddressRequest {
    pub signing_public_key: PublicKey,
    pub identity_public_key: PublicKey,
    pub network: Network,
    pub leaf_id: String,
}

/// Evidence that the operators hold the other half of a deposit key.
#[derive(Debug, Clone)]
pub struct DepositAddressProof {
    /// BIP340 signature by the operators' aggregate key (key-path tweaked)
    /// over `sha256(identity_pk ‖ operator_pk ‖ address)`.
    pub proof_of_possession: [u8; 64],
    /// ECDSA signatures over `sha256(address)`, keyed by operator id.
    pub operator_signatures: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct DepositAddress {
    pub address: String,
    pub leaf_id: String,
    /// `Y = signing_pk + operator_pk`.
    pub verifying_public_key: PublicKey,
    pub proof: DepositAddressProof,
}

#[derive(Debug, Clone)]
pub struct StartTreeCreationRequest {
    pub identity_public_key: PublicKey,
    pub signing_public_key: PublicKey,
    pub deposit_tx: Vec<u8>,
    pub vout: u32,
    pub root_tx_signing_job: UserSigningJob,
    pub refund_tx_signing_job: UserSigningJob,
}

#[derive(Debug, Clone)]
pub struct StartTreeCreationResponse {
    pub tree_id: String,
    pub root_node_id: String,
    pub verifying_public_key: PublicKey,
    pub root_tx_signing_result: OperatorSigningResult,
    pub refund_tx_signing_result: OperatorSigningResult,
}

/// Why aggregated signatures are being handed back to the operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningIntent {
    Creation,
    Transfer,
}

#[derive(Debug, Clone)]
pub struct NodeSignatures {
    pub node_id: String,
    pub node_tx_signature: Option<[u8; 64]>,
    pub refund_tx_signature: Option<[u8; 64]>,
}

#[derive(Debug, Clone)]
pub struct FinalizeNodeSignaturesRequest {
    pub intent: SigningIntent,
    pub node_signatures: Vec<NodeSignatures>,
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SigningCommitmentsRequest {
    pub node_ids: Vec<String>,
}

/// One leaf of an outgoing transfer.
#[derive(Debug, Clone)]
pub struct TransferLeafRequest {
    pub leaf_id: String,
    pub old_signing_public_key: PublicKey,
    /// The intermediate key handed to the receiver.
    pub new_signing_public_key: PublicKey,
    /// The intermediate key, ECIES-encrypted to the receiver.
    pub secret_cipher: Vec<u8>,
    /// Sender ECDSA over `sha256(leaf_id ‖ transfer_id ‖ secret_cipher)`.
    pub signature: Vec<u8>,
    /// Unsigned refund paying the receiver.
    pub refund_tx: Vec<u8>,
    pub user_commitment: SigningCommitments,
    pub user_signature_share: SignatureShare,
    /// The operator commitments the user share was computed against.
    pub operator_commitments: BTreeMap<Identifier, SigningCommitments>,
    /// Shares of `old - new`, keyed by operator id.
    pub key_tweak_shares: BTreeMap<String, VerifiableSecretShare>,
}

#[derive(Debug, Clone)]
pub struct StartTransferRequest {
    pub transfer_id: String,
    pub owner_identity_public_key: PublicKey,
    pub receiver_identity_public_key: PublicKey,
    /// UNIX seconds.
    pub expiry_time: u64,
    pub leaves: Vec<TransferLeafRequest>,
}

#[derive(Debug, Clone)]
pub struct ClaimLeafKeyTweak {
    pub leaf_id: String,
    /// This operator's share of `intermediate - final`.
    pub secret_share_tweak: VerifiableSecretShare,
}

#[derive(Debug, Clone)]
pub struct ClaimTransferTweakKeysRequest {
    pub transfer_id: String,
    pub owner_identity_public_key: PublicKey,
    pub leaves: Vec<ClaimLeafKeyTweak>,
}

#[derive(Debug, Clone)]
pub struct LeafSigningJob {
    pub leaf_id: String,
    pub job: UserSigningJob,
}

#[derive(Debug, Clone)]
pub struct ClaimTransferSignRefundsRequest {
    pub transfer_id: String,
    pub owner_identity_public_key: PublicKey,
    pub signing_jobs: Vec<LeafSigningJob>,
}

#[derive(Debug, Clone)]
pub struct LeafSigningResult {
    pub leaf_id: String,
    pub verifying_public_key: PublicKey,
    pub result: OperatorSigningResult,
}

// ---------------------------------------------------------------------------
// Preimage escrow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StorePreimageShareRequest {
    pub payment_hash: [u8; 32],
    pub preimage_share: VerifiableSecretShare,
    pub threshold: usize,
    pub receiver_identity_public_key: PublicKey,
    pub user_identity_public_key: PublicKey,
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StartTokenTransactionRequest {
    pub identity_public_key: PublicKey,
    pub partial_transaction: TokenTransaction,
    /// Owner signatures over the partial hash, one per input (one for a
    /// mint).
    pub owner_signatures: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct StartTokenTransactionResponse {
    pub final_transaction: TokenTransaction,
    pub keyshare_info: KeyshareInfo,
}

#[derive(Debug, Clone)]
pub struct SignTokenTransactionRequest {
    pub final_transaction: TokenTransaction,
    pub final_hash: [u8; 32],
    /// Owner signatures over the final hash.
    pub owner_signatures: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct SignTokenTransactionResponse {
    /// ECDSA signatures over the final hash, keyed by operator id.
    pub operator_signatures: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct FreezeTokensRequest {
    pub owner_public_key: TokenPublicKey,
    pub token_public_key: TokenPublicKey,
    pub issuer_provided_timestamp: u64,
    pub should_unfreeze: bool,
    /// Issuer ECDSA over the freeze payload for this operator.
    pub issuer_signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeTokensResponse {
    pub impacted_output_ids: Vec<String>,
    pub impacted_amount: u128,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Per-operator RPC client.
pub trait OperatorClient: Send + Sync {
    // -- Authentication -----------------------------------------------------

    fn get_challenge(
        &self,
        operator_id: &str,
        identity_public_key: &PublicKey,
    ) -> impl Future<Output = Result<Challenge, SdkError>> + Send;

    fn verify_challenge(
        &self,
        operator_id: &str,
        req: VerifyChallengeRequest,
    ) -> impl Future<Output = Result<Session, SdkError>> + Send;

    // -- Deposits -----------------------------------------------------------

    fn generate_deposit_address(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: GenerateDepositAddressRequest,
    ) -> impl Future<Output = Result<DepositAddress, SdkError>> + Send;

    fn start_deposit_tree_creation(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StartTreeCreationRequest,
    ) -> impl Future<Output = Result<StartTreeCreationResponse, SdkError>> + Send;

    /// Hands aggregated signatures back; returns the resulting leaves.
    fn finalize_node_signatures(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: FinalizeNodeSignaturesRequest,
    ) -> impl Future<Output = Result<Vec<Leaf>, SdkError>> + Send;

    // -- Transfers ------------------------------------------------------------

    /// One fresh commitment per requested node, in request order.
    fn get_signing_commitments(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: SigningCommitmentsRequest,
    ) -> impl Future<Output = Result<Vec<SigningCommitments>, SdkError>> + Send;

    fn start_transfer(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StartTransferRequest,
    ) -> impl Future<Output = Result<Transfer, SdkError>> + Send;

    /// Returns the authoritative transfer state after the attempt.
    fn cancel_transfer(
        &self,
        operator_id: &str,
        token: &Bytes,
        transfer_id: &str,
    ) -> impl Future<Output = Result<Transfer, SdkError>> + Send;

    /// Transfers addressed to the authenticated identity that await a claim.
    fn query_pending_transfers(
        &self,
        operator_id: &str,
        token: &Bytes,
    ) -> impl Future<Output = Result<Vec<Transfer>, SdkError>> + Send;

    fn query_transfer(
        &self,
        operator_id: &str,
        token: &Bytes,
        transfer_id: &str,
    ) -> impl Future<Output = Result<Transfer, SdkError>> + Send;

    fn claim_transfer_tweak_keys(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: ClaimTransferTweakKeysRequest,
    ) -> impl Future<Output = Result<(), SdkError>> + Send;

    fn claim_transfer_sign_refunds(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: ClaimTransferSignRefundsRequest,
    ) -> impl Future<Output = Result<Vec<LeafSigningResult>, SdkError>> + Send;

    // -- Preimage escrow ------------------------------------------------------

    fn store_preimage_share(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StorePreimageShareRequest,
    ) -> impl Future<Output = Result<(), SdkError>> + Send;

    // -- Tokens ---------------------------------------------------------------

    fn start_token_transaction(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StartTokenTransactionRequest,
    ) -> impl Future<Output = Result<StartTokenTransactionResponse, SdkError>> + Send;

    fn sign_token_transaction(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: SignTokenTransactionRequest,
    ) -> impl Future<Output = Result<SignTokenTransactionResponse, SdkError>> + Send;

    fn freeze_tokens(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: FreezeTokensRequest,
    ) -> impl Future<Output = Result<FreezeTokensResponse, SdkError>> + Send;

    /// Unspent outputs owned by `owner_public_key`.
    fn query_token_outputs(
        &self,
        operator_id: &str,
        token: &Bytes,
        owner_public_key: &TokenPublicKey,
    ) -> impl Future<Output = Result<Vec<OwnedTokenOutput>, SdkError>> + Send;
}
