//! Custody SDK: leaf custody, transfers, deposits, and tokens.
//!
//! The wallet orchestrates the custody protocol by combining:
//! - **Operators** ([`OperatorClient`]) for the per-operator RPC surface
//! - **Signing** ([`WalletSigner`]) for every secret-key operation
//! - **Tree store** ([`TreeStore`]) for leaf state
//! - **Token store** ([`TokenStore`]) for token output state
//!
//! # Architecture
//!
//! Two parallel state subsystems:
//! - **Leaves**: Bitcoin outputs controlled by `Y = Y_owner + Y_operators`.
//!   Ownership moves by re-splitting the owner's key; every owner change
//!   re-signs the refund with FROST.
//! - **Token outputs**: ledger entries signed by the owner's identity key.
//!   A token transaction is a two-phase start/sign exchange with the
//!   coordinator.
//!
//! # Usage
//!
//! ```no_run
//! use custody_config::NetworkConfig;
//! use custody_sdk::operator::OperatorClient;
//! use custody_sdk::{Wallet, WalletConfig};
//! use custody_signer::SeedSigner;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(client: impl OperatorClient) -> Result<(), custody_sdk::SdkError> {
//! let network = NetworkConfig::regtest();
//! let signer = SeedSigner::from_seed(&[7u8; 64], bitcoin::Network::Regtest, 0)
//!     .expect("valid seed");
//! let cancel = CancellationToken::new();
//!
//! let wallet = Wallet::with_memory_stores(WalletConfig::new(network), client, signer, cancel.clone());
//!
//! // Wallet is Clone -- share across tasks.
//! let wallet2 = wallet.clone();
//! let _ = wallet2.balance()?;
//!
//! // Graceful shutdown.
//! wallet.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bitcoin_tx;
pub mod deposit;
pub mod error;
pub mod fanout;
pub mod leaf;
pub mod operator;
pub mod preimage;
pub mod session;
pub mod signing;
pub mod token;
pub mod transfer;
pub mod tree;
pub mod utils;

pub use error::{QuorumError, SdkError};
pub use leaf::{Leaf, LeafStatus};
pub use operator::OperatorClient;
pub use token::{IssuerExtensions, TokenAmount, TokenPublicKey, TokenStore};
pub use transfer::{Transfer, TransferLeaf, TransferStatus};
pub use tree::{LeafSelector, TreeStore};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bytes::Bytes;
use custody_config::constants::{
    DEFAULT_SEND_ATTEMPTS, DEFAULT_TRANSFER_EXPIRY_SECS, DEFAULT_WITHDRAW_BOND_SATS,
    DEFAULT_WITHDRAW_RELATIVE_LOCKTIME,
};
use custody_config::{NetworkConfig, OperatorInfo};
use custody_crypto::frost::identifier_from_bytes;
use custody_signer::WalletSigner;
use frost_secp256k1_tr::Identifier;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::deposit::TrackedDeposit;
use crate::fanout::quorum_join;
use crate::operator::VerifyChallengeRequest;
use crate::session::SessionCache;
use crate::token::InMemoryTokenStore;
use crate::tree::{GreedySelector, InMemoryTreeStore, ReservationId};
use crate::utils::hex_decode;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Wallet configuration.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Operator set, threshold, and network.
    pub network: NetworkConfig,
    /// How long a sent transfer stays claimable.
    pub transfer_expiry: Duration,
    /// Fresh attempts a send makes before giving up on a transient error.
    pub send_attempts: u32,
    /// Withdrawal bond every token output must carry.
    pub expected_withdraw_bond_sats: u64,
    /// Withdrawal locktime every token output must carry, in blocks.
    pub expected_withdraw_relative_block_locktime: u64,
}

impl WalletConfig {
    /// Configuration with protocol defaults for `network`.
    pub fn new(network: NetworkConfig) -> Self {
        Self {
            network,
            transfer_expiry: Duration::from_secs(DEFAULT_TRANSFER_EXPIRY_SECS),
            send_attempts: DEFAULT_SEND_ATTEMPTS,
            expected_withdraw_bond_sats: DEFAULT_WITHDRAW_BOND_SATS,
            expected_withdraw_relative_block_locktime: DEFAULT_WITHDRAW_RELATIVE_LOCKTIME,
        }
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

/// Shared state across all wallet operations.
pub(crate) struct WalletInner<C, W, T, K> {
    pub config: WalletConfig,
    pub client: C,
    pub signer: W,
    pub tree_store: T,
    pub token_store: K,
    pub secp: Secp256k1<All>,
    pub sessions: SessionCache,
    pub leaf_selector: RwLock<Arc<dyn LeafSelector>>,
    /// Outgoing transfer id -> reservation holding its leaves.
    pub outgoing: Mutex<HashMap<String, ReservationId>>,
    /// Deposit addresses handed out, keyed by output script.
    pub deposits: Mutex<HashMap<Vec<u8>, TrackedDeposit>>,
    pub cancel: CancellationToken,
}

/// The wallet entry point.
///
/// `Clone`-able (wraps an `Arc<WalletInner>`). Stores are trait-based with
/// in-memory defaults.
///
/// # Type Parameters
///
/// - `C`: operator RPC client
/// - `W`: wallet signer holding every secret key
/// - `T`: leaf storage (insert, reserve, finalize leaves)
/// - `K`: token output storage (acquire, release, track balances)
pub struct Wallet<C, W, T = InMemoryTreeStore, K = InMemoryTokenStore> {
    pub(crate) inner: Arc<WalletInner<C, W, T, K>>,
}

// Manual Clone: we don't require C, W, T, K to be Clone.
impl<C, W, T, K> Clone for Wallet<C, W, T, K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, W, T, K> std::fmt::Debug for Wallet<C, W, T, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("network", &self.inner.config.network.network)
            .field("operators", &self.inner.config.network.num_operators())
            .finish()
    }
}

impl<C, W> Wallet<C, W>
where
    C: OperatorClient,
    W: WalletSigner,
{
    /// Creates a wallet backed by in-memory stores.
    pub fn with_memory_stores(
        config: WalletConfig,
        client: C,
        signer: W,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(
            config,
            client,
            signer,
            InMemoryTreeStore::new(),
            InMemoryTokenStore::new(),
            cancel,
        )
    }
}

impl<C, W, T, K> Wallet<C, W, T, K>
where
    C: OperatorClient,
    W: WalletSigner,
    T: TreeStore,
    K: TokenStore,
{
    /// Creates a new wallet.
    ///
    /// No operator I/O happens during construction; sessions are opened
    /// lazily on first use.
    pub fn new(
        config: WalletConfig,
        client: C,
        signer: W,
        tree_store: T,
        token_store: K,
        cancel: CancellationToken,
    ) -> Self {
        let sessions = SessionCache::new(config.network.num_operators());
        Self {
            inner: Arc::new(WalletInner {
                config,
                client,
                signer,
                tree_store,
                token_store,
                secp: Secp256k1::new(),
                sessions,
                leaf_selector: RwLock::new(Arc::new(GreedySelector)),
                outgoing: Mutex::new(HashMap::new()),
                deposits: Mutex::new(HashMap::new()),
                cancel,
            }),
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.inner.config
    }

    pub fn signer(&self) -> &W {
        &self.inner.signer
    }

    pub fn tree_store(&self) -> &T {
        &self.inner.tree_store
    }

    pub fn token_store(&self) -> &K {
        &self.inner.token_store
    }

    /// The wallet's identity key.
    pub fn identity_public_key(&self) -> PublicKey {
        self.inner.signer.identity_public_key()
    }

    /// Returns a reference to the cancellation token.
    pub fn cancel(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Graceful shutdown: signals cancellation and lets in-flight
    /// operations observe it.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        tokio::task::yield_now().await;
    }

    /// Checks whether the wallet has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Returns [`SdkError::Cancelled`] if the cancellation token has fired.
    pub(crate) fn check_cancelled(&self) -> Result<(), SdkError> {
        if self.inner.cancel.is_cancelled() {
            Err(SdkError::Cancelled)
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Balances
    // -----------------------------------------------------------------------

    /// Spendable satoshis across available leaves.
    pub fn balance(&self) -> Result<u64, SdkError> {
        self.inner.tree_store.available_balance()
    }

    /// Unlocked balance of one token.
    pub fn token_balance(&self, token_public_key: &TokenPublicKey) -> Result<u128, SdkError> {
        self.inner.token_store.get_balance(token_public_key)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Opens (or reuses) a session with the coordinator.
    pub async fn authenticate(&self) -> Result<Bytes, SdkError> {
        self.check_cancelled()?;
        let coordinator = self.inner.config.network.coordinator().id.clone();
        self.session_token(&coordinator).await
    }

    /// Returns a cached session token for `operator_id`, or runs the
    /// challenge/verify handshake to obtain one.
    pub(crate) async fn session_token(&self, operator_id: &str) -> Result<Bytes, SdkError> {
        let idx = self.operator_index(operator_id)?;
        let signer = &self.inner.signer;
        let pubkey = signer.public_key();

        if let Some(token) = self.inner.sessions.get(idx, &pubkey) {
            return Ok(token);
        }

        let identity = signer.identity_public_key();
        let challenge = self
            .inner
            .client
            .get_challenge(operator_id, &identity)
            .await?;
        let signature = signer.sign_challenge(&challenge.challenge).map_err(|e| {
            warn!(operator = %operator_id, error = %e, "challenge signing failed");
            SdkError::AuthFailed
        })?;
        let session = self
            .inner
            .client
            .verify_challenge(
                operator_id,
                VerifyChallengeRequest {
                    challenge: challenge.challenge,
                    identity_public_key: identity,
                    signature,
                },
            )
            .await
            .map_err(|e| match e {
                SdkError::Transport { .. } | SdkError::Cancelled => e,
                other => {
                    warn!(operator = %operator_id, error = %other, "challenge rejected");
                    SdkError::AuthFailed
                }
            })?;

        debug!(operator = %operator_id, expires_at = session.expires_at, "session opened");
        self.inner
            .sessions
            .insert(idx, pubkey, session.token.clone(), session.expires_at);
        Ok(session.token)
    }

    /// Drops the cached session for `operator_id`.
    pub fn invalidate_session(&self, operator_id: &str) {
        if let Ok(idx) = self.operator_index(operator_id) {
            self.inner
                .sessions
                .invalidate(idx, &self.inner.signer.public_key());
        }
    }

    // -----------------------------------------------------------------------
    // Operators
    // -----------------------------------------------------------------------

    pub(crate) fn coordinator(&self) -> &OperatorInfo {
        self.inner.config.network.coordinator()
    }

    pub(crate) fn threshold(&self) -> usize {
        self.inner.config.network.threshold
    }

    pub(crate) fn num_operators(&self) -> usize {
        self.inner.config.network.num_operators()
    }

    fn operator_index(&self, operator_id: &str) -> Result<usize, SdkError> {
        self.inner
            .config
            .network
            .operators()
            .iter()
            .position(|op| op.id == operator_id)
            .ok_or_else(|| SdkError::InvalidRequest(format!("unknown operator {operator_id}")))
    }

    /// The FROST identifier an operator signs under.
    pub(crate) fn operator_identifier(&self, operator_id: &str) -> Result<Identifier, SdkError> {
        hex_decode(operator_id)
            .and_then(|bytes| identifier_from_bytes(&bytes).ok())
            .ok_or_else(|| SdkError::operator_response(operator_id, "operator id is not an identifier"))
    }

    /// Calls every operator with its own session token and returns once
    /// `required` have succeeded.
    pub(crate) async fn fan_out<R, F, Fut>(
        &self,
        required: usize,
        call: F,
    ) -> Result<Vec<(String, R)>, SdkError>
    where
        F: Fn(String, Bytes) -> Fut,
        Fut: Future<Output = Result<R, SdkError>>,
    {
        self.check_cancelled()?;
        let call = &call;
        let calls = self.inner.config.network.operators().iter().map(|op| {
            let id = op.id.clone();
            let fut = async move {
                let token = self.session_token(&id).await?;
                call(id, token).await
            };
            (op.id.clone(), fut)
        });
        Ok(quorum_join(required, calls).await?)
    }

    // -----------------------------------------------------------------------
    // Leaf selection
    // -----------------------------------------------------------------------

    /// Replace the leaf selection strategy at runtime.
    ///
    /// In-flight operations that already cloned the previous strategy
    /// complete with the old one.
    pub fn set_leaf_selector(&self, selector: Arc<dyn LeafSelector>) {
        *self
            .inner
            .leaf_selector
            .write()
            .unwrap_or_else(PoisonError::into_inner) = selector;
    }

    /// Get the current leaf selector (cheap `Arc` clone).
    pub(crate) fn leaf_selector(&self) -> Arc<dyn LeafSelector> {
        self.inner
            .leaf_selector
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
