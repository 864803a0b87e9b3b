//! In-process operator quorum for integration tests.
//!
//! Every operator holds a real Shamir share of each leaf's operator key and
//! signs with FROST, so signatures produced through the mock verify on
//! chain exactly as they would against live operators.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::absolute::LockTime;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{All, Keypair, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use bytes::Bytes;
use custody_config::constants::{DEFAULT_WITHDRAW_BOND_SATS, DEFAULT_WITHDRAW_RELATIVE_LOCKTIME};
use custody_config::{Network, NetworkConfig, OperatorInfo};
use custody_crypto::frost::{
    additive_scale, aggregate, generate_nonces, scale_public_key, serialize_commitment, sign_additive,
    user_identifier,
};
use custody_crypto::verifiable_secret_sharing::{
    lagrange_coefficient, recover_secret, scalar_from_bytes, scalar_to_bytes, split_secret_with_proofs,
    validate_share, VerifiableSecretShare, SECP256K1_ORDER,
};
use custody_sdk::bitcoin_tx::{
    p2tr_script, parse_tx, serialize_tx, spend_sighash, verify_key_spend, with_key_spend_signature,
};
use custody_sdk::deposit::{address_digest, proof_of_possession_digest};
use custody_sdk::operator::*;
use custody_sdk::token::{
    freeze_payload_digest, hash_token_transaction, KeyshareInfo, OwnedTokenOutput, TokenInputs,
    TokenOutput, TokenPublicKey, TokenTransaction,
};
use custody_sdk::utils::{bitcoin_network, hex_encode};
use custody_sdk::{
    Leaf, LeafStatus, SdkError, Transfer, TransferLeaf, TransferStatus, Wallet, WalletConfig,
};
use custody_signer::{ecdsa, SeedSigner};
use frost_secp256k1_tr::round1::{SigningCommitments, SigningNonces};
use frost_secp256k1_tr::Identifier;
use k256::Scalar;
use rand::RngCore;
use rand_core::OsRng;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub type TestWallet = Wallet<MockClient, SeedSigner>;

/// Installs a test-friendly subscriber once; `RUST_LOG` controls output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A signer over a freshly generated BIP39 mnemonic.
pub fn test_signer() -> SeedSigner {
    let mut entropy = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut entropy);
    let mnemonic = bip39::Mnemonic::from_entropy(&entropy).expect("valid entropy length");
    SeedSigner::from_seed(&mnemonic.to_seed(""), bitcoin::Network::Regtest, 0)
        .expect("seed signer")
}

/// A confirmed-looking transaction paying `sats` to `address`.
pub fn funding_tx(address: &str, sats: u64) -> Vec<u8> {
    let mut prev = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut prev);
    let script_pubkey = Address::from_str(address)
        .expect("valid address")
        .assume_checked()
        .script_pubkey();
    serialize_tx(&Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array(prev), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(sats),
            script_pubkey,
        }],
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn reject(reason: impl Into<String>) -> SdkError {
    SdkError::InvalidRequest(reason.into())
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

fn secret_key(scalar: &Scalar) -> SecretKey {
    SecretKey::from_slice(&scalar_to_bytes(scalar)).expect("nonzero scalar")
}

fn scalar_of(key: &SecretKey) -> Scalar {
    scalar_from_bytes(&key.secret_bytes()).expect("secret key is a scalar")
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct MockOperator {
    id: String,
    identifier: Identifier,
    /// Shamir x-coordinate.
    x: Scalar,
    identity: SecretKey,
    identity_public_key: PublicKey,
}

struct LeafRecord {
    leaf: Leaf,
    /// Operator shares of the operator key, in config order.
    shares: Vec<Scalar>,
    /// Receiver refund awaiting its aggregated signature.
    pending_refund: Option<Transaction>,
}

struct PendingDeposit {
    leaf_id: String,
    verifying_public_key: PublicKey,
    shares: Vec<Scalar>,
}

struct PendingTree {
    tree_id: String,
    deposit_tx: Transaction,
    vout: u32,
    root_tx: Transaction,
    refund_tx: Transaction,
    verifying_public_key: PublicKey,
    signing_public_key: PublicKey,
    owner: PublicKey,
    shares: Vec<Scalar>,
}

struct TransferRecord {
    transfer: Transfer,
    /// Per leaf, each operator's share of the sender tweak.
    sender_tweaks: HashMap<String, Vec<Scalar>>,
    /// Operators that applied the receiver tweak.
    receiver_tweaked: HashSet<usize>,
}

struct StoredTokenOutput {
    output: TokenOutput,
    spent: bool,
}

#[derive(Default)]
struct State {
    challenges: HashMap<Vec<u8>, PublicKey>,
    sessions: HashMap<Vec<u8>, PublicKey>,
    nonces: HashMap<Vec<u8>, SigningNonces>,
    deposits: HashMap<PublicKey, PendingDeposit>,
    trees: HashMap<String, PendingTree>,
    leaves: HashMap<String, LeafRecord>,
    locked: HashSet<String>,
    transfers: HashMap<String, TransferRecord>,
    preimages: HashMap<[u8; 32], BTreeMap<usize, VerifiableSecretShare>>,
    pending_tokens: HashMap<[u8; 32], TokenTransaction>,
    token_outputs: BTreeMap<([u8; 32], u32), StoredTokenOutput>,
    /// Per operator, frozen `(owner, token)` pairs.
    frozen: Vec<HashSet<(TokenPublicKey, TokenPublicKey)>>,
}

/// Applies a pending sender tweak: operator shares absorb it and the
/// leaf's owner key becomes the intermediate key.
fn apply_sender_tweak(state: &mut State, transfer_id: &str) {
    let Some(record) = state.transfers.get_mut(transfer_id) else {
        return;
    };
    if record.transfer.status != TransferStatus::SenderKeyTweakPending {
        return;
    }
    for tl in &record.transfer.leaves {
        let (Some(leaf), Some(tweaks)) = (
            state.leaves.get_mut(&tl.leaf.id),
            record.sender_tweaks.get(&tl.leaf.id),
        ) else {
            continue;
        };
        for (share, tweak) in leaf.shares.iter_mut().zip(tweaks) {
            *share += tweak;
        }
        leaf.leaf.signing_public_key = tl.new_signing_public_key;
        state.locked.remove(&tl.leaf.id);
    }
    record.transfer.status = TransferStatus::SenderKeyTweaked;
}

fn expire_transfers(state: &mut State, now: u64) {
    for record in state.transfers.values_mut() {
        if record.transfer.status == TransferStatus::SenderKeyTweakPending
            && now >= record.transfer.expiry_time
        {
            record.transfer.status = TransferStatus::Expired;
            for tl in &record.transfer.leaves {
                state.locked.remove(&tl.leaf.id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockQuorum
// ---------------------------------------------------------------------------

pub struct MockQuorum {
    operators: Vec<MockOperator>,
    config: NetworkConfig,
    secp: Secp256k1<All>,
    state: Mutex<State>,
    offline: Mutex<HashSet<String>>,
    handshakes: AtomicUsize,
    corrupt_proof_of_possession: AtomicBool,
    tamper_withdraw_bond: AtomicBool,
    corrupt_next_transfer_reply: AtomicBool,
    refuse_cancellations: AtomicBool,
    drop_address_vouch: AtomicBool,
    forge_address_vouch: AtomicBool,
    misreport_deposit_address: AtomicBool,
    misreport_deposit_key: AtomicBool,
    misreport_claim_key: AtomicBool,
    misreport_intermediate_keys: AtomicBool,
}

impl MockQuorum {
    /// `n` operators signing `threshold`-of-`n`, coordinated by the first.
    pub fn new(n: usize, threshold: usize) -> Arc<Self> {
        let secp = Secp256k1::new();
        let operators: Vec<MockOperator> = (0..n)
            .map(|i| {
                let identity = SecretKey::new(&mut rand::thread_rng());
                MockOperator {
                    id: format!("{:064x}", i + 1),
                    identifier: Identifier::try_from(u16::try_from(i + 1).expect("small quorum"))
                        .expect("nonzero identifier"),
                    x: Scalar::from((i + 1) as u64),
                    identity_public_key: PublicKey::from_secret_key(&secp, &identity),
                    identity,
                }
            })
            .collect();
        let infos = operators
            .iter()
            .enumerate()
            .map(|(i, op)| OperatorInfo {
                index: u32::try_from(i).expect("small quorum"),
                id: op.id.clone(),
                address: format!("http://127.0.0.1:{}", 8535 + i),
                identity_public_key: hex_encode(&op.identity_public_key.serialize()),
            })
            .collect();
        let config =
            NetworkConfig::custom(Network::Regtest, infos, 0, threshold).expect("valid quorum");
        let state = State {
            frozen: vec![HashSet::new(); n],
            ..State::default()
        };
        Arc::new(Self {
            operators,
            config,
            secp,
            state: Mutex::new(state),
            offline: Mutex::new(HashSet::new()),
            handshakes: AtomicUsize::new(0),
            corrupt_proof_of_possession: AtomicBool::new(false),
            tamper_withdraw_bond: AtomicBool::new(false),
            corrupt_next_transfer_reply: AtomicBool::new(false),
            refuse_cancellations: AtomicBool::new(false),
            drop_address_vouch: AtomicBool::new(false),
            forge_address_vouch: AtomicBool::new(false),
            misreport_deposit_address: AtomicBool::new(false),
            misreport_deposit_key: AtomicBool::new(false),
            misreport_claim_key: AtomicBool::new(false),
            misreport_intermediate_keys: AtomicBool::new(false),
        })
    }

    /// A wallet with a fresh identity talking to this quorum.
    pub fn wallet(self: &Arc<Self>) -> TestWallet {
        Wallet::with_memory_stores(
            WalletConfig::new(self.config.clone()),
            MockClient(Arc::clone(self)),
            test_signer(),
            CancellationToken::new(),
        )
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn operator_id(&self, index: usize) -> String {
        self.operators[index].id.clone()
    }

    pub fn set_offline(&self, operator_id: &str, offline: bool) {
        let mut set = self.offline.lock().unwrap_or_else(PoisonError::into_inner);
        if offline {
            set.insert(operator_id.to_owned());
        } else {
            set.remove(operator_id);
        }
    }

    /// Completed challenge requests across all operators.
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Makes deposit addresses carry a proof signed by the wrong key.
    pub fn corrupt_proofs_of_possession(&self) {
        self.corrupt_proof_of_possession.store(true, Ordering::SeqCst);
    }

    /// Makes the coordinator fill token outputs with a non-default bond.
    pub fn tamper_withdraw_bond(&self) {
        self.tamper_withdraw_bond.store(true, Ordering::SeqCst);
    }

    /// The next `start_transfer` reply carries unparseable intermediate
    /// refunds. The transfer itself is recorded intact.
    pub fn corrupt_next_transfer_reply(&self) {
        self.corrupt_next_transfer_reply.store(true, Ordering::SeqCst);
    }

    /// Makes `cancel_transfer` fail as if the connection dropped.
    pub fn refuse_cancellations(&self, refuse: bool) {
        self.refuse_cancellations.store(refuse, Ordering::SeqCst);
    }

    /// Deposit addresses lack the last operator's ECDSA signature.
    pub fn drop_address_vouch(&self) {
        self.drop_address_vouch.store(true, Ordering::SeqCst);
    }

    /// The last operator signs deposit addresses with a key it does not own.
    pub fn forge_address_vouch(&self) {
        self.forge_address_vouch.store(true, Ordering::SeqCst);
    }

    /// Deposit addresses pay an unrelated key, with a proof and operator
    /// signatures over that address.
    pub fn misreport_deposit_address(&self) {
        self.misreport_deposit_address.store(true, Ordering::SeqCst);
    }

    /// Tree creation reports an unrelated verifying key.
    pub fn misreport_deposit_key(&self) {
        self.misreport_deposit_key.store(true, Ordering::SeqCst);
    }

    /// Refund signing for a claim reports an unrelated verifying key.
    pub fn misreport_claim_key(&self) {
        self.misreport_claim_key.store(true, Ordering::SeqCst);
    }

    /// Pending transfers name unrelated keys as the intermediate keys.
    pub fn misreport_intermediate_keys(&self) {
        self.misreport_intermediate_keys.store(true, Ordering::SeqCst);
    }

    /// Every transfer sent by `sender`, with its status.
    pub fn transfers_from(&self, sender: &PublicKey) -> Vec<(String, TransferStatus)> {
        self.state()
            .transfers
            .values()
            .filter(|r| r.transfer.sender_identity_public_key == *sender)
            .map(|r| (r.transfer.id.clone(), r.transfer.status))
            .collect()
    }

    pub fn transfer_status(&self, transfer_id: &str) -> Option<TransferStatus> {
        self.state()
            .transfers
            .get(transfer_id)
            .map(|r| r.transfer.status)
    }

    /// Operators holding a share of the preimage for `payment_hash`.
    pub fn preimage_holders(&self, payment_hash: &[u8; 32]) -> usize {
        self.state()
            .preimages
            .get(payment_hash)
            .map_or(0, BTreeMap::len)
    }

    /// Reconstructs an escrowed preimage from the operators' shares.
    pub fn recover_preimage(&self, payment_hash: &[u8; 32]) -> Option<[u8; 32]> {
        let state = self.state();
        let shares: Vec<VerifiableSecretShare> =
            state.preimages.get(payment_hash)?.values().cloned().collect();
        let preimage = scalar_to_bytes(&recover_secret(&shares).ok()?);
        (sha256::Hash::hash(&preimage).to_byte_array() == *payment_hash).then_some(preimage)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn threshold(&self) -> usize {
        self.config.threshold
    }

    fn unrelated_key(&self) -> PublicKey {
        PublicKey::from_secret_key(&self.secp, &SecretKey::new(&mut rand::thread_rng()))
    }

    fn reachable(&self, operator_id: &str) -> Result<usize, SdkError> {
        let offline = self.offline.lock().unwrap_or_else(PoisonError::into_inner);
        if offline.contains(operator_id) {
            return Err(SdkError::Transport {
                operator: operator_id.to_owned(),
                reason: "connection refused".into(),
            });
        }
        self.operators
            .iter()
            .position(|op| op.id == operator_id)
            .ok_or_else(|| reject(format!("unknown operator {operator_id}")))
    }

    /// Resolves a session token to its identity.
    fn session(&self, state: &State, token: &Bytes) -> Result<PublicKey, SdkError> {
        state
            .sessions
            .get(token.as_ref())
            .copied()
            .ok_or(SdkError::AuthFailed)
    }

    /// Public key of the operator key whose shares are `shares`.
    fn operator_key(&self, shares: &[Scalar]) -> PublicKey {
        let signers = &self.operators[..self.threshold()];
        let xs: Vec<Scalar> = signers.iter().map(|op| op.x).collect();
        let secret = signers
            .iter()
            .zip(shares)
            .fold(Scalar::ZERO, |acc, (op, share)| {
                acc + lagrange_coefficient(&op.x, &xs).expect("distinct indices") * share
            });
        PublicKey::from_secret_key(&self.secp, &secret_key(&secret))
    }

    // -- Signing ------------------------------------------------------------

    fn commit(&self, state: &mut State, share: &Scalar) -> SigningCommitments {
        let pair = generate_nonces(&secret_key(share), &mut OsRng).expect("valid share");
        state.nonces.insert(
            serialize_commitment(&pair.commitment).expect("serializable commitment"),
            pair.nonces,
        );
        pair.commitment
    }

    /// Signs `message` for every operator in `all_commitments` using the
    /// nonces behind their commitments.
    fn sign_committed(
        &self,
        state: &mut State,
        message: &[u8; 32],
        shares: &[Scalar],
        verifying_key: &PublicKey,
        all_commitments: &BTreeMap<Identifier, SigningCommitments>,
    ) -> Result<OperatorSigningResult, SdkError> {
        let user = user_identifier().expect("user identifier");
        let signers = all_commitments
            .keys()
            .filter(|id| **id != user)
            .map(|id| {
                self.operators
                    .iter()
                    .position(|op| op.identifier == *id)
                    .ok_or_else(|| reject("unknown signer in commitments"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let xs: Vec<Scalar> = signers.iter().map(|&i| self.operators[i].x).collect();

        let mut result = OperatorSigningResult::default();
        for &i in &signers {
            let op = &self.operators[i];
            let commitment = all_commitments[&op.identifier].clone();
            let key = serialize_commitment(&commitment).map_err(|e| reject(e.to_string()))?;
            let nonces = state
                .nonces
                .remove(&key)
                .ok_or_else(|| reject("commitment was not issued or already used"))?;
            let lambda = lagrange_coefficient(&op.x, &xs).map_err(|e| reject(e.to_string()))?;
            let additive = secret_key(&(lambda * shares[i]));
            let share = sign_additive(
                message,
                op.identifier,
                &additive,
                verifying_key,
                &nonces,
                all_commitments,
            )
            .map_err(|e| reject(format!("operator signing failed: {e}")))?;
            let scale = additive_scale(&op.identifier, all_commitments.keys())
                .map_err(|e| reject(e.to_string()))?;
            let verifying =
                scale_public_key(&PublicKey::from_secret_key(&self.secp, &additive), &scale)
                    .map_err(|e| reject(e.to_string()))?;
            result.commitments.insert(op.identifier, commitment);
            result.signature_shares.insert(op.identifier, share);
            result.verifying_shares.insert(op.identifier, verifying);
        }
        Ok(result)
    }

    /// Signs with the first threshold of operators under fresh nonces.
    fn sign_fresh(
        &self,
        state: &mut State,
        message: &[u8; 32],
        shares: &[Scalar],
        verifying_key: &PublicKey,
        user_commitment: &SigningCommitments,
    ) -> Result<OperatorSigningResult, SdkError> {
        let mut all = BTreeMap::new();
        for (op, share) in self.operators.iter().zip(shares).take(self.threshold()) {
            all.insert(op.identifier, self.commit(state, share));
        }
        all.insert(user_identifier().expect("user identifier"), user_commitment.clone());
        self.sign_committed(state, message, shares, verifying_key, &all)
    }

    // -- Authentication -----------------------------------------------------

    fn get_challenge(&self, operator_id: &str, identity: &PublicKey) -> Result<Challenge, SdkError> {
        self.reachable(operator_id)?;
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        let challenge = random_bytes::<32>().to_vec();
        self.state().challenges.insert(challenge.clone(), *identity);
        Ok(Challenge {
            challenge: Bytes::from(challenge),
            expires_at: i64::try_from(unix_now()).unwrap_or(i64::MAX) + 600,
        })
    }

    fn verify_challenge(
        &self,
        operator_id: &str,
        req: VerifyChallengeRequest,
    ) -> Result<Session, SdkError> {
        self.reachable(operator_id)?;
        let mut state = self.state();
        let identity = state
            .challenges
            .remove(req.challenge.as_ref())
            .ok_or_else(|| reject("unknown challenge"))?;
        if identity != req.identity_public_key {
            return Err(reject("challenge issued to another identity"));
        }
        let digest = sha256::Hash::hash(&req.challenge).to_byte_array();
        ecdsa::verify_digest(&self.secp, &identity, &digest, &req.signature)
            .map_err(|_| reject("challenge signature does not verify"))?;
        let token = random_bytes::<32>().to_vec();
        state.sessions.insert(token.clone(), identity);
        Ok(Session {
            token: Bytes::from(token),
            expires_at: i64::try_from(unix_now()).unwrap_or(i64::MAX) + 3600,
        })
    }

    // -- Deposits -----------------------------------------------------------

    fn generate_deposit_address(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: GenerateDepositAddressRequest,
    ) -> Result<DepositAddress, SdkError> {
        self.reachable(operator_id)?;
        let mut state = self.state();
        let identity = self.session(&state, token)?;
        if identity != req.identity_public_key {
            return Err(reject("identity does not match the session"));
        }

        let operator_secret = SecretKey::new(&mut rand::thread_rng());
        let operator_key = PublicKey::from_secret_key(&self.secp, &operator_secret);
        let verifying_public_key = req
            .signing_public_key
            .combine(&operator_key)
            .map_err(|_| reject("degenerate deposit key"))?;
        let paid_key = if self.misreport_deposit_address.load(Ordering::SeqCst) {
            self.unrelated_key()
        } else {
            verifying_public_key
        };
        let address = Address::p2tr(
            &self.secp,
            paid_key.x_only_public_key().0,
            None,
            bitcoin_network(req.network),
        )
        .to_string();

        let shares = split_secret_with_proofs(
            &scalar_of(&operator_secret),
            &SECP256K1_ORDER,
            self.threshold(),
            self.operators.len(),
            &mut OsRng,
        )
        .map_err(|e| reject(e.to_string()))?
        .into_iter()
        .map(|s| s.share)
        .collect();

        let proof_key = if self.corrupt_proof_of_possession.load(Ordering::SeqCst) {
            SecretKey::new(&mut rand::thread_rng())
        } else {
            operator_secret
        };
        let keypair = Keypair::from_secret_key(&self.secp, &proof_key)
            .tap_tweak(&self.secp, None)
            .to_inner();
        let digest = proof_of_possession_digest(&identity, &operator_key, &address);
        let proof_of_possession = self
            .secp
            .sign_schnorr(&Message::from_digest(digest), &keypair)
            .serialize();

        let address_digest = address_digest(&address);
        let last = self.operators.len() - 1;
        let mut operator_signatures: BTreeMap<String, Vec<u8>> = self
            .operators
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, op)| {
                let forged = i == last && self.forge_address_vouch.load(Ordering::SeqCst);
                let key = if forged {
                    SecretKey::new(&mut rand::thread_rng())
                } else {
                    op.identity
                };
                let signature = ecdsa::sign_digest(&self.secp, &key, &address_digest);
                (op.id.clone(), signature.serialize_der().to_vec())
            })
            .collect();
        if self.drop_address_vouch.load(Ordering::SeqCst) {
            operator_signatures.remove(&self.operators[last].id);
        }

        state.deposits.insert(
            req.signing_public_key,
            PendingDeposit {
                leaf_id: req.leaf_id.clone(),
                verifying_public_key,
                shares,
            },
        );
        Ok(DepositAddress {
            address,
            leaf_id: req.leaf_id,
            verifying_public_key,
            proof: DepositAddressProof {
                proof_of_possession,
                operator_signatures,
            },
        })
    }

    fn start_deposit_tree_creation(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StartTreeCreationRequest,
    ) -> Result<StartTreeCreationResponse, SdkError> {
        self.reachable(operator_id)?;
        let mut state = self.state();
        let identity = self.session(&state, token)?;
        let deposit = state
            .deposits
            .remove(&req.signing_public_key)
            .ok_or_else(|| reject("no deposit address for this signing key"))?;

        let deposit_tx = parse_tx(&req.deposit_tx).map_err(|e| reject(e.to_string()))?;
        let output = deposit_tx
            .output
            .get(req.vout as usize)
            .ok_or_else(|| reject("deposit output missing"))?;
        if output.script_pubkey != p2tr_script(&deposit.verifying_public_key) {
            return Err(reject("deposit output does not pay the deposit address"));
        }
        let root_tx =
            parse_tx(&req.root_tx_signing_job.raw_tx).map_err(|e| reject(e.to_string()))?;
        if root_tx.input[0].previous_output != OutPoint::new(deposit_tx.compute_txid(), req.vout) {
            return Err(reject("root does not spend the deposit"));
        }
        let refund_tx =
            parse_tx(&req.refund_tx_signing_job.raw_tx).map_err(|e| reject(e.to_string()))?;
        if refund_tx.input[0].previous_output != OutPoint::new(root_tx.compute_txid(), 0) {
            return Err(reject("refund does not spend the root"));
        }

        let root_message =
            spend_sighash(&root_tx, &deposit_tx, req.vout).map_err(|e| reject(e.to_string()))?;
        let refund_message =
            spend_sighash(&refund_tx, &root_tx, 0).map_err(|e| reject(e.to_string()))?;
        let root_tx_signing_result = self.sign_fresh(
            &mut state,
            &root_message,
            &deposit.shares,
            &deposit.verifying_public_key,
            &req.root_tx_signing_job.commitment,
        )?;
        let refund_tx_signing_result = self.sign_fresh(
            &mut state,
            &refund_message,
            &deposit.shares,
            &deposit.verifying_public_key,
            &req.refund_tx_signing_job.commitment,
        )?;

        let tree_id = hex_encode(&random_bytes::<16>());
        state.trees.insert(
            deposit.leaf_id.clone(),
            PendingTree {
                tree_id: tree_id.clone(),
                deposit_tx,
                vout: req.vout,
                root_tx,
                refund_tx,
                verifying_public_key: deposit.verifying_public_key,
                signing_public_key: req.signing_public_key,
                owner: identity,
                shares: deposit.shares,
            },
        );
        Ok(StartTreeCreationResponse {
            tree_id,
            root_node_id: deposit.leaf_id,
            verifying_public_key: if self.misreport_deposit_key.load(Ordering::SeqCst) {
                self.unrelated_key()
            } else {
                deposit.verifying_public_key
            },
            root_tx_signing_result,
            refund_tx_signing_result,
        })
    }

    fn finalize_node_signatures(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: FinalizeNodeSignaturesRequest,
    ) -> Result<Vec<Leaf>, SdkError> {
        self.reachable(operator_id)?;
        let mut guard = self.state();
        let identity = self.session(&guard, token)?;
        let state = &mut *guard;
        let mut finalized = Vec::with_capacity(req.node_signatures.len());

        for ns in req.node_signatures {
            match req.intent {
                SigningIntent::Creation => {
                    let tree = state
                        .trees
                        .remove(&ns.node_id)
                        .ok_or_else(|| reject(format!("no pending tree for {}", ns.node_id)))?;
                    let node_signature =
                        ns.node_tx_signature.ok_or_else(|| reject("missing node signature"))?;
                    let refund_signature = ns
                        .refund_tx_signature
                        .ok_or_else(|| reject("missing refund signature"))?;
                    let root = with_key_spend_signature(tree.root_tx, &node_signature);
                    verify_key_spend(
                        &self.secp,
                        &root,
                        &tree.deposit_tx,
                        tree.vout,
                        &tree.verifying_public_key,
                    )
                    .map_err(|e| reject(format!("root signature: {e}")))?;
                    let refund = with_key_spend_signature(tree.refund_tx, &refund_signature);
                    verify_key_spend(&self.secp, &refund, &root, 0, &tree.verifying_public_key)
                        .map_err(|e| reject(format!("refund signature: {e}")))?;

                    let leaf = Leaf {
                        id: ns.node_id.clone(),
                        tree_id: tree.tree_id,
                        value: root.output[0].value.to_sat(),
                        node_tx: serialize_tx(&root),
                        refund_tx: serialize_tx(&refund),
                        verifying_public_key: tree.verifying_public_key,
                        signing_public_key: tree.signing_public_key,
                        owner_identity_public_key: tree.owner,
                        vout: 0,
                        status: LeafStatus::Available,
                    };
                    state.leaves.insert(
                        ns.node_id,
                        LeafRecord {
                            leaf: leaf.clone(),
                            shares: tree.shares,
                            pending_refund: None,
                        },
                    );
                    finalized.push(leaf);
                }
                SigningIntent::Transfer => {
                    let record = state
                        .leaves
                        .get_mut(&ns.node_id)
                        .ok_or_else(|| reject(format!("unknown leaf {}", ns.node_id)))?;
                    let refund = record
                        .pending_refund
                        .take()
                        .ok_or_else(|| reject("no refund awaiting a signature"))?;
                    let signature = ns
                        .refund_tx_signature
                        .ok_or_else(|| reject("missing refund signature"))?;
                    let signed = with_key_spend_signature(refund, &signature);
                    let node_tx = record
                        .leaf
                        .parsed_node_tx()
                        .map_err(|e| reject(e.to_string()))?;
                    verify_key_spend(
                        &self.secp,
                        &signed,
                        &node_tx,
                        record.leaf.vout,
                        &record.leaf.verifying_public_key,
                    )
                    .map_err(|e| reject(format!("refund signature: {e}")))?;
                    record.leaf.refund_tx = serialize_tx(&signed);
                    record.leaf.owner_identity_public_key = identity;
                    finalized.push(record.leaf.clone());
                }
            }
        }

        if req.intent == SigningIntent::Transfer {
            let done: HashSet<&str> = finalized.iter().map(|l| l.id.as_str()).collect();
            for record in state.transfers.values_mut() {
                let transfer = &mut record.transfer;
                if transfer.status == TransferStatus::ReceiverRefundSigned
                    && transfer.receiver_identity_public_key == identity
                    && transfer.leaves.iter().all(|tl| done.contains(tl.leaf.id.as_str()))
                {
                    for tl in &mut transfer.leaves {
                        if let Some(leaf) = finalized.iter().find(|l| l.id == tl.leaf.id) {
                            tl.leaf = leaf.clone();
                        }
                    }
                    transfer.status = TransferStatus::Completed;
                }
            }
        }
        Ok(finalized)
    }

    // -- Transfers ------------------------------------------------------------

    fn get_signing_commitments(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: SigningCommitmentsRequest,
    ) -> Result<Vec<SigningCommitments>, SdkError> {
        let index = self.reachable(operator_id)?;
        let mut state = self.state();
        self.session(&state, token)?;
        req.node_ids
            .iter()
            .map(|id| {
                let share = state
                    .leaves
                    .get(id)
                    .map(|record| record.shares[index])
                    .ok_or_else(|| reject(format!("unknown leaf {id}")))?;
                Ok(self.commit(&mut state, &share))
            })
            .collect()
    }

    fn start_transfer(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StartTransferRequest,
    ) -> Result<Transfer, SdkError> {
        self.reachable(operator_id)?;
        let mut state = self.state();
        let identity = self.session(&state, token)?;
        if identity != req.owner_identity_public_key {
            return Err(reject("owner does not match the session"));
        }
        if state.transfers.contains_key(&req.transfer_id) {
            return Err(reject("transfer id already used"));
        }

        let user = user_identifier().expect("user identifier");
        let mut leaves = Vec::with_capacity(req.leaves.len());
        let mut sender_tweaks = HashMap::new();
        for lr in req.leaves {
            if state.locked.contains(&lr.leaf_id) {
                return Err(reject(format!("leaf {} is already being transferred", lr.leaf_id)));
            }
            let (leaf, shares) = state
                .leaves
                .get(&lr.leaf_id)
                .map(|r| (r.leaf.clone(), r.shares.clone()))
                .ok_or_else(|| reject(format!("unknown leaf {}", lr.leaf_id)))?;
            if leaf.owner_identity_public_key != identity
                || leaf.signing_public_key != lr.old_signing_public_key
            {
                return Err(reject(format!("leaf {} is not owned by the sender", lr.leaf_id)));
            }

            let mut tweaks = Vec::with_capacity(self.operators.len());
            for op in &self.operators {
                let share = lr
                    .key_tweak_shares
                    .get(&op.id)
                    .ok_or_else(|| reject(format!("no tweak share for {}", op.id)))?;
                validate_share(share).map_err(|e| reject(e.to_string()))?;
                if share.index != op.x {
                    return Err(reject("tweak share index does not match the operator"));
                }
                tweaks.push(share.share);
            }

            let mut engine = sha256::Hash::engine();
            engine.input(lr.leaf_id.as_bytes());
            engine.input(req.transfer_id.as_bytes());
            engine.input(&lr.secret_cipher);
            let package = sha256::Hash::from_engine(engine).to_byte_array();
            ecdsa::verify_digest(&self.secp, &identity, &package, &lr.signature)
                .map_err(|_| reject("leaf package signature does not verify"))?;

            let node_tx = leaf.parsed_node_tx().map_err(|e| reject(e.to_string()))?;
            let refund = parse_tx(&lr.refund_tx).map_err(|e| reject(e.to_string()))?;
            if refund.input[0].previous_output != OutPoint::new(node_tx.compute_txid(), leaf.vout) {
                return Err(reject("refund does not spend the leaf"));
            }
            let message =
                spend_sighash(&refund, &node_tx, leaf.vout).map_err(|e| reject(e.to_string()))?;

            let mut all_commitments = lr.operator_commitments.clone();
            all_commitments.insert(user, lr.user_commitment.clone());
            let signed = self.sign_committed(
                &mut state,
                &message,
                &shares,
                &leaf.verifying_public_key,
                &all_commitments,
            )?;
            let mut signature_shares = signed.signature_shares;
            signature_shares.insert(user, lr.user_signature_share);
            let signature = aggregate(
                &message,
                all_commitments,
                &signature_shares,
                &signed.verifying_shares,
                &lr.old_signing_public_key,
                &leaf.verifying_public_key,
            )
            .map_err(|e| reject(format!("refund aggregation failed: {e}")))?;

            sender_tweaks.insert(lr.leaf_id.clone(), tweaks);
            leaves.push(TransferLeaf {
                leaf,
                old_signing_public_key: lr.old_signing_public_key,
                new_signing_public_key: lr.new_signing_public_key,
                secret_cipher: lr.secret_cipher,
                signature: lr.signature,
                intermediate_refund_tx: serialize_tx(&with_key_spend_signature(refund, &signature)),
            });
        }

        for tl in &leaves {
            state.locked.insert(tl.leaf.id.clone());
        }
        let transfer = Transfer {
            id: req.transfer_id.clone(),
            sender_identity_public_key: identity,
            receiver_identity_public_key: req.receiver_identity_public_key,
            expiry_time: req.expiry_time,
            status: TransferStatus::SenderKeyTweakPending,
            leaves,
        };
        state.transfers.insert(
            req.transfer_id,
            TransferRecord {
                transfer: transfer.clone(),
                sender_tweaks,
                receiver_tweaked: HashSet::new(),
            },
        );
        let mut reply = transfer;
        if self.corrupt_next_transfer_reply.swap(false, Ordering::SeqCst) {
            for tl in &mut reply.leaves {
                tl.intermediate_refund_tx = vec![0x00];
            }
        }
        Ok(reply)
    }

    fn cancel_transfer(
        &self,
        operator_id: &str,
        token: &Bytes,
        transfer_id: &str,
    ) -> Result<Transfer, SdkError> {
        self.reachable(operator_id)?;
        if self.refuse_cancellations.load(Ordering::SeqCst) {
            return Err(SdkError::Transport {
                operator: operator_id.to_owned(),
                reason: "connection reset".into(),
            });
        }
        let mut guard = self.state();
        let identity = self.session(&guard, token)?;
        let state = &mut *guard;
        expire_transfers(state, unix_now());
        let record = state
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| reject("unknown transfer"))?;
        if record.transfer.sender_identity_public_key != identity {
            return Err(reject("only the sender may cancel"));
        }
        if matches!(
            record.transfer.status,
            TransferStatus::SenderInitiated | TransferStatus::SenderKeyTweakPending
        ) {
            record.transfer.status = TransferStatus::Cancelled;
            for tl in &record.transfer.leaves {
                state.locked.remove(&tl.leaf.id);
            }
        }
        Ok(record.transfer.clone())
    }

    fn query_pending_transfers(&self, operator_id: &str, token: &Bytes) -> Result<Vec<Transfer>, SdkError> {
        self.reachable(operator_id)?;
        let mut guard = self.state();
        let identity = self.session(&guard, token)?;
        let state = &mut *guard;
        expire_transfers(state, unix_now());
        let ids: Vec<String> = state
            .transfers
            .values()
            .filter(|r| {
                r.transfer.receiver_identity_public_key == identity
                    && r.transfer.status.is_claimable()
            })
            .map(|r| r.transfer.id.clone())
            .collect();
        let misreport = self.misreport_intermediate_keys.load(Ordering::SeqCst);
        Ok(ids
            .iter()
            .filter_map(|id| {
                apply_sender_tweak(state, id);
                state.transfers.get(id).map(|r| r.transfer.clone())
            })
            .map(|mut transfer| {
                if misreport {
                    for tl in &mut transfer.leaves {
                        tl.new_signing_public_key = self.unrelated_key();
                    }
                }
                transfer
            })
            .collect())
    }

    fn query_transfer(
        &self,
        operator_id: &str,
        token: &Bytes,
        transfer_id: &str,
    ) -> Result<Transfer, SdkError> {
        self.reachable(operator_id)?;
        let mut guard = self.state();
        let identity = self.session(&guard, token)?;
        let state = &mut *guard;
        expire_transfers(state, unix_now());
        let transfer = &state
            .transfers
            .get(transfer_id)
            .ok_or_else(|| reject("unknown transfer"))?
            .transfer;
        if transfer.sender_identity_public_key != identity
            && transfer.receiver_identity_public_key != identity
        {
            return Err(reject("transfer belongs to other parties"));
        }
        Ok(transfer.clone())
    }

    fn claim_transfer_tweak_keys(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: ClaimTransferTweakKeysRequest,
    ) -> Result<(), SdkError> {
        let index = self.reachable(operator_id)?;
        let mut guard = self.state();
        let identity = self.session(&guard, token)?;
        let state = &mut *guard;
        apply_sender_tweak(state, &req.transfer_id);

        let record = state
            .transfers
            .get_mut(&req.transfer_id)
            .ok_or_else(|| reject("unknown transfer"))?;
        if record.transfer.receiver_identity_public_key != identity
            || identity != req.owner_identity_public_key
        {
            return Err(reject("only the receiver may claim"));
        }
        if record.transfer.status != TransferStatus::SenderKeyTweaked {
            return Err(reject(format!(
                "transfer is {}, not ready for the receiver tweak",
                record.transfer.status
            )));
        }
        if record.receiver_tweaked.contains(&index) {
            return Ok(());
        }

        let op = &self.operators[index];
        for tweak in &req.leaves {
            if !record.transfer.leaves.iter().any(|tl| tl.leaf.id == tweak.leaf_id) {
                return Err(reject(format!("leaf {} is not in the transfer", tweak.leaf_id)));
            }
            validate_share(&tweak.secret_share_tweak).map_err(|e| reject(e.to_string()))?;
            if tweak.secret_share_tweak.index != op.x {
                return Err(reject("tweak share index does not match the operator"));
            }
        }
        for tweak in &req.leaves {
            if let Some(leaf) = state.leaves.get_mut(&tweak.leaf_id) {
                leaf.shares[index] += tweak.secret_share_tweak.share;
            }
        }
        record.receiver_tweaked.insert(index);
        if record.receiver_tweaked.len() == self.operators.len() {
            record.transfer.status = TransferStatus::ReceiverKeyTweaked;
        }
        Ok(())
    }

    fn claim_transfer_sign_refunds(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: ClaimTransferSignRefundsRequest,
    ) -> Result<Vec<LeafSigningResult>, SdkError> {
        self.reachable(operator_id)?;
        let mut guard = self.state();
        let identity = self.session(&guard, token)?;
        let state = &mut *guard;
        let record = state
            .transfers
            .get(&req.transfer_id)
            .ok_or_else(|| reject("unknown transfer"))?;
        if record.transfer.receiver_identity_public_key != identity {
            return Err(reject("only the receiver may claim"));
        }
        if record.transfer.status != TransferStatus::ReceiverKeyTweaked {
            return Err(reject(format!(
                "transfer is {}, refunds cannot be signed",
                record.transfer.status
            )));
        }

        let mut results = Vec::with_capacity(req.signing_jobs.len());
        for job in req.signing_jobs {
            let (leaf, shares) = state
                .leaves
                .get(&job.leaf_id)
                .map(|r| (r.leaf.clone(), r.shares.clone()))
                .ok_or_else(|| reject(format!("unknown leaf {}", job.leaf_id)))?;
            let expected = job
                .job
                .signing_public_key
                .combine(&self.operator_key(&shares))
                .map_err(|_| reject("degenerate leaf key"))?;
            if expected != leaf.verifying_public_key {
                return Err(reject("receiver key does not complete the leaf key"));
            }

            let node_tx = leaf.parsed_node_tx().map_err(|e| reject(e.to_string()))?;
            let refund = parse_tx(&job.job.raw_tx).map_err(|e| reject(e.to_string()))?;
            if refund.input[0].previous_output != OutPoint::new(node_tx.compute_txid(), leaf.vout) {
                return Err(reject("refund does not spend the leaf"));
            }
            let message =
                spend_sighash(&refund, &node_tx, leaf.vout).map_err(|e| reject(e.to_string()))?;
            let result = self.sign_fresh(
                state,
                &message,
                &shares,
                &leaf.verifying_public_key,
                &job.job.commitment,
            )?;

            if let Some(record) = state.leaves.get_mut(&job.leaf_id) {
                record.leaf.signing_public_key = job.job.signing_public_key;
                record.pending_refund = Some(refund);
            }
            results.push(LeafSigningResult {
                leaf_id: job.leaf_id,
                verifying_public_key: if self.misreport_claim_key.load(Ordering::SeqCst) {
                    self.unrelated_key()
                } else {
                    leaf.verifying_public_key
                },
                result,
            });
        }

        if let Some(record) = state.transfers.get_mut(&req.transfer_id) {
            record.transfer.status = TransferStatus::ReceiverRefundSigned;
        }
        Ok(results)
    }

    // -- Preimage escrow ------------------------------------------------------

    fn store_preimage_share(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StorePreimageShareRequest,
    ) -> Result<(), SdkError> {
        let index = self.reachable(operator_id)?;
        let mut state = self.state();
        let identity = self.session(&state, token)?;
        if identity != req.user_identity_public_key {
            return Err(reject("user does not match the session"));
        }
        validate_share(&req.preimage_share).map_err(|e| reject(e.to_string()))?;
        if req.preimage_share.index != self.operators[index].x {
            return Err(reject("preimage share index does not match the operator"));
        }
        state
            .preimages
            .entry(req.payment_hash)
            .or_default()
            .insert(index, req.preimage_share);
        Ok(())
    }

    // -- Tokens ---------------------------------------------------------------

    /// Checks one owner signature per input over `digest`.
    fn check_owner_signatures(
        &self,
        state: &State,
        tx: &TokenTransaction,
        digest: &[u8; 32],
        signatures: &[Vec<u8>],
    ) -> Result<(), SdkError> {
        let owners: Vec<TokenPublicKey> = match &tx.inputs {
            TokenInputs::Mint {
                issuer_public_key, ..
            } => {
                if tx.outputs.iter().any(|o| o.token_public_key != *issuer_public_key) {
                    return Err(reject("mint outputs must carry the issuer's token"));
                }
                vec![*issuer_public_key]
            }
            TokenInputs::Transfer { outputs_to_spend } => {
                let mut owners = Vec::with_capacity(outputs_to_spend.len());
                let mut input_total = 0u128;
                for spent in outputs_to_spend {
                    let stored = state
                        .token_outputs
                        .get(&(spent.prev_token_transaction_hash, spent.prev_vout))
                        .ok_or_else(|| reject("unknown token output"))?;
                    if stored.spent {
                        return Err(reject("token output already spent"));
                    }
                    let owner = stored.output.owner_public_key;
                    let token = stored.output.token_public_key;
                    if state.frozen[0].contains(&(owner, token)) {
                        return Err(reject("token output is frozen"));
                    }
                    if tx.outputs.iter().any(|o| o.token_public_key != token) {
                        return Err(reject("outputs carry a different token"));
                    }
                    input_total += stored.output.amount.to_u128().map_err(SdkError::Token)?;
                    owners.push(owner);
                }
                let output_total = tx
                    .outputs
                    .iter()
                    .map(|o| o.amount.to_u128())
                    .sum::<Result<u128, _>>()
                    .map_err(SdkError::Token)?;
                if input_total != output_total {
                    return Err(reject("token amounts do not balance"));
                }
                owners
            }
        };
        if signatures.len() != owners.len() {
            return Err(reject("one owner signature per input required"));
        }
        for (owner, signature) in owners.iter().zip(signatures) {
            let key = PublicKey::from_slice(owner).map_err(|_| reject("owner key is not a point"))?;
            ecdsa::verify_digest(&self.secp, &key, digest, signature)
                .map_err(|_| reject("owner signature does not verify"))?;
        }
        Ok(())
    }

    fn start_token_transaction(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StartTokenTransactionRequest,
    ) -> Result<StartTokenTransactionResponse, SdkError> {
        self.reachable(operator_id)?;
        let mut state = self.state();
        let identity = self.session(&state, token)?;
        if identity != req.identity_public_key {
            return Err(reject("identity does not match the session"));
        }
        let partial = req.partial_transaction;
        if let TokenInputs::Mint {
            issuer_public_key, ..
        } = &partial.inputs
        {
            if *issuer_public_key != identity.serialize() {
                return Err(reject("only the issuer may mint"));
            }
        }
        let partial_hash = hash_token_transaction(&partial, true).map_err(SdkError::Token)?;
        self.check_owner_signatures(&state, &partial, &partial_hash, &req.owner_signatures)?;

        let bond = if self.tamper_withdraw_bond.load(Ordering::SeqCst) {
            DEFAULT_WITHDRAW_BOND_SATS + 1
        } else {
            DEFAULT_WITHDRAW_BOND_SATS
        };
        let mut final_transaction = partial;
        for output in &mut final_transaction.outputs {
            let revocation = PublicKey::from_secret_key(
                &self.secp,
                &SecretKey::new(&mut rand::thread_rng()),
            );
            output.id = Some(hex_encode(&random_bytes::<16>()));
            output.revocation_commitment = Some(revocation.serialize());
            output.withdraw_bond_sats = Some(bond);
            output.withdraw_relative_block_locktime = Some(DEFAULT_WITHDRAW_RELATIVE_LOCKTIME);
        }
        let final_hash = hash_token_transaction(&final_transaction, false).map_err(SdkError::Token)?;
        state
            .pending_tokens
            .insert(final_hash, final_transaction.clone());

        Ok(StartTokenTransactionResponse {
            final_transaction,
            keyshare_info: KeyshareInfo {
                owner_identifiers: self.operators.iter().map(|op| op.id.clone()).collect(),
                threshold: self.threshold(),
            },
        })
    }

    fn sign_token_transaction(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: SignTokenTransactionRequest,
    ) -> Result<SignTokenTransactionResponse, SdkError> {
        self.reachable(operator_id)?;
        let mut state = self.state();
        self.session(&state, token)?;
        let pending = state
            .pending_tokens
            .remove(&req.final_hash)
            .ok_or_else(|| reject("no started transaction with this hash"))?;
        if pending != req.final_transaction {
            return Err(reject("final transaction differs from the started one"));
        }
        self.check_owner_signatures(&state, &pending, &req.final_hash, &req.owner_signatures)?;

        if let TokenInputs::Transfer { outputs_to_spend } = &pending.inputs {
            for spent in outputs_to_spend {
                if let Some(stored) = state
                    .token_outputs
                    .get_mut(&(spent.prev_token_transaction_hash, spent.prev_vout))
                {
                    stored.spent = true;
                }
            }
        }
        for (vout, output) in pending.outputs.into_iter().enumerate() {
            let vout = u32::try_from(vout).map_err(|_| reject("too many outputs"))?;
            state.token_outputs.insert(
                (req.final_hash, vout),
                StoredTokenOutput {
                    output,
                    spent: false,
                },
            );
        }

        let operator_signatures = self
            .operators
            .iter()
            .map(|op| {
                let signature = ecdsa::sign_digest(&self.secp, &op.identity, &req.final_hash);
                (op.id.clone(), signature.serialize_der().to_vec())
            })
            .collect();
        Ok(SignTokenTransactionResponse {
            operator_signatures,
        })
    }

    fn freeze_tokens(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: FreezeTokensRequest,
    ) -> Result<FreezeTokensResponse, SdkError> {
        let index = self.reachable(operator_id)?;
        let mut state = self.state();
        let identity = self.session(&state, token)?;
        if req.token_public_key != identity.serialize() {
            return Err(reject("only the issuer may freeze its token"));
        }
        let digest = freeze_payload_digest(
            &req.owner_public_key,
            &req.token_public_key,
            req.should_unfreeze,
            req.issuer_provided_timestamp,
            &self.operators[index].identity_public_key.serialize(),
        );
        ecdsa::verify_digest(&self.secp, &identity, &digest, &req.issuer_signature)
            .map_err(|_| reject("issuer signature does not verify"))?;

        let pair = (req.owner_public_key, req.token_public_key);
        if req.should_unfreeze {
            state.frozen[index].remove(&pair);
        } else {
            state.frozen[index].insert(pair);
        }

        let mut response = FreezeTokensResponse {
            impacted_output_ids: Vec::new(),
            impacted_amount: 0,
        };
        for stored in state.token_outputs.values().filter(|s| {
            !s.spent
                && s.output.owner_public_key == req.owner_public_key
                && s.output.token_public_key == req.token_public_key
        }) {
            response
                .impacted_output_ids
                .push(stored.output.id.clone().unwrap_or_default());
            response.impacted_amount += stored.output.amount.to_u128().map_err(SdkError::Token)?;
        }
        Ok(response)
    }

    fn query_token_outputs(
        &self,
        operator_id: &str,
        token: &Bytes,
        owner_public_key: &TokenPublicKey,
    ) -> Result<Vec<OwnedTokenOutput>, SdkError> {
        let index = self.reachable(operator_id)?;
        let state = self.state();
        self.session(&state, token)?;
        state
            .token_outputs
            .iter()
            .filter(|(_, s)| {
                !s.spent
                    && s.output.owner_public_key == *owner_public_key
                    && !state.frozen[index]
                        .contains(&(s.output.owner_public_key, s.output.token_public_key))
            })
            .map(|((hash, vout), s)| {
                Ok(OwnedTokenOutput {
                    id: s.output.id.clone().unwrap_or_default(),
                    owner_public_key: s.output.owner_public_key,
                    token_public_key: s.output.token_public_key,
                    amount: s.output.amount.to_u128().map_err(SdkError::Token)?,
                    previous_transaction_hash: *hash,
                    previous_transaction_vout: *vout,
                    withdraw_bond_sats: s.output.withdraw_bond_sats.unwrap_or_default(),
                    withdraw_relative_block_locktime: s
                        .output
                        .withdraw_relative_block_locktime
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MockClient
// ---------------------------------------------------------------------------

/// [`OperatorClient`] over a shared [`MockQuorum`].
pub struct MockClient(pub Arc<MockQuorum>);

impl OperatorClient for MockClient {
    async fn get_challenge(
        &self,
        operator_id: &str,
        identity_public_key: &PublicKey,
    ) -> Result<Challenge, SdkError> {
        self.0.get_challenge(operator_id, identity_public_key)
    }

    async fn verify_challenge(
        &self,
        operator_id: &str,
        req: VerifyChallengeRequest,
    ) -> Result<Session, SdkError> {
        self.0.verify_challenge(operator_id, req)
    }

    async fn generate_deposit_address(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: GenerateDepositAddressRequest,
    ) -> Result<DepositAddress, SdkError> {
        self.0.generate_deposit_address(operator_id, token, req)
    }

    async fn start_deposit_tree_creation(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StartTreeCreationRequest,
    ) -> Result<StartTreeCreationResponse, SdkError> {
        self.0.start_deposit_tree_creation(operator_id, token, req)
    }

    async fn finalize_node_signatures(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: FinalizeNodeSignaturesRequest,
    ) -> Result<Vec<Leaf>, SdkError> {
        self.0.finalize_node_signatures(operator_id, token, req)
    }

    async fn get_signing_commitments(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: SigningCommitmentsRequest,
    ) -> Result<Vec<SigningCommitments>, SdkError> {
        self.0.get_signing_commitments(operator_id, token, req)
    }

    async fn start_transfer(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StartTransferRequest,
    ) -> Result<Transfer, SdkError> {
        self.0.start_transfer(operator_id, token, req)
    }

    async fn cancel_transfer(
        &self,
        operator_id: &str,
        token: &Bytes,
        transfer_id: &str,
    ) -> Result<Transfer, SdkError> {
        self.0.cancel_transfer(operator_id, token, transfer_id)
    }

    async fn query_pending_transfers(
        &self,
        operator_id: &str,
        token: &Bytes,
    ) -> Result<Vec<Transfer>, SdkError> {
        self.0.query_pending_transfers(operator_id, token)
    }

    async fn query_transfer(
        &self,
        operator_id: &str,
        token: &Bytes,
        transfer_id: &str,
    ) -> Result<Transfer, SdkError> {
        self.0.query_transfer(operator_id, token, transfer_id)
    }

    async fn claim_transfer_tweak_keys(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: ClaimTransferTweakKeysRequest,
    ) -> Result<(), SdkError> {
        self.0.claim_transfer_tweak_keys(operator_id, token, req)
    }

    async fn claim_transfer_sign_refunds(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: ClaimTransferSignRefundsRequest,
    ) -> Result<Vec<LeafSigningResult>, SdkError> {
        self.0.claim_transfer_sign_refunds(operator_id, token, req)
    }

    async fn store_preimage_share(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StorePreimageShareRequest,
    ) -> Result<(), SdkError> {
        self.0.store_preimage_share(operator_id, token, req)
    }

    async fn start_token_transaction(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: StartTokenTransactionRequest,
    ) -> Result<StartTokenTransactionResponse, SdkError> {
        self.0.start_token_transaction(operator_id, token, req)
    }

    async fn sign_token_transaction(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: SignTokenTransactionRequest,
    ) -> Result<SignTokenTransactionResponse, SdkError> {
        self.0.sign_token_transaction(operator_id, token, req)
    }

    async fn freeze_tokens(
        &self,
        operator_id: &str,
        token: &Bytes,
        req: FreezeTokensRequest,
    ) -> Result<FreezeTokensResponse, SdkError> {
        self.0.freeze_tokens(operator_id, token, req)
    }

    async fn query_token_outputs(
        &self,
        operator_id: &str,
        token: &Bytes,
        owner_public_key: &TokenPublicKey,
    ) -> Result<Vec<OwnedTokenOutput>, SdkError> {
        self.0.query_token_outputs(operator_id, token, owner_public_key)
    }
}
