//! Cryptographic building blocks for the leaf custody client.
//!
//! - [`verifiable_secret_sharing`] -- Feldman VSS over the secp256k1 scalar field
//! - [`frost`] -- threshold Schnorr rounds under the additive custody key model
//! - [`ecies`] -- encryption of key material to a transfer receiver
//! - [`secp`] -- key tweak arithmetic
//! - [`derivation_path`] -- BIP32 paths for identity and leaf keys

pub mod derivation_path;
pub mod ecies;
pub mod frost;
pub mod secp;
pub mod verifiable_secret_sharing;
