//! Key arithmetic over secp256k1.
//!
//! Key tweaks move a leaf between owners without changing its verifying key:
//! the owner's key drops by `tweak` and the operators' share grows by the same
//! amount. These helpers compute the tweak on both sides.

use std::fmt;

use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};

/// Errors from key arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecpError {
    /// The operation produced the zero scalar or the point at infinity.
    ZeroResult,
}

impl fmt::Display for SecpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroResult => write!(f, "key arithmetic produced zero"),
        }
    }
}

impl std::error::Error for SecpError {}

/// Returns `a + b`.
///
/// # Errors
///
/// Returns [`SecpError::ZeroResult`] if the sum is the point at infinity.
pub fn add_public_keys(a: &PublicKey, b: &PublicKey) -> Result<PublicKey, SecpError> {
    a.combine(b).map_err(|_| SecpError::ZeroResult)
}

/// Returns `a - b`.
///
/// # Errors
///
/// Returns [`SecpError::ZeroResult`] if `a == b`.
pub fn subtract_public_keys(a: &PublicKey, b: &PublicKey) -> Result<PublicKey, SecpError> {
    let secp = Secp256k1::verification_only();
    a.combine(&b.negate(&secp)).map_err(|_| SecpError::ZeroResult)
}

/// Returns `a + b` modulo the curve order.
///
/// # Errors
///
/// Returns [`SecpError::ZeroResult`] if the sum is zero.
pub fn add_secret_keys(a: &SecretKey, b: &SecretKey) -> Result<SecretKey, SecpError> {
    a.add_tweak(&Scalar::from(*b))
        .map_err(|_| SecpError::ZeroResult)
}

/// Returns `a - b` modulo the curve order.
///
/// # Errors
///
/// Returns [`SecpError::ZeroResult`] if `a == b`.
pub fn subtract_secret_keys(a: &SecretKey, b: &SecretKey) -> Result<SecretKey, SecpError> {
    a.add_tweak(&Scalar::from(b.negate()))
        .map_err(|_| SecpError::ZeroResult)
}
