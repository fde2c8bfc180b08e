//! Recoverable ECDSA over secp256k1 and the SHA-256 digest used across
//! the payment protocol.
//!
//! Promises and exchange messages are signed over a 32-byte digest of
//! their canonical byte encoding. Signatures are recoverable, so a
//! message alone identifies its signer: the 20-byte address is derived
//! from the SHA-256 hash of the compressed public key.

use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::proto::primitives::{Address, Signature};

/// Errors raised by signing and signer recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The signature bytes do not form a valid secp256k1 signature.
    InvalidSignature(String),
    /// The recovery id byte is out of range.
    InvalidRecoveryId(u8),
    /// No public key could be recovered for the digest and signature.
    RecoveryFailed(String),
    /// The secret key bytes do not form a valid scalar.
    InvalidSecretKey(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::InvalidSignature(e) => write!(f, "invalid signature: {}", e),
            CryptoError::InvalidRecoveryId(v) => write!(f, "invalid recovery id: {}", v),
            CryptoError::RecoveryFailed(e) => write!(f, "signer recovery failed: {}", e),
            CryptoError::InvalidSecretKey(e) => write!(f, "invalid secret key: {}", e),
        }
    }
}

impl std::error::Error for CryptoError {}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Derives the 20-byte address of a public key: the trailing 20 bytes of
/// the SHA-256 hash of its compressed SEC1 encoding.
pub fn address_of(key: &VerifyingKey) -> Address {
    let digest = sha256(key.to_encoded_point(true).as_bytes());
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[12..]);
    Address::from_bytes(bytes)
}

/// Recovers the signer address of `signature` over `digest`.
pub fn recover_address(digest: &[u8; 32], signature: &Signature) -> Result<Address, CryptoError> {
    let sig = EcdsaSignature::from_slice(&signature.rs())
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let recovery_id = RecoveryId::from_byte(signature.v())
        .ok_or(CryptoError::InvalidRecoveryId(signature.v()))?;
    let key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)
        .map_err(|e| CryptoError::RecoveryFailed(e.to_string()))?;
    Ok(address_of(&key))
}

/// A secp256k1 keypair able to issue recoverable signatures.
///
/// The provider side only ever recovers signers; signing identities are
/// what consumer implementations and test fixtures use to produce valid
/// promises and exchange messages.
pub struct SigningIdentity {
    key: SigningKey,
}

impl SigningIdentity {
    /// Generates a random identity.
    pub fn generate() -> Self {
        SigningIdentity {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Restores an identity from 32 secret-key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let key = SigningKey::from_bytes(bytes.into())
            .map_err(|e| CryptoError::InvalidSecretKey(e.to_string()))?;
        Ok(SigningIdentity { key })
    }

    /// The address this identity signs as.
    pub fn address(&self) -> Address {
        address_of(self.key.verifying_key())
    }

    /// Signs a 32-byte digest, returning the recoverable signature.
    pub fn sign(&self, digest: &[u8; 32]) -> Result<Signature, CryptoError> {
        let (sig, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        let rs: [u8; 64] = sig.to_bytes().into();
        Ok(Signature::from_parts(rs, recovery_id.to_byte()))
    }
}
