//! Transaction signing and verification (secp256k1 ECDSA over SHA-256)

use crate::error::{ChainError, Result};
use crate::transaction::{Signature, Transaction};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa, All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Result<Self> {
        let secret_key = SecretKey::new(&mut OsRng);
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Creates a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    /// Imports a private key previously exported with [`KeyPair::private_key_hex`].
    pub fn from_private_key_hex(private_key: &str) -> Result<Self> {
        let bytes = hex::decode(private_key.trim())
            .map_err(|e| ChainError::CryptoError(format!("Invalid hex private key: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Returns the KeyPair's public key as a compressed byte array.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Opaque exported form of the public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Opaque exported form of the private key.
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Signs the SHA-256 digest of `message`; returns the compact signature bytes.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE]> {
        let digest: [u8; 32] = Sha256::digest(message).into();
        let message = Message::from_digest(digest);
        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact())
    }

    /// Signs the transaction's canonical pre-signature encoding.
    pub fn sign_transaction(&self, tx: &Transaction) -> Result<Signature> {
        let message = tx.signing_bytes()?;
        Ok(Signature::from_bytes(self.sign(&message)?.to_vec()))
    }
}

/// Signs `tx` with an exported private key.
pub fn sign_transaction(tx: &Transaction, private_key_hex: &str) -> Result<Signature> {
    KeyPair::from_private_key_hex(private_key_hex)?.sign_transaction(tx)
}

/// Verifies an ECDSA signature given the raw public key bytes, message, and signature bytes.
pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<()> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;

    let digest: [u8; 32] = Sha256::digest(message).into();
    let message = Message::from_digest(digest);

    let signature = ecdsa::Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}

/// True iff `signature` was produced over `tx`'s current content by the
/// holder of `public_key_hex`. Decode failures of any input yield false.
pub fn verify_transaction(tx: &Transaction, signature: &Signature, public_key_hex: &str) -> bool {
    let Ok(public_key_bytes) = hex::decode(public_key_hex.trim()) else {
        return false;
    };
    let Ok(message) = tx.signing_bytes() else {
        return false;
    };
    verify_signature(&public_key_bytes, &message, signature.as_bytes()).is_ok()
}

/// Boundary variant of [`verify_transaction`] taking a hex-encoded signature.
pub fn verify_transaction_hex(tx: &Transaction, signature_hex: &str, public_key_hex: &str) -> bool {
    match Signature::from_hex(signature_hex) {
        Ok(signature) => verify_transaction(tx, &signature, public_key_hex),
        Err(_) => false,
    }
}
