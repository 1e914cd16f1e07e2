/// Validation logic for transactions separated from type definitions
use crate::error::{ChainError, Result};
use crate::transaction::types::{AttributeValue, Transaction, CORE_FIELDS, MAX_TRANSACTION_SIZE};

/// Maximum attribute key length
pub const MAX_ATTRIBUTE_KEY_LENGTH: usize = 64;

/// Maximum length of identity, product id and product name fields
pub const MAX_FIELD_LENGTH: usize = 4096;

/// Checks that an extension-bag key is a lowercase snake_case identifier that
/// does not shadow a core field.
pub fn validate_attribute_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_ATTRIBUTE_KEY_LENGTH {
        return Err(ChainError::InvalidTransaction(format!(
            "Attribute key must be 1..={} characters, got {}",
            MAX_ATTRIBUTE_KEY_LENGTH,
            key.len()
        )));
    }
    let starts_with_letter = key.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    let well_formed = key
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !starts_with_letter || !well_formed {
        return Err(ChainError::InvalidTransaction(format!(
            "Attribute key '{}' must be lowercase snake_case",
            key
        )));
    }
    if CORE_FIELDS.contains(&key) {
        return Err(ChainError::InvalidTransaction(format!(
            "Attribute key '{}' collides with a core field",
            key
        )));
    }
    Ok(())
}

impl Transaction {
    /// Stateless checks on the content fields: identities present, quantity
    /// finite and non-negative, attribute bag well-formed, size bounded.
    pub fn validate_shape(&self) -> Result<()> {
        for (name, value) in [
            ("sender", &self.sender),
            ("recipient", &self.recipient),
            ("product_id", &self.product_id),
        ] {
            if value.trim().is_empty() {
                return Err(ChainError::InvalidTransaction(format!("{} cannot be empty", name)));
            }
        }
        for (name, value) in [
            ("sender", &self.sender),
            ("recipient", &self.recipient),
            ("product_id", &self.product_id),
            ("product_name", &self.product_name),
        ] {
            if value.len() > MAX_FIELD_LENGTH {
                return Err(ChainError::InvalidTransaction(format!(
                    "{} exceeds maximum length of {} bytes",
                    name, MAX_FIELD_LENGTH
                )));
            }
        }

        if !self.quantity.is_finite() || self.quantity < 0.0 {
            return Err(ChainError::InvalidTransaction(format!(
                "Quantity must be a finite, non-negative number, got {}",
                self.quantity
            )));
        }

        for (key, value) in &self.attributes {
            validate_attribute_key(key)?;
            if let AttributeValue::Number(n) = value {
                if !n.is_finite() {
                    return Err(ChainError::InvalidTransaction(format!(
                        "Attribute '{}' must be a finite number",
                        key
                    )));
                }
            }
        }

        let size = self.canonical_bytes()?.len();
        if size > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                size, MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }

    /// Enforces the signing requirement. System-issued transactions pass
    /// unconditionally; everything else needs a signature that verifies
    /// against `public_key` (or, when no key is supplied, against the sender
    /// identity read as a public key).
    pub fn validate_signature(&self, public_key: Option<&str>) -> Result<()> {
        if self.is_system() {
            return Ok(());
        }

        let signature = self.signature.as_ref().ok_or_else(|| {
            ChainError::RejectedTransaction("Transaction missing signature".to_string())
        })?;
        let public_key = public_key.unwrap_or(&self.sender);
        let public_key_bytes = hex::decode(public_key.trim()).map_err(|_| {
            ChainError::RejectedTransaction(
                "Transaction missing a decodable public key".to_string(),
            )
        })?;

        let message = self
            .signing_bytes()
            .map_err(|e| ChainError::RejectedTransaction(e.to_string()))?;
        crate::crypto::verify_signature(&public_key_bytes, &message, signature.as_bytes()).map_err(
            |e| ChainError::RejectedTransaction(format!("Invalid transaction signature: {}", e)),
        )
    }

    /// Full admission check applied before a transaction enters the pending
    /// buffer. Every failure is reported as a rejection.
    pub fn validate(&self, public_key: Option<&str>) -> Result<()> {
        self.validate_shape()
            .map_err(|e| ChainError::RejectedTransaction(e.to_string()))?;
        self.validate_signature(public_key)
    }
}
