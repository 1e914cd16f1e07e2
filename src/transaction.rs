//! Transaction module split into types and validation for better modularity

pub mod types;
pub mod validation;

pub use types::*;
pub use validation::validate_attribute_key;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::error::ChainError;

    fn widget(sender: &str) -> Transaction {
        Transaction::new(sender, "alice", "P1", "Widget", 1.0)
            .with_attribute(ATTR_LOCATION, "Dock 4")
            .with_attribute(ATTR_STORAGE_TEMPERATURE, 4.5)
    }

    #[test]
    fn test_system_transaction_needs_no_signature() {
        let tx = Transaction::system("alice", "P1", "Widget", 1.0);
        assert!(tx.is_system());
        assert!(tx.validate(None).is_ok());
    }

    #[test]
    fn test_unsigned_transaction_fails() {
        let keypair = KeyPair::generate().unwrap();
        let tx = widget(&keypair.public_key_hex());
        let err = tx.validate(Some(&keypair.public_key_hex())).unwrap_err();
        assert!(matches!(err, ChainError::RejectedTransaction(_)));
    }

    #[test]
    fn test_signed_transaction_validates() {
        let keypair = KeyPair::generate().unwrap();
        let mut tx = widget("supplier-1");
        let signature = keypair.sign_transaction(&tx).unwrap();
        tx.signature = Some(signature);
        assert!(tx.validate(Some(&keypair.public_key_hex())).is_ok());
    }

    #[test]
    fn test_sender_is_used_as_public_key_when_none_supplied() {
        let keypair = KeyPair::generate().unwrap();
        let mut tx = widget(&keypair.public_key_hex());
        tx.signature = Some(keypair.sign_transaction(&tx).unwrap());
        assert!(tx.validate(None).is_ok());
    }

    #[test]
    fn test_invalid_signature_fails() {
        let keypair = KeyPair::generate().unwrap();
        let tx = widget("supplier-1").with_signature(Signature::from_bytes(vec![0u8; 64]));
        let err = tx.validate(Some(&keypair.public_key_hex())).unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn test_signing_bytes_ignore_signature_and_insertion_order() {
        let a = Transaction::new("s", "r", "P1", "Widget", 2.0)
            .with_attribute("humidity", 40.0)
            .with_attribute("location", "A");
        let b = Transaction::new("s", "r", "P1", "Widget", 2.0)
            .with_attribute("location", "A")
            .with_attribute("humidity", 40.0)
            .with_signature(Signature::from_bytes(vec![1, 2, 3]));
        assert_eq!(a.signing_bytes().unwrap(), b.signing_bytes().unwrap());
        assert_ne!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn test_signing_bytes_are_versioned_canonical_json() {
        let tx = Transaction::new("s", "r", "P1", "Widget", 1.0).with_attribute("location", "A");
        let bytes = tx.signing_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "custodychain/tx/v1\n{\"location\":\"A\",\"product_id\":\"P1\",\
             \"product_name\":\"Widget\",\"quantity\":1,\"recipient\":\"r\",\"sender\":\"s\"}"
        );
    }

    #[test]
    fn test_attribute_key_rules() {
        assert!(validate_attribute_key("storage_temperature").is_ok());
        assert!(validate_attribute_key("lot_2").is_ok());
        assert!(validate_attribute_key("").is_err());
        assert!(validate_attribute_key("Location").is_err());
        assert!(validate_attribute_key("2nd").is_err());
        assert!(validate_attribute_key("with space").is_err());
        assert!(validate_attribute_key("quantity").is_err());
        assert!(validate_attribute_key(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_shape_rejects_bad_quantity_and_empty_fields() {
        let tx = Transaction::system("alice", "P1", "Widget", f64::NAN);
        assert!(tx.validate_shape().is_err());
        let tx = Transaction::system("alice", "P1", "Widget", -1.0);
        assert!(tx.validate_shape().is_err());
        assert!(tx.validate(None).unwrap_err().is_rejection());
        let tx = Transaction::system("", "P1", "Widget", 1.0);
        assert!(tx.validate_shape().is_err());
        let tx = Transaction::system("alice", "P1", "Widget", 1.0)
            .with_attribute(ATTR_HUMIDITY, f64::INFINITY);
        assert!(tx.validate_shape().is_err());
    }

    #[test]
    fn test_oversized_transaction_rejected() {
        let tx = Transaction::system("alice", "P1", "Widget", 1.0)
            .with_attribute("notes", "x".repeat(MAX_TRANSACTION_SIZE));
        let err = tx.validate_shape().unwrap_err();
        assert!(err.to_string().contains("Transaction too large"));
    }

    #[test]
    fn test_wire_format_flattens_attributes() {
        let tx = widget("0");
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["location"], "Dock 4");
        assert_eq!(json["storage_temperature"], 4.5);
        assert!(json["signature"].is_null());

        let parsed: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, tx);
    }

    #[test]
    fn test_signature_hex_on_the_wire() {
        let tx = widget("0").with_signature(Signature::from_bytes(vec![0xab, 0xcd]));
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["signature"], "abcd");
        let parsed: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.signature, Some(Signature::from_bytes(vec![0xab, 0xcd])));
    }

    #[test]
    fn test_request_with_malformed_signature() {
        let request = TransactionRequest {
            sender: "supplier-1".into(),
            recipient: "alice".into(),
            product_id: "P1".into(),
            product_name: "Widget".into(),
            quantity: 1.0,
            attributes: Default::default(),
            signature: Some("not-hex".into()),
            public_key: None,
        };
        let err = request.into_parts().unwrap_err();
        assert!(matches!(err, ChainError::MalformedSignatureEncoding(_)));
        assert!(err.is_rejection());
    }

    #[test]
    fn test_mining_reward_shape() {
        let tx = Transaction::mining_reward("node-a");
        assert!(tx.is_mining_reward());
        assert_eq!(tx.quantity, 1.0);
        assert_eq!(tx.product_name, REWARD_PRODUCT_NAME);
    }
}
