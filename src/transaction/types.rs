/// Transaction types for CustodyChain
use crate::error::{ChainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sender identity reserved for system-issued records (registrations, mining rewards).
/// Transactions from this sender carry no signature requirement.
pub const SYSTEM_SENDER: &str = "0";

/// Maximum canonical transaction size in bytes (100KB)
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// Domain prefix of the versioned signing encoding.
pub const SIGNING_DOMAIN: &[u8] = b"custodychain/tx/v1\n";

/// Product id and name carried by mining reward transactions.
pub const REWARD_PRODUCT_ID: &str = "0";
pub const REWARD_PRODUCT_NAME: &str = "Mined Coin";

pub const ATTR_TIMESTAMP: &str = "timestamp";
pub const ATTR_STORAGE_TEMPERATURE: &str = "storage_temperature";
pub const ATTR_HUMIDITY: &str = "humidity";
pub const ATTR_LOCATION: &str = "location";

/// Field names of the fixed schema; attribute keys may not shadow them.
pub const CORE_FIELDS: [&str; 6] = [
    "sender",
    "recipient",
    "product_id",
    "product_name",
    "quantity",
    "signature",
];

/// A primitive value in the transaction's extension bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Number(n) => write!(f, "{}", n),
            AttributeValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Raw signature bytes; hex-encoded on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(#[serde(with = "hex::serde")] Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Signature(bytes)
    }

    /// Decode a signature received at the boundary.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        hex::decode(hex_str.trim())
            .map(Signature)
            .map_err(|e| {
                ChainError::MalformedSignatureEncoding(format!("invalid hex signature: {}", e))
            })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

/// One transfer or registration of custody of a product batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub recipient: String,
    pub product_id: String,
    pub product_name: String,
    pub quantity: f64,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub signature: Option<Signature>,
}

/// The signed view of a transaction: every content field, never the signature.
#[derive(Serialize)]
struct SigningView<'a> {
    sender: &'a str,
    recipient: &'a str,
    product_id: &'a str,
    product_name: &'a str,
    quantity: f64,
    #[serde(flatten)]
    attributes: &'a BTreeMap<String, AttributeValue>,
}

impl Transaction {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        product_id: impl Into<String>,
        product_name: impl Into<String>,
        quantity: f64,
    ) -> Self {
        Transaction {
            sender: sender.into(),
            recipient: recipient.into(),
            product_id: product_id.into(),
            product_name: product_name.into(),
            quantity,
            attributes: BTreeMap::new(),
            signature: None,
        }
    }

    /// A system-issued record, exempt from signing.
    pub fn system(
        recipient: impl Into<String>,
        product_id: impl Into<String>,
        product_name: impl Into<String>,
        quantity: f64,
    ) -> Self {
        Self::new(SYSTEM_SENDER, recipient, product_id, product_name, quantity)
    }

    /// The reward recorded when a node seals a block.
    pub fn mining_reward(recipient: impl Into<String>) -> Self {
        Self::system(recipient, REWARD_PRODUCT_ID, REWARD_PRODUCT_NAME, 1.0)
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn is_system(&self) -> bool {
        self.sender == SYSTEM_SENDER
    }

    pub fn is_mining_reward(&self) -> bool {
        self.is_system()
            && self.product_id == REWARD_PRODUCT_ID
            && self.product_name == REWARD_PRODUCT_NAME
    }

    /// Bytes covered by the signature: the domain prefix followed by the
    /// JCS canonical JSON of the content fields.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let view = SigningView {
            sender: &self.sender,
            recipient: &self.recipient,
            product_id: &self.product_id,
            product_name: &self.product_name,
            quantity: self.quantity,
            attributes: &self.attributes,
        };
        let body = serde_jcs::to_vec(&view).map_err(canonical_encoding_failed)?;

        let mut message = Vec::with_capacity(SIGNING_DOMAIN.len() + body.len());
        message.extend_from_slice(SIGNING_DOMAIN);
        message.extend_from_slice(&body);
        Ok(message)
    }

    /// Canonical JSON of the full record, signature included.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_jcs::to_vec(self).map_err(canonical_encoding_failed)
    }
}

fn canonical_encoding_failed(e: serde_json::Error) -> ChainError {
    ChainError::InvalidTransaction(format!("Canonical encoding failed: {}", e))
}

/// A transaction as received from a collaborator: the signature is still hex
/// text and the sender's public key travels alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub sender: String,
    pub recipient: String,
    pub product_id: String,
    pub product_name: String,
    pub quantity: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

impl TransactionRequest {
    /// Decode the boundary encodings. Returns the transaction and the public key to verify against.
    pub fn into_parts(self) -> Result<(Transaction, Option<String>)> {
        let signature = match self.signature.as_deref() {
            Some(sig) if !sig.trim().is_empty() => Some(Signature::from_hex(sig)?),
            _ => None,
        };

        let tx = Transaction {
            sender: self.sender,
            recipient: self.recipient,
            product_id: self.product_id,
            product_name: self.product_name,
            quantity: self.quantity,
            attributes: self.attributes,
            signature,
        };
        Ok((tx, self.public_key))
    }
}
