//! Custody queries over sealed blocks.

use crate::blockchain::Block;
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;

/// A transaction together with the block that sealed it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CustodyEvent<'a> {
    pub block_index: u64,
    pub transaction: &'a Transaction,
}

/// Every transaction touching `product_id`, oldest first.
pub fn product_history<'a>(blocks: &'a [Block], product_id: &str) -> Vec<CustodyEvent<'a>> {
    blocks
        .iter()
        .flat_map(|block| {
            block.transactions.iter().map(move |tx| CustodyEvent {
                block_index: block.index,
                transaction: tx,
            })
        })
        .filter(|event| event.transaction.product_id == product_id)
        .collect()
}

/// The most recent transaction for `product_id`, if it was ever recorded.
pub fn latest_transaction<'a>(blocks: &'a [Block], product_id: &str) -> Option<&'a Transaction> {
    blocks
        .iter()
        .rev()
        .flat_map(|block| block.transactions.iter().rev())
        .find(|tx| tx.product_id == product_id)
}

/// Recipient of the latest transaction for `product_id`.
pub fn current_holder<'a>(blocks: &'a [Block], product_id: &str) -> Option<&'a str> {
    latest_transaction(blocks, product_id).map(|tx| tx.recipient.as_str())
}

/// Fails unless `holder` received `product_id` in its latest transaction.
pub fn ensure_holder<'a>(
    blocks: &'a [Block],
    product_id: &str,
    holder: &str,
) -> Result<&'a Transaction> {
    match latest_transaction(blocks, product_id) {
        Some(tx) if tx.recipient == holder => Ok(tx),
        Some(tx) => Err(ChainError::RejectedTransaction(format!(
            "Product {} is held by {}, not {}",
            product_id, tx.recipient, holder
        ))),
        None => Err(ChainError::RejectedTransaction(format!(
            "Product {} has never been recorded",
            product_id
        ))),
    }
}

/// Registrations issued by the system sender, mining rewards excluded.
pub fn registered_products(blocks: &[Block]) -> Vec<CustodyEvent<'_>> {
    blocks
        .iter()
        .flat_map(|block| {
            block.transactions.iter().map(move |tx| CustodyEvent {
                block_index: block.index,
                transaction: tx,
            })
        })
        .filter(|event| event.transaction.is_system() && !event.transaction.is_mining_reward())
        .collect()
}

/// An unsigned transfer of `product_id` from `sender` to `new_owner`.
///
/// Name, quantity and attributes are carried over from the latest record.
/// `sender` must be the current holder.
pub fn prepare_transfer(
    blocks: &[Block],
    product_id: &str,
    sender: &str,
    new_owner: &str,
) -> Result<Transaction> {
    let latest = ensure_holder(blocks, product_id, sender)?;
    let mut tx = Transaction::new(
        sender,
        new_owner,
        product_id,
        latest.product_name.clone(),
        latest.quantity,
    );
    tx.attributes = latest.attributes.clone();
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::ATTR_LOCATION;

    fn block(index: u64, transactions: Vec<Transaction>) -> Block {
        Block::new(index, transactions, 0, "00".repeat(32))
    }

    fn sample_chain() -> Vec<Block> {
        vec![
            Block::genesis(),
            block(
                2,
                vec![
                    Transaction::system("supplier", "P1", "Widget", 10.0)
                        .with_attribute(ATTR_LOCATION, "Plant"),
                    Transaction::mining_reward("node-a"),
                ],
            ),
            block(
                3,
                vec![
                    Transaction::new("supplier", "carrier", "P1", "Widget", 10.0)
                        .with_attribute(ATTR_LOCATION, "Truck"),
                    Transaction::system("supplier", "P2", "Gadget", 3.0),
                ],
            ),
        ]
    }

    #[test]
    fn test_history_in_chain_order() {
        let chain = sample_chain();
        let history = product_history(&chain, "P1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].block_index, 2);
        assert_eq!(history[1].block_index, 3);
        assert_eq!(history[1].transaction.recipient, "carrier");
        assert!(product_history(&chain, "missing").is_empty());
    }

    #[test]
    fn test_current_holder() {
        let chain = sample_chain();
        assert_eq!(current_holder(&chain, "P1"), Some("carrier"));
        assert_eq!(current_holder(&chain, "P2"), Some("supplier"));
        assert_eq!(current_holder(&chain, "P9"), None);
    }

    #[test]
    fn test_ensure_holder() {
        let chain = sample_chain();
        assert!(ensure_holder(&chain, "P1", "carrier").is_ok());
        let err = ensure_holder(&chain, "P1", "supplier").unwrap_err();
        assert!(err.is_rejection());
        assert!(err.to_string().contains("held by carrier"));
        assert!(ensure_holder(&chain, "P9", "carrier").is_err());
    }

    #[test]
    fn test_registered_products_skip_rewards() {
        let chain = sample_chain();
        let products: Vec<_> = registered_products(&chain)
            .iter()
            .map(|e| e.transaction.product_id.clone())
            .collect();
        assert_eq!(products, ["P1", "P2"]);
    }

    #[test]
    fn test_prepare_transfer_carries_details() {
        let chain = sample_chain();
        let tx = prepare_transfer(&chain, "P1", "carrier", "retailer").unwrap();
        assert_eq!(tx.sender, "carrier");
        assert_eq!(tx.recipient, "retailer");
        assert_eq!(tx.product_name, "Widget");
        assert_eq!(tx.quantity, 10.0);
        assert_eq!(tx.attribute(ATTR_LOCATION).and_then(|v| v.as_str()), Some("Truck"));
        assert!(tx.signature.is_none());

        assert!(prepare_transfer(&chain, "P1", "supplier", "retailer").is_err());
    }
}
