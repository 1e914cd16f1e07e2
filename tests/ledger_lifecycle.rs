//! Integration tests for the submit / seal / reload cycle

use custodychain::crypto::{self, KeyPair};
use custodychain::engine::{ChainEngine, LoadReport};
use custodychain::history;
use custodychain::miner::{CancelToken, ProofOfWork};
use custodychain::persistence::{JsonFilePersistence, SqlitePersistence};
use custodychain::transaction::{
    Transaction, TransactionRequest, ATTR_LOCATION, ATTR_STORAGE_TEMPERATURE,
};
use custodychain::ChainError;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Helper to open an engine over a JSON file in `dir`
fn open_json(
    dir: &TempDir,
    difficulty: usize,
) -> Result<(ChainEngine, LoadReport), Box<dyn std::error::Error>> {
    let store = JsonFilePersistence::new(dir.path().join("chain.json"));
    Ok(ChainEngine::open(Box::new(store), ProofOfWork::new(difficulty)?)?)
}

fn open_sqlite(path: &str) -> Result<(ChainEngine, LoadReport), ChainError> {
    ChainEngine::open(Box::new(SqlitePersistence::open(path)?), ProofOfWork::new(1)?)
}

#[test]
fn test_reference_scenario() -> TestResult {
    let dir = TempDir::new()?;
    let (engine, report) = open_json(&dir, 4)?;
    assert_eq!(report, LoadReport::CreatedGenesis);

    let genesis = engine.last_block();
    assert_eq!(genesis.index, 1);
    assert_eq!(genesis.previous_hash, "1");
    assert_eq!(genesis.proof, 100);
    assert!(genesis.transactions.is_empty());

    let index = engine.submit_transaction(Transaction::system("alice", "P1", "Widget", 1.0), None)?;
    assert_eq!(index, 2);

    let proof = engine.sealer().seal(100)?;
    let digest = hex::encode(Sha256::digest(format!("100{}", proof).as_bytes()));
    assert!(digest.starts_with("0000"));

    let block = engine.seal_block(proof, None)?;
    assert_eq!(block.index, 2);
    assert_eq!(block.previous_hash, engine.hash(&genesis)?);
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(block.transactions[0].recipient, "alice");
    assert_eq!(engine.pending_count(), 0);

    let before: Vec<String> =
        engine.get_chain().iter().map(|b| b.hash()).collect::<Result<_, _>>()?;
    drop(engine);

    let (reloaded, report) = open_json(&dir, 4)?;
    assert_eq!(report, LoadReport::Loaded { blocks: 2 });
    let after: Vec<String> =
        reloaded.get_chain().iter().map(|b| b.hash()).collect::<Result<_, _>>()?;
    assert_eq!(before, after);
    assert!(reloaded.validate().is_ok());
    Ok(())
}

#[test]
fn test_indices_are_dense_and_linked() -> TestResult {
    let dir = TempDir::new()?;
    let (engine, _) = open_json(&dir, 2)?;

    for round in 0..4 {
        engine.submit_transaction(
            Transaction::system("alice", format!("P{}", round), "Widget", 1.0),
            None,
        )?;
        engine.mine(Some("node"), &CancelToken::new())?;
    }

    let chain = engine.get_chain();
    assert_eq!(chain.len(), 5);
    for pair in chain.windows(2) {
        assert_eq!(pair[1].index, pair[0].index + 1);
        assert_eq!(pair[1].previous_hash, pair[0].hash()?);
        assert!(engine.sealer().valid(pair[0].proof, pair[1].proof));
    }
    Ok(())
}

#[test]
fn test_signed_transfer_flow() -> TestResult {
    let dir = TempDir::new()?;
    let (engine, _) = open_json(&dir, 1)?;
    let supplier = KeyPair::generate()?;
    let supplier_id = supplier.public_key_hex();

    engine.submit_transaction(
        Transaction::system(supplier_id.clone(), "P1", "Vaccine", 100.0)
            .with_attribute(ATTR_STORAGE_TEMPERATURE, -70.0),
        None,
    )?;
    engine.mine(None, &CancelToken::new())?;

    let transfer = engine.prepare_transfer("P1", &supplier_id, "carrier")?;
    let signature = crypto::sign_transaction(&transfer, &supplier.private_key_hex())?;
    // The sender string doubles as the public key when none is supplied.
    engine.submit_transaction(transfer.with_signature(signature), None)?;
    engine.mine(None, &CancelToken::new())?;

    let holder =
        engine.with_chain(|blocks| history::current_holder(blocks, "P1").map(str::to_string));
    assert_eq!(holder.as_deref(), Some("carrier"));

    let events = engine.with_chain(|blocks| history::product_history(blocks, "P1").len());
    assert_eq!(events, 2);

    assert!(matches!(
        engine.prepare_transfer("P1", &supplier_id, "someone"),
        Err(ChainError::RejectedTransaction(_))
    ));
    Ok(())
}

#[test]
fn test_unsigned_and_forged_transactions_rejected() -> TestResult {
    let dir = TempDir::new()?;
    let (engine, _) = open_json(&dir, 1)?;
    let owner = KeyPair::generate()?;
    let intruder = KeyPair::generate()?;

    let tx = Transaction::new(owner.public_key_hex(), "bob", "P1", "Widget", 1.0);
    let err = engine.submit_transaction(tx.clone(), Some(&owner.public_key_hex())).unwrap_err();
    assert!(err.is_rejection());

    let forged = tx.clone().with_signature(intruder.sign_transaction(&tx)?);
    let err = engine.submit_transaction(forged, Some(&owner.public_key_hex())).unwrap_err();
    assert!(err.is_rejection());

    let mut tampered = tx.clone().with_signature(owner.sign_transaction(&tx)?);
    tampered.quantity = 1000.0;
    assert!(engine.submit_transaction(tampered, None).is_err());

    assert_eq!(engine.pending_count(), 0);
    assert_eq!(engine.len(), 1);
    Ok(())
}

#[test]
fn test_request_with_bad_hex_signature() -> TestResult {
    let dir = TempDir::new()?;
    let (engine, _) = open_json(&dir, 1)?;
    let request: TransactionRequest = serde_json::from_str(
        r#"{
            "sender": "02aa",
            "recipient": "bob",
            "product_id": "P1",
            "product_name": "Widget",
            "quantity": 1,
            "signature": "not-hex"
        }"#,
    )?;
    let err = engine.submit_request(request).unwrap_err();
    assert!(matches!(err, ChainError::MalformedSignatureEncoding(_)));
    assert!(err.is_rejection());
    assert_eq!(engine.pending_count(), 0);
    Ok(())
}

#[test]
fn test_signed_request_accepted() -> TestResult {
    let dir = TempDir::new()?;
    let (engine, _) = open_json(&dir, 1)?;
    let keypair = KeyPair::generate()?;
    let tx = Transaction::new(keypair.public_key_hex(), "bob", "P1", "Widget", 3.0)
        .with_attribute(ATTR_LOCATION, "Dock 4");
    let signature = keypair.sign_transaction(&tx)?;

    let request = TransactionRequest {
        sender: tx.sender.clone(),
        recipient: tx.recipient.clone(),
        product_id: tx.product_id.clone(),
        product_name: tx.product_name.clone(),
        quantity: tx.quantity,
        attributes: tx.attributes.clone(),
        signature: Some(signature.to_hex()),
        public_key: Some(keypair.public_key_hex()),
    };
    assert_eq!(engine.submit_request(request)?, 2);
    Ok(())
}

#[test]
fn test_sqlite_backend_round_trip() -> TestResult {
    let dir = TempDir::new()?;
    let path = dir.path().join("chain.db");
    let path = path.to_str().ok_or("non-utf8 temp path")?;
    {
        let (engine, report) = open_sqlite(path)?;
        assert_eq!(report, LoadReport::CreatedGenesis);
        engine.submit_transaction(Transaction::system("alice", "P1", "Widget", 1.0), None)?;
        engine.mine(None, &CancelToken::new())?;
    }
    let (engine, report) = open_sqlite(path)?;
    assert_eq!(report, LoadReport::Loaded { blocks: 2 });
    assert_eq!(engine.last_block().transactions.len(), 2);
    Ok(())
}

#[test]
fn test_registration_seal_holds_only_the_registration() -> TestResult {
    let dir = TempDir::new()?;
    let (engine, _) = open_json(&dir, 1)?;
    engine.submit_transaction(Transaction::system("alice", "P1", "Widget", 1.0), None)?;

    let sealed = engine.seal_pending(&CancelToken::new())?;
    assert_eq!(sealed.block.transactions.len(), 1);
    assert_eq!(sealed.block.transactions[0].product_id, "P1");
    assert!(!sealed.block.transactions[0].is_mining_reward());

    let registered = engine.with_chain(|blocks| history::registered_products(blocks).len());
    assert_eq!(registered, 1);
    Ok(())
}
