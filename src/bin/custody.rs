#![forbid(unsafe_code)]
//! custody - operator CLI for a CustodyChain ledger

use clap::{Parser, Subcommand};
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Color as TableColor;
use comfy_table::{Attribute, Cell, ContentArrangement, Table};
use custodychain::blockchain::current_timestamp;
use custodychain::config::{load_config, DEFAULT_CONFIG_PATH};
use custodychain::crypto::KeyPair;
use custodychain::engine::{ChainEngine, LoadReport, MinedBlock};
use custodychain::history;
use custodychain::miner::CancelToken;
use custodychain::transaction::{
    validate_attribute_key, AttributeValue, Transaction, TransactionRequest, ATTR_TIMESTAMP,
};
use custodychain::ChainError;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "custody", author, version, about = "Product custody ledger", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Chain store location, overriding `storage.path`
    #[arg(long, global = true)]
    data: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generates a key pair and writes it to a JSON key file
    Keygen {
        #[arg(long, default_value = "custody-key.json")]
        out: PathBuf,
    },
    /// Registers a product batch to an owner, stamped with the current time, and seals it
    Register {
        /// Initial owner
        owner: String,
        product_id: String,
        product_name: String,
        #[arg(long, default_value_t = 1.0)]
        quantity: f64,
        /// Extra attribute as key=value (repeatable)
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, AttributeValue)>,
    },
    /// Transfers a product held by the key's owner and seals it into a new block
    Transfer {
        product_id: String,
        new_owner: String,
        /// Key file produced by `keygen`; its public key is the sender identity
        #[arg(long)]
        key: PathBuf,
    },
    /// Submits a signed transaction request from a JSON file and seals it
    Submit { file: PathBuf },
    /// Seals pending transactions plus a mining reward
    Mine {
        /// Reward recipient (defaults to the node identifier)
        #[arg(long)]
        reward_to: Option<String>,
        /// Give up after this long, e.g. "30s" or "5m"
        #[arg(long)]
        timeout: Option<humantime::Duration>,
    },
    /// Lists every block
    Chain,
    /// Shows one block as JSON
    Block { index: u64 },
    /// Re-checks linkage and proofs of the stored chain
    Validate,
    /// Shows the custody history of a product
    History { product_id: String },
    /// Lists registered products
    Products,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    public_key: String,
    private_key: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let engine = match &cli.command {
        Commands::Keygen { out } => return keygen(out),
        _ => open_engine(&cli.config, cli.data.as_deref())?,
    };

    match cli.command {
        Commands::Keygen { .. } => {}
        Commands::Register {
            owner,
            product_id,
            product_name,
            quantity,
            attributes,
        } => {
            let mut tx = Transaction::system(owner, product_id, product_name, quantity);
            tx.attributes.extend(attributes);
            tx.attributes
                .entry(ATTR_TIMESTAMP.to_string())
                .or_insert(AttributeValue::Number(current_timestamp()));
            engine.submit_transaction(tx, None)?;
            let mined = seal_with_spinner(&engine, None, |cancel| engine.seal_pending(cancel))?;
            print_mined(&engine, &mined)?;
        }
        Commands::Transfer {
            product_id,
            new_owner,
            key,
        } => {
            let key_file: KeyFile = serde_json::from_str(&fs::read_to_string(&key)?)?;
            let keypair = KeyPair::from_private_key_hex(&key_file.private_key)?;
            let sender = keypair.public_key_hex();

            let tx = engine.prepare_transfer(&product_id, &sender, &new_owner)?;
            let signature = keypair.sign_transaction(&tx)?;
            engine.submit_transaction(tx.with_signature(signature), Some(&sender))?;
            let mined = seal_with_spinner(&engine, None, |cancel| engine.seal_pending(cancel))?;
            print_mined(&engine, &mined)?;
        }
        Commands::Submit { file } => {
            let request: TransactionRequest = serde_json::from_str(&fs::read_to_string(&file)?)?;
            let index = engine.submit_request(request)?;
            println!("{}", format!("Transaction accepted for block #{}", index).green());
            let mined = seal_with_spinner(&engine, None, |cancel| engine.seal_pending(cancel))?;
            print_mined(&engine, &mined)?;
        }
        Commands::Mine { reward_to, timeout } => {
            let mined = seal_with_spinner(&engine, timeout.map(Into::into), |cancel| {
                engine.mine(reward_to.as_deref(), cancel)
            })?;
            print_mined(&engine, &mined)?;
        }
        Commands::Chain => print_chain(&engine)?,
        Commands::Block { index } => match engine.block(index) {
            Some(block) => {
                println!("{}", format!("Hash: {}", block.hash()?).cyan());
                println!("{}", serde_json::to_string_pretty(&block)?);
            }
            None => {
                return Err(format!("No block #{} (chain length {})", index, engine.len()).into())
            }
        },
        Commands::Validate => {
            engine.validate()?;
            println!(
                "{}",
                format!("✅ Chain of {} blocks is valid", engine.len()).green().bold()
            );
        }
        Commands::History { product_id } => print_history(&engine, &product_id),
        Commands::Products => print_products(&engine),
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn open_engine(
    config_path: &Path,
    data: Option<&str>,
) -> Result<ChainEngine, Box<dyn std::error::Error>> {
    let mut config = load_config(config_path)?;
    if let Some(path) = data {
        config.storage.path = path.to_string();
    }
    config.validate()?;

    let (engine, report) = ChainEngine::from_config(&config)?;
    match report {
        LoadReport::Loaded { .. } => {}
        LoadReport::CreatedGenesis => {
            println!("{}", "⛓️  No chain found, created genesis block".bright_cyan());
        }
        LoadReport::RecoveredFromCorruption { reason, quarantined } => {
            let warning = format!("⚠️  Stored chain was corrupt: {}", reason);
            eprintln!("{}", warning.yellow().bold());
            if let Some(place) = quarantined {
                eprintln!("{}", format!("   Previous content moved to {}", place).yellow());
            }
            eprintln!("{}", "   Started over from a fresh genesis block".yellow());
        }
    }
    Ok(engine)
}

fn keygen(out: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if out.exists() {
        let message = format!("{} already exists; refusing to overwrite a key file", out.display());
        return Err(message.into());
    }
    let keypair = KeyPair::generate()?;
    let key_file = KeyFile {
        public_key: keypair.public_key_hex(),
        private_key: keypair.private_key_hex(),
    };
    fs::write(out, serde_json::to_string_pretty(&key_file)?)?;

    println!("{}", "🔑 Key pair generated".green().bold());
    println!("{}", format!("Public key: {}", key_file.public_key).cyan());
    println!("{}", format!("Saved to:   {}", out.display()).cyan());
    Ok(())
}

fn parse_attribute(raw: &str) -> Result<(String, AttributeValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    validate_attribute_key(key).map_err(|e| e.to_string())?;

    let value = if let Ok(flag) = value.parse::<bool>() {
        AttributeValue::Bool(flag)
    } else if let Ok(number) = value.parse::<f64>() {
        AttributeValue::Number(number)
    } else {
        AttributeValue::Text(value.to_string())
    };
    Ok((key.to_string(), value))
}

/// Runs `seal` behind a spinner, cancelling it once `timeout` elapses.
fn seal_with_spinner<F>(
    engine: &ChainEngine,
    timeout: Option<Duration>,
    seal: F,
) -> Result<MinedBlock, Box<dyn std::error::Error>>
where
    F: FnOnce(&CancelToken) -> Result<MinedBlock, ChainError>,
{
    let cancel = CancelToken::new();
    if let Some(limit) = timeout {
        let token = cancel.clone();
        thread::spawn(move || {
            thread::sleep(limit);
            token.cancel();
        });
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")?);
    spinner.set_message(format!(
        "Mining block #{} at difficulty {}",
        engine.len() + 1,
        engine.sealer().difficulty()
    ));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = seal(&cancel);
    spinner.finish_and_clear();
    Ok(result?)
}

fn print_mined(engine: &ChainEngine, mined: &MinedBlock) -> Result<(), Box<dyn std::error::Error>> {
    let block = &mined.block;
    println!("{}", format!("✅ Block #{} sealed", block.index).green().bold());
    println!("   Hash:         {}", engine.hash(block)?.as_str().cyan());
    println!("   Previous:     {}", block.previous_hash);
    println!("   Proof:        {}", block.proof);
    println!("   Transactions: {}", block.transactions.len());
    println!(
        "   Search:       {} iterations in {}",
        mined.stats.iterations,
        humantime::format_duration(Duration::from_millis(mined.stats.elapsed.as_millis() as u64))
    );
    Ok(())
}

fn format_timestamp(timestamp: f64) -> String {
    let secs = timestamp.trunc() as i64;
    let nanos = (timestamp.fract() * 1e9) as u32;
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs, nanos)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

fn header(cells: &[&str]) -> Vec<Cell> {
    cells
        .iter()
        .map(|name| Cell::new(name).fg(TableColor::Cyan).add_attribute(Attribute::Bold))
        .collect()
}

fn print_chain(engine: &ChainEngine) -> Result<(), Box<dyn std::error::Error>> {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header(&["Block", "Time", "Txs", "Proof", "Hash"]));

    for block in engine.get_chain() {
        let hash = block.hash()?;
        table.add_row(vec![
            Cell::new(format!("#{}", block.index)).fg(TableColor::White),
            Cell::new(format_timestamp(block.timestamp)).fg(TableColor::Grey),
            Cell::new(block.transactions.len()),
            Cell::new(block.proof),
            Cell::new(&hash[..16]).fg(TableColor::Green),
        ]);
    }

    let summary = engine.summary();
    println!("{}", table);
    println!(
        "{}",
        format!(
            "{} blocks, {} transactions, store {}",
            summary.length,
            summary.total_transactions,
            engine.storage_location()
        )
        .bright_blue()
    );
    Ok(())
}

fn print_history(engine: &ChainEngine, product_id: &str) {
    engine.with_chain(|blocks| {
        let events = history::product_history(blocks, product_id);
        if events.is_empty() {
            println!("{}", format!("No records for product {}", product_id).yellow());
            return;
        }

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(header(&["Block", "From", "To", "Quantity", "Attributes"]));

        for event in &events {
            let tx = event.transaction;
            let from = if tx.is_system() { "registration".to_string() } else { tx.sender.clone() };
            let attributes = tx
                .attributes
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            table.add_row(vec![
                Cell::new(format!("#{}", event.block_index)).fg(TableColor::White),
                Cell::new(from).fg(TableColor::Red),
                Cell::new(&tx.recipient).fg(TableColor::Green),
                Cell::new(tx.quantity),
                Cell::new(attributes).fg(TableColor::Grey),
            ]);
        }

        println!("{}", table);
        if let Some(holder) = history::current_holder(blocks, product_id) {
            println!("{}", format!("Current holder: {}", holder).bright_cyan().bold());
        }
    });
}

fn print_products(engine: &ChainEngine) {
    engine.with_chain(|blocks| {
        let products = history::registered_products(blocks);
        if products.is_empty() {
            println!("{}", "No products registered yet".yellow());
            return;
        }

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(header(&["Product", "Name", "Quantity", "Registered in", "Holder"]));

        for event in &products {
            let tx = event.transaction;
            let holder = history::current_holder(blocks, &tx.product_id).unwrap_or("-");
            table.add_row(vec![
                Cell::new(&tx.product_id).fg(TableColor::Cyan),
                Cell::new(&tx.product_name),
                Cell::new(tx.quantity),
                Cell::new(format!("#{}", event.block_index)),
                Cell::new(holder).fg(TableColor::Green),
            ]);
        }
        println!("{}", table);
    });
}
