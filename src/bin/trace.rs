//! Developer diagnostic tool: prints an address's raw document plus its
//! resolved transactions (joining `vout`/`vin_txid`/`coinbase`), capped
//! at 100 each so a whale address doesn't flood the terminal. Built
//! against the actual `AddressBody`/`VoutDoc`/etc. shapes in
//! `chainidx::model`, not the stale field names the original trace
//! script read off the `address` document.

use clap::Parser;
use serde::Serialize;

use chainidx::cli::CommonArgs;
use chainidx::config::{get_global_config, init_global_config};
use chainidx::model::{AddressBody, CoinbaseDoc, VinTxidDoc, VoutDoc};
use chainidx::store::{Store, Table};

const TRACE_CAP: usize = 100;

#[derive(Parser, Debug)]
#[command(about = "Print an address document and its resolved transactions")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Address to inspect.
    #[arg(short = 'a', long = "address")]
    address: String,
}

#[derive(Debug, Serialize)]
struct TracedTx {
    txid: String,
    vout: Option<VoutDoc>,
    vin: Option<VinTxidDoc>,
    coinbase: Option<CoinbaseDoc>,
}

#[derive(Debug, Serialize)]
struct TraceReport {
    address: String,
    document: AddressBody,
    transactions: Vec<TracedTx>,
    truncated: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    init_global_config()?;
    let settings = get_global_config();
    let db_path = settings.db_path(&args.common.coin_type)?;
    let store = Store::open(&db_path)?;

    let document: AddressBody = store
        .select(Table::Address, &args.address)?
        .ok_or_else(|| format!("unknown address: {}", args.address))?;

    let txids: Vec<String> = match &document {
        AddressBody::Skip { .. } => Vec::new(),
        AddressBody::Txids(map) => map.keys().cloned().collect(),
    };

    let truncated = txids.len() > TRACE_CAP;
    let mut transactions = Vec::new();
    for txid in txids.iter().take(TRACE_CAP) {
        let vout: Option<VoutDoc> = store.select(Table::Vout, txid)?;
        let vin: Option<VinTxidDoc> = store.select(Table::VinTxid, txid)?;
        let coinbase: Option<CoinbaseDoc> = store.select(Table::Coinbase, txid)?;
        transactions.push(TracedTx { txid: txid.clone(), vout, vin, coinbase });
    }

    let report = TraceReport { address: args.address, document, transactions, truncated };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
