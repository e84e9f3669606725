//! Extractor: walks the chain from a starting block hash, emitting one
//! row per vout, per vin-spend, per coinbase-vin, per (address,vout),
//! and per (block,tx) pair into the six staging files.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, Result};
use crate::node_client::NodeClient;
use crate::staging::{StagingWriters, UNKNOWN_ADDRESS};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtractSummary {
    pub vout: u64,
    pub vin_spent: u64,
    pub vin_txid: u64,
    pub coinbase: u64,
    pub address: u64,
    pub block: u64,
    #[serde(rename = "last-processed-block")]
    pub last_processed_block: Option<String>,
    pub last_height: Option<i64>,
    pub last_timestamp: Option<i64>,
    pub limit: Option<u64>,
    /// Addresses touched by this pass, carried into the new-block
    /// notification payload.
    pub touched_addresses: BTreeSet<String>,
}

/// Walk the chain starting at `start` (genesis on the first run, or the
/// resumed `nextblockhash`), writing rows into `writers` until either
/// the chain tip or `limit` blocks have been processed.
pub fn extract(
    client: &NodeClient,
    writers: &mut StagingWriters,
    start: &str,
    limit: Option<u64>,
) -> Result<ExtractSummary> {
    let mut summary = ExtractSummary {
        limit,
        ..Default::default()
    };

    let mut next = start.to_string();
    let mut processed = 0u64;

    loop {
        if let Some(limit) = limit {
            if processed >= limit {
                break;
            }
        }

        let block = match client.get_block(&next)? {
            Some(b) => b,
            None => break,
        };

        if block.hash != next {
            return Err(IndexerError::InvalidData(format!(
                "requested block {next} but node returned {}; possible mid-run reorg",
                block.hash
            )));
        }

        for tx in &block.tx {
            let vin_count = tx.vin.len() as u32;
            let vout_count = tx.vout.len() as u32;

            writers.block.write_row(&[
                &block.hash,
                &tx.txid,
                &block.height.to_string(),
                &block.time.to_string(),
                &vin_count.to_string(),
                &vout_count.to_string(),
            ])?;
            summary.block += 1;

            for vout in &tx.vout {
                if vout.script_pub_key.addresses.is_empty() {
                    writers.vout.write_row(&[
                        &tx.txid,
                        &vout.n.to_string(),
                        UNKNOWN_ADDRESS,
                        &vout.value,
                        &block.height.to_string(),
                        &block.hash,
                        &block.time.to_string(),
                        &vin_count.to_string(),
                        &vout_count.to_string(),
                    ])?;
                    summary.vout += 1;
                    continue;
                }
                for address in &vout.script_pub_key.addresses {
                    summary.touched_addresses.insert(address.clone());
                    writers.vout.write_row(&[
                        &tx.txid,
                        &vout.n.to_string(),
                        address,
                        &vout.value,
                        &block.height.to_string(),
                        &block.hash,
                        &block.time.to_string(),
                        &vin_count.to_string(),
                        &vout_count.to_string(),
                    ])?;
                    summary.vout += 1;

                    writers.address.write_row(&[
                        address,
                        &tx.txid,
                        &vout.n.to_string(),
                        &vout.value,
                        &block.height.to_string(),
                        &block.time.to_string(),
                    ])?;
                    summary.address += 1;
                }
            }

            let is_coinbase = tx.vin.iter().any(|v| v.coinbase.is_some());
            if is_coinbase {
                if tx.vin.len() != 1 {
                    return Err(IndexerError::InvalidData(format!(
                        "coinbase tx {} has {} vins, expected exactly 1",
                        tx.txid,
                        tx.vin.len()
                    )));
                }
                let coinbase_hex = tx.vin[0].coinbase.clone().unwrap_or_default();
                writers.coinbase.write_row(&[
                    &tx.txid,
                    &coinbase_hex,
                    "0",
                    &block.time.to_string(),
                    &block.height.to_string(),
                ])?;
                summary.coinbase += 1;
            } else {
                for (vin_n, vin) in tx.vin.iter().enumerate() {
                    let Some(spent_txid) = vin.txid.as_ref() else {
                        continue;
                    };
                    let spent_vout = vin.vout.unwrap_or(0);

                    writers.vin_spent.write_row(&[
                        spent_txid,
                        &spent_vout.to_string(),
                        &tx.txid,
                        &vin_n.to_string(),
                        &block.time.to_string(),
                        &block.height.to_string(),
                    ])?;
                    summary.vin_spent += 1;

                    writers.vin_txid.write_row(&[
                        &tx.txid,
                        &vin_n.to_string(),
                        spent_txid,
                        &spent_vout.to_string(),
                        &block.time.to_string(),
                        &block.height.to_string(),
                    ])?;
                    summary.vin_txid += 1;
                }
            }
        }

        summary.last_processed_block = Some(block.hash.clone());
        summary.last_height = Some(block.height);
        summary.last_timestamp = Some(block.time);
        processed += 1;

        match block.nextblockhash {
            Some(n) => next = n,
            None => break,
        }
    }

    Ok(summary)
}
