//! JSON document shapes for the six key-value tables.
//!
//! Every table stores its document wrapped one level deep under the same
//! key used to address the row (`{key: {..fields..}}`) — the natural
//! result of a grouper accumulating `doc[key][field] = ...` as it reads
//! rows sharing one key. Callers index the outer map once after `select`,
//! exactly as the reference query engine does (`tx_vout_json[txid]['addresses']`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Satoshi = i64;

/// `block` table: `{block_hash: {height, timestamp, tx: {txid: {vin_count, vout_count}}}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BlockDoc {
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub tx: BTreeMap<String, BlockTxSummary>,
}
pub type BlockRecord = BTreeMap<String, BlockDoc>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BlockTxSummary {
    #[serde(default)]
    pub vin_count: u32,
    #[serde(default)]
    pub vout_count: u32,
}

/// `vout` table: `{txid: {height, block_hash, timestamp, vin_count, vout_count, addresses}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VoutDoc {
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub block_hash: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub vin_count: u32,
    #[serde(default)]
    pub vout_count: u32,
    /// address -> vout index (as string) -> entry
    #[serde(default)]
    pub addresses: BTreeMap<String, BTreeMap<String, VoutEntry>>,
}
pub type VoutRecord = BTreeMap<String, VoutDoc>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VoutEntry {
    #[serde(default)]
    pub value: Satoshi,
    #[serde(default)]
    pub timestamp: i64,
}

/// `vin_txid` table: `{txid: {timestamp, height, vin: {vin_n: {spent, vout}}}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VinTxidDoc {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub vin: BTreeMap<String, VinTxidEntry>,
}
pub type VinTxidRecord = BTreeMap<String, VinTxidDoc>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VinTxidEntry {
    #[serde(default)]
    pub spent: String,
    #[serde(default)]
    pub vout: u32,
}

/// `vin_spent` table: `{spent_txid: {vout_n: {timestamp, height, txid, vin_n}}}`
pub type VinSpentDoc = BTreeMap<String, VinSpentEntry>;
pub type VinSpentRecord = BTreeMap<String, VinSpentDoc>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VinSpentEntry {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub txid: String,
    #[serde(default)]
    pub vin_n: u32,
}

/// `coinbase` table: `{txid: {value, coinbase, vin_n, timestamp, height}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CoinbaseDoc {
    #[serde(default)]
    pub value: Satoshi,
    #[serde(default)]
    pub coinbase: String,
    #[serde(default)]
    pub vin_n: u32,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub height: i64,
}
pub type CoinbaseRecord = BTreeMap<String, CoinbaseDoc>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AddressEntry {
    #[serde(default)]
    pub value: Satoshi,
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub timestamp: i64,
}

/// `address` table: `{address: {txid: {n: entry}}}` or `{address: {skip: true}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AddressBody {
    Skip { skip: bool },
    Txids(BTreeMap<String, BTreeMap<String, AddressEntry>>),
}

impl AddressBody {
    pub fn is_skip(&self) -> bool {
        matches!(self, AddressBody::Skip { skip: true })
    }

    pub fn txid_count(&self) -> usize {
        match self {
            AddressBody::Skip { .. } => 0,
            AddressBody::Txids(m) => m.len(),
        }
    }
}

pub type AddressRecord = BTreeMap<String, AddressBody>;
