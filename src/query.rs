//! Query Engine: answers address/transaction/block lookups by joining
//! across the six tables, the same joins `addressapi.py`'s Flask routes
//! performed in Python (`tx_vout_json[txid]['addresses']`, `tx_vin_spent_json[txid]`,
//! `coinbase_json[txid]`). Every lookup goes through the `CacheManager`
//! first, since these documents are immutable once written (outside of
//! an orphan unwind, which invalidates explicitly).

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheManager;
use crate::error::{IndexerError, Result};
use crate::model::{AddressBody, AddressEntry, BlockDoc, CoinbaseDoc, Satoshi, VinSpentDoc, VinTxidDoc, VoutDoc};
use crate::node_client::NodeClient;
use crate::store::{Store, Table};

const ADDRESS_TTL: Duration = Duration::from_secs(30);
const TX_TTL: Duration = Duration::from_secs(300);
const BLOCK_TTL: Duration = Duration::from_secs(300);

/// Satoshi amount, or the literal string `"not calculated"` when the
/// address guardrail was tripped and no join was attempted.
#[derive(Debug, Clone, PartialEq)]
pub enum Balance {
    Amount(Satoshi),
    NotCalculated,
}

impl Serialize for Balance {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Balance::Amount(v) => serializer.serialize_i64(*v),
            Balance::NotCalculated => serializer.serialize_str("not calculated"),
        }
    }
}

impl<'de> Deserialize<'de> for Balance {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Balance::Amount)
                .ok_or_else(|| serde::de::Error::custom("balance out of i64 range")),
            serde_json::Value::String(s) if s == "not calculated" => Ok(Balance::NotCalculated),
            other => Err(serde::de::Error::custom(format!("unexpected balance shape: {other}"))),
        }
    }
}

/// One side of a transaction's value flow. `address` is `None` only for
/// the synthetic coinbase entry on a from-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressFromEntry {
    pub address: Option<String>,
    pub value: Satoshi,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coinbase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressToEntry {
    pub address: String,
    pub n: String,
    pub value: Satoshi,
    pub is_spent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressTxRecord {
    pub txid: String,
    pub block: i64,
    pub confirmations: i64,
    pub timestamp: i64,
    pub received: bool,
    pub value_in: Satoshi,
    pub sent: bool,
    pub value_out: Satoshi,
    pub from_count: usize,
    pub to_count: usize,
    pub fee: Satoshi,
    pub from: Vec<AddressFromEntry>,
    pub to: Vec<AddressToEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressDetail {
    pub address: String,
    pub balance: Balance,
    pub total_received: Balance,
    pub total_sent: Balance,
    pub tx_count: usize,
    pub transactions: Vec<AddressTxRecord>,
    /// Count of invariant violations observed while answering this
    /// request (currently: a negative computed balance). Non-fatal.
    pub errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnspentEntry {
    pub txid: String,
    pub n: String,
    pub value: Satoshi,
    pub height: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnspentSummary {
    pub address: String,
    pub balance: Balance,
    pub unspent: Vec<UnspentEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxDetail {
    pub txid: String,
    pub height: Option<i64>,
    pub timestamp: Option<i64>,
    pub vout: Option<VoutDoc>,
    pub vin: Option<VinTxidDoc>,
    pub coinbase: Option<CoinbaseDoc>,
}

/// The result of resolving `address[a]`, short of actually joining its
/// transactions: either the address's txid map, or a signal that the
/// join was skipped (absent address is a separate, 404 case handled
/// before this type is produced).
enum AddressLookup {
    Txids(BTreeMap<String, BTreeMap<String, AddressEntry>>),
    NotCalculated,
}

pub struct QueryEngine<'a> {
    store: &'a Store,
    cache: &'a CacheManager,
    client: &'a NodeClient,
    address_tx_guardrail: usize,
}

impl<'a> QueryEngine<'a> {
    pub fn new(store: &'a Store, cache: &'a CacheManager, client: &'a NodeClient, address_tx_guardrail: usize) -> Self {
        Self { store, cache, client, address_tx_guardrail }
    }

    pub async fn get_block(&self, hash: &str) -> Result<BlockDoc> {
        let key = format!("block:{hash}");
        if let Some(doc) = self.cache.get_json::<BlockDoc>(&key).await {
            return Ok(doc);
        }
        let doc: BlockDoc = self
            .store
            .select(Table::Block, hash)?
            .ok_or_else(|| IndexerError::NotFound(format!("unknown block: {hash}")))?;
        self.cache.set_json(&key, &doc, BLOCK_TTL).await;
        Ok(doc)
    }

    pub async fn get_tx(&self, txid: &str) -> Result<TxDetail> {
        let key = format!("tx:{txid}");
        if let Some(detail) = self.cache.get_json::<TxDetail>(&key).await {
            return Ok(detail);
        }

        let vout: Option<VoutDoc> = self.store.select(Table::Vout, txid)?;
        let vin: Option<VinTxidDoc> = self.store.select(Table::VinTxid, txid)?;
        let coinbase: Option<CoinbaseDoc> = self.store.select(Table::Coinbase, txid)?;

        if vout.is_none() {
            return Err(IndexerError::NotFound(format!("unknown transaction: {txid}")));
        }

        let height = vout.as_ref().map(|d| d.height);
        let timestamp = vout.as_ref().map(|d| d.timestamp);

        let detail = TxDetail { txid: txid.to_string(), height, timestamp, vout, vin, coinbase };
        self.cache.set_json(&key, &detail, TX_TTL).await;
        Ok(detail)
    }

    /// Calls the node's `validateaddress` RPC and rejects an address
    /// the node doesn't recognize as well-formed before any store lookup.
    fn validate_address(&self, address: &str) -> Result<()> {
        let result = self.client.validate_address(address)?;
        if !result.isvalid {
            return Err(IndexerError::InvalidArgument(format!("address {address} is invalid")));
        }
        Ok(())
    }

    /// Joins every transaction in which this address appears, on either
    /// side, against `vout`/`vin_txid`/`vin_spent`/`coinbase` to produce
    /// one record per transaction with confirmations, fee, and the full
    /// from/to breakdown. Addresses over `address_tx_guardrail`
    /// transactions (or already marked `skip`) skip the join entirely and
    /// report `balance: "not calculated"`, mirroring the reference Flask
    /// route's 15,000-txid guardrail.
    pub async fn get_address(&self, address: &str) -> Result<AddressDetail> {
        self.validate_address(address)?;

        let key = format!("address:{address}");
        if let Some(cached) = self.cache.get_json::<AddressDetail>(&key).await {
            return Ok(cached);
        }

        let detail = match self.load_address_txids(address)? {
            AddressLookup::NotCalculated => AddressDetail {
                address: address.to_string(),
                balance: Balance::NotCalculated,
                total_received: Balance::NotCalculated,
                total_sent: Balance::NotCalculated,
                tx_count: 0,
                transactions: Vec::new(),
                errors: 1,
            },
            AddressLookup::Txids(txids) => {
                let blockcount = self.client.get_block_count()?;
                let mut by_height: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
                for (txid, _) in &txids {
                    if let Some(vout_doc): Option<VoutDoc> = self.store.select(Table::Vout, txid)? {
                        by_height.entry(vout_doc.height).or_default().insert(txid.clone());
                    }
                    if let Some(vin_spent_doc): Option<VinSpentDoc> = self.store.select(Table::VinSpent, txid)? {
                        for entry in vin_spent_doc.values() {
                            by_height.entry(entry.height).or_default().insert(entry.txid.clone());
                        }
                    }
                }

                let mut transactions = Vec::new();
                let mut received_total: Satoshi = 0;
                let mut sent_total: Satoshi = 0;

                for txid_set in by_height.values().rev() {
                    for txid in txid_set {
                        if let Some(record) = self.build_address_tx_record(address, txid, blockcount)? {
                            received_total += record.value_in;
                            sent_total += record.value_out;
                            transactions.push(record);
                        }
                    }
                }

                let balance = received_total - sent_total;
                let errors = if balance < 0 { 1 } else { 0 };

                AddressDetail {
                    address: address.to_string(),
                    balance: Balance::Amount(balance),
                    total_received: Balance::Amount(received_total),
                    total_sent: Balance::Amount(sent_total),
                    tx_count: txids.len(),
                    transactions,
                    errors,
                }
            }
        };

        self.cache.set_json(&key, &detail, ADDRESS_TTL).await;
        Ok(detail)
    }

    /// Builds one transaction record for the address-detail join: the
    /// full `to` list from `vout[txid]`, the full `from` list resolved by
    /// following each `vin_txid[txid]` entry back to the output it spent
    /// (or a synthetic coinbase entry if the transaction has no vins).
    fn build_address_tx_record(&self, address: &str, txid: &str, blockcount: i64) -> Result<Option<AddressTxRecord>> {
        let Some(vout_doc): Option<VoutDoc> = self.store.select(Table::Vout, txid)? else {
            return Ok(None);
        };
        let vin_spent_doc: Option<VinSpentDoc> = self.store.select(Table::VinSpent, txid)?;

        let mut to = Vec::new();
        let mut to_count = 0usize;
        let mut value_in: Satoshi = 0;
        let mut vout_sum: Satoshi = 0;
        for (to_address, outputs) in &vout_doc.addresses {
            for (n, entry) in outputs {
                to_count += 1;
                vout_sum += entry.value;
                let is_spent = vin_spent_doc.as_ref().map(|d| d.contains_key(n)).unwrap_or(false);
                if to_address == address {
                    value_in += entry.value;
                }
                to.push(AddressToEntry {
                    address: to_address.clone(),
                    n: n.clone(),
                    value: entry.value,
                    is_spent,
                });
            }
        }

        let vin_txid_doc: Option<VinTxidDoc> = self.store.select(Table::VinTxid, txid)?;
        let (from, fee, value_out) = match vin_txid_doc {
            Some(vin_doc) => {
                let mut from = Vec::new();
                let mut vin_sum: Satoshi = 0;
                let mut value_out: Satoshi = 0;
                for entry in vin_doc.vin.values() {
                    let Some(spent_vout): Option<VoutDoc> = self.store.select(Table::Vout, &entry.spent)? else {
                        continue;
                    };
                    let spent_n = entry.vout.to_string();
                    for (from_address, outputs) in &spent_vout.addresses {
                        if let Some(spent_entry) = outputs.get(&spent_n) {
                            vin_sum += spent_entry.value;
                            if from_address == address {
                                value_out += spent_entry.value;
                            }
                            from.push(AddressFromEntry {
                                address: Some(from_address.clone()),
                                value: spent_entry.value,
                                coinbase: None,
                            });
                        }
                    }
                }
                (from, vin_sum - vout_sum, value_out)
            }
            None => {
                let coinbase: Option<CoinbaseDoc> = self.store.select(Table::Coinbase, txid)?;
                let entry = AddressFromEntry {
                    address: None,
                    value: coinbase.as_ref().map(|c| c.value).unwrap_or(0),
                    coinbase: coinbase.as_ref().map(|c| c.coinbase.clone()),
                };
                (vec![entry], 0, 0)
            }
        };

        Ok(Some(AddressTxRecord {
            txid: txid.to_string(),
            block: vout_doc.height,
            confirmations: blockcount - vout_doc.height,
            timestamp: vout_doc.timestamp,
            received: value_in > 0,
            value_in,
            sent: value_out > 0,
            value_out,
            from_count: from.len(),
            to_count,
            fee,
            from,
            to,
        }))
    }

    pub async fn get_unspent(&self, address: &str) -> Result<UnspentSummary> {
        self.validate_address(address)?;

        let key = format!("unspent:{address}");
        if let Some(cached) = self.cache.get_json::<UnspentSummary>(&key).await {
            return Ok(cached);
        }

        let summary = match self.load_address_txids(address)? {
            AddressLookup::NotCalculated => UnspentSummary {
                address: address.to_string(),
                balance: Balance::NotCalculated,
                unspent: Vec::new(),
            },
            AddressLookup::Txids(txids) => {
                let mut unspent = Vec::new();
                let mut balance: Satoshi = 0;

                for (txid, outputs) in &txids {
                    let vin_spent_doc: Option<VinSpentDoc> = self.store.select(Table::VinSpent, txid)?;
                    for (n, entry) in outputs {
                        let already_spent = vin_spent_doc.as_ref().map(|d| d.contains_key(n)).unwrap_or(false);
                        if already_spent {
                            continue;
                        }
                        balance += entry.value;
                        unspent.push(UnspentEntry {
                            txid: txid.clone(),
                            n: n.clone(),
                            value: entry.value,
                            height: entry.height,
                            timestamp: entry.timestamp,
                        });
                    }
                }

                UnspentSummary { address: address.to_string(), balance: Balance::Amount(balance), unspent }
            }
        };

        self.cache.set_json(&key, &summary, ADDRESS_TTL).await;
        Ok(summary)
    }

    /// 404 if the address has never been indexed; otherwise its txid map,
    /// or a not-calculated signal for a `{skip: true}` document or one
    /// over `address_tx_guardrail` transactions.
    fn load_address_txids(&self, address: &str) -> Result<AddressLookup> {
        let body: AddressBody = self
            .store
            .select(Table::Address, address)?
            .ok_or_else(|| IndexerError::NotFound(format!("unknown address: {address}")))?;

        if body.is_skip() {
            return Ok(AddressLookup::NotCalculated);
        }
        let AddressBody::Txids(txids) = body else {
            unreachable!("checked is_skip above")
        };
        if txids.len() > self.address_tx_guardrail {
            return Ok(AddressLookup::NotCalculated);
        }
        Ok(AddressLookup::Txids(txids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AddressEntry, VinSpentEntry, VinTxidEntry, VoutEntry};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Store, NodeClient) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        // No node is reachable in these tests; validate_address/get_block_count
        // are only exercised by tests that don't go through the public
        // QueryEngine entry points that call them.
        let client = NodeClient::new("127.0.0.1:0");
        (dir, store, client)
    }

    #[test]
    fn skip_address_reports_not_calculated_without_node_call() {
        let (_dir, store, client) = setup();
        let cache = CacheManager::new();
        store.insert(Table::Address, "whale", &AddressBody::Skip { skip: true }).unwrap();

        let engine = QueryEngine::new(&store, &cache, &client, 15_000);
        match engine.load_address_txids("whale").unwrap() {
            AddressLookup::NotCalculated => {}
            AddressLookup::Txids(_) => panic!("expected not-calculated for a skip document"),
        }
    }

    #[test]
    fn guardrail_exceeded_reports_not_calculated() {
        let (_dir, store, client) = setup();
        let cache = CacheManager::new();
        let mut txids = BTreeMap::new();
        for i in 0..3 {
            txids.insert(
                format!("txid{i}"),
                BTreeMap::from([("0".to_string(), AddressEntry { value: 1, height: 1, timestamp: 1 })]),
            );
        }
        store.insert(Table::Address, "busy", &AddressBody::Txids(txids)).unwrap();

        let engine = QueryEngine::new(&store, &cache, &client, 2);
        match engine.load_address_txids("busy").unwrap() {
            AddressLookup::NotCalculated => {}
            AddressLookup::Txids(_) => panic!("expected not-calculated over the guardrail"),
        }
    }

    #[test]
    fn unknown_address_is_not_found() {
        let (_dir, store, client) = setup();
        let cache = CacheManager::new();
        let engine = QueryEngine::new(&store, &cache, &client, 15_000);
        assert!(matches!(engine.load_address_txids("ghost"), Err(IndexerError::NotFound(_))));
    }

    #[tokio::test]
    async fn tx_lookup_joins_vout_and_vin() {
        let (_dir, store, client) = setup();
        let cache = CacheManager::new();

        store
            .insert(
                Table::Vout,
                "txid1",
                &VoutDoc {
                    height: 10,
                    block_hash: "h1".into(),
                    timestamp: 1000,
                    vin_count: 1,
                    vout_count: 1,
                    addresses: BTreeMap::from([(
                        "addrA".to_string(),
                        BTreeMap::from([("0".to_string(), VoutEntry { value: 500, timestamp: 1000 })]),
                    )]),
                },
            )
            .unwrap();

        let engine = QueryEngine::new(&store, &cache, &client, 15_000);
        let detail = engine.get_tx("txid1").await.unwrap();
        assert_eq!(detail.height, Some(10));
        assert!(detail.vout.is_some());
        assert!(detail.vin.is_none());
    }

    #[test]
    fn address_tx_record_resolves_sender_via_vin_txid() {
        let (_dir, store, client) = setup();
        let cache = CacheManager::new();

        // txid1: addrA receives 500 at height 10 (its funding tx).
        store
            .insert(
                Table::Vout,
                "txid1",
                &VoutDoc {
                    height: 10,
                    block_hash: "h1".into(),
                    timestamp: 1000,
                    vin_count: 0,
                    vout_count: 1,
                    addresses: BTreeMap::from([(
                        "addrA".to_string(),
                        BTreeMap::from([("0".to_string(), VoutEntry { value: 500, timestamp: 1000 })]),
                    )]),
                },
            )
            .unwrap();

        // txid2: addrA spends that output, sending 480 to addrB (fee 20).
        store
            .insert(
                Table::Vout,
                "txid2",
                &VoutDoc {
                    height: 11,
                    block_hash: "h2".into(),
                    timestamp: 1001,
                    vin_count: 1,
                    vout_count: 1,
                    addresses: BTreeMap::from([(
                        "addrB".to_string(),
                        BTreeMap::from([("0".to_string(), VoutEntry { value: 480, timestamp: 1001 })]),
                    )]),
                },
            )
            .unwrap();
        store
            .insert(
                Table::VinTxid,
                "txid2",
                &VinTxidDoc {
                    timestamp: 1001,
                    height: 11,
                    vin: BTreeMap::from([("0".to_string(), VinTxidEntry { spent: "txid1".into(), vout: 0 })]),
                },
            )
            .unwrap();
        store
            .insert(
                Table::VinSpent,
                "txid1",
                &VinSpentDoc::from([("0".to_string(), VinSpentEntry { timestamp: 1001, height: 11, txid: "txid2".into(), vin_n: 0 })]),
            )
            .unwrap();

        let engine = QueryEngine::new(&store, &cache, &client, 15_000);
        let record = engine.build_address_tx_record("addrA", "txid2", 111).unwrap().unwrap();
        assert_eq!(record.fee, 20);
        assert_eq!(record.value_out, 480);
        assert!(record.sent);
        assert!(!record.received);
        assert_eq!(record.confirmations, 100);

        let funding = engine.build_address_tx_record("addrA", "txid1", 111).unwrap().unwrap();
        assert_eq!(funding.value_in, 500);
        assert!(funding.received);
        assert_eq!(funding.from.len(), 1);
        assert_eq!(funding.from[0].address, None);
        assert_eq!(funding.fee, 0);
    }
}
