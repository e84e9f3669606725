//! Orphan Unwinder: detects that the last block this indexer processed
//! has fallen off the canonical chain and cascades its removal through
//! every table that references it, walking further back while the node
//! keeps reporting negative confirmations.
//!
//! Every delete is keyed off documents this indexer itself wrote, so a
//! block that was never indexed (or already unwound) is silently a
//! no-op — unwinding is idempotent by construction.

use crate::atomic_writer::AtomicBatchWriter;
use crate::cache::CacheManager;
use crate::error::{IndexerError, Result};
use crate::model::{AddressBody, BlockDoc, VinTxidDoc, VoutDoc};
use crate::node_client::NodeClient;
use crate::notify::{NotifyEvent, Notifier};
use crate::store::{Store, Table};

#[derive(Debug, Clone, Default)]
pub struct UnwindSummary {
    pub orphaned_blocks: Vec<String>,
}

/// Walk backward from `tip_hash` while the node reports it as orphaned
/// (`confirmations < 0`), undoing each block in turn. Stops as soon as
/// an ancestor comes back confirmed, or the node no longer has the block
/// at all (already pruned past our reorg depth).
pub async fn unwind_orphans(
    store: &Store,
    client: &NodeClient,
    cache: Option<&CacheManager>,
    notifier: Option<&Notifier>,
    coin_type: &str,
    symbol: &str,
    tip_hash: &str,
) -> Result<UnwindSummary> {
    let mut summary = UnwindSummary::default();
    let mut current = tip_hash.to_string();

    loop {
        let Some(remote_block) = client.get_block(&current)? else {
            break;
        };
        if remote_block.confirmations >= 0 {
            break;
        }

        tracing::warn!(hash = %current, "orphaned block detected, unwinding");
        unwind_one_block(store, cache, &current).await?;
        summary.orphaned_blocks.push(current.clone());

        if let Some(notifier) = notifier {
            notifier.notify(&NotifyEvent {
                event: "orphan block",
                coin_type: coin_type.to_string(),
                symbol: symbol.to_string(),
                height: remote_block.height,
                hash: current.clone(),
                timestamp: remote_block.time,
                addresses: Vec::new(),
            });
        }

        match remote_block.previousblockhash {
            Some(prev) => current = prev,
            None => break,
        }
    }

    Ok(summary)
}

async fn unwind_one_block(store: &Store, cache: Option<&CacheManager>, block_hash: &str) -> Result<()> {
    let Some(block_doc): Option<BlockDoc> = store.select(Table::Block, block_hash)? else {
        return Ok(());
    };

    let mut writer = AtomicBatchWriter::new(store.handle(), 10_000);

    for txid in block_doc.tx.keys() {
        if let Some(vout_doc): Option<VoutDoc> = store.select(Table::Vout, txid)? {
            for address in vout_doc.addresses.keys() {
                unwind_address_txid(store, &mut writer, address, txid)?;
                if let Some(cache) = cache {
                    cache.invalidate(&format!("address:{address}")).await;
                }
            }
            writer.delete(Table::Vout.cf_name(), txid.as_bytes().to_vec());
        }

        if let Some(vin_txid_doc): Option<VinTxidDoc> = store.select(Table::VinTxid, txid)? {
            for entry in vin_txid_doc.vin.values() {
                unwind_vin_spent_entry(&mut writer, &entry.spent);
                if let Some(cache) = cache {
                    cache.invalidate(&format!("vin_spent:{}", entry.spent)).await;
                }
            }
            writer.delete(Table::VinTxid.cf_name(), txid.as_bytes().to_vec());
        }

        if store.contains(Table::Coinbase, txid)? {
            writer.delete(Table::Coinbase.cf_name(), txid.as_bytes().to_vec());
        }

        if let Some(cache) = cache {
            cache.invalidate(&format!("vout:{txid}")).await;
            cache.invalidate(&format!("vin_txid:{txid}")).await;
            cache.invalidate(&format!("coinbase:{txid}")).await;
            cache.invalidate(&format!("tx:{txid}")).await;
        }
    }

    writer.delete(Table::Block.cf_name(), block_hash.as_bytes().to_vec());
    writer
        .flush()
        .await
        .map_err(|e| IndexerError::Store(e.to_string()))?;

    if let Some(cache) = cache {
        cache.invalidate(&format!("block:{block_hash}")).await;
    }
    Ok(())
}

fn unwind_address_txid(store: &Store, writer: &mut AtomicBatchWriter, address: &str, txid: &str) -> Result<()> {
    let Some(mut body): Option<AddressBody> = store.select(Table::Address, address)? else {
        return Ok(());
    };
    // A `Skip` document stands regardless of any single transaction's
    // removal: the address is still over the cap.
    if let AddressBody::Txids(map) = &mut body {
        map.remove(txid);
        if map.is_empty() {
            writer.delete(Table::Address.cf_name(), address.as_bytes().to_vec());
        } else {
            let bytes = serde_json::to_vec(&body)?;
            writer.put(Table::Address.cf_name(), address.as_bytes().to_vec(), bytes);
        }
    }
    Ok(())
}

/// Deletes `vin_spent[spent_txid]` entirely rather than picking out one
/// vout index — coarse but safe, since the non-orphan chain rewrites it
/// from scratch as it re-extracts past this height.
fn unwind_vin_spent_entry(writer: &mut AtomicBatchWriter, spent_txid: &str) {
    writer.delete(Table::VinSpent.cf_name(), spent_txid.as_bytes().to_vec());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockTxSummary, VinSpentDoc, VoutEntry};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn unwind_is_a_noop_for_unknown_block() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(unwind_one_block(&store, None, "never-indexed")).unwrap();
    }

    #[test]
    fn unwind_removes_block_vout_and_address_entries() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut tx = BTreeMap::new();
        tx.insert("txid1".to_string(), BlockTxSummary { vin_count: 0, vout_count: 1 });
        store
            .insert(Table::Block, "orphan_hash", &BlockDoc { height: 100, timestamp: 1000, tx })
            .unwrap();

        let mut addresses = BTreeMap::new();
        addresses.insert(
            "addrA".to_string(),
            BTreeMap::from([("0".to_string(), VoutEntry { value: 100, timestamp: 1000 })]),
        );
        store
            .insert(
                Table::Vout,
                "txid1",
                &VoutDoc { height: 100, block_hash: "orphan_hash".into(), timestamp: 1000, vin_count: 0, vout_count: 1, addresses },
            )
            .unwrap();

        let mut txids = BTreeMap::new();
        txids.insert(
            "txid1".to_string(),
            BTreeMap::from([("0".to_string(), crate::model::AddressEntry { value: 100, height: 100, timestamp: 1000 })]),
        );
        store
            .insert(Table::Address, "addrA", &AddressBody::Txids(txids))
            .unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(unwind_one_block(&store, None, "orphan_hash")).unwrap();

        assert!(!store.contains(Table::Block, "orphan_hash").unwrap());
        assert!(!store.contains(Table::Vout, "txid1").unwrap());
        // The address's only txid was removed, so the whole document is
        // cascade-deleted rather than left behind as an empty map.
        assert!(!store.contains(Table::Address, "addrA").unwrap());
    }

    #[test]
    fn unwind_deletes_vin_spent_document_entirely() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut tx = BTreeMap::new();
        tx.insert("txid2".to_string(), BlockTxSummary { vin_count: 1, vout_count: 0 });
        store
            .insert(Table::Block, "orphan_hash2", &BlockDoc { height: 101, timestamp: 1001, tx })
            .unwrap();

        let mut vin = BTreeMap::new();
        vin.insert("0".to_string(), crate::model::VinTxidEntry { spent: "txid1".to_string(), vout: 0 });
        store
            .insert(Table::VinTxid, "txid2", &VinTxidDoc { timestamp: 1001, height: 101, vin })
            .unwrap();

        // `vin_spent[txid1]` has entries for more than the one vout this
        // block spent; the whole document still gets deleted (coarse but
        // safe) rather than picking out a single vout index.
        store
            .insert(
                Table::VinSpent,
                "txid1",
                &VinSpentDoc::from([(
                    "0".to_string(),
                    crate::model::VinSpentEntry { timestamp: 1001, height: 101, txid: "txid2".into(), vin_n: 0 },
                )]),
            )
            .unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(unwind_one_block(&store, None, "orphan_hash2")).unwrap();

        assert!(!store.contains(Table::VinSpent, "txid1").unwrap());
        assert!(!store.contains(Table::VinTxid, "txid2").unwrap());
    }
}
