//! Groupers: read a sorted staging file, fold consecutive rows sharing a
//! key into one JSON document per table, and land the result either via
//! a bulk TSV load (first sync, table truncated first) or a per-key
//! select-merge-update (incremental sync, existing documents preserved).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::Value;

use crate::error::{IndexerError, Result};
use crate::model::{
    AddressBody, AddressEntry, BlockDoc, BlockTxSummary, CoinbaseDoc, VinSpentDoc, VinSpentEntry,
    VinTxidDoc, VinTxidEntry, VoutDoc, VoutEntry,
};
use crate::satoshi::decimal_to_satoshi;
use crate::staging::StagingReader;
use crate::store::{escape_tsv, Store, Table};

#[derive(Debug, Clone, Default)]
pub struct GroupSummary {
    pub table_name: &'static str,
    pub rows_read: u64,
    pub keys_written: u64,
    pub skipped: u64,
}

/// Consumes a sorted staging file one key-group at a time: since the
/// External Sorter orders rows by their first tab-delimited field, every
/// row for a given key is contiguous.
struct GroupedRows {
    reader: std::iter::Peekable<StagingReader>,
}

impl GroupedRows {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: StagingReader::open(path)?.peekable(),
        })
    }
}

impl Iterator for GroupedRows {
    type Item = Result<(String, Vec<Vec<String>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.reader.next()? {
            Ok(row) => row,
            Err(e) => return Some(Err(e)),
        };
        let key = first.first().cloned().unwrap_or_default();
        let mut rows = vec![first];
        loop {
            match self.reader.peek() {
                Some(Ok(row)) if row.first().map(String::as_str) == Some(key.as_str()) => {
                    rows.push(self.reader.next().unwrap().unwrap());
                }
                _ => break,
            }
        }
        Some(Ok((key, rows)))
    }
}

type BuildDoc<'a> = dyn Fn(&str, Option<Value>, &[Vec<String>]) -> Result<Option<Value>> + 'a;

/// Drives one table's group pass. `build_doc` receives the key, the
/// existing stored document (`None` in bulk mode, since the table was
/// just truncated), and every row sharing that key; it returns the new
/// document to store, or `None` to skip the key entirely.
fn run_group(
    store: &Store,
    table: Table,
    sorted_path: &Path,
    working_dir: &Path,
    bulk: bool,
    build_doc: &BuildDoc,
) -> Result<GroupSummary> {
    let mut summary = GroupSummary {
        table_name: table.cf_name(),
        ..Default::default()
    };

    if bulk {
        store.truncate(table)?;
        let tsv_path = working_dir.join(format!("{}_bulk.tsv", table.cf_name()));
        let mut tsv = BufWriter::new(File::create(&tsv_path)?);
        for group in GroupedRows::open(sorted_path)? {
            let (key, rows) = group?;
            summary.rows_read += rows.len() as u64;
            match build_doc(&key, None, &rows)? {
                Some(doc) => {
                    let json = serde_json::to_string(&doc)?;
                    writeln!(tsv, "{}\t{}", key, escape_tsv(&json))?;
                    summary.keys_written += 1;
                }
                None => summary.skipped += 1,
            }
        }
        tsv.flush()?;
        drop(tsv);
        store.bulk_load(table, &tsv_path)?;
        std::fs::remove_file(&tsv_path).ok();
    } else {
        for group in GroupedRows::open(sorted_path)? {
            let (key, rows) = group?;
            summary.rows_read += rows.len() as u64;
            let existing: Option<Value> = store.select(table, &key)?;
            match build_doc(&key, existing, &rows)? {
                Some(doc) => {
                    store.update(table, &key, &doc)?;
                    summary.keys_written += 1;
                }
                None => summary.skipped += 1,
            }
        }
    }
    Ok(summary)
}

fn field<'a>(row: &'a [String], i: usize, table: &str) -> Result<&'a str> {
    row.get(i)
        .map(String::as_str)
        .ok_or_else(|| IndexerError::InvalidData(format!("{table}: missing field {i}")))
}

fn parse_i64(row: &[String], i: usize, table: &str) -> Result<i64> {
    field(row, i, table)?
        .parse()
        .map_err(|e| IndexerError::InvalidData(format!("{table}: bad i64 at field {i}: {e}")))
}

fn parse_u32(row: &[String], i: usize, table: &str) -> Result<u32> {
    field(row, i, table)?
        .parse()
        .map_err(|e| IndexerError::InvalidData(format!("{table}: bad u32 at field {i}: {e}")))
}

/// row: `[block_hash(key), txid, height, timestamp, vin_count, vout_count]`
pub fn group_block(store: &Store, sorted_path: &Path, working_dir: &Path, bulk: bool) -> Result<GroupSummary> {
    run_group(store, Table::Block, sorted_path, working_dir, bulk, &|_key, existing, rows| {
        let mut doc: BlockDoc = match existing {
            Some(v) => serde_json::from_value(v)?,
            None => BlockDoc::default(),
        };
        for row in rows {
            let txid = field(row, 1, "block")?;
            doc.height = parse_i64(row, 2, "block")?;
            doc.timestamp = parse_i64(row, 3, "block")?;
            let vin_count = parse_u32(row, 4, "block")?;
            let vout_count = parse_u32(row, 5, "block")?;
            doc.tx.insert(txid.to_string(), BlockTxSummary { vin_count, vout_count });
        }
        Ok(Some(serde_json::to_value(&doc)?))
    })
}

/// row: `[txid(key), n, address, value, height, block_hash, timestamp, vin_count, vout_count]`
pub fn group_vout(store: &Store, sorted_path: &Path, working_dir: &Path, bulk: bool) -> Result<GroupSummary> {
    run_group(store, Table::Vout, sorted_path, working_dir, bulk, &|_key, existing, rows| {
        let mut doc: VoutDoc = match existing {
            Some(v) => serde_json::from_value(v)?,
            None => VoutDoc::default(),
        };
        for row in rows {
            let n = field(row, 1, "vout")?;
            let address = field(row, 2, "vout")?;
            let value = decimal_to_satoshi(field(row, 3, "vout")?)?;
            doc.height = parse_i64(row, 4, "vout")?;
            doc.block_hash = field(row, 5, "vout")?.to_string();
            doc.timestamp = parse_i64(row, 6, "vout")?;
            doc.vin_count = parse_u32(row, 7, "vout")?;
            doc.vout_count = parse_u32(row, 8, "vout")?;
            doc.addresses
                .entry(address.to_string())
                .or_default()
                .insert(n.to_string(), VoutEntry { value, timestamp: doc.timestamp });
        }
        Ok(Some(serde_json::to_value(&doc)?))
    })
}

/// row: `[txid(key), vin_n, spent_txid, spent_vout, timestamp, height]`
pub fn group_vin_txid(store: &Store, sorted_path: &Path, working_dir: &Path, bulk: bool) -> Result<GroupSummary> {
    run_group(store, Table::VinTxid, sorted_path, working_dir, bulk, &|_key, existing, rows| {
        let mut doc: VinTxidDoc = match existing {
            Some(v) => serde_json::from_value(v)?,
            None => VinTxidDoc::default(),
        };
        for row in rows {
            let vin_n = field(row, 1, "vin_txid")?;
            let spent_txid = field(row, 2, "vin_txid")?;
            let spent_vout = parse_u32(row, 3, "vin_txid")?;
            doc.timestamp = parse_i64(row, 4, "vin_txid")?;
            doc.height = parse_i64(row, 5, "vin_txid")?;
            doc.vin.insert(
                vin_n.to_string(),
                VinTxidEntry { spent: spent_txid.to_string(), vout: spent_vout },
            );
        }
        Ok(Some(serde_json::to_value(&doc)?))
    })
}

/// row: `[spent_txid(key), spent_vout, txid, vin_n, timestamp, height]`
pub fn group_vin_spent(store: &Store, sorted_path: &Path, working_dir: &Path, bulk: bool) -> Result<GroupSummary> {
    run_group(store, Table::VinSpent, sorted_path, working_dir, bulk, &|key, existing, rows| {
        let mut doc: VinSpentDoc = match existing {
            Some(v) => serde_json::from_value(v)?,
            None => VinSpentDoc::default(),
        };
        for row in rows {
            let spent_vout = field(row, 1, "vin_spent")?.to_string();
            let txid = field(row, 2, "vin_spent")?.to_string();
            let vin_n = parse_u32(row, 3, "vin_spent")?;
            let timestamp = parse_i64(row, 4, "vin_spent")?;
            let height = parse_i64(row, 5, "vin_spent")?;

            if let Some(prior) = doc.get(&spent_vout) {
                if prior.txid != txid {
                    tracing::warn!(
                        spent_txid = key,
                        spent_vout = %spent_vout,
                        prior_spender = %prior.txid,
                        new_spender = %txid,
                        "vin_spent conflict, keeping most recently processed spender"
                    );
                }
            }
            doc.insert(spent_vout, VinSpentEntry { timestamp, height, txid, vin_n });
        }
        Ok(Some(serde_json::to_value(&doc)?))
    })
}

/// row: `[txid(key), coinbase_hex, vin_n, timestamp, height]`. Joined
/// against the already-grouped `vout` table to compute the block reward,
/// so this grouper must run after `group_vout`. A missing `vout` document
/// means the chain walk produced inconsistent data; log and skip rather
/// than storing a document with a fabricated value.
pub fn group_coinbase(store: &Store, sorted_path: &Path, working_dir: &Path, bulk: bool) -> Result<GroupSummary> {
    run_group(store, Table::Coinbase, sorted_path, working_dir, bulk, &|key, _existing, rows| {
        let row = rows.last().expect("grouped rows are never empty");
        let coinbase_hex = field(row, 1, "coinbase")?.to_string();
        let vin_n = parse_u32(row, 2, "coinbase")?;
        let timestamp = parse_i64(row, 3, "coinbase")?;
        let height = parse_i64(row, 4, "coinbase")?;

        let vout_doc: Option<VoutDoc> = store.select(Table::Vout, key)?;
        let Some(vout_doc) = vout_doc else {
            tracing::warn!(txid = key, "coinbase has no matching vout document, skipping (INVALID_DATA)");
            return Ok(None);
        };
        let value = vout_doc
            .addresses
            .values()
            .flat_map(|entries| entries.values())
            .map(|e| e.value)
            .sum();

        let doc = CoinbaseDoc { value, coinbase: coinbase_hex, vin_n, timestamp, height };
        Ok(Some(serde_json::to_value(&doc)?))
    })
}

/// row: `[address(key), txid, n, value, height, timestamp]`. Once an
/// address accumulates more than `skip_cap` distinct transactions its
/// document is replaced entirely with `{skip: true}` and never grows
/// again — query handlers surface that as a 422, not a 500.
pub fn group_address(
    store: &Store,
    sorted_path: &Path,
    working_dir: &Path,
    bulk: bool,
    skip_cap: usize,
) -> Result<GroupSummary> {
    run_group(store, Table::Address, sorted_path, working_dir, bulk, &|key, existing, rows| {
        let mut body: AddressBody = match existing {
            Some(v) => serde_json::from_value(v)?,
            None => AddressBody::Txids(BTreeMap::new()),
        };
        if body.is_skip() {
            return Ok(Some(serde_json::to_value(&body)?));
        }
        let AddressBody::Txids(map) = &mut body else {
            unreachable!("checked is_skip above")
        };
        for row in rows {
            let txid = field(row, 1, "address")?;
            let n = field(row, 2, "address")?;
            let value = decimal_to_satoshi(field(row, 3, "address")?)?;
            let height = parse_i64(row, 4, "address")?;
            let timestamp = parse_i64(row, 5, "address")?;
            map.entry(txid.to_string())
                .or_default()
                .insert(n.to_string(), AddressEntry { value, height, timestamp });
        }
        if map.len() > skip_cap {
            tracing::warn!(address = key, tx_count = map.len(), skip_cap, "address exceeds tx cap, marking skip");
            return Ok(Some(serde_json::to_value(&AddressBody::Skip { skip: true })?));
        }
        Ok(Some(serde_json::to_value(&body)?))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::staging_path;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn write_sorted(dir: &Path, table: Table, rows: &[&str]) -> std::path::PathBuf {
        let path = staging_path(dir, table);
        let file = File::create(&path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        for row in rows {
            encoder.write_all(row.as_bytes()).unwrap();
            encoder.write_all(b"\n").unwrap();
        }
        encoder.finish().unwrap();
        path
    }

    #[test]
    fn groups_vout_rows_sharing_a_txid() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        let sorted = write_sorted(
            dir.path(),
            Table::Vout,
            &[
                "txid1\t0\taddrA\t1.0\t100\thash1\t1000\t1\t2",
                "txid1\t1\taddrB\t0.5\t100\thash1\t1000\t1\t2",
            ],
        );

        let summary = group_vout(&store, &sorted, dir.path(), true).unwrap();
        assert_eq!(summary.keys_written, 1);

        let doc: VoutDoc = store.select(Table::Vout, "txid1").unwrap().unwrap();
        assert_eq!(doc.addresses["addrA"]["0"].value, 100_000_000);
        assert_eq!(doc.addresses["addrB"]["1"].value, 50_000_000);
    }

    #[test]
    fn coinbase_join_skips_without_vout_doc() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        let sorted = write_sorted(dir.path(), Table::Coinbase, &["orphan_txid\tdeadbeef\t0\t1000\t100"]);

        let summary = group_coinbase(&store, &sorted, dir.path(), true).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.keys_written, 0);
    }

    #[test]
    fn coinbase_join_sums_vout_values() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        store
            .insert(
                Table::Vout,
                "cb_txid",
                &VoutDoc {
                    height: 100,
                    block_hash: "hash1".into(),
                    timestamp: 1000,
                    vin_count: 1,
                    vout_count: 1,
                    addresses: BTreeMap::from([(
                        "addrA".to_string(),
                        BTreeMap::from([("0".to_string(), VoutEntry { value: 500_000_000, timestamp: 1000 })]),
                    )]),
                },
            )
            .unwrap();
        let sorted = write_sorted(dir.path(), Table::Coinbase, &["cb_txid\tdeadbeef\t0\t1000\t100"]);

        group_coinbase(&store, &sorted, dir.path(), true).unwrap();
        let doc: CoinbaseDoc = store.select(Table::Coinbase, "cb_txid").unwrap().unwrap();
        assert_eq!(doc.value, 500_000_000);
    }

    #[test]
    fn address_exceeding_cap_becomes_skip_record() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        let sorted = write_sorted(
            dir.path(),
            Table::Address,
            &[
                "addrA\ttxid1\t0\t1.0\t100\t1000",
                "addrA\ttxid2\t0\t1.0\t101\t1001",
            ],
        );

        let summary = group_address(&store, &sorted, dir.path(), true, 1).unwrap();
        assert_eq!(summary.keys_written, 1);
        let doc: AddressBody = store.select(Table::Address, "addrA").unwrap().unwrap();
        assert!(doc.is_skip());
    }

    #[test]
    fn upsert_mode_merges_with_existing_document() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        store
            .insert(
                Table::VinSpent,
                "txid_spent",
                &VinSpentDoc::from([("0".to_string(), VinSpentEntry { timestamp: 1, height: 1, txid: "old".into(), vin_n: 0 })]),
            )
            .unwrap();
        let sorted = write_sorted(dir.path(), Table::VinSpent, &["txid_spent\t1\tnew_spender\t0\t2000\t200"]);

        group_vin_spent(&store, &sorted, dir.path(), false).unwrap();
        let doc: VinSpentDoc = store.select(Table::VinSpent, "txid_spent").unwrap().unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc["0"].txid, "old");
        assert_eq!(doc["1"].txid, "new_spender");
    }
}
