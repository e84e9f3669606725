//! Phase Orchestrator: drives one sync pass through
//! extract -> sort -> group(vout, coinbase, vin_spent, vin_txid, address, block)
//! in that fixed order, checkpointing after every phase so a crash
//! resumes at the next undone phase instead of redoing finished work.
//!
//! The very first pass for a coin runs every grouper in bulk mode
//! (truncate + TSV load); every pass after that runs in upsert mode,
//! tracked by the `initial_sync` checkpoint key.

use std::fs::{File, OpenOptions};
use std::time::Duration;

use fs2::FileExt;

use crate::config::Settings;
use crate::error::{IndexerError, Result};
use crate::extractor::{extract, ExtractSummary};
use crate::grouper::{group_address, group_block, group_coinbase, group_vin_spent, group_vin_txid, group_vout, GroupSummary};
use crate::metadata::{metadata_path, Metadata};
use crate::node_client::NodeClient;
use crate::notify::{NotifyEvent, Notifier};
use crate::orphan::unwind_orphans;
use crate::sorter::build_sorter;
use crate::staging::{sorted_path, staging_path, StagingWriters};
use crate::store::{Store, Table};

pub const PHASE_INITIAL_SYNC: &str = "initial_sync";
pub const PHASE_EXTRACT: &str = "extract";
pub const PHASE_SORT: &str = "sort";
pub const PHASE_GROUP_VOUT: &str = "group_vout";
pub const PHASE_GROUP_COINBASE: &str = "group_coinbase";
pub const PHASE_GROUP_VIN_SPENT: &str = "group_vin_spent";
pub const PHASE_GROUP_VIN_TXID: &str = "group_vin_txid";
pub const PHASE_GROUP_ADDRESS: &str = "group_address";
pub const PHASE_GROUP_BLOCK: &str = "group_block";

const ALL_GROUP_PHASES: [&str; 6] = [
    PHASE_GROUP_VOUT,
    PHASE_GROUP_COINBASE,
    PHASE_GROUP_VIN_SPENT,
    PHASE_GROUP_VIN_TXID,
    PHASE_GROUP_ADDRESS,
    PHASE_GROUP_BLOCK,
];

const POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Run exactly this one phase and exit, ignoring pipeline order.
    pub phase: Option<String>,
    /// Clear the checkpoint for `phase` (or every phase, if none given) before running.
    pub regenerate: bool,
    /// Run one full pass and exit instead of looping as a daemon.
    pub single: bool,
    /// Delete staging/sorted files once a pass completes successfully.
    pub cleanup: bool,
    pub limit: Option<u64>,
    /// Force bulk write mode regardless of the `initial_sync` checkpoint.
    pub initial: bool,
    /// Gzip level for staging files written by this pass.
    pub compress_level: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            phase: None,
            regenerate: false,
            single: false,
            cleanup: false,
            limit: None,
            initial: false,
            compress_level: 6,
        }
    }
}

pub async fn run(
    store: &Store,
    client: &NodeClient,
    settings: &Settings,
    coin: &str,
    working_dir: &std::path::Path,
    options: &RunOptions,
) -> Result<()> {
    let meta_path = metadata_path(working_dir);

    // The working directory is the coarse lock two extractors for the same
    // coin must not both hold: metadata and staging files aren't safe to
    // write concurrently. Held for the lifetime of this run.
    let _lock = acquire_working_dir_lock(working_dir)?;

    loop {
        let mut metadata = Metadata::load(&meta_path)?;

        if options.regenerate {
            match &options.phase {
                Some(phase) => metadata.clear(phase),
                None => metadata.clear_all(),
            }
            metadata.save(&meta_path)?;
        }

        let bulk = options.initial || !metadata.is_complete(PHASE_INITIAL_SYNC);

        if let Some(phase) = options.phase.clone() {
            run_single_phase(store, client, settings, coin, working_dir, &mut metadata, &phase, bulk, options.limit, options.compress_level)?;
            metadata.save(&meta_path)?;
            return Ok(());
        }

        if !metadata.is_complete(PHASE_EXTRACT) {
            let start_hash = match resolve_start_hash(client, settings, coin, &metadata) {
                Ok(hash) => hash,
                Err(IndexerError::NotFound(msg)) => {
                    tracing::info!(%msg, "caught up to chain tip, nothing to extract this pass");
                    maybe_unwind(store, client, settings, coin, &metadata).await?;
                    if options.single {
                        return Ok(());
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let summary = run_extract(client, working_dir, &start_hash, options.limit, options.compress_level)?;
            if let Some(last) = &summary.last_processed_block {
                metadata.cursor = Some(last.clone());
            }
            metadata.record(PHASE_EXTRACT, &summary)?;
            metadata.save(&meta_path)?;
        }

        if !metadata.is_complete(PHASE_SORT) {
            run_sort(settings, working_dir)?;
            metadata.record(PHASE_SORT, serde_json::json!({"done": true}))?;
            metadata.save(&meta_path)?;
        }

        for &phase in &ALL_GROUP_PHASES {
            if !metadata.is_complete(phase) {
                let summary = run_group_phase(store, working_dir, phase, bulk, settings)?;
                metadata.record(phase, &summary)?;
                metadata.save(&meta_path)?;
            }
        }

        metadata.record(PHASE_INITIAL_SYNC, serde_json::json!({"done": true}))?;
        metadata.save(&meta_path)?;

        if options.cleanup {
            cleanup_staging(working_dir);
        }

        if !bulk {
            if let Some(summary) = metadata.get::<ExtractSummary>(PHASE_EXTRACT) {
                notify_new_block(settings, coin, &summary);
            }
        }
        maybe_unwind(store, client, settings, coin, &metadata).await?;

        if options.single {
            return Ok(());
        }

        metadata.clear(PHASE_EXTRACT);
        metadata.clear(PHASE_SORT);
        for &phase in &ALL_GROUP_PHASES {
            metadata.clear(phase);
        }
        metadata.save(&meta_path)?;
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn acquire_working_dir_lock(working_dir: &std::path::Path) -> Result<File> {
    std::fs::create_dir_all(working_dir)?;
    let lock_path = working_dir.join(".pipeline.lock");
    let file = OpenOptions::new().create(true).write(true).open(&lock_path)?;
    file.try_lock_exclusive().map_err(|_| {
        IndexerError::InvalidArgument(format!(
            "another extract pipeline is already running for this coin (lock held on {})",
            lock_path.display()
        ))
    })?;
    Ok(file)
}

fn run_single_phase(
    store: &Store,
    client: &NodeClient,
    settings: &Settings,
    coin: &str,
    working_dir: &std::path::Path,
    metadata: &mut Metadata,
    phase: &str,
    bulk: bool,
    limit: Option<u64>,
    compress_level: u32,
) -> Result<()> {
    match phase {
        PHASE_EXTRACT => {
            let start_hash = resolve_start_hash(client, settings, coin, metadata)?;
            let summary = run_extract(client, working_dir, &start_hash, limit, compress_level)?;
            if let Some(last) = &summary.last_processed_block {
                metadata.cursor = Some(last.clone());
            }
            metadata.record(PHASE_EXTRACT, &summary)?;
            Ok(())
        }
        PHASE_SORT => {
            run_sort(settings, working_dir)?;
            metadata.record(PHASE_SORT, serde_json::json!({"done": true}))?;
            Ok(())
        }
        other if ALL_GROUP_PHASES.contains(&other) => {
            let summary = run_group_phase(store, working_dir, other, bulk, settings)?;
            metadata.record(other, &summary)?;
            Ok(())
        }
        other => Err(IndexerError::InvalidArgument(format!("unknown phase: {other}"))),
    }
}

fn resolve_start_hash(client: &NodeClient, settings: &Settings, coin: &str, metadata: &Metadata) -> Result<String> {
    match &metadata.cursor {
        Some(last_hash) => {
            let block = client.get_block(last_hash)?.ok_or_else(|| {
                IndexerError::NotFound(format!("last processed block {last_hash} no longer known to node"))
            })?;
            block
                .nextblockhash
                .ok_or_else(|| IndexerError::NotFound(format!("no blocks after {last_hash} yet")))
        }
        None => settings.coin(coin)?.genesis_hash.clone().ok_or_else(|| {
            IndexerError::InvalidArgument(format!("coin {coin} has no genesis_hash configured for first sync"))
        }),
    }
}

fn run_extract(client: &NodeClient, working_dir: &std::path::Path, start_hash: &str, limit: Option<u64>, compress_level: u32) -> Result<ExtractSummary> {
    let mut writers = StagingWriters::create(working_dir, compress_level)?;
    let summary = extract(client, &mut writers, start_hash, limit)?;
    writers.finish()?;
    Ok(summary)
}

fn run_sort(settings: &Settings, working_dir: &std::path::Path) -> Result<()> {
    let sorter = build_sorter(settings.sort.command.clone(), settings.sort.memory_budget_mb);
    for table in Table::all() {
        let src = staging_path(working_dir, table);
        if !src.exists() {
            continue;
        }
        let dst = sorted_path(working_dir, table);
        sorter.sort(&src, &dst, 0)?;
    }
    Ok(())
}

fn run_group_phase(store: &Store, working_dir: &std::path::Path, phase: &str, bulk: bool, settings: &Settings) -> Result<GroupSummary> {
    match phase {
        PHASE_GROUP_VOUT => group_vout(store, &sorted_path(working_dir, Table::Vout), working_dir, bulk),
        PHASE_GROUP_COINBASE => group_coinbase(store, &sorted_path(working_dir, Table::Coinbase), working_dir, bulk),
        PHASE_GROUP_VIN_SPENT => group_vin_spent(store, &sorted_path(working_dir, Table::VinSpent), working_dir, bulk),
        PHASE_GROUP_VIN_TXID => group_vin_txid(store, &sorted_path(working_dir, Table::VinTxid), working_dir, bulk),
        PHASE_GROUP_ADDRESS => group_address(
            store,
            &sorted_path(working_dir, Table::Address),
            working_dir,
            bulk,
            settings.address_skip_cap,
        ),
        PHASE_GROUP_BLOCK => group_block(store, &sorted_path(working_dir, Table::Block), working_dir, bulk),
        other => Err(IndexerError::InvalidArgument(format!("unknown group phase: {other}"))),
    }
}

fn cleanup_staging(working_dir: &std::path::Path) {
    for table in Table::all() {
        std::fs::remove_file(staging_path(working_dir, table)).ok();
        std::fs::remove_file(sorted_path(working_dir, table)).ok();
    }
}

fn notify_new_block(settings: &Settings, coin: &str, summary: &ExtractSummary) {
    if settings.new_block_notification.trim().is_empty() {
        return;
    }
    let Some(hash) = &summary.last_processed_block else { return };
    let Ok(coin_cfg) = settings.coin(coin) else { return };

    let notifier = Notifier::new(settings.new_block_notification.clone());
    notifier.notify(&NotifyEvent {
        event: "new_block",
        coin_type: coin.to_string(),
        symbol: coin_cfg.symbol.clone(),
        height: summary.last_height.unwrap_or_default(),
        hash: hash.clone(),
        timestamp: summary.last_timestamp.unwrap_or_default(),
        addresses: summary.touched_addresses.iter().cloned().collect(),
    });
}

async fn maybe_unwind(store: &Store, client: &NodeClient, settings: &Settings, coin: &str, metadata: &Metadata) -> Result<()> {
    let Some(tip) = &metadata.cursor else { return Ok(()) };
    let coin_cfg = settings.coin(coin)?;
    let notifier = (!settings.new_block_notification.trim().is_empty())
        .then(|| Notifier::new(settings.new_block_notification.clone()));
    // No CacheManager here: the extract/sort/group pipeline runs as a
    // separate process from the query-server that owns the cache.
    unwind_orphans(store, client, None, notifier.as_ref(), coin, &coin_cfg.symbol, tip).await?;
    Ok(())
}
