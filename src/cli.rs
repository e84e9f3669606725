//! Shared `clap`-derive argument groups used by every binary in this
//! crate, so `-t/--type`, `-v`, and `--host` mean the same thing
//! everywhere a CLI tool touches a coin's store or a node.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Coin type: a key into the `coins` table in config.toml.
    #[arg(short = 't', long = "type")]
    pub coin_type: String,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Override the node's `host:port` from config.toml.
    #[arg(long)]
    pub host: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct PipelineArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Run exactly one named phase (extract, sort, group_vout, group_coinbase,
    /// group_vin_spent, group_vin_txid, group_address, group_block) and exit.
    #[arg(short = 'p', long, conflicts_with_all = ["regenerate", "cleanup"])]
    pub phase: Option<String>,

    /// Clear the checkpoint for --phase (or every phase without it) before running.
    #[arg(short = 'r', long, conflicts_with_all = ["phase", "cleanup"])]
    pub regenerate: bool,

    /// Run one full pass and exit instead of looping as a daemon.
    #[arg(long)]
    pub single: bool,

    /// Delete staging/sorted files once a pass completes successfully.
    #[arg(long, conflicts_with_all = ["phase", "regenerate"])]
    pub cleanup: bool,

    /// Stop extraction after this many blocks (primarily for testing).
    #[arg(short = 'l', long)]
    pub limit: Option<u64>,

    /// Working directory for staging/sorted files and the metadata checkpoint,
    /// overriding the `working_dir`/coin-type path computed from config.toml.
    #[arg(long)]
    pub working: Option<String>,

    /// Force bulk (truncate + load) write mode regardless of the
    /// `initial_sync` checkpoint; the write path this coin would otherwise
    /// only take on its very first pass.
    #[arg(long)]
    pub initial: bool,

    /// Gzip compression level for staging files, 0 (none) to 9 (max).
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=9), default_value_t = 6)]
    pub compress_level: u32,
}

#[derive(Parser, Debug, Clone)]
pub struct QueryServerArgs {
    /// Address to bind the HTTP API to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
