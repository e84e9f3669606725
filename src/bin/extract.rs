use std::process::ExitCode;

use clap::Parser;

use chainidx::cli::PipelineArgs;
use chainidx::config::{get_global_config, init_global_config};
use chainidx::error::IndexerError;
use chainidx::node_client::NodeClient;
use chainidx::orchestrator::{self, RunOptions};
use chainidx::store::Store;

/// Wires up `extract_log` (file, append, level) from config.toml: a
/// rolling-appender-less file sink plus stdout, matching the reference
/// pipeline's "log to a file next to the working directory" behaviour.
fn init_logging(log_cfg: &chainidx::config::ExtractLogConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let log_path = std::path::PathBuf::from(&log_cfg.file);
    let log_dir = log_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
    let log_filename = log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("extract.log"));

    if !log_cfg.append {
        std::fs::File::create(&log_path).ok();
    }

    let file_appender = tracing_appender::rolling::never(log_dir, log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_new(&log_cfg.level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).with_writer(non_blocking).with_ansi(false).init();
    guard
}

/// Exit 0 on success, 1 on a phase/runtime failure, 2 on a bad argument
/// (unknown coin type, bad path, ...) — `clap` itself already exits 2 for
/// unparseable CLI input before `main` ever runs.
#[tokio::main]
async fn main() -> ExitCode {
    let args = PipelineArgs::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(IndexerError::InvalidArgument(msg)) => {
            eprintln!("argument error: {msg}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("extract failed: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: PipelineArgs) -> chainidx::error::Result<()> {
    init_global_config()?;
    let settings = get_global_config();
    let _log_guard = init_logging(&settings.extract_log);

    let coin_cfg = settings.coin(&args.common.coin_type)?;

    let server = args.common.host.clone().unwrap_or_else(|| coin_cfg.server.clone());
    let client = NodeClient::with_rpcauth(server, coin_cfg.rpcauth.as_deref());

    let db_path = settings.db_path(&args.common.coin_type)?;
    let store = Store::open(&db_path)?;

    let working_dir = args
        .working
        .clone()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from(settings.working_path(&args.common.coin_type)));

    let options = RunOptions {
        phase: args.phase.clone(),
        regenerate: args.regenerate,
        single: args.single,
        cleanup: args.cleanup,
        limit: args.limit,
        initial: args.initial,
        compress_level: args.compress_level,
    };

    orchestrator::run(&store, &client, settings, &args.common.coin_type, &working_dir, &options).await
}
