//! Minimal RPC passthrough, the spiritual successor of the original
//! `coin-cli.py` dynamic subcommand dispatcher: instead of building one
//! `clap` subcommand per RPC method from a hardcoded method table, this
//! takes the method name and parameters as plain positional arguments
//! and forwards them verbatim.

use clap::Parser;

use chainidx::cli::CommonArgs;
use chainidx::config::{get_global_config, init_global_config};

#[derive(Parser, Debug)]
#[command(about = "Issue a raw JSON-RPC call against a coin's node")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// RPC method name, e.g. getblockcount
    method: String,

    /// Positional RPC parameters; each is parsed as JSON if possible,
    /// otherwise passed through as a string.
    params: Vec<String>,
}

fn parse_param(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    init_global_config()?;
    let settings = get_global_config();
    let coin_cfg = settings.coin(&args.common.coin_type)?;
    let server = args.common.host.clone().unwrap_or_else(|| coin_cfg.server.clone());

    let params: Vec<serde_json::Value> = args.params.iter().map(|p| parse_param(p)).collect();
    let body = serde_json::json!({
        "jsonrpc": "1.0",
        "id": "chainidx-cli",
        "method": args.method,
        "params": params,
    });

    let http = reqwest::blocking::Client::new();
    let mut request = http.post(format!("http://{server}/")).json(&body);
    if let Some(rpcauth) = &coin_cfg.rpcauth {
        if let Some((user, password)) = rpcauth.split_once(':') {
            request = request.basic_auth(user, Some(password));
        }
    }
    let response = request.send()?;
    let json: serde_json::Value = response.json()?;

    match json.get("error") {
        Some(err) if !err.is_null() => {
            eprintln!("RPC error: {err}");
            std::process::exit(1);
        }
        _ => {
            println!("{}", serde_json::to_string_pretty(json.get("result").unwrap_or(&serde_json::Value::Null))?);
            Ok(())
        }
    }
}
