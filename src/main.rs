use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;

use chainidx::cache::CacheManager;
use chainidx::cli::QueryServerArgs;
use chainidx::config::{get_global_config, init_global_config};
use chainidx::http_api::{build_router, CoinState};
use chainidx::node_client::NodeClient;
use chainidx::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = QueryServerArgs::parse();

    init_global_config()?;
    let settings = get_global_config();

    let mut coins = HashMap::new();
    for (name, coin_cfg) in &settings.coins {
        let db_path = settings.db_path(name)?;
        let store = Arc::new(Store::open(&db_path)?);
        let client = Arc::new(NodeClient::with_rpcauth(coin_cfg.server.clone(), coin_cfg.rpcauth.as_deref()));
        let cache = Arc::new(CacheManager::new());
        coins.insert(name.clone(), CoinState { store, client, cache });
    }
    let coins = Arc::new(coins);
    let settings_arc = Arc::new(settings.clone());

    let app = build_router(coins, settings_arc);

    let addr: std::net::SocketAddr = args.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, coins = %settings.supported_coins().join(","), "query-server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
