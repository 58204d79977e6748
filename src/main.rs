//! Gatehouse - request gating service
//! Mission: Stop every request that should not reach a handler, and nothing else

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, time::interval};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::{
    accounts::AccountService,
    api::{create_router, AppState},
    config::GateConfig,
    notify::LogNotifier,
    pipeline::RequestPipeline,
    store::{MemoryUserCache, SqliteStore},
};

#[derive(Parser, Debug)]
#[command(name = "gatehouse", version, about = "Request gating service")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "ADDR")]
    addr: Option<String>,

    /// SQLite database holding users, roles and invitations
    #[arg(long, env = "AUTH_DB_PATH")]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment and logging
    load_env();
    init_tracing();

    let args = Args::parse();
    let mut config = GateConfig::from_env().context("Invalid configuration")?;
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    info!("🚀 Gatehouse starting (env: {})", config.env);
    debug!(?config, "Loaded configuration");

    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    info!("🔐 User store initialized at: {}", config.db_path);

    let cache = Arc::new(MemoryUserCache::new(config.cache.user_ttl));
    let pipeline = Arc::new(RequestPipeline::from_config(
        &config,
        store.clone(),
        store.clone(),
        cache.clone(),
    ));
    info!(
        cache = pipeline.resolver().caching_enabled(),
        single_flight = config.cache.single_flight,
        rate_limit = pipeline.limiter().enabled(),
        "🛡️ Gate pipeline ready"
    );

    let accounts = Arc::new(AccountService::new(
        store.clone(),
        pipeline.resolver().clone(),
        pipeline.tokens().clone(),
        Arc::new(LogNotifier),
        config.accounts.clone(),
        config.frontend_url.clone(),
    ));

    // Background: drop idle rate-limit windows and expired cache entries.
    tokio::spawn(maintenance_loop(
        pipeline.clone(),
        cache,
        config.rate_limit.window.max(Duration::from_secs(1)),
    ));

    let app = create_router(AppState {
        pipeline,
        accounts,
        env: config.env.clone(),
    });

    // Start server
    let listener = TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;
    info!("🎯 API server listening on {}", config.addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("👋 Gatehouse stopped");
    Ok(())
}

async fn maintenance_loop(
    pipeline: Arc<RequestPipeline>,
    cache: Arc<MemoryUserCache>,
    period: Duration,
) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;

        let windows = pipeline.limiter().sweep();
        let entries = cache.purge_expired();
        if windows > 0 || entries > 0 {
            debug!(windows, entries, "Swept idle gate state");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Initialize tracing with enhanced observability
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatehouse=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try the crate root .env when launched from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
