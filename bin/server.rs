// Bank Sync - Web Server
// Operator API + per-bank schedulers over one shared session

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

use bank_sync::api::{build_router, AppState};
use bank_sync::{Config, Session};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();
    init_tracing();

    println!("🌐 Bank Sync - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = Config::from_env().context("invalid configuration")?;
    let addr = config.bind_addr;
    println!("✓ Ledger: {}", config.ledger_url);
    println!("✓ Downloads: {}", config.downloads.display());

    let session = Arc::new(Session::from_config(config));
    println!("✓ Banks: {}", session.banks().join(", "));

    let state = AppState::new(session, Handle::current());
    let app = build_router(state);

    println!("\n🚀 Server running at http://{}", addr);
    println!("   API: http://{}/api/health", addr);
    tracing::info!(%addr, "listening");

    axum::serve(TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")
}
