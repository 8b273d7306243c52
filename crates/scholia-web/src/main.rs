//! Scholia web server.
//!
//! Run with: cargo run -p scholia-web

use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::EnvFilter;

use scholia_common::AppConfig;
use scholia_db::Database;
use scholia_web::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;

    let db = Database::open(&config.database.url).await?;
    db.initialize().await?;

    let dispatcher = scholia_web::build_dispatcher(&config, db.clone());
    let scheduler = scholia_web::build_scheduler(&config, db.clone());
    tokio::spawn(scheduler.clone().run());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let app = scholia_web::router::build_router(AppState::new(config, db, dispatcher, scheduler));

    info!(%addr, "scholia listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
