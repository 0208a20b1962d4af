use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use growda_core::{init_tracing, load_config};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

mod api;
mod federation;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config("fl-server")?;
    init_tracing(&cfg.service_name, &cfg.log_level)?;
    info!(?cfg, "config loaded");

    let federation = federation::FederationModule::new(&cfg)?;
    let origin: HeaderValue = cfg.cors_origin.parse().with_context(|| format!("invalid cors_origin '{}'", cfg.cors_origin))?;
    let app = api::router(federation.service())
        .layer(CorsLayer::new().allow_origin(origin).allow_methods([Method::GET, Method::POST]).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = cfg.listen_addr.parse().with_context(|| format!("invalid listen_addr '{}'", cfg.listen_addr))?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "fl-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    federation.shutdown();
    info!("shutdown");
    Ok(())
}
