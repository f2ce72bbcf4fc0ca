use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use made::config::Args;
use made::http::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.resolve();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("made=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let bind_addr = format!("{}:{}", config.bind_addr, config.bind_port);

    let state = Arc::new(
        AppState::new(config).map_err(|e| anyhow::anyhow!("{e}")).context("failed to build server state")?,
    );
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(%bind_addr, "deliberation coordinator listening");

    axum::serve(listener, router).await.context("server error")?;
    Ok(())
}
