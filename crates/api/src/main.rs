use std::sync::Arc;

use anyhow::Context;

use marketflow_infra::BusConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the environment may already be populated.
    let _ = dotenvy::dotenv();
    marketflow_observability::init().context("invalid logging configuration")?;

    let config = BusConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr.clone();

    let services = Arc::new(
        marketflow_api::app::services::build_services(config)
            .await
            .context("failed to wire services")?,
    );
    let sweeper = services.sweeper().spawn();
    let app = marketflow_api::app::build_app(Arc::clone(&services));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("http server stopped, draining retry sweeper");
    sweeper.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
