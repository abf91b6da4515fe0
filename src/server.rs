//! MCP server initialization for stdio and Streamable HTTP transports.
//!
//! Provides [`serve_stdio`] and [`serve_http`] entry points that open the engine,
//! start its background workers, and run the MCP tool handler until the client
//! disconnects or the process is interrupted.

use anyhow::Result;
use continuum::config::ContinuumConfig;
use continuum::Continuum;
use rmcp::ServiceExt;
use std::sync::Arc;

use crate::tools::ContinuumTools;

/// Open the engine and start its workers.
fn start_engine(config: ContinuumConfig) -> Result<Arc<Continuum>> {
    let engine = Continuum::open(config)?;
    engine.start_workers();
    tracing::info!(
        data_dir = %engine.config.resolved_data_dir().display(),
        graph = %engine.config.resolved_graph_db_path().display(),
        "engine ready"
    );
    Ok(Arc::new(engine))
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: ContinuumConfig) -> Result<()> {
    tracing::info!("starting continuum MCP server on stdio");

    let engine = start_engine(config)?;
    let tools = ContinuumTools::new(engine.clone());
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    engine.shutdown().await;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over Streamable HTTP transport.
pub async fn serve_http(config: ContinuumConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %bind_addr, "starting continuum MCP server on HTTP");

    let engine = start_engine(config)?;

    let shared = engine.clone();
    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(ContinuumTools::new(shared.clone())),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    let shutdown = engine.shutdown_token();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
                shutdown.cancelled().await;
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}
