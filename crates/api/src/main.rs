use labflow_infra::config::EngineConfig;
use labflow_observability::tracing::LoggingConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    labflow_observability::tracing::init(&LoggingConfig {
        json: !config.pretty_logs,
        ..LoggingConfig::default()
    });

    let bind_addr = config.server.bind_addr;
    let services = labflow_api::app::AppServices::build(config).await?;
    services.start().await?;
    let app = labflow_api::app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    services.shutdown().await;
    Ok(())
}
