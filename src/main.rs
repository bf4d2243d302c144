use anyhow::Context;
use scrape_fleet::config::OrchestratorConfig;
use scrape_fleet::orchestrator::dispatcher::Dispatcher;
use scrape_fleet::orchestrator::sweep;
use scrape_fleet::orchestrator::ws::api_routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OrchestratorConfig::from_env().context("loading orchestrator configuration")?;
    let bind_addr = config.bind_addr.clone();

    eprintln!("scrape-fleet orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker WS:     ws://{bind_addr}/ws");
    eprintln!("   Requester API: http://{bind_addr}/api/tasks");
    eprintln!(
        "   Capabilities:  {}",
        config
            .tokens
            .keys()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let dispatcher = Dispatcher::new(config);

    let _heartbeat_sweep = sweep::spawn_heartbeat_sweep(dispatcher.clone());
    let _stale_sweep = sweep::spawn_stale_task_sweep(dispatcher.clone());
    let _dispatch_sweep = sweep::spawn_dispatch_sweep(dispatcher.clone());

    let app = api_routes(dispatcher);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(%bind_addr, "Orchestrator started");
    axum::serve(listener, app).await?;
    Ok(())
}
