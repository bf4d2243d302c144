use anyhow::Context;
use scrape_fleet::agent::AgentRuntime;
use scrape_fleet::config::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AgentConfig::from_env().context("loading agent configuration")?;

    eprintln!("scrape-fleet agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Orchestrator: {}", config.orchestrator_url);
    eprintln!("   Capability:   {}", config.capability);
    eprintln!("   Scraper:      {}", config.scraper_url);
    eprintln!("   Callbacks:    http://{}/callback/<task_id>", config.callback_addr);

    let runtime = AgentRuntime::new(config);
    runtime.run().await.context("starting callback listener")?;
    Ok(())
}
