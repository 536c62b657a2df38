use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fundscout_crawl::{DiscoveryEngine, EngineConfig, TargetRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fundscout-cli")]
#[command(about = "Funding opportunity discovery engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl until ctrl-c, then stop and snapshot the queue.
    Crawl,
    /// Serve the JSON API; the crawl is started through it.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        /// Start crawling immediately instead of waiting for POST /crawl/start.
        #[arg(long)]
        start: bool,
    },
    /// Print the target registry.
    Targets,
    /// Apply Postgres migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Crawl) {
        Commands::Crawl => {
            let engine = DiscoveryEngine::from_config(&config).await?;
            engine.start_crawl().await;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutdown requested");
            engine.stop().await?;
            let stats = engine.status().aggregate_stats().await;
            println!(
                "crawl stopped: succeeded={} created={} updated={} points={}",
                stats.jobs.get("succeeded").copied().unwrap_or_default(),
                stats.opportunities_created,
                stats.opportunities_updated,
                stats.total_points
            );
        }
        Commands::Serve { port, start } => {
            let engine = Arc::new(DiscoveryEngine::from_config(&config).await?);
            if start {
                engine.start_crawl().await;
            }
            let port = port.unwrap_or(config.web_port);
            tokio::select! {
                served = fundscout_web::serve(engine.clone(), port) => served?,
                signal = tokio::signal::ctrl_c() => {
                    signal.context("waiting for ctrl-c")?;
                    info!("shutdown requested");
                }
            }
            engine.stop().await?;
        }
        Commands::Targets => {
            let registry =
                TargetRegistry::open(&config.targets_path, &config.registry_state_path()).await?;
            for target in registry.list().await {
                println!(
                    "{}\tpriority={}\tactive={}\tevery={}s\t{}",
                    target.target_id,
                    target.priority,
                    target.active,
                    target.rate_limit_secs,
                    target.url
                );
            }
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                anyhow::bail!("DATABASE_URL is not set");
            };
            let pool = sqlx::PgPool::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            fundscout_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
