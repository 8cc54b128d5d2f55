use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "leadsync")]
#[command(about = "Multi-source lead synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass and write its audit record.
    Run,
    /// Run the sync on its cron schedule until interrupted.
    Schedule,
    /// Apply the central Postgres schema.
    Migrate,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LEADSYNC_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Schedule) {
        Commands::Run => {
            let result = leadsync_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} cutoff={} created={} failed_sources={}",
                result.run_id,
                result.cutoff,
                result.total_created(),
                result.errors.len()
            );
        }
        Commands::Schedule => leadsync_sync::run_scheduler_from_env().await?,
        Commands::Migrate => leadsync_sync::migrate_from_env().await?,
    }

    Ok(())
}
