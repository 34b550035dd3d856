use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "finfeed")]
#[command(about = "Financial feed sync: scrape sources, dedup, push to the workspace database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass over every enabled source.
    Sync,
    /// Archive destination duplicates, keeping the newest of each group.
    Reconcile {
        /// Reconcile with this source's identity strategy and database
        /// instead of the default database by URL.
        #[arg(long)]
        source: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    // Per-item and per-source failures are reported in the summary and do not
    // change the exit code; only setup errors bubble up as non-zero.
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = finfeed_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sources={} created={} updated={} skipped={} failed={} report={}",
                summary.run_id,
                summary.enabled_sources,
                summary.totals.created,
                summary.totals.updated,
                summary.totals.skipped,
                summary.totals.failed,
                summary.report_path.display()
            );
            for failure in &summary.totals.failures {
                println!(
                    "  failed [{}] {}: {}",
                    failure.source_id, failure.title, failure.reason
                );
            }
            if summary.failed_sources > 0 {
                println!("  {} source(s) failed to fetch; see the run report", summary.failed_sources);
            }
        }
        Commands::Reconcile { source } => {
            let summary = finfeed_sync::reconcile_from_env(source.as_deref()).await?;
            println!(
                "reconcile complete: scanned={} duplicate_groups={} archived={} failed={}",
                summary.scanned, summary.duplicate_groups, summary.archived, summary.failed
            );
            for pair in &summary.review {
                println!(
                    "  review: {:.3} \"{}\" ~ \"{}\"",
                    pair.score, pair.title_a, pair.title_b
                );
            }
        }
    }

    Ok(())
}
