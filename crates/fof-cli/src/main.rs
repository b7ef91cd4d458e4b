use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fof_core::{OpportunityStatus, QueryFilters};
use fof_sync::{Aggregator, AggregatorConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "fof-cli")]
#[command(about = "Funding Opportunity Finder command-line interface")]
struct Cli {
    /// Workspace root holding sources.yaml and fixtures (overrides FOF_WORKSPACE_ROOT).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rebuild the corpus from every enabled source.
    Refresh,
    /// Search the corpus.
    Query {
        text: Vec<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        status: Option<OpportunityStatus>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        min: Option<f64>,
        #[arg(long)]
        max: Option<f64>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        page_size: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Print corpus rows as JSON, or write a parquet snapshot with `--out`.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Refresh now, then on the cron schedule until interrupted.
    Serve {
        #[arg(long)]
        cron: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fof=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = AggregatorConfig::from_env();
    if let Some(root) = cli.workspace {
        config.workspace_root = root;
    }

    match cli.command.unwrap_or(Commands::Refresh) {
        Commands::Refresh => {
            let aggregator = Aggregator::from_config(config)?;
            let summary = aggregator.refresh().await?;
            let (count, errors) = summary.counts();
            println!(
                "refresh complete: run_id={} opportunities={} added={} errors={} duplicates={}",
                summary.run_id, count, summary.added, errors, summary.duplicates_discarded
            );
            for failure in &summary.adapter_failures {
                println!("  failed: {} ({:?}): {}", failure.provider, failure.kind, failure.reason);
            }
            for pair in &summary.near_duplicates {
                println!(
                    "  review: \"{}\" ~ \"{}\" ({:.2})",
                    pair.key_a, pair.key_b, pair.similarity
                );
            }
        }
        Commands::Query {
            text,
            category,
            status,
            provider,
            min,
            max,
            page,
            page_size,
            json,
        } => {
            let page_size = page_size.unwrap_or(config.page_size);
            let aggregator = Aggregator::from_config(config)?;
            let filters = QueryFilters {
                category,
                status,
                provider_name: provider,
                amount_min: min,
                amount_max: max,
            };
            let outcome = aggregator
                .query_page(&text.join(" "), &filters, page, page_size)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }

            println!(
                "{} result(s), page {} | intent {:?} | suggested: {}",
                outcome.total_count,
                outcome.page,
                outcome.intent,
                outcome.suggested_categories.join(", ")
            );
            for result in &outcome.results {
                let o = &result.opportunity;
                let closes = o
                    .scheduled_closing_date()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "unscheduled".to_string());
                println!(
                    "{:>4}  {} [{}] {} | {} | closes {} | {}",
                    result.score,
                    o.name,
                    o.provider_name,
                    o.category,
                    o.status,
                    closes,
                    o.amount.display()
                );
            }
        }
        Commands::Export { out } => {
            let aggregator = Aggregator::from_config(config)?;
            match out {
                Some(dir) => {
                    let manifest = aggregator.write_snapshot(&dir).await?;
                    println!("snapshot written: {}", manifest.display());
                }
                None => {
                    let rows = aggregator.export().await?;
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Serve { cron } => {
            config.scheduler_enabled = true;
            if let Some(cron) = cron {
                config.refresh_cron = cron;
            }
            let aggregator = Arc::new(Aggregator::from_config(config)?);
            let (count, errors) = aggregator.refresh().await?.counts();
            info!(count, errors, "initial refresh finished");

            let mut sched = aggregator
                .maybe_build_scheduler()
                .await?
                .context("scheduler not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %aggregator.config().refresh_cron, "scheduler running; ctrl-c to stop");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
