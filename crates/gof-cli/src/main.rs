use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use gof_adapters::{dedupe_summaries, load_detail_batch, AdapterContext, OpportunitySource};
use gof_core::{parse_date_key, GrantsError};
use gof_index::{provider_from_config, IndexBuilder, IndexHandle, ProviderKind};
use gof_sync::{
    compose_for_date, index_for_date, normalize_to_csv, run_sync_once, SyncConfig, SyncPipeline,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gof")]
#[command(about = "Grant Opportunity Finder: sync, normalize and search grants.gov opportunities")]
struct Cli {
    /// Artifact date (YYYY-MM-DD); defaults to today.
    #[arg(long, global = true, value_parser = parse_date_key)]
    date: Option<NaiveDate>,

    /// Overrides GOF_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Overrides EMBEDDING_PROVIDER (huggingface, openai, fake).
    #[arg(long, global = true)]
    provider: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every stage for the date, then answer any queries.
    Sync {
        #[arg(long)]
        query: Vec<String>,
        /// One query per line.
        #[arg(long)]
        query_file: Option<PathBuf>,
    },
    /// List open and forecasted opportunity ids.
    List,
    /// Print the raw detail payload of one opportunity.
    Detail { id: String },
    /// Print the applicant eligibility categories offered by the search page.
    Eligibility,
    /// Normalize a saved detail batch into the dated CSV.
    Normalize {
        #[arg(long)]
        input: PathBuf,
    },
    /// Build the dated combined-description CSV from the dated CSV.
    Compose,
    /// Build or reuse the dated similarity index.
    Index,
    /// Search the dated index.
    Query {
        text: String,
        #[arg(long)]
        k: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let date = cli
        .date
        .unwrap_or_else(|| chrono::Local::now().date_naive());

    let provider = cli
        .provider
        .as_deref()
        .map(str::parse::<ProviderKind>)
        .transpose()?;
    let mut config = SyncConfig::from_env(provider)?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    let top_k = config.index.top_k;

    match cli.command.unwrap_or(Commands::Sync {
        query: Vec::new(),
        query_file: None,
    }) {
        Commands::Sync { query, query_file } => {
            let mut queries = query;
            if let Some(path) = query_file {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                queries.extend(
                    text.lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(str::to_string),
                );
            }

            let outcome = run_sync_once(config, date).await?;
            let summary = &outcome.summary;
            println!(
                "sync complete: run_id={} listed={} fetched={} failed={} skipped={} rows={} chunks={} index_reused={} report={}",
                summary.run_id,
                summary.listed,
                summary.fetched,
                summary.failed.len(),
                summary.skipped.len(),
                summary.rows_written,
                summary.indexed_chunks,
                summary.index_reused,
                summary.report_path
            );
            for text in &queries {
                print_hits(&outcome.index, text, top_k).await?;
            }
        }
        Commands::List => {
            let pipeline = SyncPipeline::new(config)?;
            let summaries = pipeline
                .adapter()
                .list_opportunities(&AdapterContext::new())
                .await?;
            for summary in dedupe_summaries(summaries) {
                println!(
                    "{}\t{}\t{}",
                    summary.id,
                    summary.opp_status.as_deref().unwrap_or("-"),
                    summary.title.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Detail { id } => {
            let pipeline = SyncPipeline::new(config)?;
            let record = pipeline
                .adapter()
                .fetch_detail(&AdapterContext::new(), &id)
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Eligibility => {
            let pipeline = SyncPipeline::new(config)?;
            for label in pipeline.eligibilities().await? {
                println!("{label}");
            }
        }
        Commands::Normalize { input } => {
            let records = load_detail_batch(&input)?;
            let schema = config.row_schema()?;
            let (report, path) = normalize_to_csv(&records, &schema, &config.layout(), date)?;
            println!(
                "wrote {} rows to {} ({} records skipped)",
                report.rows.len(),
                path.display(),
                report.skipped.len()
            );
        }
        Commands::Compose => {
            let (rows, path) = compose_for_date(&config.layout(), date)?;
            println!("wrote {} rows to {}", rows.len(), path.display());
        }
        Commands::Index => {
            let builder = IndexBuilder::new(provider_from_config(&config.index)?)
                .with_chunk_settings(config.index.chunk);
            let index = index_for_date(&config.layout(), date, &builder).await?;
            println!(
                "index {} at {} ({} chunks)",
                if index.reused() { "reused" } else { "built" },
                index.dir().display(),
                index.chunks().len()
            );
        }
        Commands::Query { text, k } => {
            let index = IndexBuilder::new(provider_from_config(&config.index)?)
                .load(&config.layout(), date)
                .await?;
            print_hits(&index, &text, k.unwrap_or(top_k)).await?;
        }
    }

    Ok(())
}

async fn print_hits(index: &IndexHandle, text: &str, k: usize) -> Result<(), GrantsError> {
    let hits = index.query(text, k).await?;
    info!(query = text, hits = hits.len(), "query answered");
    println!("query: {text}");
    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{:>2}. [{:.4}] opportunity {} ({} row {})",
            rank + 1,
            hit.score,
            hit.chunk.provenance.opportunity_id,
            hit.chunk.provenance.source,
            hit.chunk.provenance.row
        );
        println!("    {}", hit.chunk.text);
    }
    Ok(())
}
