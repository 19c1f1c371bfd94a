//! eanmatch - batch EAN to ASIN resolution CLI
//!
//! Subcommands:
//! - `run` - resolve an input CSV of EANs against the configured
//!   marketplaces, writing an ordered output CSV
//! - `invalidate-cache` - drop cached upstream responses
//! - `invalidate-ledger` - administratively remove one terminal decision
//! - `show-ledger` - print the run ledger

use anyhow::Result;
use clap::{Parser, Subcommand};
use eanmatch::db::{self, CacheStore, RunLedger};
use eanmatch::io::{parse_marketplaces, read_input_records, OutputWriter};
use eanmatch::services::{FallbackClient, PrimaryClient};
use eanmatch::workflow::pipeline::{Pipeline, RecordOutcome};
use eanmatch_common::config::{load_config, resolve_run_store_path};
use eanmatch_common::types::Marketplace;
use eanmatch_common::RequestFingerprint;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eanmatch", version, about = "Resolve EANs to ASINs across marketplaces")]
struct Cli {
    /// Run-store (SQLite) path; overrides EANMATCH_RUN_STORE and the config file
    #[arg(long, global = true)]
    run_store: Option<PathBuf>,

    /// TOML config file; defaults to the platform config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (e.g. "debug", "eanmatch=trace"); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a batch of EANs to ASINs
    Run {
        /// Input CSV with an 'ean' column and optional 'title'/'brand' hints
        #[arg(long)]
        input: PathBuf,

        /// Output CSV path
        #[arg(long)]
        output: PathBuf,

        /// Comma-separated marketplace codes (e.g. DE,FR,IT); defaults to
        /// the configured list
        #[arg(long)]
        marketplaces: Option<String>,

        /// Worker pool size; defaults to the configured value
        #[arg(long)]
        max_workers: Option<usize>,

        /// Skip records that already have a terminal ledger entry
        #[arg(long)]
        resume: bool,
    },

    /// Remove cached upstream responses (all, or one fingerprint)
    InvalidateCache {
        /// Hex fingerprint of the entry to remove; omit to clear everything
        #[arg(long)]
        fingerprint: Option<String>,
    },

    /// Remove one terminal ledger entry so the next run re-processes it
    InvalidateLedger {
        #[arg(long)]
        ean: String,

        #[arg(long)]
        marketplace: String,
    },

    /// Print the run ledger in append order
    ShowLedger,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; an explicit --log-level wins over RUST_LOG
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("eanmatch v{}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(cli.config.as_deref())?;
    let db_path = resolve_run_store_path(cli.run_store.as_deref(), &config);
    tracing::info!("Run store: {}", db_path.display());

    let pool = db::init_run_store(&db_path).await?;
    let cache = CacheStore::new(pool.clone());

    match cli.command {
        Command::Run {
            input,
            output,
            marketplaces,
            max_workers,
            resume,
        } => {
            if let Some(raw) = marketplaces {
                config.marketplaces = parse_marketplaces(&raw)?;
            }
            if let Some(workers) = max_workers {
                config.worker_pool_size = workers;
            }
            config.validate()?;

            let records = read_input_records(&input, &config.marketplaces)?;
            if records.is_empty() {
                tracing::warn!("No EANs found in input file");
                return Ok(());
            }

            let ledger = Arc::new(RunLedger::open(pool.clone()).await?);
            let primary = Arc::new(PrimaryClient::new(&config, cache.clone())?);
            let fallback = Arc::new(FallbackClient::new(&config, cache.clone())?);
            let pipeline = Pipeline::new(Arc::new(config), primary, fallback, ledger);

            // Ctrl-C stops dispatch; in-flight records finish their current
            // upstream call and the ledger stays resumable
            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, finishing in-flight records");
                    signal_cancel.cancel();
                }
            });

            let (out_tx, mut out_rx) = mpsc::channel::<RecordOutcome>(64);
            let mut writer = OutputWriter::create(&output)?;
            let writer_task = tokio::spawn(async move {
                while let Some(outcome) = out_rx.recv().await {
                    writer.write(&outcome)?;
                }
                writer.finish()
            });

            let summary = pipeline.run_batch(records, resume, cancel, out_tx).await?;
            let rows = writer_task.await??;

            tracing::info!(rows, output = %output.display(), "Output written");
            summary.log();

            // Exit status mirrors the batch state: 130 for an interrupted
            // run, 1 when records need human attention
            if summary.cancelled > 0 {
                std::process::exit(130);
            }
            if summary.needs_attention() {
                std::process::exit(1);
            }
        }

        Command::InvalidateCache { fingerprint } => {
            let fingerprint = fingerprint.map(RequestFingerprint::from_hex);
            let removed = cache.invalidate(fingerprint.as_ref()).await?;
            tracing::info!(removed, "Cache entries invalidated");
        }

        Command::InvalidateLedger { ean, marketplace } => {
            let marketplace: Marketplace = marketplace.parse()?;
            let ledger = RunLedger::open(pool.clone()).await?;
            if ledger.invalidate(&ean, marketplace).await? {
                tracing::info!(%ean, %marketplace, "Ledger entry removed; next run will re-process it");
            } else {
                tracing::warn!(%ean, %marketplace, "No ledger entry found");
            }
        }

        Command::ShowLedger => {
            let ledger = RunLedger::open(pool.clone()).await?;
            let entries = ledger.all().await?;
            if entries.is_empty() {
                println!("Ledger is empty");
            } else {
                for entry in entries {
                    let decision = &entry.decision;
                    println!(
                        "{}\t{}\t{}\t{}\t{:.3}\t{}\t{}",
                        decision.ean,
                        decision.marketplace,
                        decision.status.as_str(),
                        decision.asin.as_deref().unwrap_or("-"),
                        decision.confidence,
                        entry.completed_at.to_rfc3339(),
                        decision.evidence.join("; "),
                    );
                }
            }
        }
    }

    Ok(())
}
