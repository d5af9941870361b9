//! # pgload CLI - Bulk Load Runner
//!
//! Command-line interface for running pgload bulk loads. It parses a YAML
//! load command file, drives the copy orchestrator with proper cancellation
//! on Ctrl-C, and prints the final per-table summary.
//!
//! ## Usage
//!
//! ```bash
//! # Run a load described by a command file
//! pgload --load imports/app.yml
//!
//! # Keep rejected rows somewhere specific and save the summary
//! pgload --load app.yml --root-dir /var/log/pgload --summary summary.txt
//!
//! # Enable debug logging
//! RUST_LOG=debug pgload --load app.yml
//! ```
//!
//! ## Command file
//!
//! The YAML file names a source (a DBF file or a SQLite database), the
//! PostgreSQL target, and the option flags: schema creation, truncation,
//! index builds, sequence resets, and the table filter. See
//! [`pgload_core::LoadSpec`] for the full schema.

use anyhow::Result;
use clap::Parser;
use anyhow::Context;
use pgload_core::stats::render_summary;
use pgload_core::{LoadSpec, RunContext, TextEncoding};
use pgload_io::orchestrator;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the pgload runner
#[derive(Parser, Debug)]
#[command(name = "pgload")]
#[command(about = "Bulk loader for DBF and SQLite sources into PostgreSQL")]
struct Args {
    /// Path to the load command YAML file
    #[arg(short, long)]
    load: PathBuf,

    /// Output directory for rejected-row files
    #[arg(long, default_value = ".")]
    root_dir: PathBuf,

    /// Also write the final summary to this file
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Character encoding of DBF text fields (utf-8 or latin1)
    #[arg(long, default_value = "utf-8")]
    encoding: String,

    /// Row queue capacity between each reader and its sink
    ///
    /// Overrides the command file's concurrent_batches option. Higher values
    /// smooth bursts, lower values cap memory; the bound is what gives the
    /// pipeline backpressure.
    #[arg(long)]
    concurrent_batches: Option<usize>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        eprintln!("pgload: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let spec = LoadSpec::from_path(&args.load)?;

    let encoding = TextEncoding::parse(&args.encoding)
        .with_context(|| format!("unsupported encoding {:?}", args.encoding))?;
    let ctx = RunContext {
        root_dir: args.root_dir.clone(),
        summary_path: args.summary.clone(),
        encoding,
        concurrent_batches: args
            .concurrent_batches
            .unwrap_or(spec.options.concurrent_batches),
    };

    let cancel = CancellationToken::new();
    let loader = orchestrator::load(&ctx, &spec, cancel.clone());
    tokio::pin!(loader);

    let bundle = tokio::select! {
        _ = signal::ctrl_c() => {
            println!("\nReceived Ctrl-C, shutting down...");
            cancel.cancel();
            // workers stop at their next suspension point; collect what ran
            loader.await?
        }
        bundle = &mut loader => bundle?,
    };

    let label = spec.name.as_deref().unwrap_or("load");
    let report = render_summary(label, &bundle);
    print!("{}", report);
    if let Some(path) = &ctx.summary_path {
        std::fs::write(path, &report)?;
    }
    Ok(())
}
