//! kernel-resume CLI entry point.
//!
//! Inspection tooling: probe the direct kernel transport and read the
//! execution records kept for notebooks running on remote kernels.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kernel_resume::memento::FileMemento;
use kernel_resume::settings::load_settings;
use kernel_resume::tracker::{load_record, record_key, ExecutionRecord, RECORD_KEY_PREFIX};
use kernel_resume::{LogTelemetry, LoopbackTransport, Memento, RawTransportSupport};
use log::debug;

#[derive(Parser, Debug)]
#[command(name = "kernel-resume")]
#[command(about = "Inspect long-running cell execution records")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Memento file (default: from settings, or the data directory)
    #[arg(long, global = true)]
    memento: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check whether local kernels can use the direct transport
    Probe {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List execution records for all notebooks
    Records {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the execution record for one notebook
    Show {
        /// Notebook URI
        uri: String,
    },

    /// Delete the execution record for one notebook
    Forget {
        /// Notebook URI
        uri: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let memento_path = cli
        .memento
        .clone()
        .unwrap_or_else(|| load_settings().memento_path());
    debug!("Using memento {}", memento_path.display());

    match cli.command {
        Commands::Probe { json } => probe(json).await,
        Commands::Records { json } => records(memento_path, json).await,
        Commands::Show { uri } => show(memento_path, &uri).await,
        Commands::Forget { uri } => forget(memento_path, &uri).await,
    }
}

async fn probe(json: bool) -> anyhow::Result<()> {
    let support = RawTransportSupport::new(
        Box::new(LoopbackTransport::default()),
        Arc::new(LogTelemetry),
    );
    let supported = support.is_supported().await;

    if json {
        let output = serde_json::json!({ "raw_transport_supported": supported });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "Direct kernel transport: {}",
            if supported { "supported" } else { "not supported" }
        );
    }
    Ok(())
}

async fn records(memento_path: PathBuf, json: bool) -> anyhow::Result<()> {
    let memento = FileMemento::open(&memento_path).await?;
    let records: Vec<_> = memento
        .keys()
        .into_iter()
        .filter_map(|key| {
            let uri = key.strip_prefix(RECORD_KEY_PREFIX)?.to_string();
            let record = load_record(&memento, &uri)?;
            Some((uri, record))
        })
        .collect();

    if json {
        let output: BTreeMap<String, ExecutionRecord> = records.into_iter().collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No execution records in {}", memento_path.display());
        return Ok(());
    }
    println!("Execution records ({})", memento_path.display());
    println!("=================");
    for (uri, record) in records {
        println!("{}", uri);
        println!("  Cell:      {}", record.cell_index);
        println!("  Execution: {}", record.execution_id);
        println!("  Kernel:    {}", record.kernel_id);
    }
    Ok(())
}

async fn show(memento_path: PathBuf, uri: &str) -> anyhow::Result<()> {
    let memento = FileMemento::open(&memento_path).await?;
    match load_record(&memento, uri) {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("No execution record for {}", uri),
    }
    Ok(())
}

async fn forget(memento_path: PathBuf, uri: &str) -> anyhow::Result<()> {
    let memento = FileMemento::open(&memento_path).await?;
    if memento.get(&record_key(uri)).is_none() {
        println!("No execution record for {}", uri);
        return Ok(());
    }
    memento
        .update(&record_key(uri), serde_json::Value::Null)
        .await?;
    println!("Removed execution record for {}", uri);
    Ok(())
}
