use anyhow::Context;
use clap::{Parser, Subcommand};
use cull_orchestrator::{ExportFormat, FsStore, Metrics, Orchestrator, PipelineConfig, PipelinePlan};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable point-cloud reduction against vector constraints.")]
struct Cli {
    /// Root directory of the chunk store.
    #[arg(long, env = "CULL_STORE_DIR", default_value = "./cull-store")]
    store: PathBuf,

    /// Serve Prometheus metrics on this address while the command runs.
    #[arg(long, env = "CULL_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(flatten)]
    pipeline: PipelineConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a point source (.asc, .xyz, .txt, .csv, .vtxc) as a dataset's raw stage.
    Ingest {
        #[arg(long)]
        dataset: String,
        input: PathBuf,
    },
    /// Run every stage of a JSON plan, resuming from whatever is stored.
    Run { plan: PathBuf },
    /// Print per-stage progress of a plan as JSON.
    Status { plan: PathBuf },
    /// Write a dataset's final stage out of the store.
    Export {
        #[arg(long)]
        dataset: String,
        #[arg(long, value_enum, default_value_t = ExportFormat::Xyz)]
        format: ExportFormat,
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    tracing::info!(store = %cli.store.display(), config = ?cli.pipeline, "Loaded configuration");

    let metrics = Arc::new(Metrics::new());
    let metrics_handle = cli.metrics_addr.map(|addr| {
        let router = metrics.router();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(%addr, "Serving metrics");
            axum::serve(listener, router.into_make_service()).await?;
            Ok::<(), anyhow::Error>(())
        })
    });

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Shutdown signal received; stopping after in-flight chunks");
        let _ = cancel_tx.send(true);
    });

    let orch = Orchestrator::new(FsStore::new(&cli.store), cli.pipeline.clone(), metrics)
        .with_cancel(cancel_rx);

    let result = execute(&orch, cli.command).await;

    if let Some(handle) = metrics_handle {
        handle.abort();
    }
    result
}

async fn execute(orch: &Orchestrator, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ingest { dataset, input } => {
            let report = orch
                .ingest(&dataset, &input)
                .await
                .with_context(|| format!("Failed to ingest {}", input.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run { plan } => {
            let plan = PipelinePlan::from_path(&plan)
                .with_context(|| format!("Failed to load plan {}", plan.display()))?;
            let report = orch
                .run(&plan)
                .await
                .with_context(|| format!("Pipeline run for '{}' failed", plan.dataset))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status { plan } => {
            let plan = PipelinePlan::from_path(&plan)
                .with_context(|| format!("Failed to load plan {}", plan.display()))?;
            let status = orch.status(&plan).await.context("Failed to read status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Export { dataset, format, out } => {
            let written = orch
                .export(&dataset, &out, format)
                .await
                .with_context(|| format!("Failed to export '{dataset}' to {}", out.display()))?;
            tracing::info!(dataset, written, "Export written");
        }
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
