//! Deep-scan worker.
//!
//! `tick` runs one orchestrator invocation and exits, for hosts that invoke
//! it on a schedule. `serve` keeps running and fires ticks from a cron
//! expression. The remaining subcommands are the caller-facing operations.
//! Results are printed as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use deep_scan::{
    AiExtractor, DisabledExtractor, GmailConnector, IncrementalSync, OpenAiExtractor,
    PostgresStore, ScanControl, ScanDeps, ScanOrchestrator, WorkerConfig,
};

#[derive(Parser)]
#[command(name = "scan_worker")]
#[command(about = "Resumable mailbox scanning for invoices and receipts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Run one orchestrator invocation over all active scans
    Tick,

    /// Run ticks and incremental syncs on the configured cron schedule
    Serve,

    /// Start a deep scan for a mailbox
    Start { mailbox_id: Uuid },

    /// Show the latest scan for an account
    Status { account_id: Uuid },

    /// Pause a scan
    Pause { job_id: Uuid },

    /// Resume a paused scan
    Resume { job_id: Uuid },

    /// Run incremental sync for one mailbox, or all of them
    Sync {
        #[arg(long)]
        mailbox_id: Option<Uuid>,
    },
}

#[derive(Serialize)]
struct Response<T: Serialize> {
    success: bool,
    data: T,
}

fn output<T: Serialize>(data: T) -> Result<()> {
    let resp = Response {
        success: true,
        data,
    };
    println!("{}", serde_json::to_string(&resp)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,deep_scan=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env()?;

    let store = Arc::new(
        PostgresStore::new(&config.database_url)
            .await
            .context("Failed to connect to database")?,
    );

    if let Commands::Migrate = cli.command {
        store.migrate().await.context("Failed to run migrations")?;
        return output("migrations applied");
    }

    let ai: Arc<dyn AiExtractor> = match &config.openai_api_key {
        Some(key) => Arc::new(OpenAiExtractor::new(key.clone(), config.openai_model.clone())),
        None => {
            tracing::warn!("OPENAI_API_KEY not set, AI enrichment disabled");
            Arc::new(DisabledExtractor)
        }
    };
    let deps = ScanDeps::new(
        store,
        Arc::new(GmailConnector::new(config.gmail_api_base.clone())),
        ai,
        config.scan.clone(),
    );

    match cli.command {
        Commands::Migrate => Ok(()),
        Commands::Tick => output(ScanOrchestrator::new(deps).tick().await?),
        Commands::Serve => serve(deps, &config.tick_schedule).await,
        Commands::Start { mailbox_id } => {
            let job_id = ScanControl::new(deps).start(mailbox_id).await?;
            output(job_id)
        }
        Commands::Status { account_id } => {
            output(ScanControl::new(deps).status(account_id).await?)
        }
        Commands::Pause { job_id } => output(ScanControl::new(deps).pause(job_id).await?.progress()),
        Commands::Resume { job_id } => output(ScanControl::new(deps).resume(job_id).await?),
        Commands::Sync { mailbox_id } => {
            let sync = IncrementalSync::new(deps);
            match mailbox_id {
                Some(id) => output(vec![sync.sync_mailbox(id).await?]),
                None => output(sync.sync_all().await?),
            }
        }
    }
}

async fn serve(deps: ScanDeps, schedule: &str) -> Result<()> {
    let orchestrator = Arc::new(ScanOrchestrator::new(deps.clone()));
    let sync = Arc::new(IncrementalSync::new(deps));

    let scheduler = JobScheduler::new().await?;
    let tick_job = Job::new_async(schedule, move |_uuid, _lock| {
        let orchestrator = orchestrator.clone();
        let sync = sync.clone();
        Box::pin(async move {
            if let Err(e) = orchestrator.tick().await {
                tracing::error!(error = %e, "Scan tick failed");
            }
            if let Err(e) = sync.sync_all().await {
                tracing::error!(error = %e, "Incremental sync failed");
            }
        })
    })
    .with_context(|| format!("Invalid tick schedule: {}", schedule))?;

    scheduler.add(tick_job).await?;
    scheduler.start().await?;
    tracing::info!(schedule, "Scan worker started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down scan worker");

    let mut scheduler = scheduler;
    scheduler.shutdown().await?;
    Ok(())
}
