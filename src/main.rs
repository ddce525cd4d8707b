use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use jobpilot::config::AppConfig;
use jobpilot::context::AppContext;
use jobpilot::core::{
    BatchEvent, BatchHandle, JobKind, JobStatus, ListedJob, PipelineEvent, PipelineHandle,
    PipelineOutcome, StageSpec, TrackerEvent, TrackerHandle,
};
use jobpilot::logging::{self, LogConfig};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

const EVENT_BUFFER: usize = 64;

#[derive(Parser)]
#[command(name = "jobpilot")]
#[command(about = "Follows long-running remote jobs and batches", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    overrides: GlobalArgs,

    /// Config file (defaults to ./jobpilot.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,

    #[serde(rename = "api_base_url", skip_serializing_if = "Option::is_none")]
    #[arg(long = "api-url", global = true)]
    api_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resume the newest in-flight training job and follow it
    Daemon,
    /// Follow a job that was started elsewhere
    Track {
        job_id: String,
        #[arg(long, value_enum)]
        kind: JobKind,
    },
    /// Start a single job and follow it
    Start {
        #[arg(long, value_enum)]
        kind: JobKind,
        /// Start parameters as JSON
        #[arg(long, value_parser = parse_json)]
        params: Value,
    },
    /// Generate an image, then upscale it
    Generate {
        #[arg(long, value_parser = parse_json)]
        params: Value,
        #[arg(long)]
        no_upscale: bool,
    },
    /// Upscale the image of an earlier generation result
    Upscale {
        #[arg(long, value_parser = parse_json)]
        from_result: Value,
    },
    /// Start a batch and follow it until every item finished
    Batch {
        /// Parameters shared by every item, as a JSON object
        #[arg(long, value_parser = parse_json, default_value = "{}")]
        shared: Value,
        /// One JSON value per item
        #[arg(long = "item", value_parser = parse_json, required = true)]
        items: Vec<Value>,
    },
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;
    logging::init(LogConfig::from(&config));

    let ctx = AppContext::new(config).context("Failed to set up job service backend")?;

    let (tracker_tx, tracker_rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(log_events("tracker", tracker_rx));

    let resumed = if matches!(cli.command, Commands::Daemon) || ctx.config.resume_on_start {
        resume(&ctx, tracker_tx.clone()).await
    } else {
        None
    };

    let outcome = match cli.command {
        Commands::Daemon => run_daemon(resumed).await,
        Commands::Track { job_id, kind } => {
            let listed = ListedJob {
                job_id,
                kind,
                status: JobStatus::Starting,
                created_at: Utc::now(),
            };
            let handle = ctx.tracker.resume(&listed, tracker_tx.clone());
            ctx.slots.occupy(handle.clone());
            follow_job(handle).await
        }
        Commands::Start { kind, params } => {
            let handle = ctx
                .slots
                .launch(&ctx.tracker, kind, &params, tracker_tx.clone())
                .await
                .with_context(|| format!("Failed to start {kind} job"))?;
            follow_job(handle).await
        }
        Commands::Generate { params, no_upscale } => {
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            tokio::spawn(log_events("pipeline", rx));
            let pipeline = ctx.pipeline();
            let handle = if no_upscale {
                pipeline.run(vec![StageSpec::fixed(JobKind::Generation, params)], tx)
            } else {
                pipeline.generate_and_upscale(params, tx)
            }?;
            follow_pipeline(handle).await
        }
        Commands::Upscale { from_result } => {
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            tokio::spawn(log_events("pipeline", rx));
            let handle = ctx.pipeline().replay_upscale(from_result, tx)?;
            follow_pipeline(handle).await
        }
        Commands::Batch { shared, items } => {
            let Value::Object(shared) = shared else {
                bail!("--shared must be a JSON object");
            };
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            tokio::spawn(log_events("batch", rx));
            let handle = ctx.batches().start(shared, items, tx).await?;
            follow_batch(handle).await
        }
    };

    ctx.slots.cancel_all();
    outcome
}

async fn resume(ctx: &AppContext, events: mpsc::Sender<TrackerEvent>) -> Option<TrackerHandle> {
    match ctx.resumption().run(events).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "Resumption skipped");
            None
        }
    }
}

async fn run_daemon(resumed: Option<TrackerHandle>) -> Result<()> {
    match resumed {
        Some(handle) => follow_job(handle).await,
        None => {
            info!("Nothing to follow");
            Ok(())
        }
    }
}

async fn follow_job(handle: TrackerHandle) -> Result<()> {
    let job = tokio::select! {
        job = handle.wait() => job,
        _ = tokio::signal::ctrl_c() => {
            info!(job_id = %handle.job_id(), "Interrupted, the remote job keeps running");
            handle.cancel();
            return Ok(());
        }
    };

    match job.status {
        JobStatus::Succeeded => {
            print_json(&job.result)?;
            Ok(())
        }
        status if status.is_terminal() => bail!(
            "{} job {} ended {}: {}",
            job.kind,
            job.id,
            status,
            job.error.unwrap_or_default()
        ),
        _ => Ok(()),
    }
}

async fn follow_pipeline(handle: PipelineHandle) -> Result<()> {
    let cancel = handle.cancel_token();
    let wait = handle.wait();
    tokio::pin!(wait);

    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling pipeline");
            cancel.cancel();
            wait.await
        }
    }
    .context("Pipeline task panicked")?;

    match outcome {
        PipelineOutcome::Finished { result } => print_json(&result),
        PipelineOutcome::Halted { stage, kind, error } => {
            bail!("pipeline halted at stage {stage} ({kind}): {error}")
        }
        PipelineOutcome::Cancelled { stage } => {
            info!(stage, "Pipeline cancelled");
            Ok(())
        }
    }
}

async fn follow_batch(handle: BatchHandle) -> Result<()> {
    let batch = tokio::select! {
        batch = handle.wait() => batch,
        _ = tokio::signal::ctrl_c() => {
            info!(batch_id = %handle.batch_id(), "Interrupted, the remote batch keeps running");
            handle.cancel();
            return Ok(());
        }
    };

    if let Some(error) = &batch.error {
        bail!("batch {} could not be followed: {error}", batch.id);
    }
    print_json(&batch)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

trait EventName {
    fn name(&self) -> &'static str;
}

impl EventName for TrackerEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Attached { .. } => "attached",
            Self::StatusChanged { .. } => "statusChanged",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

impl EventName for PipelineEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::StageStarted { .. } => "stageStarted",
            Self::Stage { .. } => "stage",
            Self::Halted { .. } => "halted",
            Self::Finished { .. } => "finished",
        }
    }
}

impl EventName for BatchEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::ItemChanged { .. } => "itemChanged",
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

async fn log_events<E: EventName + Serialize>(source: &'static str, mut rx: mpsc::Receiver<E>) {
    while let Some(event) = rx.recv().await {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(source, event = event.name(), payload = %payload, "Event");
    }
}
