//! Operator CLI
//!
//! Drives the job-execution core directly over the coordination store:
//! scheduler control, dead-letter recovery, autoscaler history and worker
//! health.
//!
//! Exit codes: 0 = healthy/success, 1 = degraded/partial, 2 = critical or
//! usage error.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use uuid::Uuid;

use server_core::kernel::collaborators;
use server_core::kernel::health::WorkerStatus;
use server_core::kernel::jobs::recovery::{RecoveryReport, RecoveryWorker};
use server_core::kernel::jobs::{JobQueue, QueueName};
use server_core::kernel::runtime::Runtime;
use server_core::kernel::scheduler::TaskRunOutcome;
use server_core::Config;

// =============================================================================
// CLI Arguments (clap)
// =============================================================================

#[derive(Parser)]
#[command(name = "ops")]
#[command(about = "Operator CLI - scheduler, dead-letter recovery, scaling, health")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cron-scheduler control
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },

    /// Dead-letter queue recovery
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },

    /// Autoscaler decisions per queue
    Autoscaler {
        #[command(subcommand)]
        action: AutoscalerAction,
    },

    /// Worker fleet health
    Workers {
        #[command(subcommand)]
        action: WorkersAction,
    },
}

#[derive(Subcommand)]
enum SchedulerAction {
    /// Show every scheduled task with its last execution
    Status,
    /// Run one task immediately (under the fleet-wide lock)
    RunNow { task: String },
    /// Enable a task fleet-wide
    Enable { task: String },
    /// Disable a task fleet-wide
    Disable { task: String },
}

#[derive(Subcommand)]
enum DlqAction {
    /// Recover entries: `recover batch <N>` or `recover <job-id>`
    Recover {
        /// "batch" or a dead-lettered job id
        target: String,
        /// Batch size when target is "batch"
        limit: Option<usize>,
    },
    /// Remove entries older than the given age in hours
    Cleanup { age_hours: u64 },
}

#[derive(Subcommand)]
enum AutoscalerAction {
    /// Recent scaling decisions and current queue depths
    Show,
}

#[derive(Subcommand)]
enum WorkersAction {
    /// Health report derived from heartbeats and queue counts
    Health {
        #[arg(long)]
        json: bool,
    },
}

// =============================================================================
// Entry point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::from_env().context("failed to load configuration")?;
    let runtime = Runtime::connect(config, collaborators::placeholders())
        .await
        .context("failed to reach the coordination store")?;

    match cli.command {
        Commands::Scheduler { action } => scheduler_cmd(&runtime, action).await,
        Commands::Dlq { action } => dlq_cmd(&runtime, action).await,
        Commands::Autoscaler { action } => autoscaler_cmd(&runtime, action).await,
        Commands::Workers { action } => workers_cmd(&runtime, action).await,
    }
}

// =============================================================================
// Scheduler
// =============================================================================

async fn scheduler_cmd(runtime: &Runtime, action: SchedulerAction) -> Result<ExitCode> {
    let scheduler = runtime.scheduler();

    match action {
        SchedulerAction::Status => {
            let mut degraded = false;
            println!("{}", style("Scheduled tasks").bold());
            for task in scheduler.status().await? {
                let last = scheduler.history(&task.name, 1).await?;
                let (last_status, last_run) = match last.first() {
                    Some(entry) => (entry.status.clone(), entry.started_at.to_rfc3339()),
                    None => ("never run".to_string(), "-".to_string()),
                };
                if last_status == "failed" {
                    degraded = true;
                }

                let enabled = if task.enabled {
                    style("enabled").green()
                } else {
                    style("disabled").yellow()
                };
                println!(
                    "  {:<28} {:<10} cron={:<16} last={} ({})",
                    task.name, enabled, task.cron, last_status, last_run
                );
            }
            Ok(exit(degraded))
        }
        SchedulerAction::RunNow { task } => {
            match scheduler.run_task(&task).await? {
                TaskRunOutcome::Completed { duration_ms } => {
                    println!("{} {task} ({duration_ms} ms)", style("completed").green());
                    Ok(ExitCode::SUCCESS)
                }
                TaskRunOutcome::Failed { error } => {
                    println!("{} {task}: {error}", style("failed").red());
                    Ok(ExitCode::from(1))
                }
                TaskRunOutcome::Skipped => {
                    println!("{} {task}: another instance has the lock", style("skipped").yellow());
                    Ok(ExitCode::SUCCESS)
                }
                TaskRunOutcome::Disabled => {
                    println!("{} {task} is disabled", style("skipped").yellow());
                    Ok(ExitCode::from(1))
                }
            }
        }
        SchedulerAction::Enable { task } => {
            scheduler.enable(&task).await?;
            println!("{} {task}", style("enabled").green());
            Ok(ExitCode::SUCCESS)
        }
        SchedulerAction::Disable { task } => {
            scheduler.disable(&task).await?;
            println!("{} {task}", style("disabled").yellow());
            Ok(ExitCode::SUCCESS)
        }
    }
}

// =============================================================================
// Dead-letter recovery
// =============================================================================

async fn dlq_cmd(runtime: &Runtime, action: DlqAction) -> Result<ExitCode> {
    let deps = runtime.deps();
    let worker = RecoveryWorker::new(
        deps.dead_letter.clone(),
        deps.job_manager.clone(),
        deps.failure_sink.clone(),
        deps.admin_notification_channel.clone(),
    );

    let report = match action {
        DlqAction::Recover { target, limit } => {
            if target == "batch" {
                worker.process_batch(limit.unwrap_or(25)).await?
            } else {
                let job_id: Uuid = target
                    .parse()
                    .context("target must be \"batch\" or a job id")?;
                worker.process_single(job_id).await?
            }
        }
        DlqAction::Cleanup { age_hours } => worker.cleanup(age_hours).await?,
    };

    print_recovery_report(&report);
    Ok(exit(!report.notified.is_empty()))
}

fn print_recovery_report(report: &RecoveryReport) {
    println!(
        "processed={} retried={} notified={} waiting_backoff={} cleaned={}",
        report.processed,
        report.retried.len(),
        report.notified.len(),
        report.waiting_backoff,
        report.cleaned
    );
    for (original, new_id) in &report.retried {
        println!("  {} {original} -> {new_id}", style("retried").green());
    }
    for (job_id, reason) in &report.notified {
        println!("  {} {job_id} [{}]", style("permanent").red(), reason.as_str());
    }
}

// =============================================================================
// Autoscaler
// =============================================================================

async fn autoscaler_cmd(runtime: &Runtime, action: AutoscalerAction) -> Result<ExitCode> {
    let AutoscalerAction::Show = action;
    let autoscaler = runtime.autoscaler();
    let deps = runtime.deps();

    println!("{}", style("Autoscaler").bold());
    for queue in autoscaler.scaled_queues() {
        let counts = deps.job_manager.queue(queue)?.job_counts().await?;
        println!(
            "  {:<16} waiting={:<5} active={:<4} desired={}",
            queue.as_str(),
            counts.waiting,
            counts.active,
            autoscaler.desired(queue)
        );
        for decision in autoscaler.history(queue, 3).await? {
            println!(
                "    {} {:?} {} -> {} ({})",
                decision.timestamp.to_rfc3339(),
                decision.action,
                decision.current,
                decision.target,
                decision.reason
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// Worker health
// =============================================================================

async fn workers_cmd(runtime: &Runtime, action: WorkersAction) -> Result<ExitCode> {
    let WorkersAction::Health { json } = action;

    // One row per registered worker instance, fleet-wide: the monitor
    // lists autoscaled instances ("orchestration-2", ...) registered by
    // other processes alongside the base workers.
    let reports = runtime.health().report().await?;

    if reports.is_empty() {
        println!("{}", style("no workers registered").yellow());
        return Ok(ExitCode::from(1));
    }

    let degraded = reports.iter().any(|r| r.status != WorkerStatus::Healthy);

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!("{}", style("Worker health").bold());
        for report in &reports {
            let styled = match report.status {
                WorkerStatus::Healthy => style("healthy").green(),
                WorkerStatus::Stalled => style("stalled").red(),
                WorkerStatus::Stopped => style("stopped").yellow(),
            };
            println!(
                "  {:<20} {:<10} processed={:<6} failed={:<5} mean_ms={:<6} active={}",
                report.name,
                styled,
                report.jobs_processed,
                report.jobs_failed,
                report.mean_processing_ms,
                report.active_jobs
            );
        }
    }

    Ok(exit(degraded))
}

fn exit(degraded: bool) -> ExitCode {
    if degraded {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
