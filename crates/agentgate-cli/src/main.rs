mod config;
mod demo;
mod store;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chrono::Utc;

use agentgate_core::clock::SystemHostProbe;
use agentgate_core::collaborators::RunListFilter;
use agentgate_core::errors::OperationalError;
use agentgate_core::model::{RunResult, WorkOrder, WorkOrderId, WorkOrderStatus, WorkspaceSource};
use agentgate_core::orchestrator::{AgentDriverRegistry, Orchestrator, OrchestratorConfig};
use agentgate_core::admission::AdmissionConfig;
use agentgate_core::strategy::fixed::FixedStrategy;

use config::{AgentGateConfig, CliOverrides};
use store::{FileBackedPersistenceStore, WorkOrderRecord};

#[derive(Parser)]
#[command(name = "agentgate", about = "Thin demonstration CLI over the AgentGate orchestration engine")]
struct Cli {
    /// Override orchestrator.max_concurrent_runs (env: AGENTGATE_MAX_CONCURRENT_RUNS)
    #[arg(long, global = true)]
    max_concurrent_runs: Option<usize>,
    /// Override orchestrator.max_queue_size (env: AGENTGATE_MAX_QUEUE_SIZE)
    #[arg(long, global = true)]
    max_queue_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a work order. By default it runs synchronously to completion
    /// (bypassing the queue, §6 "exec now"); pass --enqueue to persist it as
    /// queued and return immediately instead.
    Submit {
        /// The task prompt handed to the agent driver.
        prompt: String,
        /// Local workspace path to operate on (a fresh git repo is used if omitted).
        #[arg(long)]
        workspace_path: Option<String>,
        /// Maximum BUILD-VERIFY iterations for this run.
        #[arg(long, default_value_t = 1)]
        max_iterations: u32,
        /// Persist as queued and return immediately instead of running now.
        #[arg(long)]
        enqueue: bool,
    },
    /// Run every persisted work order still in the `queued` status to
    /// completion, through the real admission controller (stagger/memory
    /// gates included).
    Drain,
    /// Show a persisted work order's current status and last run.
    Status {
        work_order_id: String,
    },
    /// List persisted work orders, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Cancel a queued work order.
    Cancel {
        work_order_id: String,
    },
    /// Kill a work order (best-effort against this single-shot binary's
    /// process-local state; see DESIGN.md).
    Kill {
        work_order_id: String,
        #[arg(long)]
        force: bool,
    },
    /// Delete terminal work order records older than --older-than-days.
    Purge {
        #[arg(long, value_delimiter = ',')]
        status: Vec<String>,
        #[arg(long, default_value_t = 0)]
        older_than_days: i64,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print a queue health snapshot for a freshly constructed orchestrator.
    QueueHealth,
}

fn cli_overrides(cli: &Cli) -> CliOverrides {
    CliOverrides {
        max_concurrent_runs: cli.max_concurrent_runs,
        max_queue_size: cli.max_queue_size,
        stagger_delay_ms: None,
        min_available_memory_mb: None,
    }
}

fn build_orchestrator(resolved: &AgentGateConfig) -> Arc<Orchestrator> {
    let mut drivers = AgentDriverRegistry::new();
    drivers.register(Arc::new(demo::DemoAgentDriver));

    let data_dir = config::data_dir();
    let persistence = Arc::new(FileBackedPersistenceStore::new(data_dir));

    Orchestrator::new(
        OrchestratorConfig {
            max_concurrent_runs: resolved.max_concurrent_runs,
            max_queue_size: resolved.max_queue_size,
            admission: AdmissionConfig {
                stagger_delay_ms: resolved.stagger_delay_ms,
                min_available_memory_mb: resolved.min_available_memory_mb,
                tick_interval: Duration::from_millis(200),
            },
            lease_renew_interval: Duration::from_secs(30),
            retries_enabled: true,
            default_kill_grace: Duration::from_secs(5),
            stale: agentgate_core::stale::StaleDetectorConfig::default(),
        },
        Arc::new(SystemHostProbe),
        persistence,
        Arc::new(demo::DemoWorkspaceManager),
        Arc::new(demo::DemoGatePlanResolver),
        drivers,
        Arc::new(demo::DemoVerifier),
        Arc::new(demo::DemoFeedbackGenerator),
        None,
        Some(Arc::new(FixedStrategy)),
        Arc::new(|_event| {}),
    )
}

fn new_work_order(prompt: String, workspace_path: Option<String>, max_iterations: u32) -> WorkOrder {
    let source = match workspace_path {
        Some(path) => WorkspaceSource::LocalPath { path },
        None => WorkspaceSource::FreshTemplate,
    };
    let mut work_order = WorkOrder::new_root(prompt, source);
    work_order.agent_type = "demo".to_string();
    work_order.max_iterations = max_iterations.max(1);
    work_order
}

fn parse_work_order_id(raw: &str) -> Result<WorkOrderId> {
    raw.parse::<WorkOrderId>().with_context(|| format!("invalid work order id: {raw}"))
}

fn parse_status(raw: &str) -> Result<WorkOrderStatus> {
    raw.parse::<WorkOrderStatus>().map_err(|e| anyhow::anyhow!("{e}"))
}

async fn cmd_submit(resolved: &AgentGateConfig, prompt: String, workspace_path: Option<String>, max_iterations: u32, enqueue: bool) -> Result<()> {
    let data_dir = config::data_dir();
    let work_order = new_work_order(prompt, workspace_path, max_iterations);
    let id = work_order.id;

    if enqueue {
        let record = WorkOrderRecord {
            work_order: work_order.clone(),
            status: WorkOrderStatus::Queued,
            last_run: None,
            updated_at: Utc::now(),
        };
        store::save_record(&data_dir, &record)?;
        println!("queued {id}");
        return Ok(());
    }

    let record = WorkOrderRecord {
        work_order: work_order.clone(),
        status: WorkOrderStatus::Running,
        last_run: None,
        updated_at: Utc::now(),
    };
    store::save_record(&data_dir, &record)?;

    let orchestrator = build_orchestrator(resolved);
    let run = orchestrator.execute_now(work_order).await?;
    print_run_summary(id, run.result);

    let status = match run.result {
        RunResult::Passed => WorkOrderStatus::Succeeded,
        RunResult::Canceled => WorkOrderStatus::Canceled,
        _ => WorkOrderStatus::Failed,
    };
    if let Some(mut record) = store::load_record(&data_dir, id)? {
        record.status = status;
        record.last_run = Some(run.clone());
        record.updated_at = Utc::now();
        store::save_record(&data_dir, &record)?;
    }

    if !matches!(run.result, RunResult::Passed) {
        anyhow::bail!("run did not succeed: {:?}", run.result);
    }
    Ok(())
}

async fn cmd_drain(resolved: &AgentGateConfig) -> Result<()> {
    let data_dir = config::data_dir();
    let queued: Vec<WorkOrder> = store::list_records(&data_dir)?
        .into_iter()
        .filter(|r| r.status == WorkOrderStatus::Queued)
        .map(|r| r.work_order)
        .collect();

    if queued.is_empty() {
        println!("nothing queued");
        return Ok(());
    }

    let orchestrator = build_orchestrator(resolved);
    let _admission_loop = orchestrator.spawn_admission_loop();
    let _stale_loop = orchestrator.spawn_stale_detector_loop();

    let mut ids = Vec::new();
    for work_order in queued {
        ids.push(orchestrator.submit(work_order)?);
    }

    let mut any_failed = false;
    for id in ids {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
        loop {
            let terminal = orchestrator.get(id).map(|wo| wo.status.is_terminal()).unwrap_or(true);
            if terminal {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("work order {id} never reached a terminal status");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let status = orchestrator.get(id).map(|wo| wo.status).unwrap_or(WorkOrderStatus::Failed);
        if status != WorkOrderStatus::Succeeded {
            any_failed = true;
        }
        println!("{id}: {status}");
    }

    if any_failed {
        anyhow::bail!("one or more drained work orders did not succeed");
    }
    Ok(())
}

fn print_run_summary(work_order_id: WorkOrderId, result: RunResult) {
    println!("work_order_id = {work_order_id}");
    println!("result = {result:?}");
}

fn cmd_status(work_order_id: &str) -> Result<()> {
    let id = parse_work_order_id(work_order_id)?;
    match store::load_record(&config::data_dir(), id)? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => anyhow::bail!(OperationalError::WorkOrderNotFound),
    }
}

fn cmd_list(status: Option<&str>) -> Result<()> {
    let filter_status = status.map(parse_status).transpose()?;
    let _unused = RunListFilter::default();
    let mut records = store::list_records(&config::data_dir())?;
    if let Some(status) = filter_status {
        records.retain(|r| r.status == status);
    }
    records.sort_by_key(|r| r.work_order.created_at);
    for record in records {
        println!("{}  {}  {}", record.work_order.id, record.status, record.work_order.task_prompt);
    }
    Ok(())
}

/// Cancel semantics for this single-shot binary: only a still-`queued`
/// record can be canceled, since a `running` record means some earlier
/// process's orchestrator owns the live cancellation token and this
/// process has none (restart reconciliation is out of scope, §9).
fn cmd_cancel(work_order_id: &str) -> Result<()> {
    let id = parse_work_order_id(work_order_id)?;
    let data_dir = config::data_dir();
    let mut record = store::load_record(&data_dir, id)?.ok_or(OperationalError::WorkOrderNotFound)?;
    if record.status != WorkOrderStatus::Queued {
        anyhow::bail!(OperationalError::Conflict(record.status));
    }
    record.status = WorkOrderStatus::Canceled;
    record.work_order.status = WorkOrderStatus::Canceled;
    record.updated_at = Utc::now();
    store::save_record(&data_dir, &record)?;
    println!("{id}: canceled");
    Ok(())
}

fn cmd_kill(work_order_id: &str, force: bool) -> Result<()> {
    let _ = force;
    cmd_cancel(work_order_id)
}

fn cmd_purge(statuses: &[String], older_than_days: i64, dry_run: bool) -> Result<()> {
    let wanted: Vec<WorkOrderStatus> = if statuses.is_empty() {
        vec![WorkOrderStatus::Succeeded, WorkOrderStatus::Failed, WorkOrderStatus::Canceled]
    } else {
        statuses.iter().map(|s| parse_status(s)).collect::<Result<_>>()?
    };
    let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
    let data_dir = config::data_dir();

    let matches: Vec<WorkOrderId> = store::list_records(&data_dir)?
        .into_iter()
        .filter(|r| r.status.is_terminal() && wanted.contains(&r.status) && r.work_order.created_at < cutoff)
        .map(|r| r.work_order.id)
        .collect();

    for id in &matches {
        println!("{id}");
        if !dry_run {
            store::delete_record(&data_dir, *id)?;
        }
    }
    Ok(())
}

fn cmd_queue_health(resolved: &AgentGateConfig) -> Result<()> {
    let orchestrator = build_orchestrator(resolved);
    let health = orchestrator.queue_health();
    println!("{health:#?}");
    Ok(())
}

/// Map an error surfaced from `main` to the exit-code convention (§6): 0
/// success, 1 operation failed/validation, 2 concurrency/queue refused.
fn classify_exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<OperationalError>() {
        Some(op_err) => op_err.exit_code() as u8,
        None => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let resolved = AgentGateConfig::resolve(&cli_overrides(&cli));

    let result = match cli.command {
        Commands::Submit { prompt, workspace_path, max_iterations, enqueue } => {
            cmd_submit(&resolved, prompt, workspace_path, max_iterations, enqueue).await
        }
        Commands::Drain => cmd_drain(&resolved).await,
        Commands::Status { work_order_id } => cmd_status(&work_order_id),
        Commands::List { status } => cmd_list(status.as_deref()),
        Commands::Cancel { work_order_id } => cmd_cancel(&work_order_id),
        Commands::Kill { work_order_id, force } => cmd_kill(&work_order_id, force),
        Commands::Purge { status, older_than_days, dry_run } => cmd_purge(&status, older_than_days, dry_run),
        Commands::QueueHealth => cmd_queue_health(&resolved),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(classify_exit_code(&err))
        }
    }
}
