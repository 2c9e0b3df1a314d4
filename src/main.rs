use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use batchpool::config::{ExecutorConfig, SchedulerConfig, TimeoutPolicy};
use batchpool::dashboard::{run_dashboard, DashboardState};
use batchpool::manifest::ManifestWriter;
use batchpool::scheduler::Dispatcher;
use batchpool::shutdown::install_shutdown_handler;
use batchpool::source::load_payloads;
use batchpool::status::{LogStatusSink, StatusSink, StatusSnapshot};
use batchpool::worker::CommandExecutor;

#[derive(Parser, Debug)]
#[command(name = "batchpool")]
#[command(version)]
#[command(about = "Run a fixed batch of jobs across a bounded worker pool")]
struct Args {
    /// Job source: one payload per line, or a CSV whose first column holds them
    #[arg(long, short = 's')]
    source: PathBuf,

    /// Directory artifacts are written into
    #[arg(long, short = 'o', default_value = "output")]
    output_dir: PathBuf,

    /// Shell command run per job; {payload}, {output} and {index} are substituted
    #[arg(long)]
    command: Option<String>,

    /// Artifact file extension
    #[arg(long, default_value = "pdf")]
    extension: String,

    /// Per-job timeout in seconds
    #[arg(long, default_value = "300")]
    timeout_secs: u64,

    /// Maximum number of concurrent workers (default: host parallelism)
    #[arg(long, short = 'j')]
    concurrency: Option<usize>,

    /// Status refresh interval in milliseconds
    #[arg(long, default_value = "1000")]
    status_interval_ms: u64,

    /// Pause after each command before the artifact is checked, in milliseconds
    #[arg(long, default_value = "2000")]
    settle_delay_ms: u64,

    /// What to do with a worker whose job timed out
    #[arg(long, default_value = "recycle")]
    timeout_policy: PolicyArg,

    /// Write a JSON manifest of produced artifacts to this path
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Port for the JSON status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// How status is rendered while the batch runs
    #[arg(long, default_value = "console")]
    status: StatusMode,
}

#[derive(Debug, Clone, ValueEnum)]
enum PolicyArg {
    Recycle,
    Reuse,
}

impl From<PolicyArg> for TimeoutPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Recycle => TimeoutPolicy::Recycle,
            PolicyArg::Reuse => TimeoutPolicy::Reuse,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum StatusMode {
    Console,
    Log,
    None,
}

/// Redraws a job/worker table on stdout.
struct ConsoleStatusSink;

impl StatusSink for ConsoleStatusSink {
    fn render(&self, snapshot: &StatusSnapshot) {
        let mut out = std::io::stdout().lock();
        // Clear screen and home the cursor.
        let _ = write!(out, "\x1b[2J\x1b[H");

        let counts = &snapshot.counts;
        let _ = writeln!(
            out,
            "run {}  {}/{} processed  ({} completed, {} timed out, {} running, {} pending)",
            snapshot.run_id,
            counts.processed(),
            counts.total,
            counts.completed,
            counts.timed_out,
            counts.in_progress,
            counts.pending
        );
        let _ = writeln!(out);

        let _ = writeln!(out, "{:<12} {:<10} {:<6} STATUS", "WORKER", "STATE", "JOB");
        for worker in &snapshot.workers {
            let job = worker
                .current_job
                .map(|id| (id + 1).to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:<12} {:<10} {:<6} {}",
                worker.worker_id.to_string(),
                worker.lifecycle.to_string(),
                job,
                worker.status
            );
        }
        let _ = writeln!(out);

        let _ = writeln!(
            out,
            "{:<5} {:<12} {:>4} {:>9}  PAYLOAD",
            "JOB", "STATUS", "%", "TIME"
        );
        for job in &snapshot.jobs {
            let duration = job
                .duration_ms
                .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:<5} {:<12} {:>4} {:>9}  {}",
                job.id + 1,
                job.status.to_string(),
                job.progress,
                duration,
                job.payload
            );
        }

        if snapshot.finished {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "done: {} completed, {} timed out, {} total",
                counts.completed, counts.timed_out, counts.total
            );
        }
        let _ = out.flush();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr so the console table owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let payloads = load_payloads(&args.source).await?;
    tokio::fs::create_dir_all(&args.output_dir).await?;

    let mut scheduler_config = SchedulerConfig::default()
        .with_task_timeout(Duration::from_secs(args.timeout_secs))
        .with_status_interval(Duration::from_millis(args.status_interval_ms))
        .with_timeout_policy(args.timeout_policy.into());
    if let Some(concurrency) = args.concurrency {
        scheduler_config = scheduler_config.with_concurrency(concurrency);
    }

    let mut executor_config = ExecutorConfig::default()
        .with_extension(args.extension)
        .with_settle_delay(Duration::from_millis(args.settle_delay_ms));
    executor_config.output_dir = args.output_dir;
    if let Some(command) = args.command {
        executor_config.command = command;
    }

    let executor = Arc::new(CommandExecutor::new(executor_config));
    let manifest = Arc::new(ManifestWriter::new());
    let shutdown = install_shutdown_handler();

    let dispatcher = Dispatcher::new(scheduler_config, payloads, executor)?
        .with_artifact_sink(manifest.clone())
        .with_cancellation(shutdown.clone());
    tracing::info!(run_id = %dispatcher.run_id(), "Batch prepared");

    let reporter = match args.status {
        StatusMode::Console => Some(dispatcher.spawn_status_reporter(Arc::new(ConsoleStatusSink))),
        StatusMode::Log => Some(dispatcher.spawn_status_reporter(Arc::new(LogStatusSink))),
        StatusMode::None => None,
    };

    let dashboard_stop = CancellationToken::new();
    if let Some(port) = args.dashboard_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let state = DashboardState {
            status: dispatcher.subscribe(),
        };
        tokio::spawn(run_dashboard(addr, state, dashboard_stop.clone()));
    }

    let result = dispatcher.run().await;
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }
    dashboard_stop.cancel();

    let report = result?;
    if let Some(path) = args.manifest {
        manifest.write(&path, &report).await?;
    }

    tracing::info!(
        run_id = %report.run_id,
        completed = report.counts.completed,
        timed_out = report.counts.timed_out,
        total = report.counts.total,
        "Batch complete"
    );

    Ok(())
}
