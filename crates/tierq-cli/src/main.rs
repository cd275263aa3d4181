use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use tierq_core::app::{RetrySweeper, TaskExecutor, WorkerGroup, WorkerSettings};
use tierq_core::codec::WireFormat;
use tierq_core::impls::InMemoryBroker;
use tierq_core::ports::SystemClock;
use tierq_core::{EngineConfig, PriorityQueueHandler, PriorityTier, Task};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Msgpack,
    Json,
}

impl From<FormatArg> for WireFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Msgpack => WireFormat::MessagePack,
            FormatArg::Json => WireFormat::Json,
        }
    }
}

/// Run the tiered task engine against an in-memory broker.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON engine config; defaults apply when omitted
    #[arg(short = 'c', long, env = "TIERQ_CONFIG")]
    config: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(short = 'w', long, default_value_t = 2, env = "TIERQ_WORKERS")]
    workers: usize,

    /// Tasks submitted per tier
    #[arg(short = 'n', long, default_value_t = 3)]
    tasks_per_tier: usize,

    /// Every k-th task fails this many times before succeeding
    #[arg(long, default_value_t = 1)]
    failures: u64,

    /// Override the configured wire format
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 60)]
    deadline_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Sleeps for `work_ms`, then fails while the task's retry count is below
/// its `fail_times` setting.
struct DemoExecutor;

#[async_trait]
impl TaskExecutor for DemoExecutor {
    async fn execute(&self, task: &Task) -> Result<(), String> {
        let setting = |key: &str| task.settings.get(key).and_then(|v| v.as_u64()).unwrap_or(0);

        tokio::time::sleep(Duration::from_millis(setting("work_ms"))).await;
        if u64::from(task.retry_count) < setting("fail_times") {
            return Err(format!(
                "Traceback (most recent call last):\nRuntimeError: simulated failure on attempt {}",
                task.retry_count + 1
            ));
        }
        tracing::info!(task_id = %task.task_id, priority = %task.priority, "task done");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(format) = args.format {
        config.wire_format = format.into();
    }

    let clock = Arc::new(SystemClock);
    let broker = Arc::new(InMemoryBroker::with_clock(clock.clone()));
    let handler = Arc::new(PriorityQueueHandler::new(broker, clock, config.clone())?);

    let mut submitted = 0;
    for tier in PriorityTier::ALL {
        if handler.topology().queue_for(tier).is_none() {
            continue;
        }
        for i in 0..args.tasks_per_tier {
            let fail_times = if i % 3 == 0 { args.failures } else { 0 };
            let task = Task::new(1, (submitted + 1) as i64, tier)
                .with_max_retries(config.default_max_retries)
                .with_setting("work_ms", json!(20))
                .with_setting("fail_times", json!(fail_times));
            handler.enqueue_by_priority(&task, tier, None).await?;
            submitted += 1;
        }
    }
    tracing::info!(submitted, workers = args.workers, format = ?config.wire_format, "tasks submitted");

    let group = WorkerGroup::spawn(
        args.workers,
        handler.clone(),
        Arc::new(DemoExecutor),
        WorkerSettings::default(),
    );
    let sweeper = RetrySweeper::from_config(handler.clone()).spawn(group.subscribe());

    let deadline = tokio::time::sleep(Duration::from_secs(args.deadline_secs));
    tokio::pin!(deadline);
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = &mut deadline => {
                tracing::warn!("deadline reached before all tasks settled");
                break;
            }
            _ = poll.tick() => {
                let stats = handler.get_queue_statistics().await;
                let settled = stats.totals.finished as usize + stats.dead_lettered.unwrap_or(0);
                if settled >= submitted {
                    break;
                }
            }
        }
    }

    group.shutdown_and_join().await;
    if let Err(err) = sweeper.await {
        tracing::error!(error = %err, "sweeper task panicked");
    }

    let stats = handler.get_queue_statistics().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    for record in handler.get_failed_jobs(20).await? {
        println!(
            "dead letter: task={} tier={} retries={} reason={}",
            record.task_id, record.original_priority, record.final_retry_count, record.failure_reason
        );
    }
    Ok(())
}
