use std::fs;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;

use queuectl::{JobInput, JobState, Queue, StoreOptions, WorkerOptions, WorkerPool};

#[derive(Parser)]
#[command(name = "queuectl", version, about = "CLI background job queue backed by a local JSON store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a new job to the queue
    Enqueue {
        /// Job JSON string, or @path to a JSON file
        job: String,
    },
    /// Manage workers
    Worker {
        #[arg(value_enum, default_value = "start")]
        action: WorkerAction,
        /// Number of worker loops
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Poll interval in milliseconds
        #[arg(long = "poll", default_value_t = 500)]
        poll_ms: u64,
    },
    /// Show job counts per state
    Status,
    /// List jobs, newest first
    List {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<String>,
    },
    /// Dead-letter queue operations
    Dlq {
        #[arg(value_enum, default_value = "list")]
        action: DlqAction,
        /// Job id for retry
        job_id: Option<String>,
    },
    /// Manage configuration
    Config {
        #[arg(value_enum, default_value = "list")]
        action: ConfigAction,
        key: Option<String>,
        value: Option<String>,
    },
    /// Show a single job
    Show { id: String },
    /// Return jobs stuck in processing to pending
    Recover {
        /// Only claims at least this many seconds old. Claims younger than the
        /// job's execution timeout plus a 10s grace are always kept.
        #[arg(long, default_value_t = 300)]
        older_than: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum WorkerAction {
    Start,
    Stop,
}

#[derive(Clone, Copy, ValueEnum)]
enum DlqAction {
    List,
    Retry,
}

#[derive(Clone, Copy, ValueEnum)]
enum ConfigAction {
    List,
    Get,
    Set,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let queue = Queue::open(StoreOptions::from_env());

    match cli.command {
        Command::Enqueue { job } => {
            let input = read_job_input(&job)?;
            let id = queue.enqueue(input).await.context("Failed to enqueue")?;
            println!("Enqueued: {}", id);
        }
        Command::Worker { action: WorkerAction::Start, count, poll_ms } => {
            let options = WorkerOptions {
                count,
                poll_interval: Duration::from_millis(poll_ms),
            };
            let pool = WorkerPool::new(&queue, options);
            let stop = pool.stop_handle();

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, finishing in-flight jobs");
                    stop.stop();
                }
            });

            println!("Starting {} worker(s)... Ctrl+C to stop", count);
            pool.run().await?;
            println!("Workers stopped.");
        }
        Command::Worker { action: WorkerAction::Stop, .. } => {
            // Workers only listen for Ctrl+C in their own process
            println!("Stop signal sent (no-op: stop workers with Ctrl+C in their process).");
        }
        Command::Status => {
            let counts = queue.job_counts().await?;
            println!("Job counts:");
            for state in JobState::ALL {
                println!("  {:<10} {}", state, counts.get(state));
            }
        }
        Command::List { state } => {
            let state = state.map(|s| s.parse::<JobState>()).transpose()?;
            let jobs = queue.list_jobs(state).await?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in jobs {
                println!(
                    "{} [{}] attempts={}/{} priority={} run_at={} cmd={}",
                    job.id, job.state, job.attempts, job.max_retries, job.priority, job.run_at, job.command
                );
            }
        }
        Command::Dlq { action: DlqAction::List, .. } => {
            let jobs = queue.list_dlq().await?;
            if jobs.is_empty() {
                println!("DLQ is empty.");
            }
            for job in jobs {
                println!(
                    "{} error={} attempts={} cmd={}",
                    job.id,
                    job.last_error.as_deref().unwrap_or("-"),
                    job.attempts,
                    job.command
                );
            }
        }
        Command::Dlq { action: DlqAction::Retry, job_id } => {
            let Some(job_id) = job_id else {
                bail!("Provide a job id: queuectl dlq retry <id>");
            };
            queue.retry_dlq(&job_id).await.context("Retry failed")?;
            println!("Re-enqueued from DLQ: {}", job_id);
        }
        Command::Config { action, key, value } => match (action, key, value) {
            (ConfigAction::List, _, _) => {
                for (key, value) in queue.list_config().await? {
                    println!("{}={}", key, value);
                }
            }
            (ConfigAction::Get, Some(key), _) => match queue.get_config(&key).await? {
                Some(value) => println!("{}", value),
                None => println!("(unset)"),
            },
            (ConfigAction::Set, Some(key), Some(value)) => {
                queue.set_config(&key, &value).await?;
                println!("Set {} = {}", key, value);
            }
            (ConfigAction::Set, Some(_), None) => bail!("Provide value"),
            _ => bail!("Provide key"),
        },
        Command::Show { id } => match queue.get_job(&id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => println!("Not found"),
        },
        Command::Recover { older_than } => {
            let released = queue.recover_stale(Duration::from_secs(older_than)).await?;
            println!("Recovered {} job(s)", released.len());
            for id in released {
                println!("  {}", id);
            }
        }
    }

    Ok(())
}

/// Parse a job from inline JSON or `@file.json`
fn read_job_input(arg: &str) -> Result<JobInput> {
    let raw = match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?,
        None => arg.to_string(),
    };

    serde_json::from_str(&raw).context("Invalid job JSON")
}
