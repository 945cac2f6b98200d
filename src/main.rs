use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use taskmesh::config::{CoordinatorConfig, WorkerConfig};
use taskmesh::coordinator::Coordinator;
use taskmesh::extension::ExtensionRegistry;
use taskmesh::remoting::{Connection, Message};
use taskmesh::shutdown::install_shutdown_handler;
use taskmesh::worker::{JobContext, JobHandler, JobRunner, Outcome, WorkerNode};

#[derive(Parser, Debug)]
#[command(name = "taskmesh")]
#[command(version)]
#[command(about = "A distributed job dispatch cluster")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a coordinator node
    Coordinator(CoordinatorArgs),

    /// Start a worker node with the demo handlers
    Worker(WorkerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Show dispatch statistics
    Stats {
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Parser, Debug)]
struct CoordinatorArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on
    #[arg(long, default_value = "7070")]
    port: u16,

    /// Address workers and clients use to reach this node
    #[arg(long)]
    advertise: Option<String>,

    /// Load balancing policy (round-robin, least-assignments, consistent-hash)
    #[arg(long, default_value = "round-robin")]
    balancer: String,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "2")]
    node_id: u64,

    /// Port to listen on for dispatches
    #[arg(long, default_value = "7071")]
    port: u16,

    /// Address the coordinator uses to dispatch to this node
    #[arg(long)]
    advertise: Option<String>,

    /// Address of the coordinator
    #[arg(long, short = 'c', default_value = "127.0.0.1:7070")]
    coordinator: String,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Coordinator address
    #[arg(long, short = 'a', default_value = "127.0.0.1:7070")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Job type, matched against worker handler registrations
        job_type: String,

        /// Opaque payload handed to the handler
        #[arg(default_value = "")]
        payload: String,

        /// Retry budget for job faults
        #[arg(long, default_value = "3")]
        max_retries: u32,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Cancel a waiting job
    Cancel {
        /// The job ID (UUID)
        job_id: String,
    },
}

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    job_type: String,
    state: String,
    retry_count: u32,
    max_retries: u32,
    assigned_worker: Option<u64>,
    submitted_at: String,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Demo handlers
// =============================================================================

/// Succeeds with its payload echoed back.
struct EchoHandler;

#[async_trait::async_trait]
impl JobHandler for EchoHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Outcome> {
        Ok(Outcome::Success(
            String::from_utf8_lossy(&ctx.payload).into_owned(),
        ))
    }
}

/// Sleeps for the number of milliseconds in the payload, then succeeds.
struct SleepHandler;

#[async_trait::async_trait]
impl JobHandler for SleepHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Outcome> {
        let ms: u64 = String::from_utf8_lossy(&ctx.payload).trim().parse()?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(Outcome::Success(format!("slept {ms}ms")))
    }
}

/// Fails until the retry count reaches the number in the payload.
struct FlakyHandler;

#[async_trait::async_trait]
impl JobHandler for FlakyHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Outcome> {
        let succeed_at: u32 = String::from_utf8_lossy(&ctx.payload).trim().parse().unwrap_or(1);
        if ctx.retry_count < succeed_at {
            anyhow::bail!("attempt {} failed", ctx.retry_count + 1);
        }
        Ok(Outcome::Success(format!(
            "succeeded on attempt {}",
            ctx.retry_count + 1
        )))
    }
}

// =============================================================================
// Server entry points
// =============================================================================

async fn run_coordinator(args: CoordinatorArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let mut cfg = CoordinatorConfig::new(args.node_id, listen_addr).with_balancer(&args.balancer);
    if let Some(advertise) = args.advertise {
        cfg.advertise_addr = advertise;
    } else {
        cfg.advertise_addr = format!("127.0.0.1:{}", args.port);
    }

    let registry = ExtensionRegistry::with_defaults();
    let coordinator = Coordinator::start(cfg, &registry).await?;
    tracing::info!(addr = %coordinator.local_addr(), "coordinator ready");

    install_shutdown_handler().cancelled().await;
    coordinator.shutdown();
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let mut cfg = WorkerConfig::new(args.node_id, listen_addr, args.coordinator);
    if let Some(advertise) = args.advertise {
        cfg.advertise_addr = advertise;
    } else {
        cfg.advertise_addr = format!("127.0.0.1:{}", args.port);
    }

    let runner = Arc::new(JobRunner::new());
    runner.register_handler("echo", Arc::new(EchoHandler)).await;
    runner.register_handler("sleep", Arc::new(SleepHandler)).await;
    runner.register_handler("flaky", Arc::new(FlakyHandler)).await;

    let registry = ExtensionRegistry::with_defaults();
    let worker = WorkerNode::start(cfg, &registry, runner).await?;
    tracing::info!(
        node_id = worker.node_id(),
        addr = %worker.local_addr(),
        "worker ready"
    );

    install_shutdown_handler().cancelled().await;
    worker.shutdown();
    Ok(())
}

// =============================================================================
// Client command handlers
// =============================================================================

async fn connect(addr: &str) -> Result<Connection, Box<dyn std::error::Error>> {
    let registry = ExtensionRegistry::with_defaults();
    let codec = registry.codecs.resolve("json")?;
    let conn = Connection::open(addr.to_string(), codec, Default::default(), 0, None);
    conn.wait_connected(Duration::from_secs(5)).await?;
    Ok(conn)
}

async fn handle_submit(
    client: &ClientArgs,
    job_type: String,
    payload: String,
    max_retries: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let conn = connect(&client.addr).await?;
    let reply = conn
        .request(Message::Submit {
            job_type,
            payload: payload.into_bytes(),
            max_retries,
        })
        .await?;

    match reply {
        Message::SubmitAck { job_id } => match client.output {
            OutputFormat::Json => {
                let output = JobSubmitOutput {
                    job_id: job_id.to_string(),
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Job submitted.");
                println!("Job ID: {job_id}");
            }
        },
        Message::SubmitRejected { reason } => {
            eprintln!("Error: submission rejected: {reason}");
            std::process::exit(1);
        }
        other => {
            eprintln!("Error: unexpected reply: {other:?}");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn handle_status(
    client: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_id: Uuid = job_id.parse()?;
    let conn = connect(&client.addr).await?;
    let reply = conn.request(Message::JobQuery { job_id }).await?;

    match reply {
        Message::JobReport { job: Some(job) } => match client.output {
            OutputFormat::Json => {
                let output = JobStatusOutput {
                    job_id: job.id.to_string(),
                    job_type: job.job_type,
                    state: job.state.to_string(),
                    retry_count: job.retry_count,
                    max_retries: job.max_retries,
                    assigned_worker: job.assigned_worker,
                    submitted_at: job.submitted_at.to_rfc3339(),
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Job ID:          {}", job.id);
                println!("Type:            {}", job.job_type);
                println!("State:           {}", job.state);
                println!("Retries:         {}/{}", job.retry_count, job.max_retries);
                if let Some(worker) = job.assigned_worker {
                    println!("Assigned Worker: {worker}");
                }
                println!("Submitted:       {}", job.submitted_at.to_rfc3339());
            }
        },
        Message::JobReport { job: None } => {
            eprintln!("Error: job not found");
            std::process::exit(1);
        }
        other => {
            eprintln!("Error: unexpected reply: {other:?}");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn handle_cancel(
    client: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_id: Uuid = job_id.parse()?;
    let conn = connect(&client.addr).await?;
    let reply = conn.request(Message::CancelJob { job_id }).await?;

    match reply {
        Message::CancelAck { cancelled: true, .. } => {
            println!("Job cancelled.");
        }
        Message::CancelAck {
            cancelled: false, ..
        } => {
            eprintln!("Job not cancelled (already running or finished).");
            std::process::exit(1);
        }
        other => {
            eprintln!("Error: unexpected reply: {other:?}");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn handle_stats(client: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let conn = connect(&client.addr).await?;
    let reply = conn.request(Message::StatsQuery).await?;

    match reply {
        Message::StatsReport { stats } => match client.output {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            OutputFormat::Table => {
                println!("Dispatch Statistics");
                println!("{}", "=".repeat(30));
                println!("Queue depth:  {}", stats.queue_depth);
                println!("Live workers: {}", stats.live_workers);
                println!("In flight:    {}", stats.in_flight);
                println!("Failed:       {}", stats.failed_count);
            }
        },
        other => {
            eprintln!("Error: unexpected reply: {other:?}");
            std::process::exit(1);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Coordinator(coordinator_args) => {
            run_coordinator(coordinator_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Job { client, command } => match command {
            JobCommands::Submit {
                job_type,
                payload,
                max_retries,
            } => {
                handle_submit(&client, job_type, payload, max_retries).await?;
            }
            JobCommands::Status { job_id } => {
                handle_status(&client, job_id).await?;
            }
            JobCommands::Cancel { job_id } => {
                handle_cancel(&client, job_id).await?;
            }
        },
        Commands::Stats { client } => {
            handle_stats(&client).await?;
        }
    }

    Ok(())
}
