//! `ravel` — the client CLI (`spec.md` §4.6).
//!
//! Mirrors the teacher's `src/cli.rs` shape: a `clap::Parser` root struct
//! carrying a `#[command(subcommand)]` enum plus a flattened
//! `clap_verbosity_flag::Verbosity`. The teacher's batch-file grammar
//! (`Add { script: PathBuf }` reading a heredoc/SET/JOB file) is out of
//! scope here — `run`/`queue` take a bare command line directly, per
//! `spec.md` §1's Non-goals.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ravel::client::Client;
use ravel::config::Config;
use ravel::daemon;
use ravel::job::{JobStatus, NewJob};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ravel", author, version, about = "A single-host batch job scheduler for GPU-bearing workstations.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a job and block until it reaches a terminal state, printing
    /// its captured output.
    Run(JobArgs),
    /// Submit a job and return immediately with its id.
    Queue(JobArgs),
    /// List jobs, most recent first.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Cooperatively cancel a running job.
    Stop { id: String },
    /// Delete all jobs from the store (or only a given status).
    Clear {
        #[arg(long)]
        status: Option<String>,
    },
    /// Control the background daemon.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Debug, Subcommand)]
enum DaemonAction {
    /// Fork the dispatcher into the background.
    Start,
    /// Stop a running daemon.
    Stop,
    /// Report whether the daemon is running.
    Status,
}

#[derive(Debug, Parser)]
struct JobArgs {
    /// Number of GPUs to request.
    #[arg(long, default_value_t = 0)]
    gpus: u32,
    /// Scheduling priority; higher runs first among otherwise-ready jobs.
    #[arg(long, default_value_t = 0)]
    priority: i64,
    /// Job ids this job depends on; it won't run until all of them are done.
    #[arg(long = "after")]
    depends_on: Vec<String>,
    /// A memory-class tag, gated by the MEMORY_LIMITS ceiling table.
    #[arg(long)]
    tag: Option<String>,
    /// Working directory for the child process.
    #[arg(long)]
    cwd: Option<String>,
    /// The command to run.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.verbose.tracing_level_filter().to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env().context("loading configuration")?;

    match cli.command {
        Command::Run(args) => run_and_wait(&config, args).await,
        Command::Queue(args) => queue(&config, args),
        Command::List { status, limit } => list(&config, status, limit),
        Command::Stop { id } => stop(&config, &id).await,
        Command::Clear { status } => clear(&config, status),
        Command::Daemon { action } => daemon_command(&config, action).await,
    }
}

fn new_job(args: JobArgs) -> NewJob {
    NewJob {
        command: args.command,
        gpus: args.gpus,
        priority: args.priority,
        depends_on: args.depends_on,
        memory_tag: args.tag,
        cwd: args.cwd,
    }
}

fn queue(config: &Config, args: JobArgs) -> Result<()> {
    let client = Client::open(config)?;
    let id = client.add_job(new_job(args))?;
    println!("{id}");
    Ok(())
}

async fn run_and_wait(config: &Config, args: JobArgs) -> Result<()> {
    let client = Client::open(config)?;
    let id = client.add_job(new_job(args))?;

    loop {
        let job = client
            .get_job(&id)?
            .with_context(|| format!("job {id} disappeared from the store"))?;
        if job.status.is_terminal() {
            print!("{}", job.stdout);
            eprint!("{}", job.stderr);
            std::process::exit(exit_code_for(job.status, job.returncode));
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

fn exit_code_for(status: JobStatus, returncode: Option<i32>) -> i32 {
    match status {
        JobStatus::Done => returncode.unwrap_or(0),
        _ => returncode.unwrap_or(1).max(1),
    }
}

fn list(config: &Config, status: Option<String>, limit: usize) -> Result<()> {
    let client = Client::open(config)?;
    let statuses = parse_status_filter(status)?;
    let jobs = client.list_recent_jobs(limit, statuses.as_deref())?;
    for job in jobs {
        println!(
            "{}\t{}\t{}\t{}",
            job.id,
            job.status,
            job.priority,
            job.command.join(" ")
        );
    }
    Ok(())
}

async fn stop(config: &Config, id: &str) -> Result<()> {
    let client = Client::open(config)?;
    let stopped = client.stop_job(id).await?;
    if stopped {
        println!("stopped {id}");
    } else {
        println!("{id} is not running");
    }
    Ok(())
}

fn clear(config: &Config, status: Option<String>) -> Result<()> {
    let client = Client::open(config)?;
    let statuses = parse_status_filter(status)?;
    let cleared = client.clear_jobs(statuses.as_deref())?;
    println!("cleared {cleared} job(s)");
    Ok(())
}

fn parse_status_filter(status: Option<String>) -> Result<Option<Vec<JobStatus>>> {
    status
        .map(|s| s.parse::<JobStatus>().map(|s| vec![s]))
        .transpose()
        .context("invalid --status value")
}

async fn daemon_command(config: &Config, action: DaemonAction) -> Result<()> {
    match action {
        DaemonAction::Start => start_daemon(config).await,
        DaemonAction::Stop => {
            let stopped = daemon::stop(config).await?;
            if stopped {
                println!("daemon stopped");
            } else {
                println!("daemon is not running");
            }
            Ok(())
        }
        DaemonAction::Status => {
            match daemon::status(config)? {
                daemon::DaemonStatus::Running(pid) => println!("running (pid {pid})"),
                daemon::DaemonStatus::NotRunning => println!("not running"),
            }
            Ok(())
        }
    }
}

/// Launches the `raveld` binary, which daemonizes itself (`src/daemon.rs`)
/// and runs the dispatcher loop. Looked up next to the current executable
/// first, falling back to `PATH`, mirroring how the teacher's `gctl`
/// resolves its companion `gflowd` binary.
async fn start_daemon(config: &Config) -> Result<()> {
    if let daemon::DaemonStatus::Running(pid) = daemon::status(config)? {
        println!("daemon already running (pid {pid})");
        return Ok(());
    }

    let raveld_path = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|dir| dir.join("raveld")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| "raveld".into());

    std::process::Command::new(raveld_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("failed to launch raveld")?;

    for _ in 0..50 {
        if let daemon::DaemonStatus::Running(pid) = daemon::status(config)? {
            println!("daemon started (pid {pid})");
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    anyhow::bail!("raveld did not report a pid file within 5s of starting")
}
