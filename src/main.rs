use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use fleet_agent::agent::Agent;
use fleet_agent::config::AgentConfig;
use fleet_agent::error::AgentError;
use fleet_agent::scheduler::{Task, TaskStatus};
use fleet_agent::shutdown::install_shutdown_handler;
use fleet_agent::store::TaskStore;

#[derive(Parser, Debug)]
#[command(name = "fleet-agent")]
#[command(version)]
#[command(about = "Durable task scheduler for GPU fleet agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the agent until SIGINT/SIGTERM
    Run(RunArgs),

    /// Local task commands
    Task {
        #[command(flatten)]
        config: ConfigArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table", global = true)]
        output: OutputFormat,

        #[command(subcommand)]
        command: TaskCommands,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Path to the agent TOML config
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the task database path
    #[arg(long)]
    db_path: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> Result<AgentConfig, Box<dyn std::error::Error>> {
        let mut config = AgentConfig::load(self.config.as_deref())?;
        if let Some(path) = &self.db_path {
            config.db_path = path.clone();
        }
        Ok(config)
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Maximum number of concurrently running tasks
    #[arg(long)]
    max_workers: Option<usize>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum TaskCommands {
    /// Submit a task locally and wait for it to finish
    Run {
        /// The command to execute (e.g., "echo hello")
        command: String,

        /// Run the command directly with these args instead of through `sh -c`
        #[arg(long = "arg")]
        args: Vec<String>,

        #[arg(long)]
        name: Option<String>,

        /// Lower runs first
        #[arg(long, default_value = "5")]
        priority: i32,

        /// Timeout in seconds (0 = agent default)
        #[arg(long, default_value = "0")]
        timeout: u64,

        #[arg(long, default_value = "0")]
        max_retries: u32,

        /// Seconds between retries (0 = agent default)
        #[arg(long, default_value = "0")]
        retry_delay: u64,

        #[arg(long)]
        workdir: Option<String>,

        /// Environment variable, KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },
    /// Show a stored task
    Status {
        task_id: String,
    },
    /// List stored tasks
    List {
        /// Only tasks with this status
        #[arg(long)]
        status: Option<TaskStatus>,
    },
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct TaskListOutput {
    tasks: Vec<Task>,
    counts: HashMap<String, usize>,
}

// =============================================================================
// Handlers
// =============================================================================

fn init_tracing(default: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

async fn run_agent(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    let mut config = args.config.load()?;
    if let Some(n) = args.max_workers {
        config = config.with_max_workers(n);
    }
    config.validate()?;

    tracing::info!(
        db_path = %config.db_path.display(),
        max_workers = config.max_workers,
        server = %config.server.url,
        "Starting fleet-agent"
    );

    let agent = Agent::new(config)?;
    let shutdown = install_shutdown_handler();
    agent.run(shutdown).await?;
    Ok(())
}

async fn handle_task_run(
    config: AgentConfig,
    task: Task,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    // A running daemon owns the database; running the task here too would
    // recover and dispatch its queue a second time.
    let agent = match Agent::new(config) {
        Ok(agent) => agent,
        Err(AgentError::StoreLocked(db)) => {
            return Err(format!(
                "an agent is already running on {db}; stop it or pass --db-path to use a separate database"
            )
            .into());
        }
        Err(e) => return Err(e.into()),
    };
    let scheduler = agent.scheduler().clone();
    scheduler.start().await?;

    let submitted = scheduler.submit(task).await?;
    let shutdown = install_shutdown_handler();
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut cancel_requested = false;

    let finished = loop {
        tokio::select! {
            _ = shutdown.cancelled(), if !cancel_requested => {
                cancel_requested = true;
                scheduler.cancel_task(&submitted.id).await?;
            }
            _ = ticker.tick() => {}
        }
        let current = scheduler.get_task(&submitted.id)?;
        if current.status.is_terminal() {
            break current;
        }
    };

    scheduler.shutdown().await;
    print_task(&finished, output)?;
    if finished.status != TaskStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_task_status(
    config: &AgentConfig,
    task_id: &str,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = TaskStore::open_read_only(&config.db_path)?;
    let task = store.get(task_id)?;
    print_task(&task, output)
}

fn handle_task_list(
    config: &AgentConfig,
    status: Option<TaskStatus>,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = TaskStore::open_read_only(&config.db_path)?;
    let tasks = match status {
        Some(status) => store.list_by_status(status)?,
        None => store.list_all()?,
    };

    match output {
        OutputFormat::Json => {
            let counts = store
                .count_by_status()?
                .into_iter()
                .map(|(status, n)| (status.to_string(), n))
                .collect();
            let out = TaskListOutput { tasks, counts };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:<8} {:<6} COMMAND",
                "TASK ID", "STATUS", "PRIORITY", "EXIT"
            );
            println!("{}", "-".repeat(86));
            for task in &tasks {
                let command = if task.command.len() > 40 {
                    let cut: String = task.command.chars().take(37).collect();
                    format!("{cut}...")
                } else {
                    task.command.clone()
                };
                println!(
                    "{:<38} {:<10} {:<8} {:<6} {}",
                    task.id, task.status, task.priority, task.exit_code, command
                );
            }
            println!();
            println!("Total: {} task(s)", tasks.len());
        }
    }
    Ok(())
}

fn print_task(task: &Task, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(task)?);
        }
        OutputFormat::Table => {
            println!("Task ID:     {}", task.id);
            if !task.name.is_empty() {
                println!("Name:        {}", task.name);
            }
            println!("Command:     {}", task.command);
            println!("Status:      {}", task.status);
            println!("Priority:    {}", task.priority);
            println!("Exit Code:   {}", task.exit_code);
            if task.max_retries > 0 {
                println!("Retries:     {}/{}", task.retry_count, task.max_retries);
            }
            if !task.attempt_id.is_empty() {
                println!("Attempt:     {}", task.attempt_id);
            }
            if let Some(t) = task.created_at {
                println!("Created:     {}", t.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            if let Some(t) = task.ended_at {
                println!("Ended:       {}", t.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            if !task.error.is_empty() {
                println!("Error:       {}", task.error);
            }
            if !task.stdout.is_empty() {
                println!("Output:");
                println!("{}", task.stdout);
            }
            if !task.stderr.is_empty() {
                println!("Stderr:");
                println!("{}", task.stderr);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_agent(run_args).await?;
        }
        Commands::Task {
            config,
            output,
            command,
        } => {
            init_tracing("warn");
            let config = config.load()?;

            match command {
                TaskCommands::Run {
                    command,
                    args,
                    name,
                    priority,
                    timeout,
                    max_retries,
                    retry_delay,
                    workdir,
                    env,
                } => {
                    let task = Task {
                        name: name.unwrap_or_default(),
                        args,
                        priority,
                        timeout,
                        max_retries,
                        retry_delay,
                        workdir: workdir.unwrap_or_default(),
                        env: env.into_iter().collect(),
                        ..Task::new("", command)
                    };
                    handle_task_run(config, task, &output).await?;
                }
                TaskCommands::Status { task_id } => {
                    handle_task_status(&config, &task_id, &output)?;
                }
                TaskCommands::List { status } => {
                    handle_task_list(&config, status, &output)?;
                }
            }
        }
    }

    Ok(())
}
