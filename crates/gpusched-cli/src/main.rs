//! gpusched CLI
//!
//! Command-line interface for interacting with the gpusched daemon.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gpusched - submit and inspect GPU jobs
#[derive(Parser, Debug)]
#[command(name = "gpusched")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job
    Submit {
        /// Job name
        name: String,

        /// Container image
        #[arg(long)]
        image: String,

        /// GPU memory per device in MB
        #[arg(long, default_value_t = 0)]
        memory: u64,

        /// Number of GPUs
        #[arg(long, default_value_t = 1)]
        gpus: u32,

        /// Fractional GPU share (0 means a whole device)
        #[arg(long, default_value_t = 0.0)]
        fraction: f64,

        /// Job id (generated by the daemon when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Environment variable, KEY=VALUE (repeatable)
        #[arg(short, long = "env", value_parser = commands::parse_env)]
        env: Vec<(String, String)>,

        /// Command and arguments
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// List jobs
    Jobs {
        /// Only show jobs in this state
        #[arg(long)]
        status: Option<String>,
    },

    /// Show a job
    Job {
        /// Job id or name
        job: String,
    },

    /// Cancel a pending job
    Cancel {
        /// Job id or name
        job: String,
    },

    /// Report that a running job exited
    Complete {
        /// Job id or name
        job: String,

        /// Process exit code
        #[arg(long, default_value_t = 0)]
        exit_code: i32,
    },

    /// Report that a running job failed
    Fail {
        /// Job id or name
        job: String,

        /// Failure description
        #[arg(long)]
        reason: String,
    },

    /// Show devices
    Devices,

    /// Show device telemetry
    Metrics {
        /// Device id (all devices when omitted)
        device: Option<u32>,
    },

    /// Show system status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Submit {
            name,
            image,
            memory,
            gpus,
            fraction,
            id,
            env,
            command,
        } => {
            let submission = commands::Submission {
                id,
                name,
                image,
                commands: command,
                environment: env.into_iter().collect(),
                resources: gpusched_core::ResourceRequirements {
                    gpu_memory_mb: memory,
                    gpu_count: gpus,
                    gpu_fraction: fraction,
                    ..Default::default()
                },
            };
            commands::submit(&client, submission).await?;
        }
        Commands::Jobs { status } => {
            commands::jobs(&client, status).await?;
        }
        Commands::Job { job } => {
            commands::job(&client, job).await?;
        }
        Commands::Cancel { job } => {
            commands::cancel(&client, job).await?;
        }
        Commands::Complete { job, exit_code } => {
            commands::complete(&client, job, exit_code).await?;
        }
        Commands::Fail { job, reason } => {
            commands::fail(&client, job, reason).await?;
        }
        Commands::Devices => {
            commands::devices(&client).await?;
        }
        Commands::Metrics { device } => {
            commands::metrics(&client, device).await?;
        }
        Commands::Status => {
            commands::status(&client).await?;
        }
    }

    Ok(())
}
