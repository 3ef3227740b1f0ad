//! cloudexec
//!
//! Runs a workload on a short-lived DigitalOcean droplet:
//! - uploads an input directory to the user's Spaces bucket
//! - boots a droplet that runs the configured commands under tmux
//! - tracks every job in `state/state.json` in the same bucket

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use cx_core::Settings;

mod commands;
mod launch_config;
mod status;
mod user_data;

use commands::{App, ConfigureArgs};
use launch_config::LAUNCH_CONFIG_FILE;

const WORKSPACE_TARGETS: &[&str] = &[
    "cloudexec",
    "cx_core",
    "cx_object_store",
    "cx_state_store",
    "cx_orchestrator",
];

#[derive(Parser, Debug)]
#[command(name = "cloudexec")]
#[command(about = "Easily run cloud based jobs")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (default: ~/.config/cloudexec/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging for cloudexec crates
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Verify DigitalOcean API and Spaces credentials
    Check,

    /// Write credentials to the settings file
    Configure {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        spaces_access_key: Option<String>,
        #[arg(long)]
        spaces_secret_key: Option<String>,
        #[arg(long)]
        spaces_region: Option<String>,
    },

    /// Create a cloudexec.toml launch configuration in the current directory
    Init,

    /// Launch a droplet and start a job
    Launch {
        /// Launch configuration
        #[arg(default_value = LAUNCH_CONFIG_FILE)]
        file: PathBuf,

        /// Droplet size
        #[arg(long, default_value = "c-2")]
        size: String,

        /// Droplet region (default: the Spaces region)
        #[arg(long)]
        region: Option<String>,

        /// Job name
        #[arg(long)]
        name: Option<String>,
    },

    /// Show running jobs and the latest completed one
    Status {
        /// Show all jobs, including failed, cancelled and completed
        #[arg(short, long)]
        all: bool,
    },

    /// Stream logs from a running job, or print the saved log of a finished one
    Logs {
        #[arg(long)]
        job: Option<i64>,
    },

    /// Attach to the tmux session of a running job
    Attach {
        #[arg(long)]
        job: Option<i64>,
    },

    /// Cancel a job (default: the latest) and destroy its droplet
    Cancel {
        #[arg(long, conflicts_with = "all")]
        job: Option<i64>,

        /// Cancel every active job
        #[arg(long)]
        all: bool,
    },

    /// Remove a job's droplet, bucket objects and state record (default: every job)
    Clean {
        #[arg(long)]
        job: Option<i64>,
    },

    /// Download the output of a job (default: the latest completed)
    Pull {
        /// Destination directory
        path: PathBuf,

        #[arg(long)]
        job: Option<i64>,
    },

    /// Inspect or edit the state document
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(clap::Subcommand, Debug)]
enum StateCommands {
    /// List jobs in the state document
    List,
    /// Print the state document
    Json,
    /// Remove a job from the state document
    Rm { id: i64 },
    /// Record a job's status (provisioning, running, completed, failed, cancelled, timedout)
    Mark { id: i64, status: String },
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for target in WORKSPACE_TARGETS {
        filter = filter.add_directive(format!("{}={}", target, level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let settings_path = match args.config {
        Some(path) => path,
        None => Settings::default_path()?,
    };

    match args.command {
        Commands::Configure {
            username,
            api_key,
            spaces_access_key,
            spaces_secret_key,
            spaces_region,
        } => {
            commands::configure(
                &settings_path,
                ConfigureArgs {
                    username,
                    api_key,
                    spaces_access_key,
                    spaces_secret_key,
                    spaces_region,
                },
            )?;
            println!("Configuration saved to {}", settings_path.display());
            Ok(())
        }
        Commands::Init => {
            let path = commands::init(&std::env::current_dir()?)?;
            println!("Created {}", path.display());
            Ok(())
        }
        command => {
            let app = App::new(Settings::load(&settings_path)?)?;
            run(&app, command).await
        }
    }
}

async fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Check => app.check().await,
        Commands::Launch {
            file,
            size,
            region,
            name,
        } => app.launch(&file, &size, region.as_deref(), name.as_deref()).await,
        Commands::Status { all } => app.status(all).await,
        Commands::Logs { job } => app.logs(job).await,
        Commands::Attach { job } => app.attach(job).await,
        Commands::Cancel { job, all } => app.cancel(job, all).await,
        Commands::Clean { job } => app.clean(job).await,
        Commands::Pull { path, job } => app.pull(&path, job).await,
        Commands::State { command } => match command {
            StateCommands::List => app.state_list().await,
            StateCommands::Json => app.state_json().await,
            StateCommands::Rm { id } => app.state_rm(id).await,
            StateCommands::Mark { id, status } => app.state_mark(id, &status).await,
        },
        // handled before credentials are required
        Commands::Configure { .. } | Commands::Init => Ok(()),
    }
}
