//! reqflow CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use reqflow::{
    commands::{
        cmd_build, cmd_create_project, cmd_init, cmd_jobs, cmd_list_projects, cmd_process,
        cmd_status, cmd_upload, cmd_worker, print_build, print_init, print_jobs, print_process,
        print_projects, print_run_summary, print_status, print_upload, InitOptions, Runtime,
    },
    config::Config,
    error::{Error, Result},
    progress::LogWriterFactory,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "reqflow")]
#[command(version, about = "Turn documents into requirements, knowledge bases and conflicts", long_about = None)]
struct Cli {
    /// Path to config file (or its directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize reqflow configuration and database
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Manage projects
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Upload a plain-text document and queue it for processing
    Upload {
        /// Project ID
        project_id: i64,

        /// Path to the file
        file: PathBuf,

        /// Document type sent to the extraction service (defaults to the file extension)
        #[arg(long)]
        file_type: Option<String>,
    },

    /// Process one document now, without the queue
    Process {
        /// Document ID
        document_id: i64,
    },

    /// Build a project's knowledge base
    Build {
        /// Project ID
        project_id: i64,

        /// Work the queue until it drains and show progress
        #[arg(long)]
        wait: bool,
    },

    /// Run queued jobs
    Worker {
        /// Stop once nothing is queued or running
        #[arg(long)]
        until_idle: bool,
    },

    /// Show a project's documents, requirements and knowledge base
    Status {
        /// Project ID
        project_id: i64,
    },

    /// Show the job queue
    Jobs {
        /// Number of recent jobs to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project
    Create {
        /// Project name
        name: String,
    },

    /// List projects
    List,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let json_layer = cli
        .log_json
        .then(|| fmt::layer().json().with_writer(LogWriterFactory::default()));
    let text_layer = (!cli.log_json).then(|| fmt::layer().with_writer(LogWriterFactory::default()));

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { force } => {
            let report = cmd_init(InitOptions::from_config_arg(cli.config, force)).await?;
            output(cli.json, &report, print_init)
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "reqflow", &mut std::io::stdout());
            Ok(())
        }

        command => {
            let config = load_config(cli.config)?;
            let rt = Runtime::open(config).await?;
            run_command(&rt, command, cli.json).await
        }
    }
}

async fn run_command(rt: &Runtime, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Project { action } => match action {
            ProjectAction::Create { name } => {
                let project = cmd_create_project(&rt.db, &name).await?;
                output(json, &project, |p| {
                    println!("✓ Created project '{}' with ID {}", p.name, p.id)
                })
            }
            ProjectAction::List => {
                let projects = cmd_list_projects(&rt.db).await?;
                output(json, &projects, |p| print_projects(p))
            }
        },

        Commands::Upload {
            project_id,
            file,
            file_type,
        } => {
            let report = cmd_upload(rt, project_id, &file, file_type).await?;
            output(json, &report, print_upload)
        }

        Commands::Process { document_id } => {
            let report = cmd_process(rt, document_id).await?;
            output(json, &report, print_process)
        }

        Commands::Build { project_id, wait } => {
            let report = cmd_build(rt, project_id, wait, !json).await?;
            output(json, &report, print_build)
        }

        Commands::Worker { until_idle } => {
            let summary = cmd_worker(rt, until_idle).await?;
            output(json, &summary, print_run_summary)
        }

        Commands::Status { project_id } => {
            let status = cmd_status(&rt.db, project_id).await?;
            output(json, &status, print_status)
        }

        Commands::Jobs { limit } => {
            let report = cmd_jobs(&rt.queue, limit).await?;
            output(json, &report, print_jobs)
        }

        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),
    }
}

fn output<T: Serialize>(json: bool, value: &T, print: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print(value);
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config_path = InitOptions::from_config_arg(path, false).config_path;
    if !config_path.exists() {
        return Err(Error::NotInitialized);
    }
    Config::load(&config_path)
}
