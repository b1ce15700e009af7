mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "sluice",
    version,
    about = "Extract, normalize and load semi-structured data"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a JSON or JSON lines file through a pipeline
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Rows to load: a JSON array or one JSON object per line.
        /// Without it only pending packages are loaded
        #[arg(long)]
        input: Option<PathBuf>,
        /// Table for the input rows (default: input file stem)
        #[arg(long)]
        table: Option<String>,
    },
    /// Validate pipeline configuration and destination state
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// List load packages, or show one package
    Packages {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Show jobs and schema update of this package
        #[arg(long)]
        load_id: Option<String>,
    },
    /// Delete extracted and normalized packages
    DropPending {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Also delete packages with started or completed jobs
        #[arg(long)]
        with_partial_loads: bool,
    },
    /// Print a stored schema as YAML
    Schema {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Schema name (default: the pipeline's default schema)
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the pipeline state document as JSON
    State {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            pipeline,
            input,
            table,
        } => commands::run::execute(&pipeline, input.as_deref(), table.as_deref()).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
        Commands::Packages { pipeline, load_id } => {
            commands::packages::execute(&pipeline, load_id.as_deref())
        }
        Commands::DropPending {
            pipeline,
            with_partial_loads,
        } => commands::drop_pending::execute(&pipeline, with_partial_loads),
        Commands::Schema { pipeline, name } => {
            commands::schema::execute(&pipeline, name.as_deref()).await
        }
        Commands::State { pipeline } => commands::state::execute(&pipeline).await,
    }
}
