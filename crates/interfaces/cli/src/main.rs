mod module_cmds;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mkm_config::AppConfig;

const DEFAULT_CONFIG_PATH: &str = "config/mkm.toml";

#[derive(Debug, Parser)]
#[command(
    name = "mkm",
    version,
    about = "Package and install portable knowledge modules"
)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build `<name>.mkm` from a JSON array of entities.
    Pack {
        #[arg(long, value_name = "FILE")]
        entities: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Overrides `packager.output_dir`.
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Verify, unpack and apply a module archive.
    Install {
        name: String,
        /// Install this archive instead of looking up `<modules_dir>/<name>.mkm`.
        #[arg(long, value_name = "ARCHIVE")]
        path: Option<PathBuf>,
    },
    /// Print the SHA-256 digest of a file.
    Hash {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Show an archive's metadata, sources and install steps.
    Inspect {
        #[arg(value_name = "PATH")]
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Pack {
            entities,
            name,
            description,
            output,
        } => module_cmds::run_pack(&config, &entities, &name, &description, output)?,
        Commands::Install { name, path } => {
            module_cmds::run_install(&config, &name, path.as_deref()).await?
        }
        Commands::Hash { path } => module_cmds::run_hash(&path)?,
        Commands::Inspect { path, json } => module_cmds::run_inspect(&path, json)?,
    }

    Ok(())
}
