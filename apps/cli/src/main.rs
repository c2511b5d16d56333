//! hfetch CLI - fetch URLs from the command line
//!
//! Drives the hfetch engine: single fetches with progress bars, plus
//! inspection of the persistent store and the settings file.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// hfetch - HTTP fetches with a persistent, resumable store
#[derive(Parser)]
#[command(name = "hfetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Persistent store directory
    #[arg(long, env = "HFETCH_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Settings file
    #[arg(long, env = "HFETCH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

/// Storage mode as given on the command line
#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum ModeArg {
    #[default]
    Default,
    Append,
    Replace,
    NoDownload,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL
    Get(GetArgs),

    /// Inspect the persistent store
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },

    /// Show/reset settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args)]
struct GetArgs {
    /// URL to fetch
    url: String,

    /// Request method
    #[arg(short = 'X', long)]
    method: Option<String>,

    /// Extra request header, as "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Keep the body in the store under this path
    #[arg(long)]
    save: Option<String>,

    /// What to do with a copy already in the store
    #[arg(long, value_enum, default_value_t = ModeArg::Default)]
    mode: ModeArg,

    /// Write the body to this file
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Print the body to stdout as it arrives
    #[arg(long)]
    stream: bool,

    /// Request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Basic auth credentials, as "user:password"
    #[arg(short, long)]
    user: Option<String>,

    /// Speed limit in bytes/sec
    #[arg(long)]
    limit_rate: Option<u64>,
}

#[derive(Subcommand)]
enum StoreAction {
    /// List stored files
    List,

    /// Show one stored file
    Show {
        /// Store path
        path: String,
    },

    /// Delete a stored file
    Rm {
        /// Store path
        path: String,
    },

    /// Delete every stored file
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all settings
    Show,

    /// Print the settings file location
    Path,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "hfetch", &mut std::io::stdout());
        return Ok(());
    }

    let config_path = cli
        .config
        .unwrap_or_else(hfetch_core::config::default_config_path);
    let mut config = hfetch_core::config::load_config(&config_path)?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = Some(data_dir);
    }

    match cli.command {
        Commands::Get(args) => commands::get(config, args, cli.output)?,

        Commands::Store { action } => commands::store_action(config, action, cli.output)?,

        Commands::Config { action } => {
            commands::config_action(&config_path, &config, action, cli.output)?
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}
