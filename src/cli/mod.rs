use clap::{Parser, Subcommand};
use switchboard::store::SqliteDocumentStore;

pub mod config;
pub mod init;
pub mod instances;
pub mod purge;
pub mod run;
pub mod version;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator CLI for the switchboard session manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Path to config file (default: ~/.local/share/switchboard/config.toml)
        #[arg(long)]
        config: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the session manager on the offline transport
    Run {
        /// Path to config file (created with defaults if missing)
        #[arg(long)]
        config: Option<String>,

        /// Create these instances at boot unless they already exist
        #[arg(long = "create", value_name = "ID")]
        create: Vec<String>,

        /// Callback URL for instances created with --create
        #[arg(long)]
        callback_url: Option<String>,
    },

    /// List persisted instances
    Instances {
        #[arg(long)]
        config: Option<String>,
    },

    /// Delete every persisted document of one instance
    Purge {
        /// Instance id
        id: String,

        #[arg(long)]
        config: Option<String>,

        /// Skip confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },

    /// Display version information
    Version,
}

/// Open the configured SQLite document store, creating its directory if needed
pub async fn open_store(
    config: &config::SwitchboardConfig,
) -> Result<SqliteDocumentStore, Box<dyn std::error::Error>> {
    if let Some(dir) = config.storage.db_path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create data directory '{}': {}", dir.display(), e))?;
    }
    Ok(SqliteDocumentStore::open(&config.storage.db_path).await?)
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Init { config, force } => init::execute(config, force),
        Commands::Run {
            config,
            create,
            callback_url,
        } => run::execute(config, create, callback_url).await,
        Commands::Instances { config } => instances::execute(config).await,
        Commands::Purge { id, config, yes } => purge::execute(id, config, yes).await,
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}
