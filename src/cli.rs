use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{debug, info};

use crate::api::AppState;
use crate::config::Config;
use crate::db::schema::CURRENT_SCHEMA_VERSION;
use crate::db::Database;
use crate::error::MapMarkError;
use crate::logging;
use crate::proxy::MapProxy;
use crate::server::WebServer;
use crate::upload::UploadStore;

#[derive(Parser)]
#[command(
    name = "mapmark",
    version,
    about = "mapmark: map markers, marker images and visit analytics over HTTP"
)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short = 'c', default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the server (default if no command specified)
    Serve,
    /// Bring the database schema up to date and exit
    Migrate,
}

impl Cli {
    pub fn handle_command_line() -> Result<(), MapMarkError> {
        let args = Cli::parse();

        let config = Config::load(&args.config)?;
        // Dropping the handle would stop the logger
        let _logger = logging::init(&config.logging)?;
        debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

        // Default to Serve if no command specified
        match args.command.unwrap_or(Command::Serve) {
            Command::Serve => Self::start_server(config),
            Command::Migrate => Self::migrate(&config),
        }
    }

    fn migrate(config: &Config) -> Result<(), MapMarkError> {
        Database::open(&config.database)?;
        info!("Database schema is at version {}", CURRENT_SCHEMA_VERSION);
        println!(
            "Database {} is at schema version {}",
            config.database.path, CURRENT_SCHEMA_VERSION
        );
        Ok(())
    }

    fn start_server(config: Config) -> Result<(), MapMarkError> {
        let uploads = UploadStore::from_config(&config.server);
        uploads.ensure_dir()?;

        let db = Database::open(&config.database)?;
        let proxy = MapProxy::new(&config.map, Duration::from_secs(config.server.read_timeout))?;
        let state = AppState::new(db, uploads, proxy, PathBuf::from(&config.server.static_dir));

        info!(
            "Starting server on {}:{}",
            config.server.host, config.server.port
        );

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| MapMarkError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async {
            let web_server = WebServer::new(config.server, state);
            web_server.start().await
        })
    }
}
