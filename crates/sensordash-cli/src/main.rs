//! sensordash - command line client for the sensor monitoring API.
//!
//! Logs in against the backend, keeps the session between runs, and sends
//! authenticated requests to any resource path.

mod commands;

use std::io;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sensordash_core::{ApiClient, Config};

#[derive(Parser)]
#[command(name = "sensordash", version, about = "Sensor monitoring API client")]
struct Cli {
    /// Backend base URL (overrides SENSORDASH_API_URL and the config file)
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and store the session
    Login {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Create a new account
    Register,
    /// End the session and remove stored credentials
    Logout,
    /// Show whether a session is stored
    Status,
    /// Fetch the logged-in user's profile
    Whoami,
    /// Change the account password (ends the session)
    ChangePassword,
    /// Send an authenticated request and print the response body
    Request {
        /// HTTP method (GET, POST, PATCH, DELETE, ...)
        method: String,
        /// Resource path, e.g. /sensors or /servers/3/data
        path: String,
        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::load()?;
    let api_url = cli.api_url.clone().unwrap_or_else(|| config.api_url());
    info!(%api_url, storage = ?config.storage, "sensordash starting");

    let api = ApiClient::from_config(&config, &api_url)?;

    match cli.command {
        Command::Login { username } => commands::login(&api, &mut config, username).await,
        Command::Register => commands::register(&api).await,
        Command::Logout => commands::logout(&api),
        Command::Status => commands::status(&api, &api_url),
        Command::Whoami => commands::whoami(&api).await,
        Command::ChangePassword => commands::change_password(&api).await,
        Command::Request { method, path, data } => {
            commands::request(&api, &method, &path, data).await
        }
    }
}
