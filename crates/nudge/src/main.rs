//! nudge: background reminder service
//!
//! Subcommands:
//! - `daemon`: run the service until interrupted
//! - `version`: print the version

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use nudge_todo::{DEFAULT_AUTH_URL, DEFAULT_GRAPH_URL};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod daemon;

/// Application id registered for Microsoft To Do access.
const DEFAULT_CLIENT_ID: &str = "nudge-desktop";

#[derive(Parser)]
#[command(name = "nudge")]
#[command(about = "Background reminder service with Microsoft To Do sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reminder service
    Daemon {
        /// Directory for reminders, lists, queue, settings and account tokens
        #[arg(long, env = "NUDGE_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Microsoft Graph endpoint
        #[arg(long, env = "NUDGE_GRAPH_URL", default_value = DEFAULT_GRAPH_URL)]
        graph_url: String,

        /// Identity platform endpoint used for sign-in
        #[arg(long, env = "NUDGE_AUTH_URL", default_value = DEFAULT_AUTH_URL)]
        auth_url: String,

        /// OAuth client id
        #[arg(long, env = "NUDGE_CLIENT_ID", default_value = DEFAULT_CLIENT_ID)]
        client_id: String,

        /// Minutes between remote refreshes (overrides the saved setting)
        #[arg(long, env = "NUDGE_REFRESH_MINUTES")]
        refresh_minutes: Option<u32>,
    },

    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "nudge=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            data_dir,
            graph_url,
            auth_url,
            client_id,
            refresh_minutes,
        } => {
            daemon::run(daemon::DaemonConfig {
                data_dir: data_dir.unwrap_or_else(daemon::default_data_dir),
                graph_url,
                auth_url,
                client_id,
                refresh_minutes,
            })
            .await
        }

        Commands::Version => {
            println!("nudge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
