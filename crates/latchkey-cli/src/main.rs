//! `latchkey` administration tool.
//!
//! # Usage
//!
//! ```bash
//! latchkey [--config FILE] [--data-dir DIR] <command>
//! ```
//!
//! # Commands
//!
//! - `add-user <LOCATION>...` - Add or replace a user in each location
//! - `remove-user <LOCATION>...` - Remove a user from each location
//! - `list-users <LOCATION>` - Show the users of one location
//! - `expired [--archive] <LOCATION>...` - List expired users, optionally moving them to `expired.json`
//! - `revive [NAME]` - Restore an archived user to the locations it expired from
//! - `set-lifetime <NAME> <RULE>` - Write a lifetime rule (`30d`, `+10d`, `2025-12-31`, `*`)
//! - `connect [--location L] [--wait-ms N]` - Connect to the configured locks
//!
//! Set `RUST_LOG` to change the log level (default `info`).

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use latchkey_core::Location;
use latchkey_storage::LifetimeRule;
use tracing_subscriber::EnvFilter;

mod commands;

/// Manage Latchkey users and check lock connectivity.
#[derive(Debug, Parser)]
#[command(name = "latchkey", version, about, long_about = None)]
struct Cli {
    /// Configuration file [default: latchkey.toml if present]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory with credential files and audit logs; overrides the config
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Add a user to one or more locations.
    ///
    /// Prompts for the name and the password (twice). An existing user
    /// with the same name is replaced.
    #[command(name = "add-user")]
    AddUser {
        /// Location codes (1, 2, w)
        #[arg(required = true)]
        locations: Vec<String>,
    },

    /// Remove a user from one or more locations.
    #[command(name = "remove-user")]
    RemoveUser {
        #[arg(required = true)]
        locations: Vec<String>,
    },

    /// List the users of a location with their modification dates.
    #[command(name = "list-users")]
    ListUsers { location: Location },

    /// List users whose lifetime has run out.
    Expired {
        /// Move the expired users to the archive
        #[arg(long)]
        archive: bool,

        #[arg(required = true)]
        locations: Vec<String>,
    },

    /// Put an archived user back with the archived password.
    ///
    /// Prompts for the name when none is given.
    Revive { name: Option<String> },

    /// Set the lifetime rule of a user, or of `-default-`.
    #[command(name = "set-lifetime")]
    SetLifetime {
        name: String,

        /// `30d`, `+10d`, `2025-12-31` or `*` for never
        rule: LifetimeRule,
    },

    /// Start the configured transports and wait for them to connect.
    Connect {
        /// Only connect to this location
        #[arg(short, long)]
        location: Option<Location>,

        /// How long to wait for each lock
        #[arg(long, default_value_t = 15_000)]
        wait_ms: u64,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let ctx = commands::Context::new(cli.config, cli.data_dir)?;
    match cli.command {
        Commands::AddUser { locations } => commands::add_user(&ctx, &locations),
        Commands::RemoveUser { locations } => commands::remove_user(&ctx, &locations),
        Commands::ListUsers { location } => commands::list_users(&ctx, location),
        Commands::Expired { archive, locations } => {
            commands::expired(&ctx, &locations, archive).await
        }
        Commands::Revive { name } => commands::revive(&ctx, name),
        Commands::SetLifetime { name, rule } => commands::set_lifetime(&ctx, &name, rule),
        Commands::Connect { location, wait_ms } => {
            commands::connect(&ctx, location, wait_ms).await
        }
    }
}
