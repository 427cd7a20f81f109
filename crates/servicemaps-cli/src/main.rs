//! Service Maps CLI
//!
//! Command-line front end for the Service Maps sync engine: browse the
//! cached territories, record visits and calls, and drive synchronization.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use servicemaps_core::{Config, Engine, VisitSymbol};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "servicemaps")]
#[command(about = "Service Maps - local-first territory records")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// More log output on stderr (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Don't contact the server
    #[arg(long, global = true)]
    offline: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show startup state, sync status and cache contents
    Status,
    /// Upload pending changes and refresh the cache
    Sync,
    /// List territories
    #[command(alias = "ls")]
    Territories {
        /// Order by most recent visit instead
        #[arg(long)]
        recent: bool,
    },
    /// List the addresses of a territory
    Addresses {
        /// Territory ID
        territory: String,
    },
    /// List the houses at an address
    Houses {
        /// Address ID
        address: String,
    },
    /// List the visits to a house
    Visits {
        /// House ID
        house: String,
    },
    /// Record or remove visits
    Visit {
        #[command(subcommand)]
        command: VisitCommands,
    },
    /// List phone territories, or the numbers of one
    Phone {
        /// Phone territory ID
        territory: Option<String>,
    },
    /// List the calls to a number
    Calls {
        /// Phone number ID
        number: String,
    },
    /// Record calls
    Call {
        #[command(subcommand)]
        command: CallCommands,
    },
    /// List recalls
    Recalls,
    /// List access keys
    Keys,
    /// List changes waiting for upload
    Pending,
    /// Stay connected and print updates as they arrive
    Watch,
    /// Forget the cached data and pending changes
    Logout,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum VisitCommands {
    /// Record a visit now
    Add {
        /// House ID
        house: String,
        /// Visit symbol (NC, NT, O, H, M)
        #[arg(short, long, default_value = "NC")]
        symbol: VisitSymbol,
        /// Free-text notes
        #[arg(short, long, default_value = "")]
        notes: String,
    },
    /// Delete a visit
    #[command(alias = "rm")]
    Delete {
        /// Visit ID
        id: String,
    },
}

#[derive(Subcommand)]
enum CallCommands {
    /// Record a call now
    Add {
        /// Phone number ID
        number: String,
        /// Free-text notes
        #[arg(short, long, default_value = "")]
        notes: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (see `config show`)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    init_logging(cli.verbose);

    // Config commands don't need the store
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => {
                commands::config::show(cli.config.as_ref(), &output)
            }
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, cli.config.as_ref(), &output)
            }
        };
    }

    let mut config = load_config(cli.config.as_ref())?;
    if cli.offline {
        config.sync_enabled = false;
    }
    let engine = Engine::from_config(config)?;

    let is_write = matches!(
        &cli.command,
        Commands::Visit { .. } | Commands::Call { .. }
    );
    let is_read = !is_write
        && !matches!(
            &cli.command,
            Commands::Sync | Commands::Watch | Commands::Logout | Commands::Status
        );

    // Refresh before reads so listings are current
    if is_read {
        auto_sync(&engine, &output).await;
    }

    let result = match cli.command {
        Commands::Status => commands::status::show(&engine, &output).await,
        Commands::Sync => commands::sync::sync(&engine, &output).await,
        Commands::Territories { recent } => commands::browse::territories(&engine, recent, &output),
        Commands::Addresses { territory } => {
            commands::browse::addresses(&engine, territory, &output)
        }
        Commands::Houses { address } => commands::browse::houses(&engine, address, &output),
        Commands::Visits { house } => commands::browse::visits(&engine, house, &output),
        Commands::Visit { command } => match command {
            VisitCommands::Add {
                house,
                symbol,
                notes,
            } => commands::record::add_visit(&engine, house, symbol, notes, &output),
            VisitCommands::Delete { id } => commands::record::delete_visit(&engine, id, &output),
        },
        Commands::Phone { territory } => commands::browse::phone(&engine, territory, &output),
        Commands::Calls { number } => commands::browse::calls(&engine, number, &output),
        Commands::Call { command } => match command {
            CallCommands::Add { number, notes } => {
                commands::record::add_call(&engine, number, notes, &output)
            }
        },
        Commands::Recalls => commands::browse::recalls(&engine, &output),
        Commands::Keys => commands::browse::keys(&engine, &output),
        Commands::Pending => commands::pending::list(&engine, &output),
        Commands::Watch => commands::watch::run(&engine, &output).await,
        Commands::Logout => commands::sync::logout(&engine, &output).await,
        Commands::Config { .. } => Ok(()), // Handled above
    };

    // Push local changes right away
    if is_write && result.is_ok() {
        auto_sync(&engine, &output).await;
    }

    engine.shutdown().await;
    result
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

/// Log to stderr; `RUST_LOG` wins over `--verbose`
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "servicemaps_core={},servicemaps_cli={}",
            level, level
        ))
    });

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Sync if enabled and signed in; failures only warn
async fn auto_sync(engine: &Engine, output: &Output) {
    if !engine.config().sync_enabled {
        debug!("Sync disabled; using cached data");
        return;
    }
    if let Err(e) = engine.manager().synchronize().await {
        output.warn(&format!("Auto-sync failed: {}", e));
    }
}
