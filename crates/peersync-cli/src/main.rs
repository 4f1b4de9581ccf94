//! peersync CLI
//!
//! Thin wrapper around peersync-core functions for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show this replica's identity and state
//! peersync info
//!
//! # Name this replica for its peers
//! peersync name "kitchen tablet"
//!
//! # Edit and read local data
//! peersync set workout w1 title "Leg day"
//! peersync get workout w1
//!
//! # Inspect the change log
//! peersync changes --since 10
//!
//! # Manage peers
//! peersync peers add <site_id> --name laptop
//! peersync peers list --json
//!
//! # Run a syncing node
//! peersync serve --peer <site_id>@192.168.1.20:4433
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peersync_core::{SiteId, SyncConfig, SyncEngine, SyncEvent, Value};
use tokio::sync::broadcast;

/// peersync - local-first replica sync
#[derive(Parser)]
#[command(name = "peersync")]
#[command(version = "0.1.0")]
#[command(about = "peersync - local-first replica sync")]
#[command(
    long_about = "Keeps a local replica of a dataset and pulls every peer's changes over direct QUIC connections."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.peersync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show replica information
    Info,

    /// Set the name announced to peers
    Name {
        /// New device name
        name: String,
    },

    /// Write one cell
    Set {
        table: String,
        row: String,
        column: String,
        /// Value: integer, real, `null`, or text
        value: String,
    },

    /// Read a row, or every row of a table
    Get {
        table: String,
        row: Option<String>,
    },

    /// Show change log entries
    Changes {
        /// Only changes with db_version greater than this
        #[arg(short, long, default_value_t = 0)]
        since: u64,

        /// Site whose changes to show (default: this replica)
        #[arg(short, long)]
        origin: Option<String>,
    },

    /// Peer management
    Peers {
        #[command(subcommand)]
        action: PeersAction,
    },

    /// Configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Start syncing as a long-running node
    Serve {
        /// Peer to sync with: SITE_ID or SITE_ID@HOST:PORT[,HOST:PORT...]
        #[arg(short, long)]
        peer: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PeersAction {
    /// List known peers and their cursors
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a peer, or rename a known one
    Add {
        /// Peer site id (hex)
        site_id: String,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the effective configuration to a file
    Init {
        /// Destination path
        path: PathBuf,
    },
}

fn setup_logging(verbosity: u8, default_level: &str) {
    let filter = match verbosity {
        0 => default_level,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.peersync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peersync")
        .join("data")
}

/// Config file, then PEERSYNC_* environment, then command-line flags
fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig {
            data_dir: default_data_dir(),
            ..SyncConfig::default()
        },
    };

    let mut config = config.apply_env()?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

/// Parse a peer site id from hex string
fn parse_site_id(s: &str) -> Result<SiteId> {
    SiteId::from_str(s).map_err(|e| anyhow::anyhow!("Invalid site ID '{}': {}", s, e))
}

/// Parse `SITE_ID[@HOST:PORT[,HOST:PORT...]]`
fn parse_peer(s: &str) -> Result<(SiteId, Vec<SocketAddr>)> {
    let (id, addrs) = match s.split_once('@') {
        Some((id, addrs)) => (id, Some(addrs)),
        None => (s, None),
    };

    let id = parse_site_id(id)?;
    let addrs = match addrs {
        Some(addrs) => addrs
            .split(',')
            .map(|a| {
                a.parse::<SocketAddr>()
                    .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", a, e))
            })
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok((id, addrs))
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "(unknown)".to_string())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::PeerConnected { peer, direction } => {
            println!("[connected] {} ({:?})", peer.short(), direction);
        }
        SyncEvent::PeerDisconnected { peer } => {
            println!("[disconnected] {}", peer.short());
        }
        SyncEvent::ChangesApplied {
            from,
            changes,
            updated,
            ..
        } => {
            println!(
                "[sync] {} changes from {} ({} cells updated)",
                changes,
                from.short(),
                updated
            );
        }
        SyncEvent::MergeRejected { from, reason } => {
            println!("[rejected] batch from {}: {}", from.short(), reason);
        }
        SyncEvent::RoundCompleted(summary) => {
            if summary.attempted > 0 {
                println!(
                    "[round] {}/{} peers reached",
                    summary.succeeded, summary.attempted
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let default_level = match cli.command {
        Commands::Serve { .. } => config.log_level.clone(),
        _ => "warn".to_string(),
    };
    setup_logging(cli.verbose, &default_level);

    let mut engine = SyncEngine::new(config).await?;

    match cli.command {
        Commands::Info => {
            let peers = engine.list_peers()?;
            let local_changes = engine.local_changes(0)?;
            let db_version = local_changes.last().map(|c| c.db_version).unwrap_or(0);

            println!("peersync v0.1.0");
            println!();
            println!("Identity:");
            println!("  Site ID: {}", engine.site_id());
            println!("  Name: {}", engine.device_name()?);
            println!();
            println!("Data directory: {}", engine.config().data_dir.display());
            println!("Local db_version: {}", db_version);
            println!("Known peers: {}", peers.len());
        }

        Commands::Name { name } => {
            engine.set_device_name(&name)?;
            println!("Device name set to: {}", name);
        }

        Commands::Set {
            table,
            row,
            column,
            value,
        } => {
            let value = Value::parse_literal(&value);
            let change = engine.write_cell(&table, &row, &column, value)?;
            println!(
                "Set {}/{}.{} = {} (db_version {})",
                table, row, column, change.value, change.db_version
            );
        }

        Commands::Get { table, row } => match row {
            Some(row) => {
                let columns = engine.read_row(&table, &row)?;
                if columns.is_empty() {
                    println!("Row not found: {}/{}", table, row);
                } else {
                    println!("{}/{}:", table, row);
                    for (column, value) in columns {
                        println!("  {} = {}", column, value);
                    }
                }
            }
            None => {
                let rows = engine.list_rows(&table)?;
                if rows.is_empty() {
                    println!("No rows in {}.", table);
                } else {
                    println!("{} ({} rows):", table, rows.len());
                    for row in rows {
                        let columns: Vec<String> = row
                            .columns
                            .iter()
                            .map(|(c, v)| format!("{}={}", c, v))
                            .collect();
                        println!("  {}: {}", row.id, columns.join(", "));
                    }
                }
            }
        },

        Commands::Changes { since, origin } => {
            let origin = match origin {
                Some(origin) => parse_site_id(&origin)?,
                None => engine.site_id(),
            };
            let changes = engine.changes_since(&origin, since)?;

            if changes.is_empty() {
                println!("No changes from {} after {}.", origin.short(), since);
            } else {
                println!("Changes from {} after {} ({}):", origin.short(), since, changes.len());
                for change in changes {
                    println!(
                        "  {}.{} {}/{}.{} = {} (col_version {})",
                        change.db_version,
                        change.seq,
                        change.table,
                        change.row,
                        change.column,
                        change.value,
                        change.col_version
                    );
                }
            }
        }

        Commands::Peers { action } => match action {
            PeersAction::List { json } => {
                let peers = engine.list_peers()?;

                if json {
                    let entries: Vec<serde_json::Value> = peers
                        .iter()
                        .map(|peer| {
                            serde_json::json!({
                                "id": peer.id.to_hex(),
                                "name": peer.name,
                                "version": peer.version,
                                "last_seen": peer.last_seen,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                } else if peers.is_empty() {
                    println!("No peers found.");
                } else {
                    println!("Known peers ({}):", peers.len());
                    println!();
                    for peer in peers {
                        println!("  {} - {}", peer.id.short(), peer.display_name());
                        println!("    Full ID: {}", peer.id);
                        println!("    Cursor: {}", peer.version);
                        println!("    Last seen: {}", format_timestamp(peer.last_seen));
                        println!();
                    }
                }
            }

            PeersAction::Add { site_id, name } => {
                let id = parse_site_id(&site_id)?;
                if id == engine.site_id() {
                    anyhow::bail!("Cannot add this replica as its own peer");
                }
                let record = engine.add_peer(&id, name.as_deref()).await?;
                println!("Peer added: {}", record.display_name());
                println!("  ID: {}", record.id);
            }
        },

        Commands::Config { action } => match action {
            ConfigAction::Init { path } => {
                engine.config().save_to_file(&path)?;
                println!("Configuration written to {}", path.display());
            }
        },

        Commands::Serve { peer } => {
            let peers = peer
                .iter()
                .map(|p| parse_peer(p))
                .collect::<Result<Vec<_>>>()?;

            println!("Starting peersync...");
            println!();

            engine.start_networking().await?;
            let mut events = engine.subscribe_events()?;

            for (id, addrs) in peers {
                if !addrs.is_empty() {
                    let public_key = iroh::PublicKey::from_bytes(id.as_bytes())
                        .map_err(|e| anyhow::anyhow!("Invalid site ID '{}': {}", id, e))?;
                    let addr = addrs
                        .into_iter()
                        .fold(iroh::EndpointAddr::new(public_key), |addr, socket| {
                            addr.with_ip_addr(socket)
                        });
                    engine.add_peer_addr(addr)?;
                }
                engine.add_peer(&id, None).await?;
            }

            let addr = engine.endpoint_addr()?;
            println!("Identity:");
            println!("  Site ID: {}", engine.site_id());
            println!("  Name: {}", engine.device_name()?);
            println!();
            println!("Reachable at:");
            for socket in addr.ip_addrs() {
                println!("  {}@{}", engine.site_id(), socket);
            }
            println!();
            println!("Data directory: {}", engine.config().data_dir.display());
            println!();
            println!("Node is running. Press Ctrl+C to stop.");
            println!();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            engine.shutdown().await;
            println!("Stopped.");
        }
    }

    Ok(())
}
