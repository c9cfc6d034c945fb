//! Setstore CLI
//!
//! Reads and edits a single settings state file through the engine, so
//! every change goes through the same quota checks and atomic writes as
//! an embedding service would use.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use setstore_common::{QuotaLimit, StoreConfig, VERSION_UNDEFINED};
use setstore_engine::{SettingsState, SharedLock};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "setstore")]
#[command(about = "Inspect and edit setstore state files")]
#[command(version)]
struct Args {
    /// State file (overrides the configured path)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Per-namespace byte ceiling: a byte count, "limited" or "unlimited"
    #[arg(long)]
    quota: Option<QuotaLimit>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the value of a setting
    Get {
        /// Setting name
        name: String,
    },
    /// Insert or replace a setting
    Put {
        /// Setting name
        name: String,
        /// New value
        value: String,
        /// Owning namespace
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Delete a setting
    Delete {
        /// Setting name
        name: String,
    },
    /// List settings
    List,
    /// Show or set the table version
    Version {
        /// New version
        set: Option<i32>,
    },
    /// Remove every setting owned by a namespace
    Purge {
        /// Namespace to remove
        namespace: String,
        /// Names to keep in addition to the configured ones
        #[arg(long = "protect")]
        protect: Vec<String>,
    },
    /// Rewrite the state file from the current table
    Flush,
    /// Dump the whole table
    Dump {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    const fn mutates(&self) -> bool {
        matches!(
            self,
            Self::Put { .. }
                | Self::Delete { .. }
                | Self::Purge { .. }
                | Self::Flush
                | Self::Version { set: Some(_) }
        )
    }
}

/// Build the store config from the optional file, `SETSTORE_*` env vars and flags
fn load_config(args: &Args) -> Result<StoreConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.as_path()));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("SETSTORE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("protected_names")
            .try_parsing(true),
    );

    let mut store: StoreConfig = builder
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(file) = &args.file {
        store.path.clone_from(file);
    }
    if let Some(quota) = args.quota {
        store.quota = quota;
    }
    store.validate()?;
    Ok(store)
}

fn print_value(value: Option<&str>) {
    match value {
        Some(value) => println!("{value}"),
        None => println!("(null)"),
    }
}

fn run(state: &SettingsState, command: Commands) -> Result<()> {
    let mutates = command.mutates();

    match command {
        Commands::Get { name } => match state.get(&name) {
            Some(setting) => print_value(setting.value.as_deref()),
            None => anyhow::bail!("no setting named '{name}'"),
        },
        Commands::Put {
            name,
            value,
            namespace,
        } => {
            let changed = state.insert(&name, Some(&value), namespace.as_deref())?;
            if !changed {
                info!("'{}' already has that value", name);
            }
        }
        Commands::Delete { name } => {
            if !state.delete(&name)? {
                anyhow::bail!("no setting named '{name}'");
            }
        }
        Commands::List => {
            for name in state.settings().into_iter().map(|s| s.name) {
                println!("{name}");
            }
        }
        Commands::Version { set: Some(version) } => state.set_version(version),
        Commands::Version { set: None } => match state.version() {
            VERSION_UNDEFINED => println!("undefined"),
            version => println!("{version}"),
        },
        Commands::Purge { namespace, protect } => {
            let removed = if protect.is_empty() {
                state.remove_namespace_default(&namespace)
            } else {
                let mut protected = state.protected_names().clone();
                protected.extend(protect);
                state.remove_namespace(&namespace, &protected)
            };
            println!("Removed {removed} settings");
        }
        Commands::Flush => info!("Rewriting {:?}", state.path()),
        Commands::Dump { json } => {
            let settings = state.settings();
            if json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                println!("{:<8} {:<32} {:<24} VALUE", "ID", "NAME", "NAMESPACE");
                println!("{}", "-".repeat(80));
                for s in settings {
                    println!(
                        "{:<8} {:<32} {:<24} {}",
                        s.id,
                        s.name,
                        s.namespace.as_deref().unwrap_or("-"),
                        s.value.as_deref().unwrap_or("(null)")
                    );
                }
            }
        }
    }

    if mutates {
        state
            .flush_now()
            .with_context(|| format!("failed to write {}", state.path().display()))?;
        debug!("Flushed {:?}", state.path());
    }
    Ok(())
}

fn open(config: StoreConfig) -> Result<SettingsState> {
    let context = format!("failed to open {}", config.path.display());
    SettingsState::open(config, SharedLock::new()).context(context)
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args)?;
    let state = open(config)?;
    let result = run(&state, args.command);
    state.shutdown();
    result
}
