use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use hue_groups::*;
use std::path::PathBuf;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the group database (defaults to the per-user config directory)
    #[arg(long, env = "HUE_GROUPS_DB", global = true)]
    db: Option<PathBuf>,

    /// Bridge base URL, e.g. http://192.168.1.37 (discovered when omitted)
    #[arg(long, env = "HUE_BRIDGE", global = true)]
    bridge: Option<String>,

    /// Whitelisted bridge username
    #[arg(long, env = "HUE_USERNAME", global = true)]
    username: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the group database and the uncategorized group
    Init,
    /// Create a group, optionally inside another one
    AddGroup {
        name: String,
        /// Parent group
        #[arg(short, long)]
        parent: Option<String>,
    },
    /// Place a group inside another group
    Nest { child: String, parent: String },
    /// Register a light, optionally placing it in a group
    AddLight {
        name: String,
        /// Bridge id of the light
        base_id: i64,
        /// Group to place the light in
        #[arg(short, long)]
        group: Option<String>,
    },
    /// List lights, optionally only those within a group and its sub-groups
    Lights {
        #[arg(short, long)]
        group: Option<String>,
    },
    /// Show the group hierarchy
    Groups,
    /// Check whether a light sits directly in a group
    Check { light: String, group: String },
    /// Delete every light and group
    Purge {
        /// Leave the store empty instead of recreating the uncategorized group
        #[arg(long)]
        bare: bool,
    },
    /// Find bridges on the local network
    Discover,
    /// Register a new bridge user (press the link button first)
    Register {
        #[arg(short, long, default_value = "hue-groups")]
        device_type: String,
    },
    /// Import the bridge's lights into a group
    Sync {
        #[arg(short, long, default_value = UNCATEGORIZED)]
        group: String,
    },
    /// Turn every light in a group on
    On { group: String },
    /// Turn every light in a group off
    Off { group: String },
    /// Set the brightness of every light in a group
    Brightness {
        group: String,
        /// Brightness level (0-255)
        #[arg(short, long, default_value_t = 254)]
        level: u8,
    },
    /// Switch every light on the bridge one by one
    All {
        /// Turn the lights off instead of on
        #[arg(long)]
        off: bool,
        /// Seconds to wait between lights
        #[arg(short, long, default_value_t = 0)]
        interval: u64,
    },
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("hue_groups=info")),
        )
        .compact()
        .init();

    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let config = cli.db.clone().map(StoreConfig::new).unwrap_or_default();

    match cli.command {
        Commands::Init => {
            let store = open_store(&config)?;
            info!("Group store ready at {}", config.path().display());
            print_tree(&store)?;
        }
        Commands::AddGroup { name, parent } => {
            let store = open_store(&config)?;
            if !store.add_group(&name)? {
                warn!("Group '{}' already exists", name);
            }
            if let Some(parent) = parent {
                store.add_group_to_group(&name, &parent)?;
            }
        }
        Commands::Nest { child, parent } => {
            let store = open_store(&config)?;
            store.add_group_to_group(&child, &parent)?;
        }
        Commands::AddLight {
            name,
            base_id,
            group,
        } => {
            let store = open_store(&config)?;
            match group {
                Some(group) => store.add_light_to_group(&name, base_id, &group)?,
                None => store.add_light(&name, base_id)?,
            }
        }
        Commands::Lights { group } => {
            let store = open_store(&config)?;
            let lights = match group {
                Some(group) => store.get_lights_in_group(&group)?,
                None => store.get_lights()?,
            };
            for (name, base_id) in lights {
                println!("{base_id:>4}  {name}");
            }
        }
        Commands::Groups => {
            let store = open_store(&config)?;
            print_tree(&store)?;
        }
        Commands::Check { light, group } => {
            let store = open_store(&config)?;
            let found = store.get_light_in_group(&light, &group)?;
            if found.is_empty() {
                println!("'{light}' is not directly in '{group}'");
            } else {
                println!("'{light}' is in '{group}'");
            }
        }
        Commands::Purge { bare } => {
            let store = open_store(&config)?;
            store.purge()?;
            if !bare {
                store.initialize()?;
            }
        }
        Commands::Discover => {
            for bridge in discover_bridges().await? {
                println!("{}  {}", bridge.id, bridge.url());
            }
        }
        Commands::Register { device_type } => {
            let url = resolve_bridge_url(cli.bridge.as_deref()).await?;
            let username = HueBridge::create_user(&url, &device_type).await?;
            println!("{username}");
        }
        Commands::Sync { group } => {
            let store = open_store(&config)?;
            let bridge = connect(&cli.bridge, &cli.username).await?;
            let lights = bridge.list_lights().await?;
            store.add_lights_to_group(
                lights.iter().map(|(name, id)| (name.as_str(), *id)),
                &group,
            )?;
            info!("Imported {} lights into '{}'", lights.len(), group);
        }
        Commands::On { group } => {
            switch_group(&config, &cli.bridge, &cli.username, &group, LightState::on()).await?;
        }
        Commands::Off { group } => {
            switch_group(&config, &cli.bridge, &cli.username, &group, LightState::off()).await?;
        }
        Commands::Brightness { group, level } => {
            let state = LightState {
                on: Some(true),
                bri: Some(level),
                ..LightState::default()
            };
            switch_group(&config, &cli.bridge, &cli.username, &group, state).await?;
        }
        Commands::All { off, interval } => {
            let bridge = connect(&cli.bridge, &cli.username).await?;
            let interval = Duration::from_secs(interval);
            if off {
                bridge.turn_all_lights_off(interval).await?;
            } else {
                bridge.turn_all_lights_on(interval).await?;
            }
        }
    }

    Ok(())
}

/// Opens the store and makes sure the schema and default group exist
fn open_store(config: &StoreConfig) -> Result<GroupStore> {
    let store = GroupStore::open(config)?;
    store.initialize()?;
    Ok(store)
}

/// Uses the given bridge URL or falls back to the first discovered bridge
#[instrument]
async fn resolve_bridge_url(bridge: Option<&str>) -> Result<String> {
    if let Some(url) = bridge {
        return Ok(url.to_string());
    }
    debug!("No bridge given, discovering");
    let found = discover_bridges().await?;
    let first = found.first().ok_or(Error::NoBridgeFound)?;
    info!("Using bridge {} at {}", first.id, first.internal_ip_address);
    Ok(first.url())
}

async fn connect(bridge: &Option<String>, username: &Option<String>) -> Result<HueBridge> {
    let username = username
        .as_deref()
        .ok_or_else(|| eyre!("a bridge username is required (--username or HUE_USERNAME)"))?;
    let url = resolve_bridge_url(bridge.as_deref()).await?;
    Ok(HueBridge::new(&url, username)?)
}

/// Sends one state to every light within a group and its sub-groups
#[instrument(skip(config, bridge, username))]
async fn switch_group(
    config: &StoreConfig,
    bridge: &Option<String>,
    username: &Option<String>,
    group: &str,
    state: LightState,
) -> Result<()> {
    let store = open_store(config)?;
    let ids: Vec<i64> = store.get_lights_in_group(group)?.into_values().collect();
    if ids.is_empty() {
        warn!("Group '{}' has no lights", group);
        return Ok(());
    }

    let bridge = connect(bridge, username).await?;
    let results = bridge.set_lights_state(&ids, &state).await;
    let failures: Vec<_> = ids
        .iter()
        .zip(results)
        .filter_map(|(id, result)| result.err().map(|e| (id, e)))
        .collect();
    for (id, e) in &failures {
        error!("Light {} failed: {}", id, e);
    }
    if !failures.is_empty() {
        return Err(eyre!("{} of {} lights failed", failures.len(), ids.len()));
    }
    Ok(())
}

/// Prints every root group with its sub-groups and direct lights indented below it
fn print_tree(store: &GroupStore) -> Result<()> {
    for group in store.get_groups()? {
        if store.get_parent_group(&group)?.is_none() {
            print_group(store, &group, 0)?;
        }
    }
    let ungrouped = store.get_ungrouped_lights()?;
    if !ungrouped.is_empty() {
        println!("(no group)");
        for (light, base_id) in ungrouped {
            println!("  - {light} ({base_id})");
        }
    }
    Ok(())
}

fn print_group(store: &GroupStore, group: &str, depth: usize) -> Result<()> {
    let indent = "  ".repeat(depth);
    println!("{indent}{group}");
    for (light, base_id) in store.get_direct_lights(group)? {
        println!("{indent}  - {light} ({base_id})");
    }
    for child in store.get_child_groups(group)? {
        print_group(store, &child, depth + 1)?;
    }
    Ok(())
}
