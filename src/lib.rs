/*!
 # Hue bridge client and hierarchical light group store

 A Rust library for talking to the Philips Hue bridge's local REST API and for
 organizing the lights it reports into nested, user-defined groups. The bridge
 only knows a flat group concept, so the hierarchy lives in a local SQLite file.

 ## Features

 * Bridge discovery through the Hue portal
 * One generic `invoke` call plus wrappers for lights, groups, schedules and configuration
 * Bridge error responses classified by code and rendered into readable messages
 * Group store with nested groups, move-on-assign lights and transitive membership queries

 ## Example

 ```no_run
 use hue_groups::*;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     // Find a bridge on the local network
     let found = discover_bridges().await?;
     let address = found.first().ok_or(Error::NoBridgeFound)?.url();
     let bridge = HueBridge::new(&address, "my-whitelisted-user")?;

     // Organize the lights the bridge knows about
     let store = GroupStore::in_memory()?;
     store.initialize()?;
     store.add_group("Bedroom")?;
     for (name, base_id) in bridge.list_lights().await? {
         store.add_light_to_group(&name, base_id, "Bedroom")?;
     }

     // Turn every light in the group on at once
     let ids: Vec<i64> = store.get_lights_in_group("Bedroom")?.into_values().collect();
     bridge.set_lights_state(&ids, &LightState::on()).await;

     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Custom error types for the Hue client and the group store
#[derive(Error, Debug)]
pub enum Error {
    /// An operation referenced a group name with no matching row
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// A single-row lookup matched zero or several rows
    #[error("Expected exactly one {entity} named {name:?}, found {matches}")]
    AmbiguousOrMissingEntity {
        entity: &'static str,
        name: String,
        matches: usize,
    },

    /// Parenting would make a group its own ancestor
    #[error("Cannot place group {child:?} under {parent:?}: would create a cycle")]
    CycleDetected { child: String, parent: String },

    /// Backing SQLite store failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The directory holding the store file could not be created
    #[error("Storage error: cannot prepare {}: {source}", .path.display())]
    StorageLocation {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// IO error, e.g. reading driver input
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure talking to the bridge or the portal
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bridge address without an http or https scheme
    #[error("No valid scheme found in {0:?}, please include one of 'http' or 'https'")]
    InvalidUrl(String),

    /// The bridge answered with an error element
    #[error("api_failure: {0}")]
    Bridge(#[from] BridgeError),

    /// The bridge answered with JSON of an unexpected shape
    #[error("Unexpected bridge response: {0}")]
    UnexpectedResponse(String),

    /// Discovery returned no bridges
    #[error("No Hue bridge found on the local network")]
    NoBridgeFound,

    /// A driver command line that names no command or has the wrong arguments
    #[error("Unknown command or wrong arguments: {0}")]
    InvalidCommand(String),

    /// A light id that is not an integer
    #[error("Invalid light id: {0}")]
    InvalidLightId(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod hue_error;
pub mod store;

pub use bridge::{HueBridge, LightState, Method};
pub use config::StoreConfig;
pub use discovery::{discover_bridges, discover_bridges_at, DiscoveredBridge};
pub use hue_error::{BridgeError, BridgeErrorKind};
pub use store::{GroupStore, UNCATEGORIZED};
