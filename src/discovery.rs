/*!
 # Bridge discovery

 Resolves the local addresses of Hue bridges through the Hue portal, which reports
 every bridge that registered from the caller's public IP.
*/

use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::Result;

/// Portal lookup service for bridges on the caller's network
pub const PORTAL_URL: &str = "https://discovery.meethue.com/";

/// A bridge as the portal reports it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiscoveredBridge {
    pub id: String,
    #[serde(rename = "internalipaddress")]
    pub internal_ip_address: String,
    #[serde(rename = "macaddress", default)]
    pub mac_address: Option<String>,
}

impl DiscoveredBridge {
    /// Base URL for [`crate::HueBridge::new`]
    pub fn url(&self) -> String {
        format!("http://{}", self.internal_ip_address)
    }
}

/// Looks up the bridges on the local network through the Hue portal
pub async fn discover_bridges() -> Result<Vec<DiscoveredBridge>> {
    discover_bridges_at(PORTAL_URL).await
}

/// Looks up bridges through an alternative portal endpoint
#[instrument]
pub async fn discover_bridges_at(portal_url: &str) -> Result<Vec<DiscoveredBridge>> {
    debug!("Querying bridge portal");
    let bridges: Vec<DiscoveredBridge> = reqwest::get(portal_url)
        .await?
        .error_for_status()?
        .json()
        .await?;
    info!("Found {} bridge(s)", bridges.len());
    Ok(bridges)
}
