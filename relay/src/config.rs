//! Relay Configuration
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use vc_common::WireId;

/// Default idle time after which a member is considered gone (5 minutes).
const DEFAULT_STALE_AFTER_SECS: u64 = 300;

/// Voice channel advertised by the `list` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDef {
    pub id: WireId,
    pub name: String,
}

/// Relay configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Server bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// Members idle for longer than this are dropped from peer lists.
    pub stale_after: Duration,

    /// Voice channels listed by the `list` action.
    pub channels: Vec<ChannelDef>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
            channels: vec![ChannelDef {
                id: WireId::new("1"),
                name: "General".into(),
            }],
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let stale_after = env::var("VC_RELAY_STALE_AFTER_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map_or(defaults.stale_after, Duration::from_secs);

        let channels = match env::var("VC_RELAY_CHANNELS") {
            Ok(raw) => parse_channels(&raw).context("VC_RELAY_CHANNELS is malformed")?,
            Err(_) => defaults.channels,
        };

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            stale_after,
            channels,
        })
    }
}

/// Parse `id:name` pairs separated by commas.
fn parse_channels(raw: &str) -> Result<Vec<ChannelDef>> {
    let mut channels = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((id, name)) = item.split_once(':') else {
            bail!("expected `id:name`, got `{item}`");
        };
        let (id, name) = (id.trim(), name.trim());
        if id.is_empty() || name.is_empty() {
            bail!("empty id or name in `{item}`");
        }
        channels.push(ChannelDef {
            id: WireId::new(id),
            name: name.to_string(),
        });
    }
    Ok(channels)
}
