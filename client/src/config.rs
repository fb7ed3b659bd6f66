//! Voice Client Configuration
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::discovery::TieBreak;

/// Default discovery interval (3 seconds).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Shortest discovery interval accepted; shorter values are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default timeout for a single relay request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// STUN server without credentials.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Public STUN servers used when none are configured.
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
    ]
}

/// Voice session configuration.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Signaling relay endpoint (e.g. "https://relay.example.com/voice")
    pub relay_url: String,

    /// Interval between discovery ticks
    pub poll_interval: Duration,

    /// Timeout applied to every relay request
    pub request_timeout: Duration,

    /// STUN/TURN servers handed to the media engine
    pub ice_servers: Vec<IceServerConfig>,

    /// Which side of a newly discovered pair initiates the handshake
    pub tie_break: TieBreak,
}

impl VoiceConfig {
    /// Configuration with defaults for everything but the relay URL.
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            ice_servers: default_ice_servers(),
            tie_break: TieBreak::default(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let relay_url = env::var("VC_RELAY_URL").context("VC_RELAY_URL must be set")?;
        let mut config = Self::new(relay_url);

        if let Some(ms) = env::var("VC_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
        {
            config = config.with_poll_interval(Duration::from_millis(ms));
        }

        if let Some(secs) = env::var("VC_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Ok(raw) = env::var("VC_STUN_SERVERS") {
            let stun: Vec<IceServerConfig> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(IceServerConfig::stun)
                .collect();
            config.ice_servers = stun;
        }

        if let Ok(turn) = env::var("VC_TURN_SERVER") {
            config.ice_servers.push(IceServerConfig {
                urls: vec![turn],
                username: env::var("VC_TURN_USERNAME").ok(),
                credential: env::var("VC_TURN_CREDENTIAL").ok(),
            });
        }

        if let Ok(raw) = env::var("VC_TIE_BREAK") {
            config.tie_break = raw
                .parse()
                .with_context(|| format!("invalid VC_TIE_BREAK: {raw}"))?;
        }

        Ok(config)
    }

    /// Override the discovery interval, no shorter than [`MIN_POLL_INTERVAL`].
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Override the tie-break policy.
    #[must_use]
    pub const fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }
}
