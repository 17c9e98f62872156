//! Discovery configuration
//!
//! Configuration can be built in code, read from a TOML file, and overlaid
//! from `MIIO_*` environment variables.

use crate::error::{MiioError, Result};
use crate::tokens::Token;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Well-known miio UDP port
pub const MIIO_PORT: u16 = 54321;

/// Default cache time in seconds (30 minutes)
pub const DEFAULT_CACHE_TIME: u64 = 1800;

/// Discovery engine and registry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Cache time in seconds. Probes go out every third of it, records not
    /// refreshed within it expire.
    pub cache_time: u64,

    /// Consult the persistent token store for devices hiding their token
    pub use_token_storage: bool,

    /// Manually configured tokens by device id
    pub tokens: HashMap<String, Token>,

    /// Do not register sub-devices of gateways
    pub skip_sub_devices: bool,

    /// Destination port of handshake probes
    pub port: u16,

    /// Destination address of handshake probes
    pub broadcast_address: Ipv4Addr,

    /// Local address the discovery socket binds to
    pub bind_address: SocketAddr,

    /// Token file; defaults to the user data directory
    pub token_store_path: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_time: DEFAULT_CACHE_TIME,
            use_token_storage: true,
            tokens: HashMap::new(),
            skip_sub_devices: false,
            port: MIIO_PORT,
            broadcast_address: Ipv4Addr::BROADCAST,
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            token_store_path: None,
        }
    }
}

impl DiscoveryConfig {
    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MiioError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        debug!("Loaded discovery config from {}", path.display());
        Self::from_toml_str(&contents)
    }

    /// Overlay values from `MIIO_CACHE_TIME`, `MIIO_USE_TOKEN_STORAGE`,
    /// `MIIO_BROADCAST_ADDRESS` and `MIIO_PORT`
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var("MIIO_CACHE_TIME") {
            self.cache_time = value
                .parse()
                .map_err(|_| MiioError::config(format!("MIIO_CACHE_TIME: {value:?}")))?;
        }
        if let Ok(value) = std::env::var("MIIO_USE_TOKEN_STORAGE") {
            self.use_token_storage = parse_bool(&value).ok_or_else(|| {
                MiioError::config(format!("MIIO_USE_TOKEN_STORAGE: {value:?}"))
            })?;
        }
        if let Ok(value) = std::env::var("MIIO_BROADCAST_ADDRESS") {
            self.broadcast_address = value.parse().map_err(|_| {
                MiioError::config(format!("MIIO_BROADCAST_ADDRESS: {value:?}"))
            })?;
        }
        if let Ok(value) = std::env::var("MIIO_PORT") {
            self.port = value
                .parse()
                .map_err(|_| MiioError::config(format!("MIIO_PORT: {value:?}")))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache_time == 0 {
            return Err(MiioError::config("cache_time must be at least 1 second"));
        }
        if self.port == 0 {
            return Err(MiioError::config("port must not be 0"));
        }
        Ok(())
    }

    /// Records not refreshed within this window expire
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_time)
    }

    /// Interval between search cycles
    pub fn search_interval(&self) -> Duration {
        self.cache_ttl() / 3
    }

    /// Destination of handshake probes
    pub fn probe_target(&self) -> SocketAddr {
        SocketAddr::from((self.broadcast_address, self.port))
    }

    pub fn with_cache_time(mut self, seconds: u64) -> Self {
        self.cache_time = seconds;
        self
    }

    pub fn with_token(mut self, id: impl Into<String>, token: Token) -> Self {
        self.tokens.insert(id.into(), token);
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
