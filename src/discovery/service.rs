//! Discovered service records and discovery events

use crate::tokens::Token;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// One discovered device endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Device id from the packet header, in decimal
    pub id: String,

    /// Address the reply came from
    pub address: IpAddr,

    /// Port the reply came from
    pub port: u16,

    /// Token usable for commands, if one is known
    pub token: Option<Token>,

    /// True when the token was read from the wire rather than storage or
    /// manual configuration
    pub auto_token: bool,

    /// When the last reply arrived
    pub last_seen: DateTime<Utc>,

    /// Reverse DNS name of the address
    pub hostname: Option<String>,

    /// Device type derived from the hostname
    #[serde(rename = "type")]
    pub device_type: Option<String>,

    /// Device model derived from the hostname
    pub model: Option<String>,
}

impl ServiceRecord {
    pub fn new(id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            address: addr.ip(),
            port: addr.port(),
            token: None,
            auto_token: false,
            last_seen: Utc::now(),
            hostname: None,
            device_type: None,
            model: None,
        }
    }

    pub fn with_token(mut self, token: Token, auto_token: bool) -> Self {
        self.token = Some(token);
        self.auto_token = auto_token;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// A connection can only be attempted when a token is known
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }
}

/// Lifecycle events emitted by the discovery engine
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A new device was found; emitted once per id until it goes away
    Available(ServiceRecord),

    /// A known device replied from a different address
    Update(ServiceRecord),

    /// A device stopped replying within the cache time
    Unavailable(ServiceRecord),
}

impl DiscoveryEvent {
    pub fn record(&self) -> &ServiceRecord {
        match self {
            DiscoveryEvent::Available(record)
            | DiscoveryEvent::Update(record)
            | DiscoveryEvent::Unavailable(record) => record,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryEvent::Available(_) => "available",
            DiscoveryEvent::Update(_) => "update",
            DiscoveryEvent::Unavailable(_) => "unavailable",
        }
    }
}
