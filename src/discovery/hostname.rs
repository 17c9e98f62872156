//! Hostname enrichment
//!
//! miio devices register DHCP hostnames such as
//! `zhimi-airpurifier-m1_miio12345678`, which encode the device model.

use crate::error::{MiioError, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::net::SocketAddr;

static MIIO_HOSTNAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<model>.+)_miio(?P<serial>\d+)$").expect("valid regex"));

/// Type and model derived from a hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnameInfo {
    pub device_type: String,
    pub model: String,
}

/// Maps hostnames to device type and model
pub trait HostnameLookup: Send + Sync {
    fn lookup(&self, hostname: &str) -> Option<HostnameInfo>;
}

/// Reverse DNS for a reporting address
#[async_trait]
pub trait ReverseResolver: Send + Sync {
    /// Hostname for `addr`, or `None` when the address has no name
    async fn lookup(&self, addr: SocketAddr) -> Result<Option<String>>;
}

/// Resolver backed by the system's `getnameinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl ReverseResolver for SystemResolver {
    async fn lookup(&self, addr: SocketAddr) -> Result<Option<String>> {
        let ip = addr.ip();
        let name = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip))
            .await
            .map_err(|e| MiioError::socket(format!("reverse lookup task failed: {e}")))??;

        // getnameinfo falls back to the numeric form when there is no PTR record
        if name.is_empty() || name.parse::<std::net::IpAddr>().is_ok() {
            Ok(None)
        } else {
            Ok(Some(name))
        }
    }
}

/// Hostname lookup for the miio naming scheme
#[derive(Debug, Clone)]
pub struct MiioHostnames {
    types: HashMap<String, String>,
}

impl Default for MiioHostnames {
    fn default() -> Self {
        Self::new()
    }
}

impl MiioHostnames {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// Register an exact model → type mapping, taking precedence over the
    /// built-in rules
    pub fn with_model(mut self, model: impl Into<String>, device_type: impl Into<String>) -> Self {
        self.types.insert(model.into(), device_type.into());
        self
    }

    fn type_for_model(&self, model: &str) -> String {
        if let Some(device_type) = self.types.get(model) {
            return device_type.clone();
        }

        let kind = model.split('.').nth(1).unwrap_or_default();
        let device_type = match kind {
            "gateway" => "gateway",
            "airpurifier" => "air-purifier",
            "humidifier" => "humidifier",
            "vacuum" => "vacuum",
            "plug" | "powerstrip" => "power-plug",
            "light" | "bulb" | "ceiling" | "lamp" => "light",
            "fan" => "fan",
            "aqi" | "airmonitor" => "air-monitor",
            _ => "generic",
        };
        device_type.to_string()
    }
}

impl HostnameLookup for MiioHostnames {
    fn lookup(&self, hostname: &str) -> Option<HostnameInfo> {
        // Reverse DNS may append the local search domain
        let host = hostname.split('.').next().unwrap_or(hostname);

        if let Some(caps) = MIIO_HOSTNAME.captures(host) {
            let model = caps["model"].replace('-', ".");
            let device_type = self.type_for_model(&model);
            return Some(HostnameInfo { device_type, model });
        }

        // Older gateways do not carry the _miio suffix
        if host.starts_with("lumi-gateway-") {
            return Some(HostnameInfo {
                device_type: "gateway".to_string(),
                model: "lumi.gateway.v3".to_string(),
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("zhimi-airpurifier-m1_miio12345678", "zhimi.airpurifier.m1", "air-purifier")]
    #[case("lumi-gateway-v3_miio98765", "lumi.gateway.v3", "gateway")]
    #[case("rockrobo-vacuum-v1_miio1", "rockrobo.vacuum.v1", "vacuum")]
    #[case("yeelink-light-color1_miio2.lan", "yeelink.light.color1", "light")]
    #[case("acme-toaster-v2_miio5", "acme.toaster.v2", "generic")]
    fn test_miio_hostnames(#[case] hostname: &str, #[case] model: &str, #[case] kind: &str) {
        let info = MiioHostnames::new().lookup(hostname).expect("recognised");
        assert_eq!(info.model, model);
        assert_eq!(info.device_type, kind);
    }

    #[test]
    fn test_bare_gateway_hostname() {
        let info = MiioHostnames::new().lookup("lumi-gateway-abcdef").unwrap();
        assert_eq!(info.device_type, "gateway");
    }

    #[test]
    fn test_unknown_hostname() {
        assert_eq!(MiioHostnames::new().lookup("laptop"), None);
        assert_eq!(MiioHostnames::new().lookup("printer_miio"), None);
    }

    #[test]
    fn test_custom_model_mapping() {
        let lookup = MiioHostnames::new().with_model("acme.toaster.v2", "toaster");
        let info = lookup.lookup("acme-toaster-v2_miio5").unwrap();
        assert_eq!(info.device_type, "toaster");
    }
}
