//! UDP discovery of miio devices
//!
//! The [`Browser`] broadcasts handshake probes, keeps a table of devices that
//! replied and reports when they appear, move and disappear.

pub mod browser;
pub mod hostname;
pub mod network;
pub mod service;
pub mod service_table;

// Re-export main types for convenience
pub use browser::{Browser, AVAILABILITY_GRACE};
pub use hostname::{HostnameInfo, HostnameLookup, MiioHostnames, ReverseResolver, SystemResolver};
pub use network::{probe_offsets, REBROADCAST_DELAY};
pub use service::{DiscoveryEvent, ServiceRecord};
pub use service_table::{Expired, Observation, Receipt, ServiceTable};
