//! Discovery and registration of miio smart-home devices
//!
//! miio devices answer a UDP broadcast handshake on port 54321 with a small
//! binary header carrying their device id and, on older firmware, their
//! authentication token. This crate provides:
//!
//! - the packet codec for that header
//! - token resolution from the wire, a persistent store or manual config
//! - a discovery engine that probes, caches and expires devices
//! - a device registry that opens one connection per device and tracks
//!   gateway sub-devices
//!
//! # Example
//!
//! ```no_run
//! use miio_discovery::{Browser, DiscoveryConfig, DiscoveryEvent};
//!
//! # async fn run() -> miio_discovery::Result<()> {
//! let mut browser = Browser::new(DiscoveryConfig::default());
//! let mut events = browser.subscribe();
//! browser.start().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let DiscoveryEvent::Available(service) = event {
//!         println!("{} at {}", service.id, service.address);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod config;
pub mod discovery;
pub mod error;
pub mod packet;
pub mod registry;
pub mod tokens;

// Test support modules - available for both unit tests and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

// Re-export main types for convenience
pub use config::DiscoveryConfig;
pub use discovery::{Browser, DiscoveryEvent, ServiceRecord};
pub use error::{MiioError, Result};
pub use registry::{
    Connector, DeviceHandle, DeviceRegistry, Devices, Gateway, Registration, RegistryEvent,
    RegistryOptions, SubDeviceEvent,
};
pub use tokens::{Token, TokenStore};
