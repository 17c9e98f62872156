//! Discovery engine and registry bundled together

use super::{Connector, DeviceRegistry, Registration, RegistryEvent, RegistryOptions};
use crate::config::DiscoveryConfig;
use crate::discovery::Browser;
use crate::error::{MiioError, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Discovers devices and keeps a connection open to each of them
#[derive(Debug)]
pub struct Devices {
    browser: Browser,
    registry: DeviceRegistry,
}

impl Devices {
    /// Build from configuration with the default browser collaborators
    pub fn new(config: DiscoveryConfig, connector: Arc<dyn Connector>) -> Self {
        let options = RegistryOptions::from_config(&config);
        Self::with_browser(Browser::new(config), connector, options)
    }

    /// Wrap an already configured browser
    pub fn with_browser(
        browser: Browser,
        connector: Arc<dyn Connector>,
        options: RegistryOptions,
    ) -> Self {
        let registry = DeviceRegistry::spawn(browser.subscribe(), connector, options);
        Self { browser, registry }
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    /// Subscribe to registry events. Subscribe before `start` to see every
    /// device.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Start discovery. A stopped `Devices` cannot be started again.
    pub async fn start(&mut self) -> Result<()> {
        if !self.registry.is_running() {
            return Err(MiioError::NotRunning);
        }
        self.browser.start().await
    }

    /// Stop discovery and release every connection
    pub async fn stop(&mut self) {
        self.browser.stop().await;
        self.registry.stop().await;
    }

    pub async fn registrations(&self) -> Result<Vec<Registration>> {
        self.registry.registrations().await
    }
}
