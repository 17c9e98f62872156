//! Mock implementations for testing
//!
//! This module provides mock connectors, devices and resolvers for unit and
//! integration tests.

use crate::discovery::{ReverseResolver, ServiceRecord};
use crate::error::{MiioError, Result};
use crate::registry::{Connector, DeviceHandle, Gateway, SubDeviceEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Mock device connection
#[derive(Debug)]
pub struct MockDevice {
    id: String,
    model: Option<String>,
    device_type: Option<String>,
    gateway: Option<Arc<MockGateway>>,
    destroyed: AtomicBool,
}

impl MockDevice {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: None,
            device_type: None,
            gateway: None,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Make this device a gateway fronting `gateway`'s children
    pub fn with_gateway(mut self, gateway: Arc<MockGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl DeviceHandle for MockDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    fn device_type(&self) -> Option<&str> {
        self.device_type.as_deref()
    }

    fn gateway(&self) -> Option<&dyn Gateway> {
        self.gateway.as_deref().map(|g| g as &dyn Gateway)
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Mock gateway whose children are added and removed by the test
#[derive(Debug)]
pub struct MockGateway {
    children: Mutex<Vec<Arc<MockDevice>>>,
    events: broadcast::Sender<SubDeviceEvent>,
}

impl MockGateway {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            children: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Add a child and notify subscribers
    pub fn add_child(&self, child: Arc<MockDevice>) {
        if let Ok(mut children) = self.children.lock() {
            children.push(child.clone());
        }
        let _ = self.events.send(SubDeviceEvent::Available(child));
    }

    /// Remove a child and notify subscribers
    pub fn remove_child(&self, id: &str) {
        if let Ok(mut children) = self.children.lock() {
            children.retain(|c| c.id != id);
        }
        let _ = self.events.send(SubDeviceEvent::Unavailable(id.to_string()));
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway for MockGateway {
    fn sub_devices(&self) -> Vec<Arc<dyn DeviceHandle>> {
        self.children
            .lock()
            .map(|children| {
                children
                    .iter()
                    .map(|c| c.clone() as Arc<dyn DeviceHandle>)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<SubDeviceEvent> {
        self.events.subscribe()
    }
}

/// Mock connector handing out [`MockDevice`]s
#[derive(Debug, Default)]
pub struct MockConnector {
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
    failures: Mutex<HashMap<String, usize>>,
    delay: Duration,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every connection attempt
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Return `device` when its id is connected
    pub fn with_device(self, device: Arc<MockDevice>) -> Self {
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(device.id.clone(), device);
        }
        self
    }

    /// Fail the next `times` attempts for `id`
    pub fn failing(self, id: impl Into<String>, times: usize) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(id.into(), times);
        }
        self
    }

    /// Connection attempts so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Device handed out (or preconfigured) for `id`
    pub fn device(&self, id: &str) -> Option<Arc<MockDevice>> {
        self.devices.lock().ok()?.get(id).cloned()
    }

    fn take_failure(&self, id: &str) -> bool {
        let Ok(mut failures) = self.failures.lock() else {
            return false;
        };
        match failures.get_mut(id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, service: &ServiceRecord) -> Result<Arc<dyn DeviceHandle>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.take_failure(&service.id) {
            return Err(MiioError::connection(format!(
                "mock connection to {} refused",
                service.id
            )));
        }

        let mut devices = self
            .devices
            .lock()
            .map_err(|_| MiioError::connection("mock state poisoned"))?;
        let device = devices
            .entry(service.id.clone())
            .or_insert_with(|| {
                let mut device = MockDevice::new(service.id.clone());
                device.model = service.model.clone();
                device.device_type = service.device_type.clone();
                Arc::new(device)
            })
            .clone();
        Ok(device as Arc<dyn DeviceHandle>)
    }
}

/// Reverse resolver with a fixed answer
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hostname: Option<String>,
    delay: Option<Duration>,
}

impl StaticResolver {
    /// Resolve every address to `hostname`
    pub fn hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            delay: None,
        }
    }

    /// Resolve nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// Answer only after `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ReverseResolver for StaticResolver {
    async fn lookup(&self, _addr: SocketAddr) -> Result<Option<String>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.hostname.clone())
    }
}
