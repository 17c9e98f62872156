//! Connection collaborators
//!
//! The registry does not speak the miio command protocol itself. A
//! [`Connector`] turns a discovered service into a live [`DeviceHandle`];
//! handles that front a gateway expose their child devices through the
//! [`Gateway`] capability.

use crate::discovery::ServiceRecord;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Opens connections to discovered devices
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the device behind `service`. Only called for services
    /// with a token.
    async fn connect(&self, service: &ServiceRecord) -> Result<Arc<dyn DeviceHandle>>;
}

/// A connected device
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn model(&self) -> Option<&str> {
        None
    }

    fn device_type(&self) -> Option<&str> {
        None
    }

    /// Sub-device capability, present on gateways
    fn gateway(&self) -> Option<&dyn Gateway> {
        None
    }

    /// Release the connection. Called exactly once by the registry when
    /// the device is removed or the registry stops.
    fn destroy(&self);
}

/// Sub-device lifecycle of a gateway
pub trait Gateway: Send + Sync {
    /// Sub-devices known right now
    fn sub_devices(&self) -> Vec<Arc<dyn DeviceHandle>>;

    /// Future sub-device changes
    fn subscribe(&self) -> broadcast::Receiver<SubDeviceEvent>;
}

/// Sub-device change reported by a gateway
#[derive(Debug, Clone)]
pub enum SubDeviceEvent {
    Available(Arc<dyn DeviceHandle>),
    /// Id of the sub-device that went away
    Unavailable(String),
}
