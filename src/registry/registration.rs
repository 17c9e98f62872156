//! Registrations, registry options and registry events

use super::connector::DeviceHandle;
use crate::config::DiscoveryConfig;
use crate::discovery::ServiceRecord;
use crate::error::MiioError;
use std::fmt;
use std::sync::Arc;

/// Registry view of a device: the discovered service plus connection state
/// and position in the gateway tree
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,

    /// Discovered service; `None` for sub-devices reached through a gateway
    pub service: Option<ServiceRecord>,

    pub model: Option<String>,

    pub device_type: Option<String>,

    /// Live connection, once established
    pub device: Option<Arc<dyn DeviceHandle>>,

    /// Last connection failure
    pub error: Option<Arc<MiioError>>,

    /// Id of the gateway this device was reached through
    pub parent: Option<String>,
}

impl Registration {
    /// Registration for a discovered root device
    pub fn from_service(service: ServiceRecord) -> Self {
        Self {
            id: service.id.clone(),
            model: service.model.clone(),
            device_type: service.device_type.clone(),
            service: Some(service),
            device: None,
            error: None,
            parent: None,
        }
    }

    /// Registration for a sub-device of `parent`
    pub fn sub_device(parent: &str, device: Arc<dyn DeviceHandle>) -> Self {
        Self {
            id: device.id().to_string(),
            service: None,
            model: device.model().map(str::to_string),
            device_type: device.device_type().map(str::to_string),
            device: Some(device),
            error: None,
            parent: Some(parent.to_string()),
        }
    }

    pub fn has_token(&self) -> bool {
        self.service.as_ref().is_some_and(ServiceRecord::has_token)
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    pub fn is_sub_device(&self) -> bool {
        self.parent.is_some()
    }

    /// Record a successful connection, filling in what the device reports
    /// about itself
    pub(crate) fn attach(&mut self, device: Arc<dyn DeviceHandle>) {
        if let Some(model) = device.model() {
            self.model = Some(model.to_string());
        }
        if let Some(device_type) = device.device_type() {
            self.device_type = Some(device_type.to_string());
        }
        self.device = Some(device);
        self.error = None;
    }
}

/// Predicate deciding which devices are registered
pub type RegistrationFilter = Arc<dyn Fn(&Registration) -> bool + Send + Sync>;

/// Registry behaviour
#[derive(Clone, Default)]
pub struct RegistryOptions {
    pub filter: Option<RegistrationFilter>,

    /// Do not register sub-devices of gateways
    pub skip_sub_devices: bool,
}

impl RegistryOptions {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            filter: None,
            skip_sub_devices: config.skip_sub_devices,
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Registration) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_skip_sub_devices(mut self, skip: bool) -> Self {
        self.skip_sub_devices = skip;
        self
    }

    pub(crate) fn accepts(&self, registration: &Registration) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(registration))
    }
}

impl fmt::Debug for RegistryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryOptions")
            .field("filter", &self.filter.is_some())
            .field("skip_sub_devices", &self.skip_sub_devices)
            .finish()
    }
}

/// Lifecycle events of the device registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// Device registered; carries the connection or the connection error
    Available(Registration),

    /// Device removed and its connection released
    Unavailable(Registration),

    /// Connection attempt failed
    Error {
        error: Arc<MiioError>,
        registration: Registration,
    },
}

impl RegistryEvent {
    pub fn registration(&self) -> &Registration {
        match self {
            RegistryEvent::Available(registration)
            | RegistryEvent::Unavailable(registration)
            | RegistryEvent::Error { registration, .. } => registration,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RegistryEvent::Available(_) => "available",
            RegistryEvent::Unavailable(_) => "unavailable",
            RegistryEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use crate::tokens::Token;

    fn service(id: &str) -> ServiceRecord {
        let mut record = ServiceRecord::new(id, "10.0.0.2:54321".parse().unwrap());
        record.model = Some("zhimi.airpurifier.m1".into());
        record.device_type = Some("air-purifier".into());
        record
    }

    #[test]
    fn test_from_service() {
        let registration = Registration::from_service(service("1"));
        assert_eq!(registration.id, "1");
        assert_eq!(registration.model.as_deref(), Some("zhimi.airpurifier.m1"));
        assert!(!registration.has_token());
        assert!(!registration.is_connected());
        assert!(!registration.is_sub_device());
    }

    #[test]
    fn test_has_token() {
        let token: Token = "00112233445566778899aabbccddeeff".parse().unwrap();
        let registration = Registration::from_service(service("1").with_token(token, true));
        assert!(registration.has_token());
    }

    #[test]
    fn test_attach_prefers_device_metadata() {
        let mut registration = Registration::from_service(service("1"));
        registration.error = Some(Arc::new(MiioError::connection("refused")));

        let device = MockDevice::new("1").with_model("zhimi.airpurifier.m2");
        registration.attach(Arc::new(device));

        assert_eq!(registration.model.as_deref(), Some("zhimi.airpurifier.m2"));
        assert_eq!(registration.device_type.as_deref(), Some("air-purifier"));
        assert!(registration.is_connected());
        assert!(registration.error.is_none());
    }

    #[test]
    fn test_sub_device_registration() {
        let device = MockDevice::new("158d0001").with_type("sensor");
        let registration = Registration::sub_device("99", Arc::new(device));
        assert_eq!(registration.parent.as_deref(), Some("99"));
        assert_eq!(registration.device_type.as_deref(), Some("sensor"));
        assert!(registration.is_connected());
        assert!(!registration.has_token());
    }

    #[test]
    fn test_filter() {
        let options = RegistryOptions::default().with_filter(|r| r.id != "2");
        assert!(options.accepts(&Registration::from_service(service("1"))));
        assert!(!options.accepts(&Registration::from_service(service("2"))));
        assert!(RegistryOptions::default().accepts(&Registration::from_service(service("2"))));
    }
}
