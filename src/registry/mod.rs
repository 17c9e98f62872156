//! Device registry
//!
//! Turns discovery events into device connections. One registration exists
//! per device id; gateways contribute child registrations for their
//! sub-devices, linked back by parent id. The registry runs as a single task
//! that owns the registration table, so connection results, sub-device
//! changes and discovery events are applied one at a time.

pub mod connector;
pub mod devices;
pub mod registration;

pub use connector::{Connector, DeviceHandle, Gateway, SubDeviceEvent};
pub use devices::Devices;
pub use registration::{Registration, RegistrationFilter, RegistryEvent, RegistryOptions};

use crate::discovery::{DiscoveryEvent, ServiceRecord};
use crate::error::{MiioError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Capacity of the registry event channel
pub const REGISTRY_EVENT_CAPACITY: usize = 1024;

/// Handle to a running registry task
pub struct DeviceRegistry {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<RegistryEvent>,
    task: Option<JoinHandle<()>>,
}

enum Command {
    Registrations(oneshot::Sender<Vec<Registration>>),
    Stop,
}

enum Completion {
    Connected {
        id: String,
        epoch: u64,
        result: Result<Arc<dyn DeviceHandle>>,
    },
    SubDevice {
        parent: String,
        epoch: u64,
        event: SubDeviceEvent,
    },
}

impl DeviceRegistry {
    /// Start a registry consuming `discovery`
    pub fn spawn(
        discovery: broadcast::Receiver<DiscoveryEvent>,
        connector: Arc<dyn Connector>,
        options: RegistryOptions,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(REGISTRY_EVENT_CAPACITY);

        let task = RegistryTask {
            options,
            connector,
            discovery,
            commands: commands_rx,
            completions_tx,
            completions_rx,
            events: events.clone(),
            entries: HashMap::new(),
            tasks: JoinSet::new(),
            next_epoch: 0,
        };

        Self {
            commands,
            events,
            task: Some(tokio::spawn(task.run())),
        }
    }

    /// Subscribe to registry events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Snapshot of current registrations, ordered by id
    pub async fn registrations(&self) -> Result<Vec<Registration>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Registrations(reply))
            .map_err(|_| MiioError::NotRunning)?;
        rx.await.map_err(|_| MiioError::NotRunning)
    }

    /// Release every connection and stop the task. Idempotent.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.commands.send(Command::Stop);
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!("Registry task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(Command::Stop);
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("running", &self.is_running())
            .finish()
    }
}

struct Entry {
    registration: Registration,
    /// A connection attempt is in flight
    connecting: bool,
    epoch: u64,
    /// Task forwarding gateway sub-device events
    forwarder: Option<AbortHandle>,
}

impl Entry {
    /// Release the connection and stop listening to sub-devices
    fn release(self) -> Registration {
        if let Some(forwarder) = self.forwarder {
            forwarder.abort();
        }
        if let Some(device) = &self.registration.device {
            device.destroy();
        }
        self.registration
    }
}

struct RegistryTask {
    options: RegistryOptions,
    connector: Arc<dyn Connector>,
    discovery: broadcast::Receiver<DiscoveryEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    events: broadcast::Sender<RegistryEvent>,
    entries: HashMap<String, Entry>,
    tasks: JoinSet<()>,
    next_epoch: u64,
}

impl RegistryTask {
    async fn run(mut self) {
        let mut discovery_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Registrations(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Stop) | None => break,
                },
                received = self.discovery.recv(), if discovery_open => match received {
                    Ok(event) => self.handle_discovery(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Registry missed {} discovery events", skipped);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Discovery source closed");
                        discovery_open = false;
                    }
                },
                Some(completion) = self.completions_rx.recv() => self.handle_completion(completion),
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        }

        self.tasks.abort_all();
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            entry.release();
        }
        info!("Registry stopped, released {} registrations", count);
    }

    fn snapshot(&self) -> Vec<Registration> {
        let mut registrations: Vec<Registration> = self
            .entries
            .values()
            .map(|entry| entry.registration.clone())
            .collect();
        registrations.sort_by(|a, b| a.id.cmp(&b.id));
        registrations
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    fn handle_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Available(service) => self.handle_available(service),
            DiscoveryEvent::Update(service) => {
                if let Some(entry) = self.entries.get_mut(&service.id) {
                    entry.registration.service = Some(service);
                }
            }
            DiscoveryEvent::Unavailable(service) => self.remove(&service.id),
        }
    }

    fn handle_available(&mut self, service: ServiceRecord) {
        if let Some(entry) = self.entries.get_mut(&service.id) {
            // A failed connection is retried; anything else is a repeat
            let retry = entry.registration.error.is_some()
                && !entry.connecting
                && service.has_token();
            if !retry {
                debug!(device = %service.id, "Already registered");
                return;
            }

            info!(device = %service.id, "Retrying connection");
            entry.registration.service = Some(service.clone());
            entry.connecting = true;
            let epoch = entry.epoch;
            self.connect(service, epoch);
            return;
        }

        let registration = Registration::from_service(service.clone());
        if !self.options.accepts(&registration) {
            debug!(device = %service.id, "Rejected by filter");
            return;
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let has_token = registration.has_token();

        self.entries.insert(
            service.id.clone(),
            Entry {
                registration: registration.clone(),
                connecting: has_token,
                epoch,
                forwarder: None,
            },
        );

        if has_token {
            self.connect(service, epoch);
        } else {
            info!(device = %service.id, "Registered device without token");
            self.emit(RegistryEvent::Available(registration));
        }
    }

    fn connect(&mut self, service: ServiceRecord, epoch: u64) {
        let connector = self.connector.clone();
        let tx = self.completions_tx.clone();

        self.tasks.spawn(async move {
            let result = connector.connect(&service).await;
            let _ = tx.send(Completion::Connected {
                id: service.id,
                epoch,
                result,
            });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connected { id, epoch, result } => self.handle_connected(id, epoch, result),
            Completion::SubDevice {
                parent,
                epoch,
                event,
            } => {
                let current = self
                    .entries
                    .get(&parent)
                    .is_some_and(|entry| entry.epoch == epoch);
                if !current {
                    return;
                }
                match event {
                    SubDeviceEvent::Available(device) => self.add_sub_device(&parent, device),
                    SubDeviceEvent::Unavailable(id) => {
                        let is_child = self.entries.get(&id).is_some_and(|e| {
                            e.registration.parent.as_deref() == Some(parent.as_str())
                        });
                        if is_child {
                            self.remove(&id);
                        }
                    }
                }
            }
        }
    }

    fn handle_connected(&mut self, id: String, epoch: u64, result: Result<Arc<dyn DeviceHandle>>) {
        let Some(entry) = self.entries.get_mut(&id).filter(|e| e.epoch == epoch) else {
            // Removed while connecting
            if let Ok(device) = result {
                debug!(device = %id, "Releasing connection to removed device");
                device.destroy();
            }
            return;
        };
        entry.connecting = false;

        match result {
            Ok(device) => {
                entry.registration.attach(device.clone());
                let registration = entry.registration.clone();
                info!(
                    device = %id,
                    model = registration.model.as_deref().unwrap_or("unknown"),
                    "Device connected"
                );
                self.emit(RegistryEvent::Available(registration));

                if let Some(gateway) = device.gateway() {
                    if self.options.skip_sub_devices {
                        debug!(device = %id, "Skipping sub-devices");
                    } else {
                        self.bind_gateway(&id, epoch, gateway);
                    }
                }
            }
            Err(e) => {
                warn!(device = %id, "Connection failed: {}", e);
                let error = Arc::new(e);
                entry.registration.error = Some(error.clone());
                let registration = entry.registration.clone();
                self.emit(RegistryEvent::Available(registration.clone()));
                self.emit(RegistryEvent::Error {
                    error,
                    registration,
                });
            }
        }
    }

    fn bind_gateway(&mut self, parent: &str, epoch: u64, gateway: &dyn Gateway) {
        // Subscribe first so nothing slips between the listing and the stream
        let mut stream = gateway.subscribe();
        let current = gateway.sub_devices();
        debug!(device = %parent, "Gateway reports {} sub-devices", current.len());

        for device in current {
            self.add_sub_device(parent, device);
        }

        let tx = self.completions_tx.clone();
        let parent_id = parent.to_string();
        let forwarder = self.tasks.spawn(async move {
            loop {
                match stream.recv().await {
                    Ok(event) => {
                        let completion = Completion::SubDevice {
                            parent: parent_id.clone(),
                            epoch,
                            event,
                        };
                        if tx.send(completion).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(device = %parent_id, "Missed {} sub-device events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(entry) = self.entries.get_mut(parent) {
            entry.forwarder = Some(forwarder);
        }
    }

    fn add_sub_device(&mut self, parent: &str, device: Arc<dyn DeviceHandle>) {
        if self.entries.contains_key(device.id()) {
            debug!(device = device.id(), "Sub-device already registered");
            return;
        }

        let registration = Registration::sub_device(parent, device);
        if !self.options.accepts(&registration) {
            debug!(device = %registration.id, "Sub-device rejected by filter");
            return;
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        info!(device = %registration.id, parent, "Sub-device available");

        self.entries.insert(
            registration.id.clone(),
            Entry {
                registration: registration.clone(),
                connecting: false,
                epoch,
                forwarder: None,
            },
        );
        self.emit(RegistryEvent::Available(registration));
    }

    /// Remove a registration and everything reached through it
    fn remove(&mut self, id: &str) {
        let mut pending = vec![id.to_string()];

        while let Some(id) = pending.pop() {
            let Some(entry) = self.entries.remove(&id) else {
                continue;
            };

            let children: Vec<String> = self
                .entries
                .values()
                .filter(|e| e.registration.parent.as_deref() == Some(id.as_str()))
                .map(|e| e.registration.id.clone())
                .collect();
            if !children.is_empty() {
                debug!(device = %id, "Removing {} sub-devices", children.len());
            }

            let registration = entry.release();
            info!(device = %id, "Device unavailable");
            self.emit(RegistryEvent::Unavailable(registration));

            pending.extend(children.into_iter().rev());
        }
    }
}
