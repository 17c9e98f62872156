//! Discovery engine
//!
//! A [`Browser`] owns one UDP socket and a background task. The task
//! broadcasts handshake probes every `cache_time / 3`, turns replies into
//! service records, and expires records that stop replying within
//! `cache_time`. All record mutations happen on that task; token lookups,
//! reverse DNS and the availability grace timer run in child tasks that
//! report back over a channel.

use super::hostname::{HostnameInfo, HostnameLookup, MiioHostnames, ReverseResolver, SystemResolver};
use super::network::{create_discovery_socket, probe_offsets, send_probe};
use super::service::{DiscoveryEvent, ServiceRecord};
use super::service_table::{Observation, Receipt, ServiceTable};
use crate::config::DiscoveryConfig;
use crate::error::{MiioError, Result};
use crate::packet;
use crate::tokens::{FileTokenStore, TokenResolution, TokenResolver, TokenStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Longest a new device waits for reverse DNS before it is announced
pub const AVAILABILITY_GRACE: Duration = Duration::from_secs(5);

/// Capacity of the event channel
pub const EVENT_CAPACITY: usize = 1024;

/// Largest datagram the engine reads
const RECV_BUFFER_SIZE: usize = 4096;

/// miio discovery engine
pub struct Browser {
    config: DiscoveryConfig,
    resolver: Arc<TokenResolver>,
    reverse: Arc<dyn ReverseResolver>,
    hostnames: Arc<dyn HostnameLookup>,
    events: broadcast::Sender<DiscoveryEvent>,
    running: Option<Running>,
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

enum Command {
    Services(oneshot::Sender<Vec<ServiceRecord>>),
    Stop,
}

/// Results of child tasks, applied on the discovery task
#[derive(Debug)]
enum Completion {
    Resolved {
        id: String,
        addr: SocketAddr,
        resolution: TokenResolution,
        receipt: Receipt,
    },
    Enriched {
        id: String,
        epoch: u64,
        hostname: String,
        info: Option<HostnameInfo>,
    },
    Announce {
        id: String,
        epoch: u64,
    },
}

impl Browser {
    /// Create a browser from configuration.
    ///
    /// With `use_token_storage` the JSON token file at `token_store_path`
    /// (or the default location) is consulted for devices hiding their token.
    pub fn new(config: DiscoveryConfig) -> Self {
        let store: Option<Arc<dyn TokenStore>> = if config.use_token_storage {
            let store = match &config.token_store_path {
                Some(path) => Some(FileTokenStore::new(path)),
                None => match FileTokenStore::default_location() {
                    Ok(store) => Some(store),
                    Err(e) => {
                        warn!("Token storage disabled: {}", e);
                        None
                    }
                },
            };
            if let Some(store) = &store {
                debug!("Reading tokens from {}", store.path().display());
            }
            store.map(|s| Arc::new(s) as Arc<dyn TokenStore>)
        } else {
            None
        };

        let resolver = TokenResolver::new(store, config.tokens.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            config,
            resolver: Arc::new(resolver),
            reverse: Arc::new(SystemResolver),
            hostnames: Arc::new(MiioHostnames::new()),
            events,
            running: None,
        }
    }

    /// Replace the token store; `None` disables storage lookups
    pub fn with_token_store(mut self, store: Option<Arc<dyn TokenStore>>) -> Self {
        self.resolver = Arc::new(TokenResolver::new(store, self.config.tokens.clone()));
        self
    }

    pub fn with_reverse_resolver(mut self, reverse: Arc<dyn ReverseResolver>) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_hostname_lookup(mut self, hostnames: Arc<dyn HostnameLookup>) -> Self {
        self.hostnames = hostnames;
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Subscribe to discovery events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address of the discovery socket while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Bind the socket, send the first probe and start the discovery task.
    ///
    /// Bind and send failures are returned; nothing keeps running after an
    /// error. Starting a running browser is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            debug!("Discovery already running");
            return Ok(());
        }

        self.config.validate()?;

        let socket = create_discovery_socket(self.config.bind_address)?;
        let local_addr = socket.local_addr()?;
        send_probe(&socket, self.config.probe_target()).await?;

        let search_interval = self.config.search_interval();
        let rebroadcast_at = probe_offsets(search_interval)
            .get(1)
            .map(|offset| Instant::now() + *offset);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let task = DiscoveryTask {
            config: self.config.clone(),
            socket,
            table: ServiceTable::new(),
            resolver: self.resolver.clone(),
            reverse: self.reverse.clone(),
            hostnames: self.hostnames.clone(),
            events: self.events.clone(),
            commands: commands_rx,
            completions_tx,
            completions_rx,
            tasks: JoinSet::new(),
            rebroadcast_at,
            received: 0,
        };

        info!(
            "Discovery started on {} (probing {} every {:?})",
            local_addr,
            self.config.probe_target(),
            search_interval
        );

        self.running = Some(Running {
            commands,
            task: tokio::spawn(task.run()),
            local_addr,
        });
        Ok(())
    }

    /// Stop probing, cancel pending lookups and release the socket.
    ///
    /// Records are dropped without `unavailable` events. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.commands.send(Command::Stop);
        if let Err(e) = running.task.await {
            if !e.is_cancelled() {
                warn!("Discovery task ended abnormally: {}", e);
            }
        }
        info!("Discovery stopped");
    }

    /// Snapshot of the records announced so far
    pub async fn services(&self) -> Result<Vec<ServiceRecord>> {
        let running = self.running.as_ref().ok_or(MiioError::NotRunning)?;
        let (reply, rx) = oneshot::channel();
        running
            .commands
            .send(Command::Services(reply))
            .map_err(|_| MiioError::NotRunning)?;
        rx.await.map_err(|_| MiioError::NotRunning)
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
        }
    }
}

impl std::fmt::Debug for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Browser")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("running", &self.local_addr())
            .finish()
    }
}

/// State owned by the background task
struct DiscoveryTask {
    config: DiscoveryConfig,
    socket: UdpSocket,
    table: ServiceTable,
    resolver: Arc<TokenResolver>,
    reverse: Arc<dyn ReverseResolver>,
    hostnames: Arc<dyn HostnameLookup>,
    events: broadcast::Sender<DiscoveryEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    tasks: JoinSet<()>,
    rebroadcast_at: Option<Instant>,
    /// Replies accepted so far, numbers each reply in arrival order
    received: u64,
}

impl DiscoveryTask {
    async fn run(mut self) {
        let search_interval = self.config.search_interval();
        let ttl = self.config.cache_ttl();
        let started = Instant::now();

        let mut search = interval_at(started + search_interval, search_interval);
        search.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval_at(started + ttl, ttl);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let rebroadcast_at = self.rebroadcast_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Services(reply)) => {
                        let _ = reply.send(self.table.announced());
                    }
                    Some(Command::Stop) | None => break,
                },
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.handle_datagram(&buf[..len], addr),
                    Err(e) => warn!("UDP receive error: {}", e),
                },
                Some(completion) = self.completions_rx.recv() => self.handle_completion(completion),
                _ = search.tick() => self.search().await,
                _ = sleep_until(rebroadcast_at.unwrap_or(started)), if rebroadcast_at.is_some() => {
                    self.rebroadcast_at = None;
                    if let Err(e) = send_probe(&self.socket, self.config.probe_target()).await {
                        warn!("Extra broadcast failed: {}", e);
                    }
                }
                _ = sweep.tick() => self.remove_stale(),
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        }

        self.tasks.abort_all();
        let dropped = self.table.clear();
        debug!("Discovery task exiting, dropped {} records", dropped);
    }

    /// One search cycle: probe now, and again shortly after for long cycles
    async fn search(&mut self) {
        if let Err(e) = send_probe(&self.socket, self.config.probe_target()).await {
            warn!("Handshake probe failed: {}", e);
        }
        self.rebroadcast_at = probe_offsets(self.config.search_interval())
            .get(1)
            .map(|offset| Instant::now() + *offset);
    }

    fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr) {
        let header = match packet::decode(data) {
            Ok(header) => header,
            Err(e) => {
                debug!("Dropping packet from {}: {}", addr, e);
                return;
            }
        };

        // Another client's probe, not a device reply
        if header.device_id == u32::MAX && header.unknown == u32::MAX {
            debug!("Ignoring handshake probe from {}", addr);
            return;
        }

        self.received += 1;
        let receipt = Receipt::new(self.received, Instant::now());

        let id = header.service_id();
        let resolver = self.resolver.clone();
        let tx = self.completions_tx.clone();

        self.tasks.spawn(async move {
            let resolution = resolver.resolve(&id, &header.checksum).await;
            let _ = tx.send(Completion::Resolved {
                id,
                addr,
                resolution,
                receipt,
            });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Resolved {
                id,
                addr,
                resolution,
                receipt,
            } => match self.table.observe(&id, addr, resolution, receipt) {
                Observation::Created { epoch } => {
                    debug!(
                        device = %id,
                        has_token = resolution.token.is_some(),
                        auto_token = resolution.auto_token,
                        "New device at {}",
                        addr
                    );
                    self.schedule_availability(id, addr, epoch);
                }
                Observation::Moved(record) => {
                    info!(device = %record.id, "Device moved to {}", record.address);
                    self.emit(DiscoveryEvent::Update(record));
                }
                Observation::Refreshed => {}
                Observation::Outdated => {
                    debug!(device = %id, "Ignoring reply #{} from {}", receipt.seq, addr);
                }
            },
            Completion::Enriched {
                id,
                epoch,
                hostname,
                info,
            } => {
                self.table.enrich(&id, epoch, hostname, info);
                self.announce(&id, epoch);
            }
            Completion::Announce { id, epoch } => self.announce(&id, epoch),
        }
    }

    /// Race reverse DNS against the grace timer; whichever reports first
    /// triggers the single `available` event.
    fn schedule_availability(&mut self, id: String, addr: SocketAddr, epoch: u64) {
        let reverse = self.reverse.clone();
        let hostnames = self.hostnames.clone();
        let tx = self.completions_tx.clone();
        let lookup_id = id.clone();

        self.tasks.spawn(async move {
            let completion = match reverse.lookup(addr).await {
                Ok(Some(hostname)) => {
                    let info = hostnames.lookup(&hostname);
                    Completion::Enriched {
                        id: lookup_id,
                        epoch,
                        hostname,
                        info,
                    }
                }
                Ok(None) => Completion::Announce { id: lookup_id, epoch },
                Err(e) => {
                    debug!("Reverse lookup for {} failed: {}", addr, e);
                    Completion::Announce { id: lookup_id, epoch }
                }
            };
            let _ = tx.send(completion);
        });

        let tx = self.completions_tx.clone();
        self.tasks.spawn(async move {
            sleep(AVAILABILITY_GRACE).await;
            let _ = tx.send(Completion::Announce { id, epoch });
        });
    }

    fn announce(&mut self, id: &str, epoch: u64) {
        if let Some(record) = self.table.announce(id, epoch) {
            info!(
                device = %record.id,
                model = record.model.as_deref().unwrap_or("unknown"),
                "Device available at {}",
                record.socket_addr()
            );
            self.emit(DiscoveryEvent::Available(record));
        }
    }

    fn remove_stale(&mut self) {
        for expired in self.table.sweep(Instant::now(), self.config.cache_ttl()) {
            if expired.announced {
                info!(device = %expired.record.id, "Device unavailable");
                self.emit(DiscoveryEvent::Unavailable(expired.record));
            } else {
                debug!(device = %expired.record.id, "Expired before announcement");
            }
        }
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}
