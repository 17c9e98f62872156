//! Live service records keyed by device id
//!
//! The table is owned by the discovery task and never shared. Each record
//! carries an epoch so completions scheduled for an earlier incarnation of
//! the same id (enrichment, grace timer) can be recognised and dropped.
//! Replies are applied in receive order: token lookups finish out of order,
//! so each reply carries a [`Receipt`] and older ones are ignored.

use super::hostname::HostnameInfo;
use super::service::ServiceRecord;
use crate::tokens::TokenResolution;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Entry for one live record
#[derive(Debug, Clone)]
struct Entry {
    record: ServiceRecord,
    seen_at: Instant,
    last_seq: u64,
    epoch: u64,
    announced: bool,
}

/// When a reply arrived, numbered in receive order
#[derive(Debug, Clone, Copy)]
pub struct Receipt {
    pub seq: u64,
    pub at: Instant,
    pub wall: DateTime<Utc>,
}

impl Receipt {
    pub fn new(seq: u64, at: Instant) -> Self {
        Self {
            seq,
            at,
            wall: Utc::now(),
        }
    }
}

/// Result of recording a reply
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// First reply for this id; availability must be scheduled
    Created { epoch: u64 },

    /// Known and announced record replied from a new address
    Moved(ServiceRecord),

    /// Known record refreshed, nothing to emit
    Refreshed,

    /// A later reply was already applied; nothing changed
    Outdated,
}

/// Record removed by a sweep
#[derive(Debug, Clone)]
pub struct Expired {
    pub record: ServiceRecord,
    /// Only announced records produce an `unavailable` event
    pub announced: bool,
}

/// Live records keyed by id
#[derive(Debug, Default)]
pub struct ServiceTable {
    entries: HashMap<String, Entry>,
    next_epoch: u64,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ServiceRecord> {
        self.entries.get(id).map(|entry| &entry.record)
    }

    /// Record a reply from `addr` for `id`
    pub fn observe(
        &mut self,
        id: &str,
        addr: SocketAddr,
        resolution: TokenResolution,
        receipt: Receipt,
    ) -> Observation {
        match self.entries.get_mut(id) {
            Some(entry) if receipt.seq < entry.last_seq => Observation::Outdated,
            Some(entry) => {
                let moved = entry.record.address != addr.ip();

                entry.record.address = addr.ip();
                entry.record.port = addr.port();
                entry.record.token = resolution.token;
                entry.record.auto_token = resolution.auto_token;
                entry.record.last_seen = receipt.wall;
                entry.seen_at = receipt.at;
                entry.last_seq = receipt.seq;

                if moved && entry.announced {
                    Observation::Moved(entry.record.clone())
                } else {
                    Observation::Refreshed
                }
            }
            None => {
                let epoch = self.next_epoch;
                self.next_epoch += 1;

                let mut record = ServiceRecord::new(id, addr);
                record.token = resolution.token;
                record.auto_token = resolution.auto_token;
                record.last_seen = receipt.wall;

                self.entries.insert(
                    id.to_string(),
                    Entry {
                        record,
                        seen_at: receipt.at,
                        last_seq: receipt.seq,
                        epoch,
                        announced: false,
                    },
                );
                Observation::Created { epoch }
            }
        }
    }

    /// Apply reverse DNS results to a record
    pub fn enrich(&mut self, id: &str, epoch: u64, hostname: String, info: Option<HostnameInfo>) {
        let Some(entry) = self.entries.get_mut(id).filter(|e| e.epoch == epoch) else {
            return;
        };

        entry.record.hostname = Some(hostname);
        if let Some(info) = info {
            entry.record.model = Some(info.model);
            entry.record.device_type = Some(info.device_type);
        }
    }

    /// Mark a record as announced.
    ///
    /// Returns the record to emit the first time it is called for an epoch,
    /// `None` on every later call or when the epoch is gone.
    pub fn announce(&mut self, id: &str, epoch: u64) -> Option<ServiceRecord> {
        let entry = self.entries.get_mut(id).filter(|e| e.epoch == epoch)?;
        if entry.announced {
            return None;
        }
        entry.announced = true;
        Some(entry.record.clone())
    }

    /// Remove every record not refreshed within `ttl`
    pub fn sweep(&mut self, now: Instant, ttl: Duration) -> Vec<Expired> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.seen_at) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|entry| Expired {
                record: entry.record,
                announced: entry.announced,
            })
            .collect()
    }

    /// Snapshot of announced records
    pub fn announced(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> = self
            .entries
            .values()
            .filter(|entry| entry.announced)
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Drop every record without producing events
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
