//! Registry of active relay sessions

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::bridge::RelayCounters;

/// One active relay
#[derive(Debug)]
pub struct RelayEntry {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub counters: RelayCounters,
}

/// Serializable view of an active relay
#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub frames_to_upstream: u64,
    pub frames_to_client: u64,
}

#[derive(Debug, Default, Clone)]
pub struct RelayRegistry {
    relays: Arc<RwLock<HashMap<Uuid, Arc<RelayEntry>>>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new relay. It stays listed until the guard is dropped.
    pub fn register(&self) -> RelayGuard {
        let entry = Arc::new(RelayEntry {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            counters: RelayCounters::default(),
        });
        self.relays.write().insert(entry.id, entry.clone());
        RelayGuard {
            entry,
            relays: self.relays.clone(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.relays.read().len()
    }

    pub fn snapshot(&self) -> Vec<RelaySnapshot> {
        let mut list: Vec<RelaySnapshot> = self
            .relays
            .read()
            .values()
            .map(|entry| {
                let (up, down) = entry.counters.snapshot();
                RelaySnapshot {
                    id: entry.id,
                    started_at: entry.started_at,
                    frames_to_upstream: up,
                    frames_to_client: down,
                }
            })
            .collect();
        list.sort_by_key(|s| s.started_at);
        list
    }
}

/// Keeps a relay registered for its lifetime
pub struct RelayGuard {
    entry: Arc<RelayEntry>,
    relays: Arc<RwLock<HashMap<Uuid, Arc<RelayEntry>>>>,
}

impl RelayGuard {
    pub fn id(&self) -> Uuid {
        self.entry.id
    }

    pub fn counters(&self) -> &RelayCounters {
        &self.entry.counters
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.relays.write().remove(&self.entry.id);
    }
}
