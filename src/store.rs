//! # Local Storage
//!
//! Two independent stores live on every node:
//!
//! - [`LocationMap`]: key → holder → expiry. Populated when this node is the
//!   root for a key and some holder registers itself. Entries expire unless the
//!   holder republishes before the TTL elapses.
//! - [`BlobStore`]: key → payload for blobs this node holds itself. Blobs never
//!   expire; they are dropped only by an explicit remove or by leaving the mesh.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::{NodeId, RemoteNode};

/// Largest payload accepted by [`BlobStore::put`].
pub const MAX_BLOB_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
struct HolderEntry {
    holder: RemoteNode,
    expires_at: Instant,
}

/// Holder registrations for keys this node is (or was) root for.
#[derive(Debug, Default)]
pub struct LocationMap {
    entries: HashMap<String, HashMap<NodeId, HolderEntry>>,
}

impl LocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) `holder` for `key`. Returns true if the holder was
    /// not previously registered.
    pub fn register(&mut self, key: &str, holder: RemoteNode, ttl: Duration) -> bool {
        self.register_at(key, holder, Instant::now() + ttl)
    }

    fn register_at(&mut self, key: &str, holder: RemoteNode, expires_at: Instant) -> bool {
        let holders = self.entries.entry(key.to_string()).or_default();
        match holders.get_mut(&holder.id) {
            Some(entry) => {
                entry.holder = holder;
                if expires_at > entry.expires_at {
                    entry.expires_at = expires_at;
                }
                false
            }
            None => {
                holders.insert(holder.id, HolderEntry { holder, expires_at });
                true
            }
        }
    }

    /// Unexpired holders for `key`.
    pub fn get(&self, key: &str) -> Vec<RemoteNode> {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|holders| {
                holders
                    .values()
                    .filter(|entry| entry.expires_at > now)
                    .map(|entry| entry.holder.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Forget `id` as a holder of every key.
    pub fn remove_holder(&mut self, id: &NodeId) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, holders| {
            if holders.remove(id).is_some() {
                removed += 1;
            }
            !holders.is_empty()
        });
        removed
    }

    /// Drop expired registrations; returns how many were dropped.
    pub fn expire(&mut self) -> usize {
        let now = Instant::now();
        let mut dropped = 0;
        self.entries.retain(|_, holders| {
            let before = holders.len();
            holders.retain(|_, entry| entry.expires_at > now);
            dropped += before - holders.len();
            !holders.is_empty()
        });
        dropped
    }

    /// Remove and return the unexpired holders of every key matching `pred`,
    /// for handing to another node.
    pub fn take_where<F>(&mut self, mut pred: F) -> HashMap<String, Vec<RemoteNode>>
    where
        F: FnMut(&str) -> bool,
    {
        let now = Instant::now();
        let matching: Vec<String> = self
            .entries
            .keys()
            .filter(|key| pred(key))
            .cloned()
            .collect();

        let mut taken = HashMap::new();
        for key in matching {
            if let Some(holders) = self.entries.remove(&key) {
                let live: Vec<RemoteNode> = holders
                    .into_values()
                    .filter(|entry| entry.expires_at > now)
                    .map(|entry| entry.holder)
                    .collect();
                if !live.is_empty() {
                    taken.insert(key, live);
                }
            }
        }
        taken
    }

    /// Remove and return all unexpired registrations.
    pub fn drain_all(&mut self) -> HashMap<String, Vec<RemoteNode>> {
        self.take_where(|_| true)
    }

    /// Absorb registrations transferred from another node.
    pub fn merge(&mut self, transferred: HashMap<String, Vec<RemoteNode>>, ttl: Duration) -> usize {
        let expires_at = Instant::now() + ttl;
        let mut added = 0;
        for (key, holders) in transferred {
            for holder in holders {
                if self.register_at(&key, holder, expires_at) {
                    added += 1;
                }
            }
        }
        added
    }

    /// Number of keys with at least one registration.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Payloads held by this node.
#[derive(Debug, Default)]
pub struct BlobStore {
    blobs: HashMap<String, Vec<u8>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        self.blobs.insert(key.to_string(), value)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.blobs.remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.blobs.clear();
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}
