//! # Prefix Routing Mesh
//!
//! [`TapestryNode`] is one member of the mesh. It owns the node's routing table,
//! backpointer index, object-location map and blob store, answers inbound
//! protocol requests (the `handle_*` methods) and drives the multi-step
//! protocols built on top of them:
//!
//! - **lookup** ([`TapestryNode::find_root`]): repeated next-hop steps until a node
//!   names itself, backing off to the previous hop when one fails
//! - **join**: hello, root lookup, multicast from the root, backpointer traversal
//!   for the lower levels
//! - **object location**: register/fetch at a key's surrogate root, with periodic
//!   republishing and expiry
//! - **leave**: hand over location entries, notify backpointers with a
//!   replacement, drop our backpointers elsewhere
//!
//! ## Failure Handling
//!
//! Every single-hop remote step goes through one helper that bounds it by
//! `MeshConfig::rpc_timeout` and retries `MeshConfig::rpc_attempts` times. When the
//! attempts run out the peer is pruned from every local structure and remembered
//! as recently failed; that set rides along on next-hop responses so callers prune
//! it too. There is no heartbeat.
//!
//! Join announcements fan out: the callee answers only once its own forwards
//! return. Those are sent to peers that just answered a `hello` and bounded by
//! `MeshConfig::relay_timeout` instead, and a relay that runs out of time leaves
//! the peer in place, since the delay may sit anywhere below it.
//!
//! ## Locking
//!
//! Per-node state sits behind `tokio::sync::RwLock`s. Guards are never held
//! across a remote call: a handler may call back into the node that is calling it.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use lru::LruCache;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::error::TapestryError;
use crate::identity::{NodeId, RemoteNode, DIGITS};
use crate::nodeset::NodeSet;
use crate::protocols::TapestryRpc;
use crate::routing::{Backpointers, RoutingTable, SlotUpdate, DEFAULT_SLOT_SIZE};
use crate::store::{BlobStore, LocationMap, MAX_BLOB_SIZE};

/// Lookups give up after this many next-hop steps.
pub const HOP_BUDGET: usize = DIGITS * 2;

/// How many recently failed peers are remembered.
const FAILED_PEER_CAPACITY: usize = 256;

const MIN_MAINTENANCE_PERIOD: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// Candidates per routing slot.
    pub slot_size: usize,
    /// Upper bound on a single remote call.
    pub rpc_timeout: Duration,
    /// Attempts per remote call before the peer is declared unreachable.
    pub rpc_attempts: usize,
    /// Upper bound on a request the callee answers only after calls of its own
    /// (join announcements). Running out of it never prunes the callee.
    pub relay_timeout: Duration,
    /// Register/fetch attempts (each one a fresh lookup).
    pub lookup_retries: usize,
    /// Root lookup + announce attempts during join.
    pub join_attempts: usize,
    /// Neighbour set size kept per level of the join traversal.
    pub join_neighbors: usize,
    /// How often held blobs are republished and expired entries dropped.
    pub republish_interval: Duration,
    /// Lifetime of a location registration.
    pub location_ttl: Duration,
    /// How long a failed peer is advertised on next-hop responses.
    pub failed_peer_ttl: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            slot_size: DEFAULT_SLOT_SIZE,
            rpc_timeout: Duration::from_secs(3),
            rpc_attempts: 2,
            relay_timeout: Duration::from_secs(20),
            lookup_retries: 3,
            join_attempts: 3,
            join_neighbors: 10,
            republish_interval: Duration::from_secs(10),
            location_ttl: Duration::from_secs(25),
            failed_peer_ttl: Duration::from_secs(30),
        }
    }
}

/// Point-in-time counts for status logging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MeshSnapshot {
    pub routing_entries: usize,
    pub backpointers: usize,
    pub location_keys: usize,
    pub stored_blobs: usize,
}

struct Inner<N: TapestryRpc> {
    local: RemoteNode,
    config: MeshConfig,
    network: N,
    routing: RwLock<RoutingTable>,
    backpointers: RwLock<Backpointers>,
    locations: RwLock<LocationMap>,
    blobs: RwLock<BlobStore>,
    failed: Mutex<LruCache<NodeId, (RemoteNode, Instant)>>,
    maintenance: std::sync::Mutex<Option<JoinHandle<()>>>,
}

pub struct TapestryNode<N: TapestryRpc> {
    inner: Arc<Inner<N>>,
}

impl<N: TapestryRpc> Clone for TapestryNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: TapestryRpc> TapestryNode<N> {
    /// Create a node and start its maintenance loop. The node knows nobody until
    /// [`join`](Self::join) is called; a node that never joins is a mesh of one.
    pub fn new(local: RemoteNode, network: N, config: MeshConfig) -> Self {
        let failed_capacity = NonZeroUsize::new(FAILED_PEER_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        let inner = Arc::new(Inner {
            routing: RwLock::new(RoutingTable::new(local.clone(), config.slot_size)),
            backpointers: RwLock::new(Backpointers::new(local.id)),
            locations: RwLock::new(LocationMap::new()),
            blobs: RwLock::new(BlobStore::new()),
            failed: Mutex::new(LruCache::new(failed_capacity)),
            maintenance: std::sync::Mutex::new(None),
            local,
            config,
            network,
        });

        let node = Self { inner };
        node.spawn_maintenance();
        node
    }

    pub fn local(&self) -> &RemoteNode {
        &self.inner.local
    }

    pub fn id(&self) -> NodeId {
        self.inner.local.id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn network(&self) -> &N {
        &self.inner.network
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    fn spawn_maintenance(&self) {
        let weak: Weak<Inner<N>> = Arc::downgrade(&self.inner);
        let period = self.inner.config.republish_interval.max(MIN_MAINTENANCE_PERIOD);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                TapestryNode { inner }.maintain().await;
            }
        });

        if let Ok(mut slot) = self.inner.maintenance.lock() {
            *slot = Some(handle);
        }
    }

    /// Stop republishing and expiring. Idempotent.
    pub fn stop_maintenance(&self) {
        if let Ok(mut slot) = self.inner.maintenance.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }

    async fn maintain(&self) {
        let expired = self.inner.locations.write().await.expire();
        if expired > 0 {
            debug!(node = %self.local(), expired, "dropped expired location entries");
        }

        let keys = self.inner.blobs.read().await.keys();
        for key in keys {
            if let Err(e) = self.publish(&key).await {
                debug!(key = %key, error = %e, "republish failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Remote call plumbing
    // ------------------------------------------------------------------

    /// Run `op` with the configured timeout and attempt count.
    async fn attempt<T, F, Fut>(&self, what: &'static str, addr: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.inner.config.rpc_timeout;
        let attempts = self.inner.config.rpc_attempts.max(1);
        let mut last_err = anyhow!("{} to {} was not attempted", what, addr);

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    trace!(peer = %addr, op = what, attempt, error = %e, "remote call failed");
                    last_err = e;
                }
                Err(_) => {
                    trace!(peer = %addr, op = what, attempt, "remote call timed out");
                    last_err = anyhow!("{} to {} timed out after {:?}", what, addr, timeout);
                }
            }
        }

        Err(last_err.context(TapestryError::Unreachable {
            addr: addr.to_string(),
        }))
    }

    /// [`attempt`](Self::attempt) plus liveness bookkeeping for `peer`.
    async fn call<T, F, Fut>(&self, peer: &RemoteNode, what: &'static str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.attempt(what, &peer.addr, op).await {
            Ok(value) => {
                self.mark_alive(peer).await;
                Ok(value)
            }
            Err(e) => {
                self.mark_unreachable(peer).await;
                Err(e)
            }
        }
    }

    /// Send a request whose answer waits on further calls made by `peer`.
    /// A transport error prunes `peer`; running past `relay_timeout` does not.
    async fn relay<T>(
        &self,
        peer: &RemoteNode,
        what: &'static str,
        request: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let deadline = self.inner.config.relay_timeout;
        match tokio::time::timeout(deadline, request).await {
            Ok(Ok(value)) => {
                self.mark_alive(peer).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.mark_unreachable(peer).await;
                Err(e.context(TapestryError::Unreachable {
                    addr: peer.addr.clone(),
                }))
            }
            Err(_) => {
                debug!(node = %self.local(), peer = %peer, op = what, "relay still running at deadline");
                Err(anyhow!("{} to {} still running after {:?}", what, peer, deadline))
            }
        }
    }

    /// One `hello` round trip through [`call`](Self::call).
    async fn ping(&self, peer: &RemoteNode) -> bool {
        let net = self.network();
        match self.call(peer, "hello", move || net.hello(&peer.addr, None)).await {
            Ok(answer) if answer.id == peer.id => true,
            Ok(answer) => {
                debug!(node = %self.local(), expected = %peer, found = %answer, "address now serves another node");
                self.prune(std::slice::from_ref(peer)).await;
                false
            }
            Err(_) => false,
        }
    }

    async fn mark_alive(&self, peer: &RemoteNode) {
        self.inner.routing.write().await.refresh(&peer.id);
        self.inner.failed.lock().await.pop(&peer.id);
    }

    async fn mark_unreachable(&self, peer: &RemoteNode) {
        if peer.id == self.id() {
            return;
        }
        debug!(node = %self.local(), peer = %peer, "peer unreachable, pruning");
        self.prune(std::slice::from_ref(peer)).await;
        self.inner
            .failed
            .lock()
            .await
            .put(peer.id, (peer.clone(), Instant::now()));
    }

    /// Peers this node failed to reach within `failed_peer_ttl`.
    pub async fn recently_failed(&self) -> Vec<RemoteNode> {
        let ttl = self.inner.config.failed_peer_ttl;
        self.inner
            .failed
            .lock()
            .await
            .iter()
            .filter(|(_, (_, failed_at))| failed_at.elapsed() < ttl)
            .map(|(_, (node, _))| node.clone())
            .collect()
    }

    /// Forget `bad` everywhere: routing table, backpointers, location holders.
    async fn prune(&self, bad: &[RemoteNode]) {
        let me = self.id();
        let bad: Vec<RemoteNode> = bad.iter().filter(|n| n.id != me).cloned().collect();
        if bad.is_empty() {
            return;
        }

        let removed = self.inner.routing.write().await.remove_all(&bad);
        {
            let mut backpointers = self.inner.backpointers.write().await;
            for node in &bad {
                backpointers.remove(&node.id);
            }
        }
        {
            let mut locations = self.inner.locations.write().await;
            for node in &bad {
                locations.remove_holder(&node.id);
            }
        }

        if !removed.is_empty() {
            trace!(node = %self.local(), removed = removed.len(), "pruned routing entries");
        }
    }

    /// Add `node` to the routing table; when it is new there, register ourselves
    /// as one of its backpointers. Evicted candidates are not told.
    async fn add_route(&self, node: RemoteNode) -> SlotUpdate {
        if node.id == self.id() {
            return SlotUpdate::Rejected;
        }

        let outcome = self.inner.routing.write().await.add(node.clone());
        if let SlotUpdate::Replaced { evicted } = &outcome {
            trace!(node = %self.local(), evicted = %evicted, added = %node, "slot full, evicted candidate");
        }

        if outcome.is_new() {
            let net = self.network();
            let me = self.local();
            let to = &node;
            if let Err(e) = self
                .call(to, "add_backpointer", move || net.add_backpointer(to, me.clone()))
                .await
            {
                debug!(node = %self.local(), peer = %node, error = %e, "could not register backpointer");
            }
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Inbound handlers
    // ------------------------------------------------------------------

    pub async fn handle_hello(&self, joiner: Option<RemoteNode>) -> RemoteNode {
        if let Some(joiner) = joiner {
            debug!(node = %self.local(), joiner = %joiner, "hello");
        }
        self.local().clone()
    }

    /// One routing step: our best candidate from `level` on, or ourselves when we
    /// are the root, plus the peers we recently failed to reach.
    pub async fn handle_next_hop(&self, target: NodeId, level: usize) -> (RemoteNode, Vec<RemoteNode>) {
        let next = self.inner.routing.read().await.best_match_from(&target, level);
        let next = next.unwrap_or_else(|| self.local().clone());
        (next, self.recently_failed().await)
    }

    /// Accept a registration only when we are the root for the key.
    pub async fn handle_register(&self, key: &str, holder: RemoteNode) -> bool {
        let target = NodeId::for_key(key);
        if self.inner.routing.read().await.best_match(&target).is_some() {
            debug!(node = %self.local(), key = %key, "declining registration, not root");
            return false;
        }

        let ttl = self.inner.config.location_ttl;
        let added = self.inner.locations.write().await.register(key, holder.clone(), ttl);
        if added {
            debug!(node = %self.local(), key = %key, holder = %holder, "registered holder");
        }
        true
    }

    pub async fn handle_fetch(&self, key: &str) -> (bool, Vec<RemoteNode>) {
        let target = NodeId::for_key(key);
        if self.inner.routing.read().await.best_match(&target).is_some() {
            return (false, Vec::new());
        }
        (true, self.inner.locations.read().await.get(key))
    }

    pub async fn handle_lookup(&self, key: &str) -> Result<Vec<RemoteNode>> {
        self.fetch(key).await
    }

    /// A joiner found us as its root: multicast from the level it shares with us.
    pub async fn handle_add_node(&self, joiner: RemoteNode) -> Vec<RemoteNode> {
        let level = self.id().shared_prefix_len(&joiner.id);
        info!(node = %self.local(), joiner = %joiner, level, "announcing new node");
        self.handle_add_node_multicast(joiner, level).await
    }

    /// Forward the announcement of `joiner` to one live node per non-empty slot
    /// at `level` and deeper, then take the joiner into our own table and hand it
    /// the registrations it is now closer to.
    ///
    /// Forwards run concurrently. A child that fails its `hello` is skipped for
    /// the next candidate in its slot; a child whose subtree is slow still counts
    /// as reached.
    pub async fn handle_add_node_multicast(&self, joiner: RemoteNode, level: usize) -> Vec<RemoteNode> {
        let mut children = Vec::new();
        for l in level..DIGITS {
            let slots = self.inner.routing.read().await.level_slots(l);
            for slot in slots {
                for candidate in slot.into_iter().filter(|c| c.id != joiner.id) {
                    if self.ping(&candidate).await {
                        children.push((candidate, l + 1));
                        break;
                    }
                    debug!(node = %self.local(), peer = %candidate, level = l, "multicast child down, trying alternate");
                }
            }
        }

        let mut forwards = JoinSet::new();
        for (child, next_level) in children {
            let node = self.clone();
            let joiner = joiner.clone();
            forwards.spawn(async move {
                let net = node.network();
                let request = net.add_node_multicast(&child, joiner, next_level);
                let result = node.relay(&child, "add_node_multicast", request).await;
                (child, result)
            });
        }

        let mut reached = NodeSet::new();
        while let Some(joined) = forwards.join_next().await {
            match joined {
                Ok((child, Ok(nodes))) => {
                    reached.add(child);
                    reached.extend(nodes);
                }
                Ok((child, Err(e))) => {
                    debug!(node = %self.local(), peer = %child, error = %e, "multicast forward incomplete");
                    // Still running below the child; it answered the ping.
                    if !matches!(e.downcast_ref::<TapestryError>(), Some(TapestryError::Unreachable { .. })) {
                        reached.add(child);
                    }
                }
                Err(e) => warn!(node = %self.local(), error = %e, "multicast forward task failed"),
            }
        }

        reached.add(self.local().clone());
        reached.remove(&joiner.id);

        self.add_route(joiner.clone()).await;
        self.transfer_closer_keys(&joiner).await;

        reached.into_vec()
    }

    /// Move registrations whose key now lies closer to `joiner` than to us.
    async fn transfer_closer_keys(&self, joiner: &RemoteNode) {
        let me = self.id();
        let moved = self
            .inner
            .locations
            .write()
            .await
            .take_where(|key| NodeId::for_key(key).closer(&joiner.id, &me));
        if moved.is_empty() {
            return;
        }

        let count = moved.len();
        let net = self.network();
        let local = self.local();
        let batch = &moved;
        let result = self
            .call(joiner, "transfer", move || net.transfer(joiner, local.clone(), batch.clone()))
            .await;

        match result {
            Ok(()) => debug!(node = %self.local(), to = %joiner, keys = count, "transferred registrations"),
            Err(e) => {
                warn!(node = %self.local(), to = %joiner, error = %e, "transfer failed, keeping registrations");
                let ttl = self.inner.config.location_ttl;
                self.inner.locations.write().await.merge(moved, ttl);
            }
        }
    }

    pub async fn handle_transfer(&self, from: RemoteNode, registrations: HashMap<String, Vec<RemoteNode>>) {
        let ttl = self.inner.config.location_ttl;
        let added = self.inner.locations.write().await.merge(registrations, ttl);
        debug!(node = %self.local(), from = %from, added, "merged transferred registrations");
    }

    /// `from` now routes through us; it may also be a useful route for us.
    pub async fn handle_add_backpointer(&self, from: RemoteNode) {
        if from.id == self.id() {
            return;
        }
        self.inner.backpointers.write().await.add(from.clone());
        self.add_route(from).await;
    }

    pub async fn handle_remove_backpointer(&self, from: RemoteNode) {
        self.inner.backpointers.write().await.remove(&from.id);
    }

    pub async fn handle_remove_bad_nodes(&self, bad: Vec<RemoteNode>) {
        self.prune(&bad).await;
    }

    /// Our backpointers at `level`; the requester is considered for our table.
    pub async fn handle_get_backpointers(&self, from: RemoteNode, level: usize) -> Vec<RemoteNode> {
        self.add_route(from).await;
        self.inner.backpointers.read().await.level(level)
    }

    pub async fn handle_notify_leave(&self, from: RemoteNode, replacement: Option<RemoteNode>) {
        debug!(node = %self.local(), departed = %from, replacement = ?replacement.as_ref().map(|r| r.id), "peer leaving");
        self.prune(std::slice::from_ref(&from)).await;
        if let Some(replacement) = replacement
            && replacement.id != self.id()
            && replacement.id != from.id
        {
            self.add_route(replacement).await;
        }
    }

    pub async fn handle_blob_fetch(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.blobs.read().await.get(key)
    }

    pub async fn handle_blob_store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.store(key, value).await
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    async fn next_hop_via(
        &self,
        current: &RemoteNode,
        target: NodeId,
        level: usize,
    ) -> Result<(RemoteNode, Vec<RemoteNode>)> {
        if current.id == self.id() {
            return Ok(self.handle_next_hop(target, level).await);
        }
        let net = self.network();
        self.call(current, "next_hop", move || net.next_hop(current, target, level))
            .await
    }

    /// Walk next-hop steps from `start` until a node names itself as the root
    /// for `target`.
    ///
    /// The walk keeps its path. When a hop fails, the previous hop is told to
    /// drop it and asked again, so the lookup routes around dead entries instead
    /// of failing. Only an unreachable `start` or an exhausted hop budget fail.
    pub async fn find_root(&self, start: RemoteNode, target: NodeId) -> Result<RemoteNode> {
        let mut path: Vec<(RemoteNode, usize)> = vec![(start, 0)];
        let mut hops = 0;

        while let Some((current, level)) = path.last().cloned() {
            hops += 1;
            if hops > HOP_BUDGET {
                warn!(node = %self.local(), target = %target.short(), hops = HOP_BUDGET, "lookup did not converge");
                return Err(TapestryError::Inconsistent {
                    target,
                    hops: HOP_BUDGET,
                }
                .into());
            }

            match self.next_hop_via(&current, target, level).await {
                Ok((next, unreachable)) => {
                    if !unreachable.is_empty() {
                        self.prune(&unreachable).await;
                    }
                    if next.id == current.id {
                        trace!(node = %self.local(), target = %target.short(), root = %current, hops, "lookup reached root");
                        return Ok(current);
                    }
                    let next_level = current.id.shared_prefix_len(&next.id) + 1;
                    path.push((next, next_level));
                }
                Err(e) => {
                    path.pop();
                    let Some((previous, _)) = path.last().cloned() else {
                        return Err(e);
                    };
                    trace!(node = %self.local(), failed = %current, previous = %previous, "hop failed, backing off");
                    if previous.id == self.id() {
                        self.prune(std::slice::from_ref(&current)).await;
                    } else {
                        let net = self.network();
                        let (to, bad) = (&previous, &current);
                        if let Err(e) = self
                            .call(to, "remove_bad_nodes", move || net.remove_bad_nodes(to, vec![bad.clone()]))
                            .await
                        {
                            debug!(peer = %previous, error = %e, "could not report failed hop");
                        }
                    }
                }
            }
        }

        Err(anyhow!("lookup for {} ran out of hops to retry", target.short()))
    }

    // ------------------------------------------------------------------
    // Object location
    // ------------------------------------------------------------------

    /// Register `holder` for `key` at the key's root; returns the root.
    pub async fn register(&self, key: &str, holder: RemoteNode) -> Result<RemoteNode> {
        let target = NodeId::for_key(key);
        let mut start = self.local().clone();
        let mut last_err = None;

        for attempt in 1..=self.inner.config.lookup_retries.max(1) {
            let root = match self.find_root(start.clone(), target).await {
                Ok(root) => root,
                Err(e) => {
                    debug!(key = %key, attempt, error = %e, "register lookup failed");
                    last_err = Some(e);
                    start = self.local().clone();
                    continue;
                }
            };

            let accepted = if root.id == self.id() {
                Ok(self.handle_register(key, holder.clone()).await)
            } else {
                let net = self.network();
                let (to, holder) = (&root, &holder);
                self.call(to, "register", move || net.register(to, key, holder.clone()))
                    .await
            };

            match accepted {
                Ok(true) => return Ok(root),
                Ok(false) => {
                    // The root knows someone closer; continue the walk from there.
                    last_err = Some(anyhow!("{} declined registration of {:?}", root, key));
                    start = root;
                }
                Err(e) => {
                    last_err = Some(e);
                    start = self.local().clone();
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("registration of {:?} was not attempted", key)))
    }

    /// Register ourselves as a holder of `key`.
    pub async fn publish(&self, key: &str) -> Result<RemoteNode> {
        self.register(key, self.local().clone()).await
    }

    /// Holders currently registered for `key` at its root. Empty is not an error.
    pub async fn fetch(&self, key: &str) -> Result<Vec<RemoteNode>> {
        let target = NodeId::for_key(key);
        let mut start = self.local().clone();
        let mut last_err = None;

        for attempt in 1..=self.inner.config.lookup_retries.max(1) {
            let root = match self.find_root(start.clone(), target).await {
                Ok(root) => root,
                Err(e) => {
                    debug!(key = %key, attempt, error = %e, "fetch lookup failed");
                    last_err = Some(e);
                    start = self.local().clone();
                    continue;
                }
            };

            let answer = if root.id == self.id() {
                Ok(self.handle_fetch(key).await)
            } else {
                let net = self.network();
                let to = &root;
                self.call(to, "fetch", move || net.fetch(to, key)).await
            };

            match answer {
                Ok((true, holders)) => return Ok(holders),
                Ok((false, _)) => {
                    last_err = Some(anyhow!("{} is no longer root for {:?}", root, key));
                    start = root;
                }
                Err(e) => {
                    last_err = Some(e);
                    start = self.local().clone();
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("fetch of {:?} was not attempted", key)))
    }

    // ------------------------------------------------------------------
    // Blobs
    // ------------------------------------------------------------------

    /// Keep `value` locally and announce ourselves as its holder.
    pub async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        if value.len() > MAX_BLOB_SIZE {
            return Err(TapestryError::BlobTooLarge {
                size: value.len(),
                max: MAX_BLOB_SIZE,
            }
            .into());
        }

        self.inner.blobs.write().await.put(key, value);
        self.publish(key).await?;
        Ok(())
    }

    /// Read `key` from whichever registered holder still has it, ourselves first.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let not_found = || anyhow::Error::new(TapestryError::NotFound { key: key.to_string() });

        let mut holders = self.fetch(key).await?;
        if holders.is_empty() {
            return Err(not_found());
        }
        let me = self.id();
        holders.sort_by_key(|holder| holder.id != me);

        let mut answered = false;
        let mut last_err = None;
        for holder in &holders {
            if holder.id == me {
                let local = self.inner.blobs.read().await.get(key);
                if let Some(value) = local {
                    return Ok(value);
                }
                answered = true;
                continue;
            }

            let net = self.network();
            match self.call(holder, "blob_fetch", move || net.blob_fetch(holder, key)).await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => answered = true,
                Err(e) => {
                    debug!(key = %key, holder = %holder, error = %e, "holder unreachable, trying next");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if !answered => Err(e),
            _ => Err(not_found()),
        }
    }

    /// Drop the local copy of `key`; remote registrations lapse on expiry.
    pub async fn remove(&self, key: &str) -> bool {
        self.inner.blobs.write().await.remove(key)
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Enter the mesh through the node listening at `seed_addr`.
    pub async fn join(&self, seed_addr: &str) -> Result<()> {
        let join_failed = || TapestryError::JoinUnreachable {
            seed: seed_addr.to_string(),
        };
        let me = self.local();
        let net = self.network();

        let seed = self
            .attempt("hello", seed_addr, move || net.hello(seed_addr, Some(me.clone())))
            .await
            .map_err(|e| e.context(join_failed()))?;

        if seed.id == me.id {
            if seed.addr != me.addr {
                return Err(TapestryError::DuplicateIdentifier { id: me.id }.into());
            }
            anyhow::bail!("cannot join the mesh through our own address {}", seed_addr);
        }

        let mut last_err = None;
        for attempt in 1..=self.inner.config.join_attempts.max(1) {
            let root = match self.find_root(seed.clone(), me.id).await {
                Ok(root) => root,
                Err(e) => {
                    debug!(node = %me, seed = %seed, attempt, error = %e, "root lookup failed");
                    last_err = Some(e);
                    continue;
                }
            };

            if root.id == me.id {
                if root.addr != me.addr {
                    return Err(TapestryError::DuplicateIdentifier { id: me.id }.into());
                }
                // An earlier attempt already announced us.
                info!(node = %me, "already part of the mesh");
                return Ok(());
            }

            let neighbours = match self
                .relay(&root, "add_node", net.add_node(&root, me.clone()))
                .await
            {
                Ok(neighbours) => neighbours,
                Err(e) => {
                    debug!(node = %me, root = %root, attempt, error = %e, "announce failed");
                    last_err = Some(e);
                    continue;
                }
            };

            self.fill_routing_table(&root, neighbours).await;
            let routes = self.inner.routing.read().await.len();
            info!(node = %me, root = %root, routes, "joined the mesh");
            return Ok(());
        }

        let err = last_err.unwrap_or_else(|| anyhow!("no join attempt was made"));
        Err(err.context(join_failed()))
    }

    /// Take the multicast result into our table, then fill the levels below the
    /// root's shared prefix by walking backpointers one level at a time.
    async fn fill_routing_table(&self, root: &RemoteNode, neighbours: Vec<RemoteNode>) {
        let me = self.id();
        let shared = root.id.shared_prefix_len(&me);
        let keep = self.inner.config.join_neighbors.max(1);

        let mut known: NodeSet = neighbours.into_iter().filter(|n| n.id != me).collect();
        known.add(root.clone());
        for node in known.iter() {
            self.add_route(node.clone()).await;
        }

        let mut current = known.closest(&me, keep);
        for level in (0..shared).rev() {
            let mut found: NodeSet = current.iter().cloned().collect();
            for neighbour in &current {
                let net = self.network();
                let local = self.local();
                let result = self
                    .call(neighbour, "get_backpointers", move || {
                        net.get_backpointers(neighbour, local.clone(), level)
                    })
                    .await;
                match result {
                    Ok(backpointers) => found.extend(backpointers.into_iter().filter(|n| n.id != me)),
                    Err(e) => debug!(peer = %neighbour, level, error = %e, "backpointer query failed"),
                }
            }

            for node in found.iter() {
                self.add_route(node.clone()).await;
            }
            trace!(node = %self.local(), level, found = found.len(), "backpointer traversal step");
            current = found.closest(&me, keep);
        }
    }

    /// Leave gracefully: registrations go to the closest node we know, everyone
    /// routing through us learns a replacement, and everyone we route through
    /// forgets us.
    pub async fn leave(&self) -> Result<()> {
        self.stop_maintenance();
        let me = self.local().clone();

        let entries = self.inner.locations.write().await.drain_all();
        if !entries.is_empty() {
            let known: NodeSet = self.inner.routing.read().await.nodes().into_iter().collect();
            let mut batches: HashMap<NodeId, (RemoteNode, HashMap<String, Vec<RemoteNode>>)> = HashMap::new();
            for (key, holders) in entries {
                let target = NodeId::for_key(&key);
                match known.closest(&target, 1).into_iter().next() {
                    Some(dest) => {
                        batches
                            .entry(dest.id)
                            .or_insert_with(|| (dest.clone(), HashMap::new()))
                            .1
                            .insert(key, holders);
                    }
                    None => debug!(key = %key, "no node to hand registration to"),
                }
            }

            for (dest, batch) in batches.into_values() {
                let net = self.network();
                let (to, from, data) = (&dest, &me, &batch);
                if let Err(e) = self
                    .call(to, "transfer", move || net.transfer(to, from.clone(), data.clone()))
                    .await
                {
                    warn!(to = %dest, keys = batch.len(), error = %e, "could not hand over registrations");
                }
            }
        }

        for level in 0..DIGITS {
            let backpointers = self.inner.backpointers.read().await.level(level);
            if backpointers.is_empty() {
                continue;
            }
            let replacement = self.inner.routing.read().await.replacement_for(level);
            for backpointer in &backpointers {
                let net = self.network();
                let (from, replacement) = (&me, &replacement);
                if let Err(e) = self
                    .call(backpointer, "notify_leave", move || {
                        net.notify_leave(backpointer, from.clone(), replacement.clone())
                    })
                    .await
                {
                    debug!(peer = %backpointer, error = %e, "leave notification failed");
                }
            }
        }

        let routes = self.inner.routing.read().await.nodes();
        for route in &routes {
            let net = self.network();
            let from = &me;
            if let Err(e) = self
                .call(route, "remove_backpointer", move || net.remove_backpointer(route, from.clone()))
                .await
            {
                debug!(peer = %route, error = %e, "could not drop backpointer");
            }
        }

        self.inner.blobs.write().await.clear();
        info!(node = %me, "left the mesh");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub async fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            routing_entries: self.inner.routing.read().await.len(),
            backpointers: self.inner.backpointers.read().await.len(),
            location_keys: self.inner.locations.read().await.len(),
            stored_blobs: self.inner.blobs.read().await.len(),
        }
    }

    pub async fn routing_nodes(&self) -> Vec<RemoteNode> {
        self.inner.routing.read().await.nodes()
    }

    pub async fn backpointer_nodes(&self) -> Vec<RemoteNode> {
        self.inner.backpointers.read().await.all()
    }

    pub async fn has_route(&self, id: &NodeId) -> bool {
        self.inner.routing.read().await.contains(id)
    }

    pub async fn has_backpointer(&self, id: &NodeId) -> bool {
        self.inner.backpointers.read().await.contains(id)
    }
}
