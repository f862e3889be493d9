//! # Connection Cache
//!
//! Outbound connections are shared per remote address. The cache is an LRU
//! bounded by [`MAX_CACHED_CONNECTIONS`]; each entry is a once-cell, so when many
//! tasks ask for the same address at the same time exactly one of them dials and
//! the rest await its result.
//!
//! A failed dial leaves nothing behind. A connection that the [`Dialer`] reports
//! as dead is replaced on the next lookup; callers that see a transport error
//! call [`ConnectionManager::invalidate`] so the next call redials.

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, trace};

/// Upper bound on cached outbound connections.
pub const MAX_CACHED_CONNECTIONS: usize = 1_000;

/// Establishes connections to remote addresses.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    async fn dial(&self, addr: &str) -> Result<Self::Connection>;

    /// Whether a cached connection can still carry requests.
    fn is_alive(&self, _connection: &Self::Connection) -> bool {
        true
    }
}

type Slot<C> = Arc<OnceCell<C>>;

pub struct ConnectionManager<D: Dialer> {
    dialer: D,
    cache: RwLock<LruCache<String, Slot<D::Connection>>>,
}

impl<D: Dialer> ConnectionManager<D> {
    pub fn new(dialer: D) -> Self {
        Self::with_capacity(dialer, MAX_CACHED_CONNECTIONS)
    }

    pub fn with_capacity(dialer: D, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            dialer,
            cache: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Cached connection to `addr`, dialing it if needed.
    pub async fn get(&self, addr: &str) -> Result<D::Connection> {
        let slot = self.slot(addr).await;

        match slot.get_or_try_init(|| self.dialer.dial(addr)).await {
            Ok(connection) => Ok(connection.clone()),
            Err(e) => {
                self.remove_slot(addr, &slot).await;
                Err(e)
            }
        }
    }

    async fn slot(&self, addr: &str) -> Slot<D::Connection> {
        {
            let cache = self.cache.read().await;
            if let Some(slot) = cache.peek(addr)
                && self.usable(slot)
            {
                return slot.clone();
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(slot) = cache.get(addr) {
            if self.usable(slot) {
                return slot.clone();
            }
            trace!(addr = %addr, "cached connection is closed, replacing");
        }

        let slot: Slot<D::Connection> = Arc::new(OnceCell::new());
        if let Some((evicted, _)) = cache.push(addr.to_string(), slot.clone())
            && evicted != addr
        {
            trace!(addr = %evicted, "evicted least recently used connection");
        }
        slot
    }

    /// Empty cells are in-flight dials and count as usable.
    fn usable(&self, slot: &Slot<D::Connection>) -> bool {
        match slot.get() {
            Some(connection) => self.dialer.is_alive(connection),
            None => true,
        }
    }

    async fn remove_slot(&self, addr: &str, slot: &Slot<D::Connection>) {
        let mut cache = self.cache.write().await;
        if let Some(current) = cache.peek(addr)
            && Arc::ptr_eq(current, slot)
        {
            cache.pop(addr);
        }
    }

    /// Drop the cached connection for `addr`; the next call redials.
    pub async fn invalidate(&self, addr: &str) {
        if self.cache.write().await.pop(addr).is_some() {
            debug!(addr = %addr, "invalidated cached connection after failure");
        }
    }

    /// Drop every cached connection; returns how many were cached.
    pub async fn close_all(&self) -> usize {
        let mut cache = self.cache.write().await;
        let count = cache.len();
        cache.clear();
        count
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
