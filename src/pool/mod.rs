//! Keyed pool of collector connections.
//!
//! Each [`EndpointKey`] owns an independent partition of idle connections.
//! A borrowed [`PooledConnection`] is moved out of the pool, so it can never
//! be handed to a second borrower until it comes back through
//! [`KeyedPool::return_connection`]. Broken connections are dropped with
//! [`KeyedPool::invalidate`] instead.

pub mod factory;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::PoolError;

pub use factory::{CollectorStream, ConnectionFactory, TcpConnectionFactory};

// ─── Configuration ───────────────────────────────────────────────

/// Idle connections older than this are closed by the eviction sweep.
const MIN_EVICTABLE_IDLE: Duration = Duration::from_secs(3 * 60);

/// Cadence of the background eviction sweep.
const EVICTION_INTERVAL: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Validate an idle connection before handing it out.
    pub test_on_borrow: bool,
    /// Validate idle connections during each eviction sweep.
    pub test_while_idle: bool,
    pub time_between_eviction_runs: Duration,
    pub min_evictable_idle: Duration,
    /// `None` means unbounded; reporting traffic keeps counts low.
    pub max_active_per_key: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            test_on_borrow: true,
            test_while_idle: true,
            time_between_eviction_runs: EVICTION_INTERVAL,
            min_evictable_idle: MIN_EVICTABLE_IDLE,
            max_active_per_key: None,
        }
    }
}

// ─── Public types ────────────────────────────────────────────────

/// Identity of one pool partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    host: Arc<str>,
    port: u16,
}

impl EndpointKey {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: Arc::from(host.as_ref()),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A connection checked out of the pool.
///
/// Dropping it without [`KeyedPool::return_connection`] or
/// [`KeyedPool::invalidate`] releases its slot and destroys the connection.
pub struct PooledConnection<F: ConnectionFactory> {
    id: u64,
    key: EndpointKey,
    conn: Option<F::Connection>,
    pool: Weak<PoolInner<F>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Pool-unique identifier, stable for the life of the connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    fn into_parts(mut self) -> (u64, EndpointKey, Option<F::Connection>) {
        let key = self.key.clone();
        (self.id, key, self.conn.take())
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &F::Connection {
        self.conn.as_ref().expect("pooled connection already released")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut F::Connection {
        self.conn.as_mut().expect("pooled connection already released")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        match self.pool.upgrade() {
            Some(inner) => {
                tracing::debug!(
                    host = self.key.host(),
                    port = self.key.port(),
                    id = self.id,
                    "connection dropped while checked out"
                );
                inner.state.lock().release(&self.key, self.id);
                inner.factory.destroy(&self.key, conn);
            }
            None => drop(conn),
        }
    }
}

/// Slot reserved for a connection still being opened. Released on drop
/// unless the connection made it out.
struct Reservation<'a, F: ConnectionFactory> {
    inner: &'a PoolInner<F>,
    key: &'a EndpointKey,
    id: u64,
    armed: bool,
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().release(self.key, self.id);
        }
    }
}

// ─── Internal state ──────────────────────────────────────────────

struct IdleEntry<C> {
    id: u64,
    conn: C,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: HashMap<EndpointKey, VecDeque<IdleEntry<C>>>,
    active: HashMap<EndpointKey, HashSet<u64>>,
    closed: bool,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            idle: HashMap::new(),
            active: HashMap::new(),
            closed: false,
        }
    }

    fn active_count(&self, key: &EndpointKey) -> usize {
        self.active.get(key).map_or(0, HashSet::len)
    }

    /// Returns false if `id` was not checked out under `key`.
    fn release(&mut self, key: &EndpointKey, id: u64) -> bool {
        match self.active.get_mut(key) {
            Some(ids) => {
                let found = ids.remove(&id);
                if ids.is_empty() {
                    self.active.remove(key);
                }
                found
            }
            None => false,
        }
    }
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    next_id: AtomicU64,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn evict(&self) -> usize {
        let now = Instant::now();
        let mut doomed = Vec::new();
        {
            let mut state = self.state.lock();
            for (key, entries) in state.idle.iter_mut() {
                let mut kept = VecDeque::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    let expired = now.duration_since(entry.idle_since) >= self.config.min_evictable_idle;
                    let broken = !expired
                        && self.config.test_while_idle
                        && !self.factory.validate(key, &entry.conn);
                    if expired || broken {
                        doomed.push((key.clone(), entry.conn));
                    } else {
                        kept.push_back(entry);
                    }
                }
                *entries = kept;
            }
            state.idle.retain(|_, entries| !entries.is_empty());
        }

        let evicted = doomed.len();
        for (key, conn) in doomed {
            self.factory.destroy(&key, conn);
        }
        if evicted > 0 {
            tracing::debug!(count = evicted, "evicted idle collector connections");
        }
        evicted
    }
}

// ─── KeyedPool ───────────────────────────────────────────────────

/// Thread-safe keyed connection pool.
pub struct KeyedPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> KeyedPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(PoolState::new()),
                next_id: AtomicU64::new(1),
            }),
            evictor: Mutex::new(None),
        }
    }

    /// Spawn the periodic eviction sweep on the current Tokio runtime.
    ///
    /// The task only holds a weak reference, so it ends on its own once
    /// the pool is dropped.
    pub fn start_evictor(&self) {
        let mut slot = self.evictor.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<PoolInner<F>> = Arc::downgrade(&self.inner);
        let period = self.inner.config.time_between_eviction_runs;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        inner.evict();
                    }
                    None => break,
                }
            }
        }));
    }

    /// Hand out an idle connection for `key`, or open a new one.
    pub async fn borrow(&self, key: &EndpointKey) -> Result<PooledConnection<F>, PoolError> {
        loop {
            let entry = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                let entry = state.idle.get_mut(key).and_then(VecDeque::pop_back);
                if let Some(entry) = &entry {
                    state.active.entry(key.clone()).or_default().insert(entry.id);
                }
                entry
            };

            let Some(entry) = entry else { break };

            if self.inner.config.test_on_borrow && !self.inner.factory.validate(key, &entry.conn) {
                tracing::debug!(host = key.host(), port = key.port(), "idle connection failed validation");
                self.inner.state.lock().release(key, entry.id);
                self.inner.factory.destroy(key, entry.conn);
                continue;
            }

            return Ok(PooledConnection {
                id: entry.id,
                key: key.clone(),
                conn: Some(entry.conn),
                pool: Arc::downgrade(&self.inner),
            });
        }

        // Reserve the slot before connecting so concurrent borrowers see it.
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(limit) = self.inner.config.max_active_per_key {
                if state.active_count(key) >= limit {
                    return Err(PoolError::Exhausted {
                        key: key.clone(),
                        limit,
                    });
                }
            }
            state.active.entry(key.clone()).or_default().insert(id);
        }

        let mut reservation = Reservation {
            inner: &self.inner,
            key,
            id,
            armed: true,
        };
        match self.inner.factory.create(key).await {
            Ok(conn) => {
                reservation.armed = false;
                Ok(PooledConnection {
                    id,
                    key: key.clone(),
                    conn: Some(conn),
                    pool: Arc::downgrade(&self.inner),
                })
            }
            Err(source) => Err(PoolError::Connect {
                key: key.clone(),
                source,
            }),
        }
    }

    /// Give a healthy connection back for reuse.
    pub fn return_connection(&self, pooled: PooledConnection<F>) {
        let (id, key, conn) = pooled.into_parts();
        let Some(conn) = conn else { return };
        let mut state = self.inner.state.lock();
        if !state.release(&key, id) {
            drop(state);
            tracing::warn!(host = key.host(), port = key.port(), id, "returned connection was not checked out");
            self.inner.factory.destroy(&key, conn);
            return;
        }
        if state.closed {
            drop(state);
            self.inner.factory.destroy(&key, conn);
            return;
        }
        state.idle.entry(key).or_default().push_back(IdleEntry {
            id,
            conn,
            idle_since: Instant::now(),
        });
    }

    /// Drop a connection that failed mid-use; it never re-enters the pool.
    pub fn invalidate(&self, pooled: PooledConnection<F>) {
        let (id, key, conn) = pooled.into_parts();
        let Some(conn) = conn else { return };
        self.inner.state.lock().release(&key, id);
        self.inner.factory.destroy(&key, conn);
    }

    /// Run one eviction sweep now; returns how many connections were closed.
    pub fn evict(&self) -> usize {
        self.inner.evict()
    }

    pub fn num_idle(&self, key: &EndpointKey) -> usize {
        self.inner.state.lock().idle.get(key).map_or(0, VecDeque::len)
    }

    pub fn num_active(&self, key: &EndpointKey) -> usize {
        self.inner.state.lock().active_count(key)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Stop the evictor and close every idle connection. Connections still
    /// checked out are closed when they come back.
    pub fn close(&self) {
        if let Some(handle) = self.evictor.lock().take() {
            handle.abort();
        }
        let idle = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        for (key, entries) in idle {
            for entry in entries {
                self.inner.factory.destroy(&key, entry.conn);
            }
        }
    }
}

impl<F: ConnectionFactory> Drop for KeyedPool<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.evictor.get_mut().take() {
            handle.abort();
        }
    }
}
