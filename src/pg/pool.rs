//! Connector pool.
//!
//! One queue per normalized connection string. A queue holds idle
//! connectors (FIFO), shared connectors with their reference counts, and a
//! semaphore with `max_pool_size` checkout permits. Exclusive checkouts and
//! distinct shared connectors each hold one permit while out of the pool.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::{MutexGuard, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::connector::Connector;
use super::error::{PgError, PgResult};
use super::settings::ConnectionSettings;
use super::state::StateKind;
use super::types::TransactionStatus;

static GLOBAL_POOL: Lazy<Arc<ConnectorPool>> = Lazy::new(|| Arc::new(ConnectorPool::new()));

// ============================================================================
// Queue
// ============================================================================

struct IdleEntry {
    connector: Connector,
    generation: u64,
    idle_since: Instant,
}

struct SharedSlot {
    entry: Arc<SharedEntry>,
    refs: usize,
}

#[derive(Default)]
struct QueueState {
    idle: VecDeque<IdleEntry>,
    shared: Vec<SharedSlot>,
    /// Physical connectors belonging to this key, idle or out.
    total: usize,
    /// Bumped by `clear`; older connectors are discarded on release.
    generation: u64,
}

/// Pool bookkeeping for one connection string.
struct ConnectorQueue {
    key: String,
    settings: Arc<ConnectionSettings>,
    permits: Arc<Semaphore>,
    state: Mutex<QueueState>,
    /// Signalled whenever an idle connector appears or `total` drops.
    slots: Notify,
}

impl ConnectorQueue {
    fn new(key: String, settings: &ConnectionSettings) -> Self {
        Self {
            key,
            settings: Arc::new(settings.clone()),
            permits: Arc::new(Semaphore::new(settings.max_pool_size)),
            state: Mutex::new(QueueState::default()),
            slots: Notify::new(),
        }
    }

    /// Wait for a checkout permit, bounded by the connect timeout.
    async fn acquire_permit(&self) -> PgResult<OwnedSemaphorePermit> {
        let wait = self.settings.timeout;
        match tokio::time::timeout(wait, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(PgError::Config("Pool closed".to_string())),
            Err(_) => Err(PgError::PoolExhausted {
                max_pool_size: self.settings.max_pool_size,
                waited: wait,
            }),
        }
    }

    /// Oldest usable idle connector, else a new one.
    ///
    /// A physical slot is reserved under the queue lock before connecting,
    /// so `total` never exceeds `max_pool_size` even while opens and
    /// top-ups are in flight.
    async fn checkout(self: &Arc<Self>) -> PgResult<(Connector, u64)> {
        loop {
            let slot_change = self.slots.notified();
            tokio::pin!(slot_change);
            slot_change.as_mut().enable();

            if self.settings.pooling {
                if let Some(found) = self.take_idle().await {
                    return Ok(found);
                }
            }
            if let Some(generation) = self.reserve() {
                return self.open_reserved(generation).await;
            }
            // Every slot belongs to a top-up that is still connecting.
            debug!("Waiting for a pending top-up on {}", self.key_target());
            slot_change.await;
        }
    }

    async fn take_idle(&self) -> Option<(Connector, u64)> {
        loop {
            let (entry, current) = {
                let mut state = self.state.lock();
                let entry = state.idle.pop_front()?;
                (entry, state.generation)
            };
            let mut connector = entry.connector;
            if entry.generation != current || connector.is_broken() {
                self.discard(connector).await;
                continue;
            }
            if entry.idle_since.elapsed() >= self.settings.validate_idle_after
                && !connector.is_valid().await
            {
                debug!("Idle connector for {} failed validation", self.key_target());
                self.discard(connector).await;
                continue;
            }
            return Some((connector, entry.generation));
        }
    }

    /// Claim one physical slot, returning the generation it belongs to.
    fn reserve(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.total >= self.settings.max_pool_size {
            return None;
        }
        state.total += 1;
        Some(state.generation)
    }

    fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
        }
        self.slots.notify_waiters();
    }

    async fn open_reserved(self: &Arc<Self>, generation: u64) -> PgResult<(Connector, u64)> {
        match Connector::connect((*self.settings).clone()).await {
            Ok(connector) => {
                if self.settings.pooling && self.below_minimum() {
                    let queue = Arc::clone(self);
                    tokio::spawn(async move { queue.top_up().await });
                }
                Ok((connector, generation))
            }
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    fn below_minimum(&self) -> bool {
        self.state.lock().total < self.settings.min_pool_size
    }

    /// Bring the key up to `min_pool_size` with idle connectors. Runs in the
    /// background after a checkout had to open a new connector.
    async fn top_up(&self) {
        loop {
            let generation = {
                let mut state = self.state.lock();
                if state.total >= self.settings.min_pool_size
                    || state.total >= self.settings.max_pool_size
                {
                    return;
                }
                state.total += 1;
                state.generation
            };
            match Connector::connect((*self.settings).clone()).await {
                Ok(connector) => {
                    self.state.lock().idle.push_back(IdleEntry {
                        connector,
                        generation,
                        idle_since: Instant::now(),
                    });
                    self.slots.notify_waiters();
                }
                Err(err) => {
                    self.release_slot();
                    warn!("Pool top-up for {} failed: {}", self.key_target(), err);
                    return;
                }
            }
        }
    }

    /// Return a connector. It goes back to idle only if it is healthy,
    /// Ready, outside a transaction, of the current generation and there is
    /// room; otherwise it is closed.
    async fn check_in(&self, mut connector: Connector, generation: u64) {
        if !self.settings.pooling {
            self.discard(connector).await;
            return;
        }
        if connector.is_broken() || connector.state() != StateKind::Ready {
            self.discard(connector).await;
            return;
        }
        if connector.transaction_status() != TransactionStatus::Idle {
            if let Err(err) = connector.simple_query("ROLLBACK").await {
                debug!("Rollback on release failed: {}", err);
                self.discard(connector).await;
                return;
            }
        }

        let rejected = {
            let mut state = self.state.lock();
            if generation == state.generation && state.idle.len() < self.settings.max_pool_size {
                state.idle.push_back(IdleEntry {
                    connector,
                    generation,
                    idle_since: Instant::now(),
                });
                None
            } else {
                Some(connector)
            }
        };
        match rejected {
            Some(connector) => self.discard(connector).await,
            None => self.slots.notify_waiters(),
        }
    }

    /// Synchronous half of `check_in` for drop paths without a runtime.
    fn check_in_now(&self, connector: Connector, generation: u64) {
        let reusable = self.settings.pooling
            && !connector.is_broken()
            && connector.state() == StateKind::Ready
            && connector.transaction_status() == TransactionStatus::Idle;
        {
            let mut state = self.state.lock();
            if reusable
                && generation == state.generation
                && state.idle.len() < self.settings.max_pool_size
            {
                state.idle.push_back(IdleEntry {
                    connector,
                    generation,
                    idle_since: Instant::now(),
                });
            } else {
                state.total = state.total.saturating_sub(1);
            }
        }
        self.slots.notify_waiters();
    }

    async fn discard(&self, mut connector: Connector) {
        self.release_slot();
        if let Err(err) = connector.close().await {
            debug!("Close of discarded connector failed: {}", err);
        }
    }

    fn key_target(&self) -> String {
        self.settings.display_target()
    }
}

/// Hand a connector back from a `Drop` impl: async when a runtime is
/// available, synchronously otherwise.
fn return_from_drop(
    queue: Arc<ConnectorQueue>,
    connector: Connector,
    generation: u64,
    permit: Option<OwnedSemaphorePermit>,
) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                queue.check_in(connector, generation).await;
                drop(permit);
            });
        }
        Err(_) => {
            queue.check_in_now(connector, generation);
            drop(permit);
        }
    }
}

// ============================================================================
// Pooled connector
// ============================================================================

/// A connector checked out exclusively.
///
/// Prefer [`ConnectorPool::release_connector`]; dropping it also returns
/// the connector, from a spawned task.
pub struct PooledConnector {
    /// The actual connector (None once returned)
    connector: Option<Connector>,
    queue: Arc<ConnectorQueue>,
    generation: u64,
    /// Checkout permit (controls pool size)
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnector {
    pub fn connector(&self) -> PgResult<&Connector> {
        self.connector.as_ref().ok_or(PgError::ConnectionClosed)
    }

    pub fn connector_mut(&mut self) -> PgResult<&mut Connector> {
        self.connector.as_mut().ok_or(PgError::ConnectionClosed)
    }

    /// Check if the connector is usable.
    pub fn is_healthy(&self) -> bool {
        self.connector
            .as_ref()
            .map(|c| !c.is_broken() && c.state() == StateKind::Ready)
            .unwrap_or(false)
    }

    /// Return the connector to its pool.
    pub async fn release(mut self) {
        if let Some(connector) = self.connector.take() {
            self.queue.check_in(connector, self.generation).await;
        }
        self.permit.take();
    }
}

impl Drop for PooledConnector {
    fn drop(&mut self) {
        if let Some(connector) = self.connector.take() {
            return_from_drop(
                Arc::clone(&self.queue),
                connector,
                self.generation,
                self.permit.take(),
            );
        }
    }
}

// ============================================================================
// Shared connector
// ============================================================================

struct SharedEntry {
    connector: tokio::sync::Mutex<Connector>,
    generation: u64,
    permit: OwnedSemaphorePermit,
}

/// A connector checked out by reference count.
///
/// All holders for one connection string see the same connector; use
/// [`lock`](Self::lock) for each exchange.
pub struct SharedConnector {
    entry: Option<Arc<SharedEntry>>,
    queue: Arc<ConnectorQueue>,
}

impl SharedConnector {
    /// Exclusive access for one exchange.
    pub async fn lock(&self) -> PgResult<MutexGuard<'_, Connector>> {
        match &self.entry {
            Some(entry) => Ok(entry.connector.lock().await),
            None => Err(PgError::ConnectionClosed),
        }
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        let Some(entry) = &self.entry else {
            return 0;
        };
        let state = self.queue.state.lock();
        state
            .shared
            .iter()
            .find(|slot| Arc::ptr_eq(&slot.entry, entry))
            .map(|slot| slot.refs)
            .unwrap_or(0)
    }

    /// Whether both handles refer to the same physical connector.
    pub fn same_connector(&self, other: &SharedConnector) -> bool {
        match (&self.entry, &other.entry) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Drop this reference. The last one returns the connector to idle.
    pub async fn release(mut self) {
        if let Some((connector, generation, permit)) = self.detach() {
            self.queue.check_in(connector, generation).await;
            drop(permit);
        }
    }

    /// Decrement the reference count; on zero, unwrap the connector.
    fn detach(&mut self) -> Option<(Connector, u64, OwnedSemaphorePermit)> {
        let entry = self.entry.take()?;
        {
            let mut state = self.queue.state.lock();
            let index = state
                .shared
                .iter()
                .position(|slot| Arc::ptr_eq(&slot.entry, &entry))?;
            state.shared[index].refs -= 1;
            if state.shared[index].refs > 0 {
                return None;
            }
            state.shared.remove(index);
        }
        match Arc::try_unwrap(entry) {
            Ok(entry) => Some((entry.connector.into_inner(), entry.generation, entry.permit)),
            Err(_) => {
                warn!("Shared connector still referenced after its last release");
                None
            }
        }
    }
}

impl Drop for SharedConnector {
    fn drop(&mut self) {
        if let Some((connector, generation, permit)) = self.detach() {
            return_from_drop(Arc::clone(&self.queue), connector, generation, Some(permit));
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Snapshot of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub shared: usize,
    pub total: usize,
    pub available_permits: usize,
}

/// Connector pool keyed by normalized connection string.
#[derive(Default)]
pub struct ConnectorPool {
    queues: Mutex<HashMap<String, Arc<ConnectorQueue>>>,
}

impl ConnectorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide pool.
    pub fn global() -> &'static Arc<ConnectorPool> {
        &GLOBAL_POOL
    }

    fn queue_for(&self, settings: &ConnectionSettings) -> PgResult<Arc<ConnectorQueue>> {
        settings.validate()?;
        let key = settings.normalized_key();
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ConnectorQueue::new(key, settings)));
        Ok(Arc::clone(queue))
    }

    fn existing_queue(&self, settings: &ConnectionSettings) -> Option<Arc<ConnectorQueue>> {
        self.queues.lock().get(&settings.normalized_key()).cloned()
    }

    /// Check out a connector exclusively.
    ///
    /// Waits up to `settings.timeout` for a permit when `max_pool_size`
    /// connectors are already out.
    pub async fn request_connector(
        &self,
        settings: &ConnectionSettings,
    ) -> PgResult<PooledConnector> {
        let queue = self.queue_for(settings)?;
        let permit = queue.acquire_permit().await?;
        let (connector, generation) = queue.checkout().await?;
        Ok(PooledConnector {
            connector: Some(connector),
            queue,
            generation,
            permit: Some(permit),
        })
    }

    /// Check out the key's shared connector, creating it if needed.
    pub async fn request_shared_connector(
        &self,
        settings: &ConnectionSettings,
    ) -> PgResult<SharedConnector> {
        let queue = self.queue_for(settings)?;
        if let Some(shared) = Self::join_shared(&queue) {
            return Ok(shared);
        }

        let permit = queue.acquire_permit().await?;
        let (connector, generation) = queue.checkout().await?;
        let entry = Arc::new(SharedEntry {
            connector: tokio::sync::Mutex::new(connector),
            generation,
            permit,
        });
        queue.state.lock().shared.push(SharedSlot {
            entry: Arc::clone(&entry),
            refs: 1,
        });
        Ok(SharedConnector {
            entry: Some(entry),
            queue,
        })
    }

    fn join_shared(queue: &Arc<ConnectorQueue>) -> Option<SharedConnector> {
        let mut state = queue.state.lock();
        let slot = state.shared.first_mut()?;
        slot.refs += 1;
        Some(SharedConnector {
            entry: Some(Arc::clone(&slot.entry)),
            queue: Arc::clone(queue),
        })
    }

    /// Return an exclusive connector.
    pub async fn release_connector(&self, connector: PooledConnector) {
        connector.release().await;
    }

    /// Drop one reference to a shared connector.
    pub async fn release_shared_connector(&self, connector: SharedConnector) {
        connector.release().await;
    }

    /// Close idle connectors for `settings` and retire checked-out ones.
    pub async fn clear_pool(&self, settings: &ConnectionSettings) {
        if let Some(queue) = self.existing_queue(settings) {
            Self::clear_queue(&queue).await;
        }
    }

    pub async fn clear_all_pools(&self) {
        let queues: Vec<_> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            Self::clear_queue(&queue).await;
        }
    }

    async fn clear_queue(queue: &ConnectorQueue) {
        let idle: Vec<IdleEntry> = {
            let mut state = queue.state.lock();
            state.generation += 1;
            state.idle.drain(..).collect()
        };
        debug!("Clearing {} idle connectors for {}", idle.len(), queue.key_target());
        for entry in idle {
            queue.discard(entry.connector).await;
        }
    }

    /// Close connectors idle longer than `connection_lifetime`, keeping
    /// `min_pool_size` per key. Returns how many were closed.
    pub async fn prune_idle(&self) -> usize {
        let queues: Vec<_> = self.queues.lock().values().cloned().collect();
        let mut closed = 0;
        for queue in queues {
            let expired: Vec<IdleEntry> = {
                let mut state = queue.state.lock();
                let lifetime = queue.settings.connection_lifetime;
                let min = queue.settings.min_pool_size;
                let mut expired = Vec::new();
                let mut kept = VecDeque::with_capacity(state.idle.len());
                let mut remaining = state.total;
                while let Some(entry) = state.idle.pop_front() {
                    if remaining > min && entry.idle_since.elapsed() >= lifetime {
                        remaining -= 1;
                        expired.push(entry);
                    } else {
                        kept.push_back(entry);
                    }
                }
                state.idle = kept;
                expired
            };
            closed += expired.len();
            for entry in expired {
                queue.discard(entry.connector).await;
            }
        }
        if closed > 0 {
            debug!("Pruned {} idle connectors", closed);
        }
        closed
    }

    /// Run `prune_idle` every `every` until the pool is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let pool: Weak<ConnectorPool> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.prune_idle().await;
            }
        })
    }

    pub fn stats(&self, settings: &ConnectionSettings) -> Option<PoolStats> {
        let queue = self.existing_queue(settings)?;
        let state = queue.state.lock();
        Some(PoolStats {
            idle: state.idle.len(),
            shared: state.shared.len(),
            total: state.total,
            available_permits: queue.permits.available_permits(),
        })
    }
}
