//! Connection pooling.
//!
//! The pool keeps three disjoint connection sets (free, used and invalid)
//! plus a count of connections currently being opened, all under one mutex.
//! Opening a connection reserves a capacity slot first and does the network
//! work outside the lock. Waiters blocked on a full pool sleep on a
//! [`Notify`] and re-validate the whole acquisition from the top when woken,
//! so spurious wakeups are harmless.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::core::connection::RawConnection;
use crate::core::EndPoint;
use crate::discovery::{discover_primary, PrimaryProbe, WireProbe};
use crate::error::DriverError;

struct PoolState {
    /// Known servers; grows as discovery learns replica hosts.
    servers: Vec<EndPoint>,
    /// The endpoint new connections are opened against.
    primary: Option<EndPoint>,
    /// Whether `primary` reflects a completed discovery run.
    discovered: bool,
    free: VecDeque<Arc<RawConnection>>,
    used: Vec<Arc<RawConnection>>,
    invalid: Vec<Arc<RawConnection>>,
    /// Connections being opened; they count against capacity.
    pending: usize,
}

impl PoolState {
    fn open_count(&self) -> usize {
        self.free.len() + self.used.len() + self.pending
    }
}

/// Snapshot of the pool's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub free: usize,
    pub used: usize,
    pub invalid: usize,
    pub pending: usize,
    pub max_pool_size: usize,
}

/// Pool of raw connections to the replica set's primary.
///
/// Use through an `Arc`; acquired connections come wrapped in a
/// [`PooledConnection`] guard that returns them on drop.
pub struct ConnectionPool {
    min_pool_size: usize,
    max_pool_size: usize,
    connection_lifetime: Duration,
    connection_timeout: Duration,
    connect_timeout: Duration,
    probe: Box<dyn PrimaryProbe>,
    state: Mutex<PoolState>,
    released: Notify,
}

impl ConnectionPool {
    /// Build a pool from a configuration.
    ///
    /// No connection is opened and no discovery runs here; both wait for
    /// the first acquire so construction never blocks on the network.
    pub fn new(config: &ClientConfig) -> Result<Arc<Self>, DriverError> {
        let probe = WireProbe::new(config.pool.connect_timeout());
        Self::with_probe(config, Box::new(probe))
    }

    /// Same as [`ConnectionPool::new`] with a caller-supplied primary probe.
    pub fn with_probe(
        config: &ClientConfig,
        probe: Box<dyn PrimaryProbe>,
    ) -> Result<Arc<Self>, DriverError> {
        config.validate()?;
        let servers = config.endpoints()?;

        Ok(Arc::new(Self {
            min_pool_size: config.pool.min_pool_size,
            max_pool_size: config.pool.max_pool_size,
            connection_lifetime: config.pool.connection_lifetime(),
            connection_timeout: config.pool.connection_timeout(),
            connect_timeout: config.pool.connect_timeout(),
            probe,
            state: Mutex::new(PoolState {
                servers,
                primary: None,
                discovered: false,
                free: VecDeque::new(),
                used: Vec::new(),
                invalid: Vec::new(),
                pending: 0,
            }),
            released: Notify::new(),
        }))
    }

    /// The endpoint discovery last confirmed as primary, if any.
    pub async fn primary_endpoint(&self) -> Option<EndPoint> {
        self.state.lock().await.primary.clone()
    }

    /// Current pool bookkeeping.
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            free: state.free.len(),
            used: state.used.len(),
            invalid: state.invalid.len(),
            pending: state.pending,
            max_pool_size: self.max_pool_size,
        }
    }

    /// Check out a connection.
    ///
    /// Reuses the oldest healthy idle connection, opens a new one while
    /// capacity remains, and otherwise waits for a release. The wait is
    /// bounded by the configured connection timeout; when it elapses the
    /// acquire fails with [`DriverError::PoolTimeout`] and the pool stays
    /// usable.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, DriverError> {
        let deadline = Instant::now() + self.connection_timeout;

        loop {
            {
                let mut state = self.state.lock().await;

                while let Some(connection) = state.free.pop_front() {
                    if connection.is_alive(self.connection_lifetime) {
                        state.used.push(Arc::clone(&connection));
                        return Ok(PooledConnection::new(connection, Arc::clone(self)));
                    }
                    debug!("Evicting dead idle connection to {}", connection.endpoint());
                    connection.mark_invalid();
                    state.invalid.push(connection);
                }

                if state.open_count() < self.max_pool_size {
                    state.pending += 1;
                    drop(state);
                    return self.open_for_use().await;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DriverError::PoolTimeout {
                    timeout: self.connection_timeout,
                });
            }
            let _ = tokio::time::timeout(remaining, self.released.notified()).await;
        }
    }

    /// Open a fresh connection against an already-reserved capacity slot.
    async fn open_for_use(self: &Arc<Self>) -> Result<PooledConnection, DriverError> {
        match self.open_to_primary().await {
            Ok(connection) => {
                let mut state = self.state.lock().await;
                state.pending -= 1;
                state.used.push(Arc::clone(&connection));
                Ok(PooledConnection::new(connection, Arc::clone(self)))
            }
            Err(e) => {
                {
                    let mut state = self.state.lock().await;
                    state.pending -= 1;
                }
                // The reserved slot is free again; let a waiter retry.
                self.released.notify_one();
                Err(e)
            }
        }
    }

    /// Open one connection to the current primary, running discovery first
    /// when none is known yet.
    async fn open_to_primary(&self) -> Result<Arc<RawConnection>, DriverError> {
        let primary = self.ensure_primary().await?;
        let connection = RawConnection::open(primary, self.connect_timeout).await?;
        Ok(Arc::new(connection))
    }

    async fn ensure_primary(&self) -> Result<EndPoint, DriverError> {
        let mut state = self.state.lock().await;
        if state.discovered {
            if let Some(primary) = state.primary.clone() {
                return Ok(primary);
            }
        }

        let primary = discover_primary(self.probe.as_ref(), &mut state.servers).await?;
        state.primary = Some(primary.clone());
        state.discovered = true;
        Ok(primary)
    }

    /// Return a connection to the pool.
    ///
    /// Unhealthy connections move to the invalid set instead of back to
    /// free, and losing a connection to the current primary re-runs
    /// discovery: the primary may have moved.
    pub(crate) async fn release(&self, connection: Arc<RawConnection>) {
        let mut state = self.state.lock().await;

        match state
            .used
            .iter()
            .position(|c| Arc::ptr_eq(c, &connection))
        {
            Some(index) => {
                state.used.swap_remove(index);
            }
            None => {
                // Happens when the pool was shut down with the connection
                // still checked out.
                debug!(
                    "Ignoring release of a connection the pool no longer tracks ({})",
                    connection.endpoint()
                );
                return;
            }
        }

        if !connection.is_alive(self.connection_lifetime) {
            let was_primary = state.primary.as_ref() == Some(connection.endpoint());
            debug!("Evicting dead connection to {}", connection.endpoint());
            connection.mark_invalid();
            state.invalid.push(connection);

            if was_primary {
                debug!("Lost a connection to the primary; rerunning discovery");
                state.discovered = false;
                state.primary = None;
                match discover_primary(self.probe.as_ref(), &mut state.servers).await {
                    Ok(primary) => {
                        state.primary = Some(primary);
                        state.discovered = true;
                    }
                    Err(e) => warn!("Discovery after losing the primary failed: {}", e),
                }
            }

            drop(state);
            self.released.notify_one();
            return;
        }

        state.free.push_back(connection);
        drop(state);
        self.released.notify_one();
    }

    /// Open idle connections until the pool holds at least the configured
    /// minimum.
    pub async fn ensure_minimum_pool_size(self: &Arc<Self>) -> Result<(), DriverError> {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.open_count() >= self.min_pool_size {
                    return Ok(());
                }
                state.pending += 1;
            }

            match self.open_to_primary().await {
                Ok(connection) => {
                    let mut state = self.state.lock().await;
                    state.pending -= 1;
                    state.free.push_back(connection);
                    drop(state);
                    self.released.notify_one();
                }
                Err(e) => {
                    {
                        let mut state = self.state.lock().await;
                        state.pending -= 1;
                    }
                    self.released.notify_one();
                    return Err(e);
                }
            }
        }
    }

    /// Maintenance sweep: evict dead idle connections, physically close
    /// everything already marked invalid, then top back up to the minimum.
    pub async fn reap(self: &Arc<Self>) -> Result<(), DriverError> {
        let stale = {
            let mut state = self.state.lock().await;

            let mut alive = VecDeque::with_capacity(state.free.len());
            while let Some(connection) = state.free.pop_front() {
                if connection.is_alive(self.connection_lifetime) {
                    alive.push_back(connection);
                } else {
                    debug!("Evicting dead idle connection to {}", connection.endpoint());
                    connection.mark_invalid();
                    state.invalid.push(connection);
                }
            }
            state.free = alive;

            std::mem::take(&mut state.invalid)
        };

        for connection in stale {
            connection.shutdown().await;
        }

        self.ensure_minimum_pool_size().await
    }

    /// Close every connection in every set. Safe to call repeatedly;
    /// connections still checked out are closed too and will be dropped on
    /// release.
    pub async fn shutdown(&self) {
        let connections = {
            let mut state = self.state.lock().await;
            let mut all: Vec<Arc<RawConnection>> = state.free.drain(..).collect();
            all.extend(state.used.drain(..));
            all.extend(state.invalid.drain(..));
            all
        };

        if !connections.is_empty() {
            debug!("Shutting down pool with {} connections", connections.len());
        }
        for connection in &connections {
            connection.shutdown().await;
        }
        self.released.notify_one();
    }
}

/// RAII guard for a checked-out connection.
///
/// Dropping the guard returns the connection to the pool through a spawned
/// task; [`PooledConnection::release`] does the same inline.
pub struct PooledConnection {
    connection: Option<Arc<RawConnection>>,
    pool: Arc<ConnectionPool>,
}

impl PooledConnection {
    fn new(connection: Arc<RawConnection>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            connection: Some(connection),
            pool,
        }
    }

    /// Hand the connection back to the pool immediately.
    pub async fn release(mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection).await;
        }
    }

    pub(crate) fn shared(&self) -> Arc<RawConnection> {
        Arc::clone(self.connection.as_ref().expect("connection already released"))
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.connection.is_some())
            .finish()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = RawConnection;

    fn deref(&self) -> &RawConnection {
        self.connection
            .as_deref()
            .expect("connection already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                pool.release(connection).await;
            });
        }
    }
}
