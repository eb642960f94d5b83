//! Connection pool
//!
//! Supervises [`Connection`]s: hands them out one owner at a time, pings
//! connections that sat idle longer than the keepalive interval (and
//! reconnects them when the ping fails), and discards connections that come
//! back broken or still inside a transaction. Retry policy stays here; the
//! connections themselves never retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::config::ConnectionOptions;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::Connection;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub min_connections: usize,
    /// Max wait for a free slot.
    pub acquire_timeout: Duration,
    /// Connections idle longer than this are pinged before reuse.
    pub idle_interval: Duration,
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_interval: Duration::from_secs(3600),
            max_lifetime: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the keepalive interval taken from connection options.
    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self::default().idle_interval(options.idle_interval())
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Connections opened eagerly by [`Pool::connect`].
    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Recycle connections older than `lifetime`.
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub max_size: usize,
    pub total_created: usize,
    pub reconnects: usize,
    pub discarded: usize,
}

struct PooledConn<C> {
    conn: C,
    created_at: Instant,
    last_used: Instant,
}

/// A checked-out connection. Checked back in when dropped.
pub struct PooledConnection<C: Connection> {
    conn: Option<PooledConn<C>>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connection> PooledConnection<C> {
    /// Check the connection back in now rather than on drop.
    pub async fn release(mut self) {
        if let Some(pooled) = self.conn.take() {
            self.pool.return_connection(pooled).await;
        }
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(pooled) = self.conn.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.return_connection(pooled).await;
            });
        }
    }
}

impl<C: Connection> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self
            .conn
            .as_ref()
            .expect("Connection should always be present")
            .conn
    }
}

impl<C: Connection> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self
            .conn
            .as_mut()
            .expect("Connection should always be present")
            .conn
    }
}

/// Inner pool state (shared across clones).
struct PoolInner<C: Connection> {
    config: PoolConfig,
    connect_config: C::Config,
    connections: Mutex<Vec<PooledConn<C>>>,
    semaphore: Semaphore,
    closed: AtomicBool,
    active_count: AtomicUsize,
    total_created: AtomicUsize,
    reconnects: AtomicUsize,
    discarded: AtomicUsize,
}

impl<C: Connection> PoolInner<C> {
    async fn return_connection(&self, mut pooled: PooledConn<C>) {
        self.active_count.fetch_sub(1, Ordering::Relaxed);

        let reusable = match pooled.conn.checkin().await {
            Ok(()) => !self.closed.load(Ordering::Relaxed),
            Err(e) => {
                warn!("discarding connection on checkin: {}", e);
                false
            }
        };

        if reusable {
            let mut connections = self.connections.lock().await;
            if connections.len() < self.config.max_connections {
                pooled.last_used = Instant::now();
                connections.push(pooled);
                drop(connections);
                self.semaphore.add_permits(1);
                return;
            }
        }

        self.discard(pooled.conn).await;
        self.semaphore.add_permits(1);
    }

    async fn discard(&self, mut conn: C) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = conn.disconnect().await {
            debug!("ignoring disconnect failure on discard: {}", e);
        }
    }

    /// Pop an idle connection that is still usable, pinging (and if needed
    /// reconnecting) connections idle past the keepalive interval.
    async fn take_idle(&self) -> Option<PooledConn<C>> {
        loop {
            let mut pooled = self.connections.lock().await.pop()?;

            if let Some(max_life) = self.config.max_lifetime
                && pooled.created_at.elapsed() > max_life
            {
                self.discard(pooled.conn).await;
                continue;
            }

            if pooled.last_used.elapsed() > self.config.idle_interval {
                if let Err(e) = pooled.conn.ping().await {
                    warn!("keepalive ping failed, reconnecting: {}", e);
                    if let Err(e) = pooled.conn.reconnect().await {
                        warn!("reconnect failed, discarding connection: {}", e);
                        self.discard(pooled.conn).await;
                        continue;
                    }
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    pooled.created_at = Instant::now();
                }
            }

            return Some(pooled);
        }
    }
}

/// A pool of connections sharing one connect configuration.
///
/// # Example
/// ```ignore
/// let config = ProtocolConfig::new(SqlxBridge::new(), options, Arc::new(TypeCache::new()));
/// let pool: Pool<Protocol<SqlxBridge>> = Pool::connect(config, PoolConfig::new()).await?;
/// let mut conn = pool.acquire().await?;
/// conn.execute(&Query::new("SELECT 1"), &[]).await?;
/// ```
pub struct Pool<C: Connection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connection> Pool<C> {
    /// Create a pool, opening `min_connections` up front.
    pub async fn connect(connect_config: C::Config, config: PoolConfig) -> Result<Self> {
        let semaphore = Semaphore::new(config.max_connections);

        let mut initial = Vec::new();
        for _ in 0..config.min_connections.min(config.max_connections) {
            let conn = C::connect(&connect_config).await?;
            initial.push(PooledConn {
                conn,
                created_at: Instant::now(),
                last_used: Instant::now(),
            });
        }
        let initial_count = initial.len();

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                connect_config,
                connections: Mutex::new(initial),
                semaphore,
                closed: AtomicBool::new(false),
                active_count: AtomicUsize::new(0),
                total_created: AtomicUsize::new(initial_count),
                reconnects: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
            }),
        })
    }

    /// Check out a connection.
    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(Error::connection(
                "pool is closed",
                ErrorCode::ConnectionDoesNotExist,
            ));
        }

        // Wait for available slot with timeout
        let acquire_timeout = self.inner.config.acquire_timeout;
        let permit = tokio::time::timeout(acquire_timeout, self.inner.semaphore.acquire())
            .await
            .map_err(|_| {
                Error::connection(
                    format!(
                        "timed out waiting for a connection ({}s)",
                        acquire_timeout.as_secs()
                    ),
                    ErrorCode::ConnectionTimeout,
                )
            })?
            .map_err(|_| Error::connection("pool closed", ErrorCode::ConnectionDoesNotExist))?;
        permit.forget();

        match self.checkout().await {
            Ok(pooled) => {
                self.inner.active_count.fetch_add(1, Ordering::Relaxed);
                Ok(PooledConnection {
                    conn: Some(pooled),
                    pool: self.inner.clone(),
                })
            }
            Err(e) => {
                self.inner.semaphore.add_permits(1);
                Err(e)
            }
        }
    }

    async fn checkout(&self) -> Result<PooledConn<C>> {
        let mut pooled = match self.inner.take_idle().await {
            Some(pooled) => pooled,
            None => {
                let conn = C::connect(&self.inner.connect_config).await?;
                self.inner.total_created.fetch_add(1, Ordering::Relaxed);
                PooledConn {
                    conn,
                    created_at: Instant::now(),
                    last_used: Instant::now(),
                }
            }
        };
        if let Err(e) = pooled.conn.checkout().await {
            self.inner.discard(pooled.conn).await;
            return Err(e);
        }
        Ok(pooled)
    }

    /// Get the current number of idle connections.
    pub async fn idle_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Get the number of connections currently in use.
    pub fn active_count(&self) -> usize {
        self.inner.active_count.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.inner.config.max_connections
    }

    pub async fn stats(&self) -> PoolStats {
        let idle = self.inner.connections.lock().await.len();
        PoolStats {
            active: self.inner.active_count.load(Ordering::Relaxed),
            idle,
            max_size: self.inner.config.max_connections,
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Close the pool and disconnect idle connections. Checked-out
    /// connections are disconnected when they come back.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        let idle: Vec<_> = self.inner.connections.lock().await.drain(..).collect();
        for pooled in idle {
            let mut conn = pooled.conn;
            if let Err(e) = conn.disconnect().await {
                debug!("ignoring disconnect failure on close: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config() {
        let options = ConnectionOptions::builder()
            .dsn("snowflake")
            .idle_interval(Duration::from_secs(120))
            .build()
            .unwrap();
        let config = PoolConfig::from_options(&options)
            .max_connections(0)
            .min_connections(2);

        assert_eq!(config.idle_interval, Duration::from_secs(120));
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
    }
}
