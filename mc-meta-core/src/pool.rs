//! The per-server connection pool (spec §4.3): built on `deadpool::managed`,
//! re-targeted so the poolable `Type` is a single [`Conn<T>`] (one TCP
//! connection) rather than the teacher's poolable `Client<C, P>` (a whole
//! multi-server client). Every server address the [`crate::resolver`]
//! layer knows about gets its own pool.
//!
//! Lifetime and idle-time eviction are driven off the timestamps [`Conn`]
//! already tracks rather than `deadpool`'s own `Metrics`, since the
//! `deadpool` version this crate targets hands a manager only `&mut T` in
//! `recycle`, not the checkout's age/idle metrics.

use crate::connection::{Conn, Error};
use crate::transport::Transport;
use async_trait::async_trait;
use deadpool::managed::{Manager, RecycleError, RecycleResult};
use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// Tunables for one server's pool (spec §6 configuration table).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections kept warm even when idle. The eager-fill and sweeper
    /// tasks (implemented by the runtime crate, since filling a pool
    /// requires spawning onto a runtime) maintain at least this many.
    pub min_size: usize,
    /// Upper bound on concurrently checked-out-or-idle connections.
    pub max_size: usize,
    /// A connection older than this is retired at its next recycle check,
    /// regardless of health. `None` disables the check.
    pub max_lifetime: Option<Duration>,
    /// A connection idle longer than this is retired at its next recycle
    /// check. `None` disables the check.
    pub max_idle_time: Option<Duration>,
    /// Bounds [`ConnManager::create`]'s TCP connect.
    pub connect_timeout: Duration,
    /// Bounds the no-op health check `recycle` runs before handing a
    /// connection back out.
    pub health_check_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 1,
            max_size: 10,
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            max_idle_time: Some(Duration::from_secs(5 * 60)),
            connect_timeout: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(1),
        }
    }
}

/// `deadpool::managed::Manager` for a single server address. Creates fresh
/// [`Conn`]s and recycles idle ones by running a no-op round trip and
/// checking the lifetime/idle-time bounds from [`PoolConfig`].
pub struct ConnManager<T: Transport> {
    addr: String,
    config: PoolConfig,
    _transport: PhantomData<fn() -> T>,
}

impl<T: Transport> ConnManager<T> {
    pub fn new(addr: impl Into<String>, config: PoolConfig) -> Self {
        ConnManager {
            addr: addr.into(),
            config,
            _transport: PhantomData,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl<T: Transport> Manager<Conn<T>, Error> for ConnManager<T> {
    async fn create(&self) -> Result<Conn<T>, Error> {
        let deadline = Instant::now() + self.config.connect_timeout;
        match Conn::connect(&self.addr, Some(deadline)).await {
            Ok(conn) => {
                tracing::debug!(addr = %self.addr, "pool created connection");
                Ok(conn)
            }
            Err(e) => {
                tracing::warn!(addr = %self.addr, error = %e, "pool failed to create connection");
                Err(e)
            }
        }
    }

    async fn recycle(&self, conn: &mut Conn<T>) -> RecycleResult<Error> {
        let now = Instant::now();

        if let Some(max_lifetime) = self.config.max_lifetime {
            if now.saturating_duration_since(conn.created_at()) >= max_lifetime {
                tracing::debug!(addr = %self.addr, "retiring connection past max lifetime");
                return Err(RecycleError::Message("connection exceeded max lifetime".into()));
            }
        }
        if let Some(max_idle) = self.config.max_idle_time {
            if now.saturating_duration_since(conn.last_used()) >= max_idle {
                tracing::debug!(addr = %self.addr, "retiring connection past max idle time");
                return Err(RecycleError::Message("connection exceeded max idle time".into()));
            }
        }
        if !conn.is_healthy() {
            tracing::debug!(addr = %self.addr, "retiring connection marked unhealthy");
            return Err(RecycleError::Message("connection marked unhealthy by last use".into()));
        }

        let deadline = now + self.config.health_check_timeout;
        if let Err(e) = conn.noop(deadline).await {
            tracing::warn!(addr = %self.addr, error = %e, "pool health check failed");
            return Err(RecycleError::Backend(e));
        }

        Ok(())
    }
}

/// One server's connection pool.
pub type Pool<T> = deadpool::managed::Pool<Conn<T>, Error>;

/// Build a pool for a single server address with the given configuration.
/// `max_size` governs `deadpool`'s own capacity bound; `min_size` is not
/// something `deadpool` tracks natively and is left for the runtime crate's
/// eager-fill task to honor.
pub fn build_pool<T: Transport>(addr: impl Into<String>, config: PoolConfig) -> Pool<T> {
    let max_size = config.max_size;
    let manager = ConnManager::new(addr, config);
    deadpool::managed::Pool::new(manager, max_size)
}

/// A snapshot of a pool's utilization, surfaced to callers that want to
/// export it as a metric (spec §6: "per-pool statistics"). `deadpool`
/// exposes these counts directly via [`deadpool::managed::Pool::status`];
/// this type just names the fields this crate promises to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub max_size: usize,
}

impl<T: Transport> From<&Pool<T>> for PoolStats {
    fn from(pool: &Pool<T>) -> Self {
        let status = pool.status();
        PoolStats {
            size: status.size,
            available: status.available.max(0) as usize,
            max_size: status.max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default_has_bounds() {
        let c = PoolConfig::default();
        assert!(c.min_size <= c.max_size);
        assert!(c.max_lifetime.is_some());
        assert!(c.max_idle_time.is_some());
    }
}
