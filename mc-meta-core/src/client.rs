//! The top-level coordinator (spec §4.5): the public surface applications
//! call. Fans a batch of commands out to the server(s) that own their keys,
//! pipelines each per-server bucket on one pooled connection, and scatters
//! the responses back into the caller's original order.
//!
//! Generalizes the teacher's `Client<C, P>`, which owned one `Ring<C>` of
//! plain connections, into a coordinator that owns one connection *pool*
//! per server address and dispatches buckets to them concurrently with
//! `futures::future::join_all`, mirroring the teacher's own use of
//! `futures` for its multi-get fan-out.

use crate::error::Error;
use crate::pool::{self, Pool, PoolConfig};
use crate::protocol::{Command, Flag, Request, Response, SetMode, Status};
use crate::resolver::Resolver;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Programmatic configuration for a [`Client`] (spec §6 table).
pub struct ClientConfig {
    pub resolver: Arc<dyn Resolver>,
    pub pool: PoolConfig,
}

impl ClientConfig {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        ClientConfig {
            resolver,
            pool: PoolConfig::default(),
        }
    }

    pub fn with_pool_config(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// The result of a single-key `Get` (spec §4.5 response mapping).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub found: bool,
    pub value: Option<Vec<u8>>,
    pub cas: Option<u64>,
}

/// The result of a mutation (`Set`/`Add`/`Replace`/`Append`/`Prepend`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    Stored,
    NotStored,
    CasMismatch,
}

/// The result of a `Delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    Deleted,
    NotFound,
}

/// The coordinator. Cheap to clone: everything it owns is behind an `Arc`
/// or is itself a handle (`Pool` is a handle in `deadpool`).
pub struct Client<T: Transport> {
    resolver: Arc<dyn Resolver>,
    pool_config: PoolConfig,
    pools: Arc<RwLock<HashMap<String, Arc<Pool<T>>>>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Client {
            resolver: self.resolver.clone(),
            pool_config: self.pool_config.clone(),
            pools: self.pools.clone(),
        }
    }
}

impl<T: Transport> Client<T> {
    pub fn new(config: ClientConfig) -> Self {
        Client {
            resolver: config.resolver,
            pool_config: config.pool,
            pools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Every server address currently known to the resolver, with its pool
    /// lazily created on first mention (spec §4.4/§4.5).
    pub fn addresses(&self) -> Vec<String> {
        self.resolver.all()
    }

    /// The pool configuration every per-server pool was (or will be) built
    /// with. Used by the runtime crate's eager-fill/sweeper task to know
    /// each pool's target `min_size`.
    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool_config
    }

    fn pool_for(&self, addr: &str) -> Result<Arc<Pool<T>>, Error> {
        if let Some(p) = self.pools.read().unwrap().get(addr) {
            return Ok(p.clone());
        }
        let mut pools = self.pools.write().unwrap();
        if let Some(p) = pools.get(addr) {
            return Ok(p.clone());
        }
        let built = Arc::new(pool::build_pool::<T>(addr.to_string(), self.pool_config.clone()));
        pools.insert(addr.to_string(), built.clone());
        Ok(built)
    }

    /// Per-server pool handles for every address the resolver currently
    /// knows about. Used by the runtime crate's eager-fill/sweeper task.
    pub fn all_pools(&self) -> Result<Vec<(String, Arc<Pool<T>>)>, Error> {
        self.resolver
            .all()
            .into_iter()
            .map(|addr| self.pool_for(&addr).map(|p| (addr, p)))
            .collect()
    }

    /// Run an arbitrary batch of requests, routed per-key, and return
    /// responses in the same order as `requests` (spec §4.5 algorithm).
    pub async fn execute(
        &self,
        requests: Vec<Request>,
        deadline: Instant,
    ) -> Result<Vec<Response>, Error> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        // Step 1: resolve and bucket by server, preserving per-bucket order
        // and recording each request's back-index into the output slice.
        let mut buckets: HashMap<String, (Vec<Request>, Vec<usize>)> = HashMap::new();
        for (i, req) in requests.iter().enumerate() {
            let addr = self.resolver.address_for(&req.key)?;
            let entry = buckets.entry(addr).or_insert_with(|| (Vec::new(), Vec::new()));
            entry.0.push(req.clone());
            entry.1.push(i);
        }

        // Step 2: dispatch each bucket concurrently.
        let mut futures = Vec::with_capacity(buckets.len());
        for (addr, (bucket_requests, back_indices)) in buckets {
            let pool = self.pool_for(&addr)?;
            futures.push(run_bucket::<T>(pool, bucket_requests, back_indices, deadline));
        }
        let bucket_results = futures::future::join_all(futures).await;

        // Step 3/4: scatter responses back; partial failures are filled
        // with a synthetic ConnectionError so the output is fully populated.
        let mut out: Vec<Option<Response>> = (0..requests.len()).map(|_| None).collect();
        for (back_indices, responses, err) in bucket_results {
            for (i, back_index) in back_indices.iter().enumerate() {
                if let Some(resp) = responses.get(i) {
                    out[*back_index] = Some(resp.clone());
                } else {
                    let msg = err
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "connection closed before this request's response".into());
                    // Synthetic fill-in for a bucket that failed partway
                    // through (spec §4.5 step 4): the request was never
                    // answered, not rejected, so this is reported as a
                    // parse/connection-level failure rather than a server
                    // status.
                    out[*back_index] = Some(Response::err(
                        Status::ParseError,
                        crate::protocol::CodecError::ParseError(msg),
                    ));
                }
            }
        }

        Ok(out.into_iter().map(|r| r.unwrap()).collect())
    }

    async fn execute_one(&self, request: Request, deadline: Instant) -> Result<Response, Error> {
        let mut responses = self.execute(vec![request], deadline).await?;
        Ok(responses.remove(0))
    }

    fn deadline(timeout: Duration) -> Instant {
        Instant::now() + timeout
    }

    /// Fetch a single value. `timeout` bounds resolution, acquire, write
    /// and read (spec §4.5 "Timeouts").
    pub async fn get(&self, key: impl Into<Vec<u8>>, timeout: Duration) -> Result<GetResult, Error> {
        let req = Request::new(Command::Get, key.into())
            .with_flag(Flag::return_key())
            .with_flag(Flag::return_cas());
        let resp = self.execute_one(req, Self::deadline(timeout)).await?;
        check_error(&resp)?;
        let cas = parse_cas(&resp);
        Ok(match resp.status {
            Status::Va => GetResult {
                found: true,
                value: Some(resp.data),
                cas,
            },
            _ => GetResult {
                found: false,
                value: None,
                cas: None,
            },
        })
    }

    /// Batch fetch; misses are simply absent from the failure channel and
    /// present with `found: false` in the result vector (spec §4.5
    /// `GetMulti`).
    pub async fn get_multi(
        &self,
        keys: Vec<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Vec<GetResult>, Error> {
        let requests: Vec<Request> = keys
            .into_iter()
            .map(|k| {
                Request::new(Command::Get, k)
                    .with_flag(Flag::return_key())
                    .with_flag(Flag::return_cas())
            })
            .collect();
        let responses = self.execute(requests, Self::deadline(timeout)).await?;
        responses
            .into_iter()
            .map(|resp| {
                check_error(&resp)?;
                let cas = parse_cas(&resp);
                Ok(match resp.status {
                    Status::Va => GetResult {
                        found: true,
                        value: Some(resp.data),
                        cas,
                    },
                    _ => GetResult {
                        found: false,
                        value: None,
                        cas: None,
                    },
                })
            })
            .collect()
    }

    async fn store(
        &self,
        mode: SetMode,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        ttl: Option<u32>,
        timeout: Duration,
    ) -> Result<StoreResult, Error> {
        let mut req = Request::new(Command::Set, key.into())
            .with_data(value.into())
            .with_flag(Flag::set_mode(mode));
        if let Some(ttl) = ttl {
            req = req.with_flag(Flag::ttl(ttl));
        }
        let resp = self.execute_one(req, Self::deadline(timeout)).await?;
        check_error(&resp)?;
        Ok(match resp.status {
            Status::Hd => StoreResult::Stored,
            Status::Ns => StoreResult::NotStored,
            Status::Ex => StoreResult::CasMismatch,
            _ => StoreResult::NotStored,
        })
    }

    pub async fn set(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        ttl: Option<u32>,
        timeout: Duration,
    ) -> Result<StoreResult, Error> {
        self.store(SetMode::Set, key, value, ttl, timeout).await
    }

    pub async fn add(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        ttl: Option<u32>,
        timeout: Duration,
    ) -> Result<StoreResult, Error> {
        self.store(SetMode::Add, key, value, ttl, timeout).await
    }

    pub async fn replace(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        ttl: Option<u32>,
        timeout: Duration,
    ) -> Result<StoreResult, Error> {
        self.store(SetMode::Replace, key, value, ttl, timeout).await
    }

    pub async fn append(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<StoreResult, Error> {
        self.store(SetMode::Append, key, value, None, timeout).await
    }

    pub async fn prepend(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<StoreResult, Error> {
        self.store(SetMode::Prepend, key, value, None, timeout).await
    }

    /// Delete treats a missing key as success (spec §4.5: idempotent).
    pub async fn delete(&self, key: impl Into<Vec<u8>>, timeout: Duration) -> Result<DeleteResult, Error> {
        let req = Request::new(Command::Delete, key.into());
        let resp = self.execute_one(req, Self::deadline(timeout)).await?;
        check_error(&resp)?;
        Ok(match resp.status {
            Status::Hd => DeleteResult::Deleted,
            Status::Nf => DeleteResult::NotFound,
            _ => DeleteResult::NotFound,
        })
    }

    async fn arithmetic(
        &self,
        key: impl Into<Vec<u8>>,
        delta: i64,
        vivify_ttl: Option<u32>,
        initial: Option<u64>,
        timeout: Duration,
    ) -> Result<Option<u64>, Error> {
        let incr = delta >= 0;
        let magnitude = delta.unsigned_abs();
        let mut req = Request::new(Command::Arithmetic, key.into())
            .with_flag(Flag::arithmetic_mode(incr))
            .with_flag(Flag::delta(magnitude))
            .with_flag(Flag::return_value());
        if let Some(ttl) = vivify_ttl {
            req = req.with_flag(Flag::vivify_ttl(ttl));
        }
        if let Some(initial) = initial {
            req = req.with_flag(Flag::initial_value(initial));
        }
        let resp = self.execute_one(req, Self::deadline(timeout)).await?;
        check_error(&resp)?;
        match resp.status {
            Status::Va => {
                let text = String::from_utf8_lossy(&resp.data);
                Ok(text.trim().parse::<u64>().ok())
            }
            Status::Nf => Ok(None),
            _ => Ok(None),
        }
    }

    /// Increment never goes negative; a positive `delta` is required.
    pub async fn increment(
        &self,
        key: impl Into<Vec<u8>>,
        delta: u64,
        vivify_ttl: Option<u32>,
        initial: Option<u64>,
        timeout: Duration,
    ) -> Result<Option<u64>, Error> {
        self.arithmetic(key, delta as i64, vivify_ttl, initial, timeout).await
    }

    /// Decrement never underflows below zero (spec §4.5: server semantics).
    pub async fn decrement(
        &self,
        key: impl Into<Vec<u8>>,
        delta: u64,
        vivify_ttl: Option<u32>,
        initial: Option<u64>,
        timeout: Duration,
    ) -> Result<Option<u64>, Error> {
        self.arithmetic(key, -(delta as i64), vivify_ttl, initial, timeout).await
    }

    /// Debug metadata for a key (spec §3 `Debug`/`me`), returned verbatim as
    /// the server formats it (`key=... exp=... la=... cas=... ...`).
    pub async fn debug(&self, key: impl Into<Vec<u8>>, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        let req = Request::new(Command::Debug, key.into());
        let resp = self.execute_one(req, Self::deadline(timeout)).await?;
        check_error(&resp)?;
        Ok(match resp.status {
            Status::Me => Some(resp.data),
            _ => None,
        })
    }

    /// Explicit no-op round trip, distinct from the engine's internal
    /// quiet-batch sentinel (spec §3: `NoOp` is a caller-visible command).
    pub async fn noop(&self, timeout: Duration) -> Result<(), Error> {
        let req = Request::noop();
        let resp = self.execute_one(req, Self::deadline(timeout)).await?;
        match resp.status {
            Status::Mn => Ok(()),
            _ => Err(Error::Connection(crate::connection::Error::Codec(
                crate::protocol::CodecError::ParseError("expected MN for explicit noop".into()),
            ))),
        }
    }

    /// Legacy `stats` command against every known server, keyed by address.
    pub async fn stats(&self, timeout: Duration) -> HashMap<String, Result<Vec<(String, String)>, Error>> {
        let deadline = Self::deadline(timeout);
        let addrs = self.resolver.all();
        let mut out = HashMap::new();
        for addr in addrs {
            let result = self.stats_one(&addr, deadline).await;
            out.insert(addr, result);
        }
        out
    }

    async fn stats_one(&self, addr: &str, deadline: Instant) -> Result<Vec<(String, String)>, Error> {
        let pool = self.pool_for(addr)?;
        let mut conn = pool.get().await?;
        // A must-close error leaves `healthy` false, which the pool's
        // `recycle` checks on return and destroys the connection for
        // (spec invariant I5) — no explicit discard needed here.
        conn.stats(deadline).await.map_err(Error::Connection)
    }
}

/// Surface a response's protocol-level error, if any, instead of letting it
/// fall through a convenience wrapper's status match and get mistaken for an
/// ordinary miss/not-stored result.
fn check_error(resp: &Response) -> Result<(), Error> {
    if let Some(e) = resp.error.as_ref() {
        return Err(Error::Connection(crate::connection::Error::Codec(e.clone())));
    }
    Ok(())
}

/// Extract the CAS token from a response's `c` flag, if the server returned
/// one (requested via [`Flag::return_cas`] on `get`/`get_multi`).
fn parse_cas(resp: &Response) -> Option<u64> {
    resp.flag(b'c')
        .and_then(|tok| std::str::from_utf8(tok).ok())
        .and_then(|s| s.parse::<u64>().ok())
}

/// Acquire a connection, run one bucket's pipelined batch, and release it
/// (destroying it on a must-close error per spec invariant I5). Returns the
/// bucket's back-indices alongside whatever responses were collected and,
/// on partial failure, the error that stopped collection.
async fn run_bucket<T: Transport>(
    pool: Arc<Pool<T>>,
    requests: Vec<Request>,
    back_indices: Vec<usize>,
    deadline: Instant,
) -> (Vec<usize>, Vec<Response>, Option<Error>) {
    let mut conn = match pool.get().await {
        Ok(c) => c,
        Err(e) => return (back_indices, Vec::new(), Some(Error::from(e))),
    };

    // A must-close error leaves the connection's own `healthy` flag false;
    // the pool's `recycle` checks that on return and destroys it instead
    // of keeping it idle (spec invariant I5), so no explicit discard is
    // needed here.
    let result = conn.execute(&requests, deadline).await;
    let err = result.error.map(Error::Connection);
    (back_indices, result.responses, err)
}
