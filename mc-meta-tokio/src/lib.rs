//! A tokio runtime binding for the memcached meta-protocol client core:
//! implements [`mc_meta_core::Transport`] over `tokio::net::TcpStream`,
//! enforcing the caller's deadline with `tokio::time::timeout`, and runs
//! the background tasks (eager pool fill, idle/lifetime sweeper) that need
//! a runtime to spawn onto.

use async_trait::async_trait;
use mc_meta_core::pool::Pool;
use mc_meta_core::{Client, Transport};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub use mc_meta_core::{
    ClientConfig, Command, DeleteResult, Dynamic, Error, Flag, GetResult, PoolConfig, PoolStats,
    Request, Resolver, Response, SetMode, Static, Status, StoreResult,
};

/// A bare TCP socket driven by tokio, bounded per-call by an optional
/// deadline via `tokio::time::timeout`. An elapsed deadline surfaces as
/// `io::ErrorKind::TimedOut`, which the connection engine treats as any
/// other I/O failure (destroy the connection, spec invariant I5).
#[derive(Debug)]
pub struct TokioTransport {
    stream: TcpStream,
}

async fn bounded<F, T>(deadline: Option<Instant>, fut: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match deadline {
        None => fut.await,
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::timeout(remaining, fut)
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")))
        }
    }
}

#[async_trait]
impl Transport for TokioTransport {
    async fn connect(addr: &str, deadline: Option<Instant>) -> io::Result<Self> {
        let addr = addr.to_string();
        let stream = bounded(deadline, async move { TcpStream::connect(addr).await }).await?;
        Ok(TokioTransport { stream })
    }

    async fn read(&mut self, buf: &mut Vec<u8>, deadline: Option<Instant>) -> io::Result<usize> {
        bounded(deadline, self.stream.read(buf)).await
    }

    async fn write_all(&mut self, data: &[u8], deadline: Option<Instant>) -> io::Result<()> {
        bounded(deadline, self.stream.write_all(data)).await?;
        Ok(())
    }
}

/// A memcached meta-protocol client bound to tokio.
pub type TokioClient = Client<TokioTransport>;

/// Spawn the background tasks a [`TokioClient`]'s pools need: eager fill to
/// `min_size` and periodic lifetime/idle-time eviction (spec §4.3). `deadpool`
/// has no idle-timeout sweeper of its own, so this task drives it by
/// periodically warming each pool back up to its configured minimum — any
/// connection `recycle` rejects for age or idleness is simply replaced on
/// the next fill tick.
///
/// Returns a [`tokio::task::JoinHandle`] the caller may abort to stop the
/// sweeper; dropping the handle leaves the task running detached.
pub fn spawn_pool_sweeper(client: TokioClient, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let min_size = client.pool_config().min_size;
            if let Ok(pools) = client.all_pools() {
                for (_, pool) in pools {
                    fill_to_min(&pool, min_size).await;
                }
            }
        }
    })
}

async fn fill_to_min(pool: &Arc<Pool<TokioTransport>>, min_size: usize) {
    let status = pool.status();
    let deficit = min_size.saturating_sub(status.size);
    if deficit > 0 {
        tracing::debug!(deficit, size = status.size, min_size, "sweeper topping up pool");
    }
    for _ in 0..deficit {
        // `get` both creates (if under max) and immediately returns the
        // connection to the idle set on drop, which is the cheapest way to
        // warm a pool up using only the public `deadpool` API.
        let _ = pool.get().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::process::{Child, Command, Stdio};

    struct MemcachedTester {
        names: Vec<String>,
        procs: Vec<Child>,
    }

    impl MemcachedTester {
        fn new(port: u16) -> Self {
            let name = format!("test_memcached_{}", port);
            let proc = MemcachedTester::new_proc(&name, port);
            MemcachedTester {
                procs: vec![proc],
                names: vec![name],
            }
        }

        fn new_proc(name: &str, port: u16) -> Child {
            let mut proc = Command::new("docker")
                .args([
                    "run",
                    "--rm",
                    "-t",
                    "--name",
                    name,
                    "-p",
                    &format!("{}:11211", port),
                    "memcached",
                    "memcached",
                    "-vv",
                ])
                .stdout(Stdio::piped())
                .spawn()
                .unwrap();

            let stdout = proc.stdout.as_mut().unwrap();
            let mut reader = BufReader::new(stdout);
            let mut buf = String::new();
            reader.read_line(&mut buf).unwrap();
            proc
        }
    }

    impl Drop for MemcachedTester {
        fn drop(&mut self) {
            for name in &self.names {
                let _ = Command::new("docker").args(["stop", name]).output();
            }
            for proc in self.procs.iter_mut() {
                let _ = proc.wait();
            }
        }
    }

    fn test_client(port: u16) -> TokioClient {
        let resolver = Arc::new(Static::new(vec![format!("127.0.0.1:{}", port)]));
        Client::new(ClientConfig::new(resolver))
    }

    #[tokio::test]
    #[ignore = "requires docker and a loopback memcached instance"]
    async fn test_connect() {
        let port = 21211;
        let _tester = MemcachedTester::new(port);
        TokioTransport::connect(&format!("127.0.0.1:{}", port), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires docker and a loopback memcached instance"]
    async fn test_set_get_delete_round_trip() {
        let port = 21212;
        let _tester = MemcachedTester::new(port);
        let client = test_client(port);
        let timeout = Duration::from_secs(2);

        let miss = client.get(b"key".to_vec(), timeout).await.unwrap();
        assert!(!miss.found);

        let stored = client
            .set(b"key".to_vec(), b"hello".to_vec(), None, timeout)
            .await
            .unwrap();
        assert_eq!(stored, StoreResult::Stored);

        let hit = client.get(b"key".to_vec(), timeout).await.unwrap();
        assert!(hit.found);
        assert_eq!(hit.value, Some(b"hello".to_vec()));

        let deleted = client.delete(b"key".to_vec(), timeout).await.unwrap();
        assert_eq!(deleted, DeleteResult::Deleted);

        let miss_again = client.get(b"key".to_vec(), timeout).await.unwrap();
        assert!(!miss_again.found);
    }

    #[tokio::test]
    #[ignore = "requires docker and a loopback memcached instance"]
    async fn test_get_multi_mixed_hits_and_misses() {
        let port = 21213;
        let _tester = MemcachedTester::new(port);
        let client = test_client(port);
        let timeout = Duration::from_secs(2);

        client
            .set(b"a".to_vec(), b"1".to_vec(), None, timeout)
            .await
            .unwrap();
        client
            .set(b"b".to_vec(), b"2".to_vec(), None, timeout)
            .await
            .unwrap();

        let results = client
            .get_multi(vec![b"a".to_vec(), b"missing".to_vec(), b"b".to_vec()], timeout)
            .await
            .unwrap();

        assert!(results[0].found);
        assert_eq!(results[0].value, Some(b"1".to_vec()));
        assert!(!results[1].found);
        assert!(results[2].found);
        assert_eq!(results[2].value, Some(b"2".to_vec()));
    }

    #[tokio::test]
    #[ignore = "requires docker and a loopback memcached instance"]
    async fn test_increment_decrement() {
        let port = 21214;
        let _tester = MemcachedTester::new(port);
        let client = test_client(port);
        let timeout = Duration::from_secs(2);

        let first = client
            .increment(b"counter".to_vec(), 5, Some(60), Some(10), timeout)
            .await
            .unwrap();
        assert_eq!(first, Some(15));

        let after_decr = client
            .decrement(b"counter".to_vec(), 3, None, None, timeout)
            .await
            .unwrap();
        assert_eq!(after_decr, Some(12));
    }

    #[tokio::test]
    #[ignore = "requires docker and a loopback memcached instance"]
    async fn test_explicit_noop_round_trip() {
        let port = 21215;
        let _tester = MemcachedTester::new(port);
        let client = test_client(port);
        client.noop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires docker and a loopback memcached instance"]
    async fn test_pool_sweeper_fills_to_min() {
        let port = 21216;
        let _tester = MemcachedTester::new(port);
        let resolver = Arc::new(Static::new(vec![format!("127.0.0.1:{}", port)]));
        let config = ClientConfig::new(resolver).with_pool_config(PoolConfig {
            min_size: 2,
            ..PoolConfig::default()
        });
        let client = Client::new(config);
        let handle = spawn_pool_sweeper(client.clone(), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (_, pool) = client.all_pools().unwrap().into_iter().next().unwrap();
        assert!(pool.status().size >= 2);
        handle.abort();
    }
}
