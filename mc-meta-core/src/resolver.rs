//! Server-selection layer (spec §4.4): maps a key to exactly one server
//! address using Google's Jump Consistent Hash over a stable 64-bit key
//! hash, and enumerates the full address set for housekeeping (eager pool
//! fill, keep-alives).
//!
//! Replaces the teacher's `Ring`, which placed weighted buckets for each
//! server on a hash ring using `murmur3`. Jump hash needs no precomputed
//! bucket table — it is a pure function of the key's hash and the current
//! server count — so there is no ring to build or rebuild on resize.

use crate::error::Error;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// A stable 64-bit hash of a key's raw bytes. Fixed per process (spec §4.4)
/// so that routing stays consistent across calls; backed by `xxh64`
/// (pack precedent: `estuary-flow` depends on `xxhash-rust` for the same
/// non-cryptographic fast-hashing need).
pub fn hash64(key: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(key, 0)
}

/// Google's Jump Consistent Hash: deterministically maps `key` to a bucket
/// in `[0, num_buckets)` with minimal key movement under resize and O(ln
/// num_buckets) work. `num_buckets` of `0` is the caller's responsibility to
/// avoid; this function requires at least one bucket.
pub fn jump_hash(mut key: u64, num_buckets: u32) -> u32 {
    debug_assert!(num_buckets > 0);
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < num_buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b.wrapping_add(1)) as f64 * ((1i64 << 31) as f64 / ((key >> 33).wrapping_add(1)) as f64)) as i64;
    }
    b as u32
}

/// Maps keys to server addresses and enumerates the current address set.
/// Both [`Static`] and [`Dynamic`] implement this; the coordinator only
/// ever depends on the trait, so a user can swap in their own discovery
/// mechanism.
pub trait Resolver: Send + Sync {
    /// Resolve `key` to a server address. Returns [`Error::NoServers`] iff
    /// the address set is empty at resolution time (spec §4.4 failure
    /// semantics).
    fn address_for(&self, key: &[u8]) -> Result<String, Error>;

    /// A snapshot of every address currently known (used for eager pool
    /// fill and keep-alive probing).
    fn all(&self) -> Vec<String>;
}

fn route<'a>(key: &[u8], addrs: &'a [String]) -> Option<&'a String> {
    if addrs.is_empty() {
        return None;
    }
    let bucket = jump_hash(hash64(key), addrs.len() as u32);
    addrs.get(bucket as usize)
}

/// A fixed server list supplied at construction. Routing never changes
/// unless a new `Static` is built.
#[derive(Debug, Clone)]
pub struct Static {
    addrs: Arc<Vec<String>>,
}

impl Static {
    pub fn new(addrs: Vec<String>) -> Self {
        Static {
            addrs: Arc::new(addrs),
        }
    }
}

impl Resolver for Static {
    fn address_for(&self, key: &[u8]) -> Result<String, Error> {
        route(key, &self.addrs)
            .cloned()
            .ok_or(Error::NoServers)
    }

    fn all(&self) -> Vec<String> {
        (*self.addrs).clone()
    }
}

/// A server list that can be atomically replaced, e.g. by a background
/// discovery task. An in-flight batch routes against the snapshot visible
/// when it started (spec §4.4): [`Dynamic::address_for`] takes one atomic
/// load per call, so a rotation never retargets work already dispatched.
#[derive(Debug)]
pub struct Dynamic {
    addrs: ArcSwap<Vec<String>>,
}

impl Dynamic {
    pub fn new(addrs: Vec<String>) -> Self {
        Dynamic {
            addrs: ArcSwap::from_pointee(addrs),
        }
    }

    /// Atomically replace the address set. At most
    /// `new.len() / max(new.len(), old.len())` of keys relocate in
    /// expectation (spec §4.4).
    pub fn rotate(&self, addrs: Vec<String>) {
        self.addrs.store(Arc::new(addrs));
    }
}

impl Resolver for Dynamic {
    fn address_for(&self, key: &[u8]) -> Result<String, Error> {
        let snapshot = self.addrs.load();
        route(key, &snapshot).cloned().ok_or(Error::NoServers)
    }

    fn all(&self) -> Vec<String> {
        (**self.addrs.load()).clone()
    }
}
