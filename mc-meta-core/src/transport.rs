//! The raw async I/O seam a concrete runtime (tokio, async-std, ...)
//! implements. Generalized from the teacher's `Connection` trait; renamed
//! to `Transport` here because spec §3 reserves "Connection" for the
//! higher-level entity in [`crate::connection`] that owns a transport plus
//! its buffers and pool-visible metadata.

use async_trait::async_trait;
use std::io;
use std::time::Instant;

/// A bare network socket, connected to exactly one server address. A
/// concrete runtime crate (e.g. `mc-meta-tokio`) implements this over its
/// own `TcpStream` type; this crate never touches a runtime directly.
///
/// `deadline`, when present, bounds how long the call may block; an
/// implementation should translate an elapsed deadline into an
/// `io::Error` of kind `TimedOut`. This is how the caller's context
/// deadline (spec §4.2/§5) reaches the socket without the runtime-agnostic
/// core crate depending on a specific async runtime's timer.
#[async_trait]
pub trait Transport: Sized + Send + Sync + 'static {
    /// Open a TCP connection to `addr` (host:port), bounded by `deadline`.
    async fn connect(addr: &str, deadline: Option<Instant>) -> io::Result<Self>;

    /// Read at least one byte into `buf`, growing it as needed, returning
    /// the number of bytes appended. `0` means the peer closed the socket.
    async fn read(&mut self, buf: &mut Vec<u8>, deadline: Option<Instant>) -> io::Result<usize>;

    /// Write `data` to the socket in full.
    async fn write_all(&mut self, data: &[u8], deadline: Option<Instant>) -> io::Result<()>;
}
