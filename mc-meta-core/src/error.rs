//! The crate-level error returned by [`crate::client::Client`] (spec §7):
//! unifies the per-layer errors (codec, connection, pool, routing) so a
//! caller only ever matches one type.

use crate::connection;
use std::fmt::{self, Display, Formatter};

/// Top-level failure of a client operation.
#[derive(Debug)]
pub enum Error {
    /// The routing layer has no server to send a key to (spec §4.4).
    NoServers,
    /// Acquiring a pooled connection failed (timed out, or the pool's
    /// manager could not create a replacement).
    Pool(deadpool::managed::PoolError<connection::Error>),
    /// The connection engine failed mid-batch; see [`connection::Error`]
    /// for whether the connection was closed as a result.
    Connection(connection::Error),
}

impl From<connection::Error> for Error {
    fn from(e: connection::Error) -> Self {
        Error::Connection(e)
    }
}

impl From<deadpool::managed::PoolError<connection::Error>> for Error {
    fn from(e: deadpool::managed::PoolError<connection::Error>) -> Self {
        Error::Pool(e)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoServers => write!(f, "no servers available to route this key to"),
            Error::Pool(e) => write!(f, "pool error: {}", e),
            Error::Connection(e) => write!(f, "connection error: {}", e),
        }
    }
}

impl std::error::Error for Error {}
