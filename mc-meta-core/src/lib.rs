//! This crate provides the runtime-agnostic core of an async memcached
//! meta-protocol client: the wire codec, the pipelined per-connection
//! engine, the connection pool, the server-selection layer, and the
//! top-level coordinator. A concrete runtime crate (e.g. `mc-meta-tokio`)
//! supplies the [`transport::Transport`] implementation this crate drives.

pub mod client;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod resolver;
pub mod transport;

pub use client::{Client, ClientConfig, DeleteResult, GetResult, StoreResult};
pub use connection::Conn;
pub use error::Error;
pub use pool::{Pool, PoolConfig, PoolStats};
pub use protocol::{Command, Flag, Request, Response, SetMode, Status};
pub use resolver::{Dynamic, Resolver, Static};
pub use transport::Transport;
