//! The meta protocol wire codec (spec §4.1): a pure boundary between
//! [`Request`]/[`Response`] values and the memcached meta-protocol byte
//! stream (`mg`/`ms`/`md`/`ma`/`me`/`mn`, plus legacy `stats`).

mod codec;
mod error;
mod types;

pub use codec::{decode, decode_stats, encode, validate_key, StatsLine, MAX_VALUE_SIZE};
pub use error::{CodecError, InvalidKeyReason};
pub use types::{Command, Flag, Request, Response, SetMode, Status};
