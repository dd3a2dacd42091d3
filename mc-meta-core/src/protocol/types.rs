//! The canonical `Request`/`Response`/`Flag` triple (spec §3). Every other
//! representation the wire codec deals with funnels through these three
//! types; nothing downstream of [`crate::protocol::codec`] ever needs to
//! know that the wire format is line-oriented ASCII.

use super::CodecError;

/// A single meta-protocol flag letter plus its (possibly empty) token.
/// Flags are opaque to the codec: it serializes and parses them without
/// interpreting most of them (spec §9 forbids baking opaque-matching or
/// other flag semantics into the engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub kind: u8,
    pub token: Vec<u8>,
}

impl Flag {
    pub fn new(kind: u8, token: impl Into<Vec<u8>>) -> Self {
        Flag {
            kind,
            token: token.into(),
        }
    }

    /// A flag letter with no token, e.g. `q` (quiet) or `k` (return key).
    pub fn bare(kind: u8) -> Self {
        Flag {
            kind,
            token: Vec::new(),
        }
    }

    /// `T<seconds>` — relative TTL in seconds.
    pub fn ttl(seconds: u32) -> Self {
        Flag::new(b'T', seconds.to_string().into_bytes())
    }

    /// `F<flags>` — opaque 32-bit client flags stored alongside the value.
    pub fn client_flags(flags: u32) -> Self {
        Flag::new(b'F', flags.to_string().into_bytes())
    }

    /// `C<cas>` — compare-and-swap token.
    pub fn cas(cas: u64) -> Self {
        Flag::new(b'C', cas.to_string().into_bytes())
    }

    /// `q` — ask the server to suppress the success response.
    pub fn quiet() -> Self {
        Flag::bare(b'q')
    }

    /// `b` — the key is base64-encoded.
    pub fn base64() -> Self {
        Flag::bare(b'b')
    }

    /// `k` — echo the key back on the response.
    pub fn return_key() -> Self {
        Flag::bare(b'k')
    }

    /// `c` — ask the server to return the item's CAS token in the response.
    pub fn return_cas() -> Self {
        Flag::bare(b'c')
    }

    /// `O<token>` — opaque token, copied back verbatim. Never interpreted
    /// by the connection engine (spec §9): response reordering relies
    /// solely on pipelined ordering (invariant I2), not on this token.
    pub fn opaque(token: impl Into<Vec<u8>>) -> Self {
        Flag::new(b'O', token)
    }

    /// `M<mode>` — set-mode flag distinguishing set/add/replace/append/prepend
    /// on an `ms` command.
    pub fn set_mode(mode: SetMode) -> Self {
        Flag::new(b'M', vec![mode.wire_byte()])
    }

    /// `N<seconds>` — auto-vivify TTL for an `ma` command on a missing key.
    pub fn vivify_ttl(seconds: u32) -> Self {
        Flag::new(b'N', seconds.to_string().into_bytes())
    }

    /// `J<value>` — initial value to vivify to, for an `ma` command.
    pub fn initial_value(value: u64) -> Self {
        Flag::new(b'J', value.to_string().into_bytes())
    }

    /// `D<delta>` — magnitude of an increment/decrement.
    pub fn delta(delta: u64) -> Self {
        Flag::new(b'D', delta.to_string().into_bytes())
    }

    /// `MA<mode>` — arithmetic mode flag (`I`/`incr` or `D`/`decr`).
    pub fn arithmetic_mode(incr: bool) -> Self {
        Flag::new(b'M', vec![if incr { b'I' } else { b'D' }])
    }

    /// `v` — return the item's new numeric value after an `ma` command.
    pub fn return_value() -> Self {
        Flag::bare(b'v')
    }
}

/// The `M` mode token used on an `ms` (Set) command to select
/// set/add/replace/append/prepend semantics, all of which share one wire
/// command in the meta protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl SetMode {
    fn wire_byte(self) -> u8 {
        match self {
            SetMode::Set => b'S',
            SetMode::Add => b'E',
            SetMode::Replace => b'R',
            SetMode::Append => b'A',
            SetMode::Prepend => b'P',
        }
    }
}

/// One of the operations the meta protocol supports (spec §3). `Set`
/// carries add/replace/append/prepend semantics via an `M` flag rather than
/// as distinct variants, mirroring the protocol's single `ms` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Get,
    Set,
    Delete,
    Arithmetic,
    Debug,
    NoOp,
    Stats,
}

impl Command {
    /// The two-letter (or `stats`) wire token for this command.
    pub(crate) fn wire_token(self) -> &'static [u8] {
        match self {
            Command::Get => b"mg",
            Command::Set => b"ms",
            Command::Delete => b"md",
            Command::Arithmetic => b"ma",
            Command::Debug => b"me",
            Command::NoOp => b"mn",
            Command::Stats => b"stats",
        }
    }
}

/// A request to send to the server. Value-like and immutable once built;
/// `encode` borrows it rather than consuming it, so the same `Request` can
/// be retried by the caller at a higher layer (the engine itself never
/// retries — spec §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub flags: Vec<Flag>,
}

impl Request {
    pub fn new(command: Command, key: impl Into<Vec<u8>>) -> Self {
        Request {
            command,
            key: key.into(),
            data: Vec::new(),
            flags: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn with_flags(mut self, flags: impl IntoIterator<Item = Flag>) -> Self {
        self.flags.extend(flags);
        self
    }

    /// Whether this request carries the quiet (`q`) flag, i.e. the server
    /// will suppress its success response (spec §4.2 step 1/5).
    pub fn is_quiet(&self) -> bool {
        self.flags.iter().any(|f| f.kind == b'q')
    }

    pub fn noop() -> Self {
        Request::new(Command::NoOp, Vec::new())
    }
}

/// Status line of a meta-protocol response, widened (per spec §3) to
/// include the synthetic statuses produced by protocol-level errors. The
/// detail behind an error status lives in [`Response::error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Success, header only.
    Hd,
    /// Success, value follows.
    Va,
    /// Success (used by `me` debug).
    En,
    /// Item not found.
    Nf,
    /// Item not stored.
    Ns,
    /// CAS mismatch.
    Ex,
    /// No-op terminator.
    Mn,
    /// Error detail from an `me` command, preserved verbatim as data.
    Me,
    ClientError,
    ServerError,
    GenericError,
    ParseError,
}

/// A parsed response from the server (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    /// Populated iff `status` is `Va` or `Me`.
    pub data: Vec<u8>,
    /// Flags as received, in wire order (invariant I3).
    pub flags: Vec<Flag>,
    /// Populated iff `status` is one of the error variants.
    pub error: Option<CodecError>,
}

impl Response {
    pub(crate) fn ok(status: Status, data: Vec<u8>, flags: Vec<Flag>) -> Self {
        Response {
            status,
            data,
            flags,
            error: None,
        }
    }

    pub(crate) fn err(status: Status, error: CodecError) -> Self {
        Response {
            status,
            data: Vec::new(),
            flags: Vec::new(),
            error: Some(error),
        }
    }

    /// Find the token of the first flag of the given kind, if present.
    pub fn flag(&self, kind: u8) -> Option<&[u8]> {
        self.flags
            .iter()
            .find(|f| f.kind == kind)
            .map(|f| f.token.as_slice())
    }
}
