//! The per-connection pipelined request/response engine (spec §4.2): owns
//! one TCP socket, pipelines writes, and demultiplexes responses back into
//! the exact order their requests were written in (invariant I2).

use crate::protocol::{self, CodecError, Command, Request, Response, Status};
use crate::transport::Transport;
use bytes::BytesMut;
use std::io;
use std::time::Instant;

/// Error surfaced by the connection engine. Unifies transport I/O failures
/// with codec-level protocol failures so callers only match one type.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Codec(CodecError),
}

impl Error {
    /// Whether the connection that produced this error must be destroyed
    /// rather than returned to the pool (spec invariant I5).
    pub fn must_close(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Codec(e) => e.must_close(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Codec(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// The result of running a batch through [`Conn::execute`]: the responses
/// collected so far (in request order) and, on a failure partway through,
/// the error that stopped collection (spec §4.2: "partial failure returns
/// what was read plus the failing error").
pub struct ExecuteResult {
    pub responses: Vec<Response>,
    pub error: Option<Error>,
}

/// One TCP connection bound to a single server address, plus the buffers
/// and lifecycle metadata spec §3 assigns to a `Connection`. Owned
/// exclusively by whichever pool loan holds it; there is no internal
/// locking because nothing else can reach it while checked out.
pub struct Conn<T: Transport> {
    transport: T,
    addr: String,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
}

impl<T: Transport> Conn<T> {
    pub async fn connect(addr: &str, deadline: Option<Instant>) -> Result<Self, Error> {
        let transport = T::connect(addr, deadline).await?;
        let now = Instant::now();
        Ok(Conn {
            transport,
            addr: addr.to_string(),
            created_at: now,
            last_used: now,
            healthy: true,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: Vec::with_capacity(256),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Whether this connection survived its last use without a
    /// must-close error. Checked by the pool's `recycle` before returning
    /// it to the idle set (spec invariant I5).
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Read and parse exactly one response off the wire, growing
    /// `read_buf` as needed. This is the only place the engine talks to
    /// the transport on the read side.
    async fn read_one_response(&mut self, deadline: Option<Instant>) -> Result<Response, Error> {
        loop {
            if let Some((consumed, response)) = protocol::decode(&self.read_buf)? {
                let _ = self.read_buf.split_to(consumed);
                return Ok(response);
            }
            self.read_buf.reserve(4096);
            let mut chunk = vec![0u8; 4096];
            let n = self.transport.read(&mut chunk, deadline).await?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer mid-response",
                )));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Run a pipelined batch of requests on this connection (spec §4.2
    /// algorithm). Requests are written in order with a single flush; a
    /// synthetic no-op terminator is appended iff any request is quiet, so
    /// the server's reply stream can be bounded even when every response in
    /// the batch is suppressed.
    pub async fn execute(&mut self, requests: &[Request], deadline: Instant) -> ExecuteResult {
        let needs_sentinel = requests.iter().any(Request::is_quiet);

        self.write_buf.clear();
        for req in requests {
            if let Err(e) = protocol::encode(&mut self.write_buf, req) {
                // Nothing has been written to the socket yet, so only a
                // must-close-class error actually leaves the connection
                // unsafe to reuse (spec §7 kind 1: `InvalidKey` is a pure
                // precondition failure — "connection untouched").
                if e.must_close() {
                    self.healthy = false;
                }
                return ExecuteResult {
                    responses: Vec::new(),
                    error: Some(Error::Codec(e)),
                };
            }
        }
        if needs_sentinel {
            // unwrap: NoOp encoding cannot fail key validation.
            protocol::encode(&mut self.write_buf, &Request::noop()).unwrap();
        }

        if let Err(e) = self
            .transport
            .write_all(&self.write_buf, Some(deadline))
            .await
        {
            self.healthy = false;
            return ExecuteResult {
                responses: Vec::new(),
                error: Some(Error::Io(e)),
            };
        }

        let mut responses: Vec<Option<Response>> = (0..requests.len()).map(|_| None).collect();
        let mut next_unfilled = 0usize;
        let mut sentinel_consumed = !needs_sentinel;

        // Phase A: fill the original requests' slots in order.
        //
        // A non-quiet slot (including an explicit `NoOp`) always produces
        // exactly one response, so reading one and assigning it here is
        // unconditionally correct. A quiet slot may produce *no* response at
        // all (the server suppresses it), so a response that arrives while
        // the earliest unfilled slot is quiet cannot automatically be
        // attributed to that slot — it may belong to a later quiet slot in
        // the same run that happened to respond instead.
        //
        // `MN` is reserved for the `mn` command, so wherever it appears it
        // unambiguously answers either a still-pending explicit `NoOp` or
        // (once no explicit `NoOp` remains ahead) our own appended sentinel.
        while next_unfilled < requests.len() {
            if !requests[next_unfilled].is_quiet() {
                let resp = match self.read_one_response(Some(deadline)).await {
                    Ok(r) => r,
                    Err(e) => {
                        self.healthy = false;
                        return ExecuteResult {
                            responses: responses.into_iter().flatten().collect(),
                            error: Some(e),
                        };
                    }
                };
                if resp.status == Status::Mn && requests[next_unfilled].command != Command::NoOp {
                    self.healthy = false;
                    return ExecuteResult {
                        responses: responses.into_iter().flatten().collect(),
                        error: Some(Error::Codec(CodecError::ParseError(
                            "unexpected MN before a non-quiet request's own response".into(),
                        ))),
                    };
                }
                if let Some(e) = resp.error.as_ref().filter(|e| e.must_close()) {
                    self.healthy = false;
                    let err = Error::Codec(e.clone());
                    responses[next_unfilled] = Some(resp);
                    return ExecuteResult {
                        responses: responses.into_iter().flatten().collect(),
                        error: Some(err),
                    };
                }
                responses[next_unfilled] = Some(resp);
                next_unfilled += 1;
                continue;
            }

            // `requests[next_unfilled]` is quiet. Find the run of
            // consecutive quiet, unfilled requests starting here, bounded
            // either by the next non-quiet request or by the end of the
            // batch (in which case only our appended sentinel's `MN`
            // follows).
            let run_start = next_unfilled;
            let run_end = requests[run_start..]
                .iter()
                .position(|r| !r.is_quiet())
                .map(|off| run_start + off)
                .unwrap_or(requests.len());

            if run_end < requests.len() {
                // Bounded by a real, non-`MN`-shaped anchor. Only a single
                // pending quiet slot ahead of it is safely attributable
                // without a correlating `k` (return-key) flag: a wider run
                // here would require guessing which slot actually answered,
                // which is exactly the silent-corruption bug this replaces.
                if run_end - run_start != 1 {
                    self.healthy = false;
                    return ExecuteResult {
                        responses: responses.into_iter().flatten().collect(),
                        error: Some(Error::Codec(CodecError::ParseError(
                            "cannot attribute a response among multiple pending quiet \
                             requests ahead of a non-quiet request without a return-key \
                             (k) flag on each"
                                .into(),
                        ))),
                    };
                }
                let resp = match self.read_one_response(Some(deadline)).await {
                    Ok(r) => r,
                    Err(e) => {
                        self.healthy = false;
                        return ExecuteResult {
                            responses: responses.into_iter().flatten().collect(),
                            error: Some(e),
                        };
                    }
                };
                if resp.status == Status::Mn {
                    // The lone quiet slot was suppressed; this MN can only
                    // be the anchor's own response if the anchor is itself
                    // an explicit `NoOp` — anything else would mean `MN`
                    // arrived ahead of a guaranteed, not-yet-sent response,
                    // which is a protocol violation.
                    if requests[run_end].command == Command::NoOp {
                        responses[run_start] = Some(Response::ok(Status::Hd, Vec::new(), Vec::new()));
                        responses[run_end] = Some(resp);
                        next_unfilled = run_end + 1;
                        continue;
                    }
                    self.healthy = false;
                    return ExecuteResult {
                        responses: responses.into_iter().flatten().collect(),
                        error: Some(Error::Codec(CodecError::ParseError(
                            "unexpected MN while a non-quiet request's response was still pending".into(),
                        ))),
                    };
                }
                if let Some(e) = resp.error.as_ref().filter(|e| e.must_close()) {
                    self.healthy = false;
                    let err = Error::Codec(e.clone());
                    responses[run_start] = Some(resp);
                    return ExecuteResult {
                        responses: responses.into_iter().flatten().collect(),
                        error: Some(err),
                    };
                }
                responses[run_start] = Some(resp);
                next_unfilled = run_start + 1;
                continue;
            }

            // The run reaches the end of the batch, so it's bounded only by
            // the appended sentinel's `MN` — unambiguous, since no explicit
            // `NoOp` can remain past `run_end == requests.len()`. Buffer
            // every real response until it arrives, then reconcile the
            // count against the run.
            let mut hits: Vec<Response> = Vec::new();
            loop {
                let resp = match self.read_one_response(Some(deadline)).await {
                    Ok(r) => r,
                    Err(e) => {
                        self.healthy = false;
                        return ExecuteResult {
                            responses: responses.into_iter().flatten().collect(),
                            error: Some(e),
                        };
                    }
                };
                if resp.status == Status::Mn {
                    sentinel_consumed = true;
                    break;
                }
                if let Some(e) = resp.error.as_ref().filter(|e| e.must_close()) {
                    self.healthy = false;
                    let err = Error::Codec(e.clone());
                    return ExecuteResult {
                        responses: responses.into_iter().flatten().collect(),
                        error: Some(err),
                    };
                }
                hits.push(resp);
            }

            let run_len = run_end - run_start;
            if hits.is_empty() {
                // Every quiet slot in the run was suppressed.
                for slot in responses.iter_mut().take(run_end).skip(run_start) {
                    *slot = Some(Response::ok(Status::Hd, Vec::new(), Vec::new()));
                }
            } else if hits.len() == run_len {
                // No suppression occurred at all: wire order maps directly
                // onto request order.
                for (offset, resp) in hits.into_iter().enumerate() {
                    responses[run_start + offset] = Some(resp);
                }
            } else {
                // Some slots answered and some were suppressed, and which
                // ones cannot be told apart by position alone. Use each
                // response's echoed key (the `k` flag) to attribute it;
                // fail instead of guessing if that information is missing.
                let mut filled = vec![false; run_len];
                let mut unresolved = Vec::new();
                for resp in hits {
                    let matched = resp.flag(b'k').and_then(|key| {
                        (0..run_len).find(|&i| !filled[i] && requests[run_start + i].key.as_slice() == key)
                    });
                    match matched {
                        Some(i) => {
                            filled[i] = true;
                            responses[run_start + i] = Some(resp);
                        }
                        None => unresolved.push(resp),
                    }
                }
                let open_slots: Vec<usize> = (0..run_len).filter(|&i| !filled[i]).collect();
                if unresolved.len() == 1 && open_slots.len() == 1 {
                    // Exactly one unattributed response and exactly one
                    // open slot: there is nowhere else it could belong.
                    let idx = open_slots[0];
                    filled[idx] = true;
                    responses[run_start + idx] = Some(unresolved.pop().unwrap());
                } else if !unresolved.is_empty() {
                    self.healthy = false;
                    return ExecuteResult {
                        responses: responses.into_iter().flatten().collect(),
                        error: Some(Error::Codec(CodecError::ParseError(
                            "cannot attribute a response among multiple pending quiet \
                             requests without a return-key (k) flag"
                                .into(),
                        ))),
                    };
                }
                for (i, filled) in filled.into_iter().enumerate() {
                    if !filled {
                        responses[run_start + i] = Some(Response::ok(Status::Hd, Vec::new(), Vec::new()));
                    }
                }
            }

            next_unfilled = run_end;
        }

        // Phase B: consume the appended sentinel itself, if we haven't
        // already (every original slot was filled without hitting it).
        if !sentinel_consumed {
            match self.read_one_response(Some(deadline)).await {
                Ok(resp) if resp.status == Status::Mn => {}
                Ok(_) => {
                    self.healthy = false;
                    return ExecuteResult {
                        responses: responses.into_iter().flatten().collect(),
                        error: Some(Error::Codec(CodecError::ParseError(
                            "expected MN terminator, got something else".into(),
                        ))),
                    };
                }
                Err(e) => {
                    self.healthy = false;
                    return ExecuteResult {
                        responses: responses.into_iter().flatten().collect(),
                        error: Some(e),
                    };
                }
            }
        }

        self.last_used = Instant::now();
        ExecuteResult {
            responses: responses.into_iter().flatten().collect(),
            error: None,
        }
    }

    /// A cheap round trip used for pool health checks (spec §4.3).
    pub async fn noop(&mut self, deadline: Instant) -> Result<(), Error> {
        let result = self.execute(&[Request::noop()], deadline).await;
        if let Some(e) = result.error {
            return Err(e);
        }
        Ok(())
    }

    /// Run the legacy `stats\r\n` command, which does not follow the
    /// meta-protocol status-line framing (spec §3: `Stats` command). Not
    /// pipelined with anything else, since its response has no bounded
    /// shape the engine's normal demultiplexer understands.
    pub async fn stats(&mut self, deadline: Instant) -> Result<Vec<(String, String)>, Error> {
        match self.stats_inner(deadline).await {
            Ok(out) => {
                self.last_used = Instant::now();
                Ok(out)
            }
            Err(e) => {
                if e.must_close() {
                    self.healthy = false;
                }
                Err(e)
            }
        }
    }

    async fn stats_inner(&mut self, deadline: Instant) -> Result<Vec<(String, String)>, Error> {
        self.write_buf.clear();
        self.write_buf.extend_from_slice(b"stats\r\n");
        self.transport
            .write_all(&self.write_buf, Some(deadline))
            .await?;

        let mut out = Vec::new();
        loop {
            let line = loop {
                if let Some((consumed, line)) = protocol::decode_stats(&self.read_buf)? {
                    let _ = self.read_buf.split_to(consumed);
                    break line;
                }
                self.read_buf.reserve(4096);
                let mut chunk = vec![0u8; 4096];
                let n = self.transport.read(&mut chunk, Some(deadline)).await?;
                if n == 0 {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer mid-stats",
                    )));
                }
                self.read_buf.extend_from_slice(&chunk[..n]);
            };
            match line {
                protocol::StatsLine::Entry(k, v) => out.push((k, v)),
                protocol::StatsLine::End => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Flag, SetMode};
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Replays whatever bytes are passed as the connect address as the
    /// server's full reply stream. Writes are discarded, since encoding is
    /// covered by the codec's own tests — these tests exercise the
    /// read-side demultiplexing in [`Conn::execute`].
    struct ScriptedTransport {
        reply: VecDeque<u8>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(addr: &str, _deadline: Option<Instant>) -> io::Result<Self> {
            Ok(ScriptedTransport {
                reply: addr.bytes().collect(),
            })
        }

        async fn read(&mut self, buf: &mut Vec<u8>, _deadline: Option<Instant>) -> io::Result<usize> {
            let n = self.reply.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.reply.pop_front().unwrap();
            }
            Ok(n)
        }

        async fn write_all(&mut self, _data: &[u8], _deadline: Option<Instant>) -> io::Result<()> {
            Ok(())
        }
    }

    async fn scripted(reply: &str) -> Conn<ScriptedTransport> {
        Conn::connect(reply, None).await.unwrap()
    }

    #[test]
    fn test_execute_single_request_round_trip() {
        tokio_test::block_on(async {
            let mut conn = scripted("HD\r\n").await;
            let requests = vec![Request::new(Command::Get, b"k".to_vec())];
            let result = conn.execute(&requests, Instant::now()).await;
            assert!(result.error.is_none());
            assert_eq!(result.responses.len(), 1);
            assert_eq!(result.responses[0].status, Status::Hd);
            assert!(conn.is_healthy());
        });
    }

    #[test]
    fn test_execute_quiet_batch_fills_suppressed_slots_at_sentinel() {
        tokio_test::block_on(async {
            let mut conn = scripted("HD\r\nMN\r\n").await;
            let requests = vec![
                Request::new(Command::Get, b"a".to_vec()),
                Request::new(Command::Get, b"b".to_vec()).with_flag(Flag::quiet()),
            ];
            let result = conn.execute(&requests, Instant::now()).await;
            assert!(result.error.is_none());
            assert_eq!(result.responses.len(), 2);
            assert_eq!(result.responses[0].status, Status::Hd);
            // The quiet slot never got its own wire bytes; the engine fills
            // it synthetically once the sentinel arrives.
            assert_eq!(result.responses[1].status, Status::Hd);
        });
    }

    #[test]
    fn test_execute_quiet_request_followed_by_explicit_noop() {
        tokio_test::block_on(async {
            // server suppresses the quiet `mg`'s response, answers the
            // explicit `mn` with its own MN, then our appended sentinel
            // gets a second MN.
            let mut conn = scripted("MN\r\nMN\r\n").await;
            let requests = vec![
                Request::new(Command::Get, b"a".to_vec()).with_flag(Flag::quiet()),
                Request::noop(),
            ];
            let result = conn.execute(&requests, Instant::now()).await;
            assert!(result.error.is_none());
            assert_eq!(result.responses.len(), 2);
            assert_eq!(result.responses[0].status, Status::Hd);
            assert_eq!(result.responses[1].status, Status::Mn);
        });
    }

    #[test]
    fn test_execute_quiet_run_all_hits_preserves_order() {
        tokio_test::block_on(async {
            // Three quiet gets, all hits: no suppression at all, so the
            // three VA responses map straight onto their requests in order.
            let mut conn = scripted(
                "VA 1 ka\r\na\r\nVA 1 kb\r\nb\r\nVA 1 kc\r\nc\r\nMN\r\n",
            )
            .await;
            let requests = vec![
                Request::new(Command::Get, b"a".to_vec())
                    .with_flag(Flag::quiet())
                    .with_flag(Flag::return_key()),
                Request::new(Command::Get, b"b".to_vec())
                    .with_flag(Flag::quiet())
                    .with_flag(Flag::return_key()),
                Request::new(Command::Get, b"c".to_vec())
                    .with_flag(Flag::quiet())
                    .with_flag(Flag::return_key()),
            ];
            let result = conn.execute(&requests, Instant::now()).await;
            assert!(result.error.is_none());
            assert_eq!(result.responses.len(), 3);
            assert_eq!(result.responses[0].data, b"a");
            assert_eq!(result.responses[1].data, b"b");
            assert_eq!(result.responses[2].data, b"c");
            assert!(conn.is_healthy());
        });
    }

    #[test]
    fn test_execute_quiet_run_partial_hits_without_key_flag_errors() {
        tokio_test::block_on(async {
            // [Get(a,q), Get(b,q), Get(c,q), Get(d,q)] with only b and c
            // hitting: with no return-key flag to attribute the two VA
            // responses to a slot, the engine must refuse to guess rather
            // than silently misassign them.
            let mut conn = scripted("VA 1\r\nb\r\nVA 1\r\nc\r\nMN\r\n").await;
            let requests = vec![
                Request::new(Command::Get, b"a".to_vec()).with_flag(Flag::quiet()),
                Request::new(Command::Get, b"b".to_vec()).with_flag(Flag::quiet()),
                Request::new(Command::Get, b"c".to_vec()).with_flag(Flag::quiet()),
                Request::new(Command::Get, b"d".to_vec()).with_flag(Flag::quiet()),
            ];
            let result = conn.execute(&requests, Instant::now()).await;
            assert!(result.error.is_some());
            assert!(!conn.is_healthy());
        });
    }

    #[test]
    fn test_execute_quiet_run_partial_hits_resolved_via_return_key() {
        tokio_test::block_on(async {
            // Same shape as above, but each request carries a return-key
            // flag, so the two VA responses can be attributed to the right
            // slots by their echoed key instead of by position.
            let mut conn =
                scripted("VA 1 kb\r\nb\r\nVA 1 kc\r\nc\r\nMN\r\n").await;
            let requests = vec![
                Request::new(Command::Get, b"a".to_vec())
                    .with_flag(Flag::quiet())
                    .with_flag(Flag::return_key()),
                Request::new(Command::Get, b"b".to_vec())
                    .with_flag(Flag::quiet())
                    .with_flag(Flag::return_key()),
                Request::new(Command::Get, b"c".to_vec())
                    .with_flag(Flag::quiet())
                    .with_flag(Flag::return_key()),
                Request::new(Command::Get, b"d".to_vec())
                    .with_flag(Flag::quiet())
                    .with_flag(Flag::return_key()),
            ];
            let result = conn.execute(&requests, Instant::now()).await;
            assert!(result.error.is_none());
            assert_eq!(result.responses.len(), 4);
            assert_eq!(result.responses[0].status, Status::Hd);
            assert_eq!(result.responses[1].status, Status::Va);
            assert_eq!(result.responses[1].data, b"b");
            assert_eq!(result.responses[2].status, Status::Va);
            assert_eq!(result.responses[2].data, b"c");
            assert_eq!(result.responses[3].status, Status::Hd);
            assert!(conn.is_healthy());
        });
    }

    #[test]
    fn test_execute_must_close_error_marks_connection_unhealthy() {
        tokio_test::block_on(async {
            let mut conn = scripted("CLIENT_ERROR bad command line\r\n").await;
            let requests = vec![Request::new(
                Command::Set,
                b"k".to_vec(),
            )
            .with_data(b"v".to_vec())
            .with_flag(Flag::set_mode(SetMode::Set))];
            let result = conn.execute(&requests, Instant::now()).await;
            assert!(result.error.is_some());
            assert!(!conn.is_healthy());
        });
    }

    #[test]
    fn test_execute_peer_close_mid_response_marks_connection_unhealthy() {
        tokio_test::block_on(async {
            let mut conn = scripted("").await;
            let requests = vec![Request::new(Command::Get, b"k".to_vec())];
            let result = conn.execute(&requests, Instant::now()).await;
            assert!(result.error.is_some());
            assert!(!conn.is_healthy());
        });
    }
}
