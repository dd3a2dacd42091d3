//! A pure, side-effect-free boundary between [`Request`]/[`Response`]
//! values and the meta protocol's byte stream (spec §4.1).
//!
//! `encode` is fully synchronous: it appends bytes to a caller-owned buffer
//! and never touches I/O. `decode` is incremental rather than blocking on a
//! full line/body read itself, following the `BytesMut`-scanning technique
//! the pack's Shopify `async-memcached` parser uses (`Node::drive_receive`):
//! it is handed whatever bytes have arrived so far and returns `Ok(None)`
//! when it needs more, so the connection engine (§4.2) — not the codec —
//! owns the socket read loop.

use super::{CodecError, Flag, InvalidKeyReason, Request, Response, Status};

/// Protocol limit on stored value size (spec invariant I7).
pub const MAX_VALUE_SIZE: u64 = 1024 * 1024;

/// Validate a key against invariant I4. `base64` is true iff the request
/// carries the `b` flag, in which case whitespace is permitted (the key is
/// expected to be base64 text, which has its own disjoint charset from raw
/// control bytes).
pub fn validate_key(key: &[u8], base64: bool) -> Result<(), CodecError> {
    if key.is_empty() {
        return Err(CodecError::InvalidKey(InvalidKeyReason::TooShort));
    }
    if key.len() > 250 {
        return Err(CodecError::InvalidKey(InvalidKeyReason::TooLong));
    }
    if !base64 && key.iter().any(|&b| matches!(b, b' ' | b'\t' | b'\r' | b'\n')) {
        return Err(CodecError::InvalidKey(InvalidKeyReason::ContainsWhitespace));
    }
    Ok(())
}

/// Serialize `request` into `buf`, appending to whatever is already there.
/// No bytes are appended if key validation fails (spec property P3).
pub fn encode(buf: &mut Vec<u8>, request: &Request) -> Result<(), CodecError> {
    use super::Command;

    if request.command == Command::NoOp {
        buf.extend_from_slice(b"mn\r\n");
        return Ok(());
    }

    let base64 = request.flags.iter().any(|f| f.kind == b'b');
    validate_key(&request.key, base64)?;

    buf.extend_from_slice(request.command.wire_token());
    buf.push(b' ');
    buf.extend_from_slice(&request.key);

    if request.command == Command::Set {
        buf.push(b' ');
        buf.extend_from_slice(request.data.len().to_string().as_bytes());
    }

    for flag in &request.flags {
        buf.push(b' ');
        buf.push(flag.kind);
        buf.extend_from_slice(&flag.token);
    }

    buf.extend_from_slice(b"\r\n");

    if request.command == Command::Set {
        buf.extend_from_slice(&request.data);
        buf.extend_from_slice(b"\r\n");
    }

    Ok(())
}

fn parse_flags(tokens: &[&[u8]]) -> Result<Vec<Flag>, CodecError> {
    tokens
        .iter()
        .map(|tok| {
            if tok.is_empty() {
                return Err(CodecError::ParseError("empty flag token".into()));
            }
            Ok(Flag::new(tok[0], tok[1..].to_vec()))
        })
        .collect()
}

fn split_tokens(line: &[u8]) -> Vec<&[u8]> {
    line.split(|&b| b == b' ').filter(|t| !t.is_empty()).collect()
}

/// Find the end of the next `\n`-terminated line in `buf`, tolerating a
/// bare `\n` (no `\r`) as the spec's leniency clause allows. Returns
/// `(line_without_terminator, bytes_consumed_including_terminator)`.
fn next_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let nl = memchr::memchr(b'\n', buf)?;
    let line = if nl > 0 && buf[nl - 1] == b'\r' {
        &buf[..nl - 1]
    } else {
        &buf[..nl]
    };
    Some((line, nl + 1))
}

/// Attempt to parse one response from the front of `buf`.
///
/// Returns:
/// - `Ok(Some((n, response)))` — a complete response occupying the first
///   `n` bytes of `buf`.
/// - `Ok(None)` — not enough data yet; call again once more bytes arrive.
/// - `Err(_)` — the bytes present are not a valid response; the connection
///   must be closed (see [`CodecError::must_close`]).
pub fn decode(buf: &[u8]) -> Result<Option<(usize, Response)>, CodecError> {
    let (line, header_len) = match next_line(buf) {
        Some(v) => v,
        None => return Ok(None),
    };

    if line == b"ERROR" {
        return Ok(Some((header_len, Response::err(Status::GenericError, CodecError::GenericError))));
    }
    if let Some(rest) = line.strip_prefix(b"CLIENT_ERROR ") {
        let msg = String::from_utf8_lossy(rest).into_owned();
        return Ok(Some((
            header_len,
            Response::err(Status::ClientError, CodecError::ClientError(msg)),
        )));
    }
    if let Some(rest) = line.strip_prefix(b"SERVER_ERROR ") {
        let msg = String::from_utf8_lossy(rest).into_owned();
        return Ok(Some((
            header_len,
            Response::err(Status::ServerError, CodecError::ServerError(msg)),
        )));
    }

    let tokens = split_tokens(line);
    let status_tok = match tokens.first() {
        Some(t) => *t,
        None => {
            return Err(CodecError::ParseError("empty status line".into()));
        }
    };

    match status_tok {
        b"MN" => Ok(Some((header_len, Response::ok(Status::Mn, Vec::new(), Vec::new())))),
        b"VA" => {
            let size_tok = tokens.get(1).ok_or_else(|| {
                CodecError::ParseError("VA response missing size token".into())
            })?;
            let size: u64 = btoi::btoi(size_tok)
                .map_err(|_| CodecError::ParseError("VA size token not a number".into()))?;
            if size > MAX_VALUE_SIZE {
                return Err(CodecError::ParseError(format!(
                    "VA size {} exceeds protocol maximum {}",
                    size, MAX_VALUE_SIZE
                )));
            }
            let flags = parse_flags(&tokens[2..])?;

            let data_start = header_len;
            let size = size as usize;
            // Need `size` data bytes plus a line terminator (1 or 2 bytes).
            if buf.len() < data_start + size + 1 {
                return Ok(None);
            }
            let data = buf[data_start..data_start + size].to_vec();
            let after_data = &buf[data_start + size..];
            let total_after = if after_data[0] == b'\r' {
                if after_data.len() < 2 {
                    return Ok(None);
                }
                if after_data[1] != b'\n' {
                    return Err(CodecError::ParseError(
                        "VA data block missing trailing CRLF".into(),
                    ));
                }
                data_start + size + 2
            } else if after_data[0] == b'\n' {
                data_start + size + 1
            } else {
                return Err(CodecError::ParseError(
                    "VA data block missing trailing CRLF".into(),
                ));
            };
            Ok(Some((total_after, Response::ok(Status::Va, data, flags))))
        }
        b"HD" => Ok(Some((
            header_len,
            Response::ok(Status::Hd, Vec::new(), parse_flags(&tokens[1..])?),
        ))),
        b"EN" => Ok(Some((
            header_len,
            Response::ok(Status::En, Vec::new(), parse_flags(&tokens[1..])?),
        ))),
        b"NF" => Ok(Some((
            header_len,
            Response::ok(Status::Nf, Vec::new(), parse_flags(&tokens[1..])?),
        ))),
        b"NS" => Ok(Some((
            header_len,
            Response::ok(Status::Ns, Vec::new(), parse_flags(&tokens[1..])?),
        ))),
        b"EX" => Ok(Some((
            header_len,
            Response::ok(Status::Ex, Vec::new(), parse_flags(&tokens[1..])?),
        ))),
        b"ME" => {
            // "ME <key> <k1>=<v1> <k2>=<v2> ..." — everything after the key
            // token is preserved verbatim as Data, not flag-parsed. The key's
            // end is found by walking `line` itself rather than re-searching
            // for the key's bytes, since those bytes may recur earlier in
            // the line (e.g. a key of "E" would also match inside "ME").
            let after_status = line
                .iter()
                .position(|&b| b == b' ')
                .map(|i| &line[i + 1..])
                .unwrap_or(&[]);
            let rest = match after_status.iter().position(|&b| b == b' ') {
                Some(i) => &after_status[i + 1..],
                None => &[],
            };
            Ok(Some((header_len, Response::ok(Status::Me, rest.to_vec(), Vec::new()))))
        }
        other => Err(CodecError::ParseError(format!(
            "unrecognized status {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// One line of a legacy `stats` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsLine {
    Entry(String, String),
    End,
}

/// Incremental parser for the legacy `stats\r\n` command's response, which
/// does not follow the meta-protocol status-line framing at all: it is a
/// sequence of `STAT <name> <value>\r\n` lines terminated by `END\r\n`.
pub fn decode_stats(buf: &[u8]) -> Result<Option<(usize, StatsLine)>, CodecError> {
    let (line, consumed) = match next_line(buf) {
        Some(v) => v,
        None => return Ok(None),
    };
    if line == b"END" {
        return Ok(Some((consumed, StatsLine::End)));
    }
    if let Some(rest) = line.strip_prefix(b"STAT ") {
        let mut parts = rest.splitn(2, |&b| b == b' ');
        let name = parts.next().unwrap_or(&[]);
        let value = parts.next().unwrap_or(&[]);
        return Ok(Some((
            consumed,
            StatsLine::Entry(
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            ),
        )));
    }
    Err(CodecError::ParseError(format!(
        "unrecognized stats line {:?}",
        String::from_utf8_lossy(line)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    #[test]
    fn test_encode_noop() {
        let mut buf = Vec::new();
        encode(&mut buf, &Request::noop()).unwrap();
        assert_eq!(buf, b"mn\r\n");
    }

    #[test]
    fn test_encode_get_with_flags() {
        let mut buf = Vec::new();
        let req = Request::new(Command::Get, b"foo".to_vec())
            .with_flag(Flag::return_key())
            .with_flag(Flag::ttl(60));
        encode(&mut buf, &req).unwrap();
        assert_eq!(buf, b"mg foo kT60\r\n");
    }

    #[test]
    fn test_encode_get_requesting_cas() {
        let mut buf = Vec::new();
        let req = Request::new(Command::Get, b"foo".to_vec()).with_flag(Flag::return_cas());
        encode(&mut buf, &req).unwrap();
        assert_eq!(buf, b"mg foo c\r\n");
    }

    #[test]
    fn test_encode_set_zero_length_data() {
        let mut buf = Vec::new();
        let req = Request::new(Command::Set, b"foo".to_vec()).with_data(Vec::new());
        encode(&mut buf, &req).unwrap();
        assert_eq!(buf, b"ms foo 0\r\n\r\n");
    }

    #[test]
    fn test_encode_invalid_key_writes_nothing() {
        let mut buf = Vec::new();
        let req = Request::new(Command::Get, Vec::new());
        let err = encode(&mut buf, &req).unwrap_err();
        assert!(matches!(err, CodecError::InvalidKey(InvalidKeyReason::TooShort)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_needs_more_data() {
        assert_eq!(decode(b"HD").unwrap(), None);
        assert_eq!(decode(b"VA 5 f0\r\nhel").unwrap(), None);
    }

    #[test]
    fn test_decode_hd_with_flags() {
        let (n, resp) = decode(b"HD c123 k\r\nrest").unwrap().unwrap();
        assert_eq!(n, b"HD c123 k\r\n".len());
        assert_eq!(resp.status, Status::Hd);
        assert_eq!(resp.flag(b'c'), Some(&b"123"[..]));
        assert_eq!(resp.flag(b'k'), Some(&b""[..]));
    }

    #[test]
    fn test_decode_va() {
        let (n, resp) = decode(b"VA 5 f1\r\nhello\r\nnext").unwrap().unwrap();
        assert_eq!(n, b"VA 5 f1\r\nhello\r\n".len());
        assert_eq!(resp.status, Status::Va);
        assert_eq!(resp.data, b"hello");
        assert_eq!(resp.flag(b'f'), Some(&b"1"[..]));
    }

    #[test]
    fn test_decode_va_tolerates_bare_lf_trailer() {
        let (n, resp) = decode(b"VA 5\r\nhello\nnext").unwrap().unwrap();
        assert_eq!(n, b"VA 5\r\nhello\n".len());
        assert_eq!(resp.data, b"hello");
    }

    #[test]
    fn test_decode_mn() {
        let (n, resp) = decode(b"MN\r\n").unwrap().unwrap();
        assert_eq!(n, 4);
        assert_eq!(resp.status, Status::Mn);
    }

    #[test]
    fn test_decode_client_error_must_close() {
        let (_, resp) = decode(b"CLIENT_ERROR bad command line\r\n").unwrap().unwrap();
        assert!(resp.error.as_ref().unwrap().must_close());
    }

    #[test]
    fn test_decode_server_error_reusable() {
        let (_, resp) = decode(b"SERVER_ERROR out of memory\r\n").unwrap().unwrap();
        assert!(!resp.error.as_ref().unwrap().must_close());
    }

    #[test]
    fn test_decode_generic_error() {
        let (_, resp) = decode(b"ERROR\r\n").unwrap().unwrap();
        assert_eq!(resp.status, Status::GenericError);
    }

    #[test]
    fn test_decode_malformed_status() {
        let err = decode(b"XX foo\r\n").unwrap_err();
        assert!(matches!(err, CodecError::ParseError(_)));
    }

    #[test]
    fn test_decode_va_over_max_size_is_parse_error() {
        let line = format!("VA {}\r\n", super::MAX_VALUE_SIZE + 1);
        let err = decode(line.as_bytes()).unwrap_err();
        assert!(matches!(err, CodecError::ParseError(_)));
    }

    #[test]
    fn test_decode_me() {
        let (n, resp) = decode(b"ME foo exp=-1 la=10 cas=1\r\nrest").unwrap().unwrap();
        assert_eq!(n, b"ME foo exp=-1 la=10 cas=1\r\n".len());
        assert_eq!(resp.status, Status::Me);
        assert_eq!(resp.data, b"exp=-1 la=10 cas=1");
    }

    #[test]
    fn test_decode_me_key_recurs_in_status_prefix() {
        // The key "E" also occurs as the second letter of "ME" itself, so a
        // substring search for the key's bytes anywhere in the line would
        // find that spurious earlier occurrence instead of the real key
        // token.
        let (n, resp) = decode(b"ME E exp=-1 la=10 cas=1\r\n").unwrap().unwrap();
        assert_eq!(n, b"ME E exp=-1 la=10 cas=1\r\n".len());
        assert_eq!(resp.data, b"exp=-1 la=10 cas=1");
    }

    #[test]
    fn test_decode_me_key_only_no_trailing_data() {
        let (n, resp) = decode(b"ME foo\r\n").unwrap().unwrap();
        assert_eq!(n, b"ME foo\r\n".len());
        assert_eq!(resp.data, Vec::<u8>::new());
    }

    #[test]
    fn test_decode_stats() {
        let (n, line) = decode_stats(b"STAT pid 123\r\nrest").unwrap().unwrap();
        assert_eq!(n, b"STAT pid 123\r\n".len());
        assert_eq!(line, StatsLine::Entry("pid".into(), "123".into()));
        let (n, line) = decode_stats(b"END\r\n").unwrap().unwrap();
        assert_eq!(n, 5);
        assert_eq!(line, StatsLine::End);
    }
}
