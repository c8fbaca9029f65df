//! Resumable byte state machine for the request line and header lines
//! (component B).
//!
//! Each `parse_*` call takes the active buffer and a cursor; it returns
//! `Again` when the buffer doesn't yet contain a full line (the connection
//! driver then reads more bytes, growing the buffer via `engine::buffer` if
//! it's full) or the parsed result with every token already frozen into an
//! independent `bytes::Bytes` — see `engine::buffer` for why that replaces
//! pointer rebasing.

use bytes::{Bytes, BytesMut};
use memchr::{memchr, memchr2};

#[derive(Debug, Clone)]
pub enum Status<T> {
    Done(T),
    Again,
}

impl<T> Status<T> {
    pub fn is_again(&self) -> bool {
        matches!(self, Status::Again)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLineError {
    InvalidMethod,
    InvalidRequest,
    /// HTTP/0.9 request-line for a method other than GET.
    Invalid09Method,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLineError {
    InvalidHeader,
}

/// One successfully parsed request line, with every token already frozen.
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub request_line: Bytes,
    pub method: Bytes,
    pub uri: Bytes,
    pub http_major: u16,
    pub http_minor: u16,
    /// Absolute-form scheme, e.g. `http` in `http://host/path`.
    pub schema: Option<Bytes>,
    pub host: Option<Bytes>,
    pub port: Option<Bytes>,
    pub args: Option<Bytes>,
    pub complex_uri: bool,
    pub quoted_uri: bool,
    pub space_in_uri: bool,
}

/// One successfully parsed header line, with name/value already frozen.
/// `HeaderLine::End` signals the blank line terminating the header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderLine {
    Header {
        name: Bytes,
        lower_name: Bytes,
        value: Bytes,
        /// Incremental hash over `lower_name`, used by the known-header
        /// registry (`engine::request::KNOWN_HEADERS`) for O(1) dispatch.
        hash: u32,
    },
    End,
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

/// Header-name hash: FNV-1a over the lowercased bytes, matching the
/// incremental hash the known-header registry is built with.
pub fn header_hash(lower_name: &[u8]) -> u32 {
    let mut h: u32 = 0x811c9dc5;
    for &b in lower_name {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

/// Find the end of the next line (index just past the terminator), the raw
/// line span `[start, term_start)`, or `Again` if the buffer doesn't yet
/// contain one. Tolerates a bare LF per the wire contract.
fn next_line(buf: &[u8], start: usize) -> Option<(usize, usize)> {
    let rest = &buf[start..];
    match memchr(b'\n', rest) {
        None => None,
        Some(lf) => {
            let abs_lf = start + lf;
            let term_start = if abs_lf > start && buf[abs_lf - 1] == b'\r' {
                abs_lf - 1
            } else {
                abs_lf
            };
            Some((term_start, abs_lf + 1))
        }
    }
}

/// Parse one request line starting at `*pos` in `buf`. On success or
/// hard failure, advances `*pos` past the consumed line. On `Again`,
/// leaves `*pos` untouched so the same in-progress token can be copied
/// into a grown buffer by the caller.
pub fn parse_request_line(
    buf: &Bytes,
    pos: &mut usize,
) -> Result<Status<RequestLine>, RequestLineError> {
    let (term_start, next) = match next_line(buf, *pos) {
        Some(v) => v,
        None => return Ok(Status::Again),
    };
    let line = &buf[*pos..term_start];
    if line.is_empty() {
        // Leading blank lines before the request line are tolerated by
        // skipping them (some clients pad keep-alive connections with CRLF).
        *pos = next;
        return parse_request_line(buf, pos);
    }

    let sp1 = match memchr(b' ', line) {
        Some(i) => i,
        None => return Err(RequestLineError::InvalidRequest),
    };
    let method = &line[..sp1];
    if method.is_empty() || !method.iter().all(|&b| is_tchar(b)) {
        return Err(RequestLineError::InvalidMethod);
    }

    let after_method = &line[sp1 + 1..];
    let sp2 = memchr(b' ', after_method);
    let (target, proto) = match sp2 {
        Some(i) => (&after_method[..i], Some(&after_method[i + 1..])),
        None => (after_method, None),
    };
    if target.is_empty() {
        return Err(RequestLineError::InvalidRequest);
    }

    let (http_major, http_minor) = match proto {
        None => {
            if method != b"GET" {
                return Err(RequestLineError::Invalid09Method);
            }
            (0, 9)
        }
        Some(proto) => parse_http_version(proto)?,
    };

    let space_in_uri = memchr(b' ', target).is_some();
    let (schema, host, port, uri_and_query) = split_request_target(target)?;
    let (uri, args) = split_uri_query(uri_and_query);

    let complex_uri = uri.contains(&b'%') || uri.windows(2).any(|w| w == b"//") || uri.contains(&b'\0');
    let quoted_uri = uri.contains(&b'%');

    // `buf` is already a frozen snapshot (taken once per `recv`, not once
    // per line) — every token below is a cheap slice (refcount bump), not a
    // fresh allocation.
    let freeze = |s: &[u8]| -> Bytes {
        let start = offset_of(buf, s);
        buf.slice(start..start + s.len())
    };

    let result = RequestLine {
        request_line: freeze(line),
        method: freeze(method),
        uri: freeze(uri),
        http_major,
        http_minor,
        schema: schema.map(freeze),
        host: host.map(freeze),
        port: port.map(freeze),
        args: args.map(freeze),
        complex_uri,
        quoted_uri,
        space_in_uri,
    };
    *pos = next;
    Ok(Status::Done(result))
}

/// Byte offset of a subslice within `buf`'s current contents. The request
/// line and header lines are always subslices of `buf` itself (never a
/// copy) until the point they're frozen, so pointer arithmetic is safe.
fn offset_of(buf: &Bytes, sub: &[u8]) -> usize {
    let base = buf.as_ptr() as usize;
    let ptr = sub.as_ptr() as usize;
    ptr - base
}

fn parse_http_version(proto: &[u8]) -> Result<(u16, u16), RequestLineError> {
    let proto = proto.strip_prefix(b"HTTP/").ok_or(RequestLineError::InvalidRequest)?;
    let dot = memchr(b'.', proto).ok_or(RequestLineError::InvalidRequest)?;
    let major = parse_u16(&proto[..dot])?;
    let minor = parse_u16(&proto[dot + 1..])?;
    Ok((major, minor))
}

fn parse_u16(s: &[u8]) -> Result<u16, RequestLineError> {
    if s.is_empty() || !s.iter().all(|b| b.is_ascii_digit()) {
        return Err(RequestLineError::InvalidRequest);
    }
    std::str::from_utf8(s)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RequestLineError::InvalidRequest)
}

/// Splits an absolute-form target (`scheme://host[:port]path`) into its
/// parts; origin-form, asterisk-form, and authority-form pass through with
/// no schema/host/port.
fn split_request_target(
    target: &[u8],
) -> Result<(Option<&[u8]>, Option<&[u8]>, Option<&[u8]>, &[u8]), RequestLineError> {
    if target == b"*" || target[0] == b'/' {
        return Ok((None, None, None, target));
    }
    if let Some(scheme_end) = find_scheme_sep(target) {
        let schema = &target[..scheme_end];
        let rest = &target[scheme_end + 3..];
        let path_start = memchr(b'/', rest).unwrap_or(rest.len());
        let authority = &rest[..path_start];
        let path = if path_start == rest.len() {
            &rest[rest.len()..]
        } else {
            &rest[path_start..]
        };
        let (host, port) = split_authority(authority)?;
        let uri = if path.is_empty() { &b"/"[..] } else { path };
        return Ok((Some(schema), Some(host), port, uri));
    }
    // authority-form, e.g. CONNECT example.com:443 — treat the whole
    // target as host[:port] with an empty path.
    let (host, port) = split_authority(target)?;
    Ok((None, Some(host), port, &target[target.len()..]))
}

fn find_scheme_sep(target: &[u8]) -> Option<usize> {
    let sep = b"://";
    target
        .windows(3)
        .position(|w| w == sep)
        .filter(|&i| i > 0 && target[..i].iter().all(|&b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.'))
}

fn split_authority(authority: &[u8]) -> Result<(&[u8], Option<&[u8]>), RequestLineError> {
    if authority.is_empty() {
        return Err(RequestLineError::InvalidRequest);
    }
    if authority[0] == b'[' {
        // IPv6 literal: host runs through the matching `]`.
        let close = memchr(b']', authority).ok_or(RequestLineError::InvalidRequest)?;
        let host = &authority[..=close];
        let rest = &authority[close + 1..];
        if rest.is_empty() {
            return Ok((host, None));
        }
        let port = rest.strip_prefix(b":").ok_or(RequestLineError::InvalidRequest)?;
        return Ok((host, Some(port)));
    }
    match memchr(b':', authority) {
        Some(i) => Ok((&authority[..i], Some(&authority[i + 1..]))),
        None => Ok((authority, None)),
    }
}

fn split_uri_query(uri: &[u8]) -> (&[u8], Option<&[u8]>) {
    match memchr(b'?', uri) {
        Some(i) => (&uri[..i], Some(&uri[i + 1..])),
        None => (uri, None),
    }
}

/// Parse one header line (or the blank line terminating the header block)
/// starting at `*pos`. `allow_underscores` controls whether `_` is accepted
/// in header names (mirrors `underscores_in_headers`).
pub fn parse_header_line(
    buf: &BytesMut,
    pos: &mut usize,
    allow_underscores: bool,
) -> Result<Status<HeaderLine>, HeaderLineError> {
    let (term_start, next) = match next_line(buf, *pos) {
        Some(v) => v,
        None => return Ok(Status::Again),
    };
    let line = &buf[*pos..term_start];
    if line.is_empty() {
        *pos = next;
        return Ok(Status::Done(HeaderLine::End));
    }

    let colon = match memchr2(b':', b'\n', line) {
        Some(i) if line[i] == b':' => i,
        _ => return Err(HeaderLineError::InvalidHeader),
    };
    let raw_name = &line[..colon];
    if raw_name.is_empty() || raw_name.iter().any(|&b| b == b' ' || b == b'\t') {
        return Err(HeaderLineError::InvalidHeader);
    }
    for &b in raw_name {
        let ok = is_tchar(b) && (allow_underscores || b != b'_');
        if !ok {
            return Err(HeaderLineError::InvalidHeader);
        }
    }

    let mut value = &line[colon + 1..];
    while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
        value = &value[1..];
    }
    while value.last() == Some(&b' ') || value.last() == Some(&b'\t') {
        value = &value[..value.len() - 1];
    }

    let mut lower = raw_name.to_ascii_lowercase();
    let hash = header_hash(&lower);

    let name_start = offset_of(buf, raw_name);
    let value_start = offset_of(buf, value);
    let frozen = buf.clone().freeze();
    let name = frozen.slice(name_start..name_start + raw_name.len());
    let value_bytes = frozen.slice(value_start..value_start + value.len());
    let lower_name = Bytes::from(std::mem::take(&mut lower));

    *pos = next;
    Ok(Status::Done(HeaderLine::Header {
        name,
        lower_name,
        value: value_bytes,
        hash,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(s: &[u8]) -> BytesMut {
        BytesMut::from(s)
    }

    /// Request-line parsing freezes its input once per `recv` (see the
    /// module doc); tests mirror that by handing it an already-frozen
    /// `Bytes` rather than the mutable read buffer.
    fn line_buf(s: &[u8]) -> Bytes {
        Bytes::copy_from_slice(s)
    }

    #[test]
    fn minimal_get() {
        let b = line_buf(b"GET /a?b=1 HTTP/1.1\r\n");
        let mut pos = 0;
        let Status::Done(rl) = parse_request_line(&b, &mut pos).unwrap() else {
            panic!("expected Done");
        };
        assert_eq!(&rl.method[..], b"GET");
        assert_eq!(&rl.uri[..], b"/a");
        assert_eq!(rl.args.as_deref(), Some(&b"b=1"[..]));
        assert_eq!((rl.http_major, rl.http_minor), (1, 1));
        assert_eq!(pos, b.len());
    }

    #[test]
    fn incomplete_line_yields_again() {
        let b = line_buf(b"GET /a HTTP/1.1");
        let mut pos = 0;
        assert!(parse_request_line(&b, &mut pos).unwrap().is_again());
        assert_eq!(pos, 0);
    }

    #[test]
    fn http_09_get_has_no_protocol() {
        let b = line_buf(b"GET /\r\n");
        let mut pos = 0;
        let Status::Done(rl) = parse_request_line(&b, &mut pos).unwrap() else {
            panic!("expected Done");
        };
        assert_eq!((rl.http_major, rl.http_minor), (0, 9));
    }

    #[test]
    fn http_09_non_get_is_invalid() {
        let b = line_buf(b"POST /\r\n");
        let mut pos = 0;
        assert_eq!(
            parse_request_line(&b, &mut pos).unwrap_err(),
            RequestLineError::Invalid09Method
        );
    }

    #[test]
    fn absolute_form_splits_schema_host_port() {
        let b = line_buf(b"GET http://example.com:8080/a HTTP/1.1\r\n");
        let mut pos = 0;
        let Status::Done(rl) = parse_request_line(&b, &mut pos).unwrap() else {
            panic!("expected Done");
        };
        assert_eq!(rl.schema.as_deref(), Some(&b"http"[..]));
        assert_eq!(rl.host.as_deref(), Some(&b"example.com"[..]));
        assert_eq!(rl.port.as_deref(), Some(&b"8080"[..]));
        assert_eq!(&rl.uri[..], b"/a");
    }

    #[test]
    fn invalid_method_rejected() {
        let b = line_buf(b"G@T / HTTP/1.1\r\n");
        let mut pos = 0;
        assert_eq!(
            parse_request_line(&b, &mut pos).unwrap_err(),
            RequestLineError::InvalidMethod
        );
    }

    #[test]
    fn header_line_roundtrip() {
        let b = buf(b"Host: x.test\r\n");
        let mut pos = 0;
        let Status::Done(HeaderLine::Header {
            name, value, hash, ..
        }) = parse_header_line(&b, &mut pos, false).unwrap()
        else {
            panic!("expected header");
        };
        assert_eq!(&name[..], b"Host");
        assert_eq!(&value[..], b"x.test");
        assert_eq!(hash, header_hash(b"host"));
        assert_eq!(pos, b.len());
    }

    #[test]
    fn blank_line_signals_header_done() {
        let b = buf(b"\r\n");
        let mut pos = 0;
        assert!(matches!(
            parse_header_line(&b, &mut pos, false).unwrap(),
            Status::Done(HeaderLine::End)
        ));
    }

    #[test]
    fn underscore_header_name_gated_by_config() {
        let b = buf(b"X_Foo: 1\r\n");
        let mut pos = 0;
        assert!(parse_header_line(&b, &mut pos, false).is_err());
        let mut pos2 = 0;
        assert!(parse_header_line(&b, &mut pos2, true).is_ok());
    }

    #[test]
    fn splitting_across_reads_is_byte_identical_to_one_shot() {
        let whole = b"GET /a?b=1 HTTP/1.1\r\n".to_vec();
        let mut one_shot_pos = 0;
        let one_shot = line_buf(&whole);
        let Status::Done(a) = parse_request_line(&one_shot, &mut one_shot_pos).unwrap() else {
            panic!()
        };

        for split in 1..whole.len() {
            let mut growable = BytesMut::from(&whole[..split]);
            let mut pos = 0;
            if parse_request_line(&growable.clone().freeze(), &mut pos)
                .unwrap()
                .is_again()
            {
                growable.extend_from_slice(&whole[split..]);
                let Status::Done(b) =
                    parse_request_line(&growable.freeze(), &mut pos).unwrap()
                else {
                    panic!("split at {split} did not complete")
                };
                assert_eq!(a.method, b.method);
                assert_eq!(a.uri, b.uri);
                assert_eq!(a.args, b.args);
            }
        }
    }
}
