//! The per-request object (component E).
//!
//! Byte-range fields live as frozen `bytes::Bytes` slices rather than
//! buffer offsets (see `engine::buffer`); everything else — the
//! well-known header slots, state enum, flags, and the `main`/`parent`
//! subrequest links — follows the data model directly.

use crate::engine::handle::{Handle, RefCount};
use crate::engine::parser::{header_hash, RequestLine};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

/// Failure ingesting one header line into a `Request` (§4.3's known-header
/// registry). The connection driver maps each of these to 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderIngestError {
    InvalidName,
    InvalidValue,
    /// A second `Content-Length` disagreeing with the first.
    DuplicateContentLength,
    InvalidContentLength,
    /// Both `Transfer-Encoding: chunked` and `Content-Length` present —
    /// request smuggling bait, rejected outright rather than picking one.
    ConflictingTransferEncodingAndContentLength,
}

/// Observable request lifecycle state (§4.7). The connection driver
/// dispatches on this; transitions are explicit, not swapped handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    ReadingRequest,
    ParsingHeaders,
    Processing,
    Writing,
    Done,
}

/// Boolean flags carried on a request, matching the data model's list
/// (trimmed to the ones this engine actually branches on; the rest of
/// the spec's flag set — `buffered`, `filter_finalize`, `header_only` —
/// falls out of `RequestState`/`body` directly and needs no separate bit).
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestFlags {
    pub discard_body: bool,
    pub postponed: bool,
    pub blocked: bool,
    pub done: bool,
    pub logged: bool,
    pub keepalive: bool,
    pub lingering_close: bool,
    pub pipeline: bool,
}

/// Connection-type as scanned off the `Connection` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    Unspecified,
    KeepAlive,
    Close,
}

/// Browser flags detected from `User-Agent` (§4.3), consulted downstream
/// by filters that need quirks-mode behavior for a given client family.
/// Checks are mutually exclusive in the same order nginx's own detection
/// runs: Opera before MSIE (Opera's UA string also contains "MSIE" on
/// some versions), Chrome/Konqueror before Safari (both also contain
/// "Safari" in their UA string), and anything left over with "Gecko"
/// falls to plain Gecko.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrowserFlags {
    pub msie: bool,
    pub opera: bool,
    pub gecko: bool,
    pub chrome: bool,
    pub safari: bool,
    pub konqueror: bool,
}

impl BrowserFlags {
    fn detect(value: &[u8]) -> Self {
        let ua = String::from_utf8_lossy(value);
        let opera = ua.contains("Opera");
        let msie = !opera && ua.contains("MSIE");
        let chrome = ua.contains("Chrome");
        let konqueror = ua.contains("Konqueror");
        let safari = !chrome && !konqueror && ua.contains("Safari");
        let gecko = !opera && !msie && !chrome && !konqueror && !safari && ua.contains("Gecko");
        Self {
            msie,
            opera,
            gecko,
            chrome,
            safari,
            konqueror,
        }
    }
}

/// How the known-header registry dispatches one entry once looked up.
/// `Unique`/`Multi` name the two plain storage shapes from §4.3; the rest
/// are the "semantic work" handlers the section calls out by name.
#[derive(Debug, Clone, Copy)]
enum HeaderSlot {
    Host,
    Connection,
    ContentLength,
    TransferEncoding,
    KeepAlive,
    UserAgent,
    /// Appended to a list rather than a single slot (`Cookie`,
    /// `X-Forwarded-For`) — both already land in `ordered_headers` and in
    /// `headers` via `HeaderMap::append`, so this variant only exists so
    /// the registry can name them; no extra dispatch work is needed.
    Multi,
}

struct KnownHeader {
    lower_name: &'static str,
    slot: HeaderSlot,
}

/// The `(name, slot, handler)` table from §4.3, built once and hashed by
/// the same FNV-1a `engine::parser::header_hash` the line parser already
/// computes per header — the table is keyed by that hash so a lookup is
/// one `HashMap` probe rather than a chain of `HeaderName` comparisons.
/// `lower_name` is re-checked on a hit to rule out a hash collision.
fn known_headers() -> &'static HashMap<u32, KnownHeader> {
    static TABLE: OnceLock<HashMap<u32, KnownHeader>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let entries: &[(&str, HeaderSlot)] = &[
            ("host", HeaderSlot::Host),
            ("connection", HeaderSlot::Connection),
            ("content-length", HeaderSlot::ContentLength),
            ("transfer-encoding", HeaderSlot::TransferEncoding),
            ("keep-alive", HeaderSlot::KeepAlive),
            ("user-agent", HeaderSlot::UserAgent),
            ("cookie", HeaderSlot::Multi),
            ("x-forwarded-for", HeaderSlot::Multi),
        ];
        entries
            .iter()
            .map(|&(lower_name, slot)| (header_hash(lower_name.as_bytes()), KnownHeader { lower_name, slot }))
            .collect()
    })
}

/// A single parsed request. The `main` request owns the refcount; a
/// subrequest holds a clone of the `RefCount` plus a link back to its
/// `main` and `parent`.
pub struct Request {
    pub request_line: RequestLine,
    pub headers: HeaderMap,
    /// Raw header lines in arrival order, pre-`HeaderMap`-merge — needed
    /// for `multi` slots (`Cookie`, `X-Forwarded-For`) and for faithfully
    /// replaying header order to the upstream.
    pub ordered_headers: Vec<(Bytes, Bytes)>,
    pub content_length_n: i64,
    pub keep_alive_n: i64,
    pub connection_type: ConnectionType,
    pub state: RequestState,
    pub flags: RequestFlags,
    /// Resolved once the Host header (or SNI) binds a virtual server.
    pub bound_host: Option<String>,
    /// Refcount token for this request's tree. Always present; for a
    /// subrequest it is a clone of `main`'s, acquired through
    /// `RefCount::acquire`.
    refcount: RefCount,
    /// This request's own holder of the tree — dropped on finalize.
    pub handle: Option<Handle>,
    /// `None` for a main request; `Some(main)` for a subrequest.
    pub main: Option<Arc<RequestMeta>>,
    /// Set once a `Transfer-Encoding: chunked` header is seen. Mutually
    /// exclusive with a `Content-Length` — see `ingest_header`.
    pub chunked: bool,
    /// Browser family detected off `User-Agent`, if any was sent.
    pub browser: BrowserFlags,
}

/// Stable identity of the main request, cheap to share with
/// subrequests without cloning the (possibly large) `Request` itself.
pub struct RequestMeta {
    pub method: Method,
    pub uri: http::Uri,
    pub version: Version,
}

impl Request {
    /// Construct the main request for a connection, per §4.6: `count = 1`,
    /// `method = UNKNOWN` (represented here as `Method::OPTIONS` placeholder
    /// until the request line parses — callers should not read `method`
    /// before `request_line` is `Complete`), `content_length_n =
    /// keep_alive_n = -1`, `state = ReadingRequest`.
    pub fn new_main(request_line: RequestLine) -> (Self, Handle) {
        let (refcount, handle) = RefCount::new();
        let req = Self {
            request_line,
            headers: HeaderMap::new(),
            ordered_headers: Vec::new(),
            content_length_n: -1,
            keep_alive_n: -1,
            connection_type: ConnectionType::Unspecified,
            state: RequestState::ReadingRequest,
            flags: RequestFlags::default(),
            bound_host: None,
            refcount,
            handle: None,
            main: None,
            chunked: false,
            browser: BrowserFlags::default(),
        };
        (req, handle)
    }

    /// The request-line method, decoded once the line has parsed.
    pub fn method(&self) -> Result<Method, http::method::InvalidMethod> {
        Method::from_bytes(&self.request_line.method)
    }

    /// The request-line target as an `http::Uri`, query string included.
    /// Origin-form targets (the common case) parse directly; absolute-form
    /// targets carry their own authority and parse the same way.
    pub fn uri(&self) -> Result<Uri, http::uri::InvalidUri> {
        Uri::try_from(&self.target()[..])
    }

    /// Path (+ query, if any) exactly as the client sent it. `parser`
    /// splits the query string off into `args` so header/route matching
    /// can work on the bare path; this re-joins them for anything that
    /// needs the literal request target (building the upstream `Uri`).
    pub fn target(&self) -> Bytes {
        match &self.request_line.args {
            Some(args) => {
                let mut buf = Vec::with_capacity(self.request_line.uri.len() + 1 + args.len());
                buf.extend_from_slice(&self.request_line.uri);
                buf.push(b'?');
                buf.extend_from_slice(args);
                Bytes::from(buf)
            }
            None => self.request_line.uri.clone(),
        }
    }

    pub fn version(&self) -> Version {
        match (self.request_line.http_major, self.request_line.http_minor) {
            (1, 1) => Version::HTTP_11,
            (1, 0) => Version::HTTP_10,
            (0, 9) => Version::HTTP_09,
            (2, _) => Version::HTTP_2,
            _ => Version::HTTP_11,
        }
    }

    /// Ingest one parsed header line (§4.3): looks `hash` up in the
    /// known-header registry (built once, keyed by the same FNV-1a
    /// `engine::parser::header_hash` the line parser already computed for
    /// this header) and dispatches to whichever slot it names, then
    /// records the header in arrival order for `multi` slots and upstream
    /// replay and merges it into `headers`.
    pub fn ingest_header(
        &mut self,
        name: Bytes,
        lower_name: Bytes,
        value: Bytes,
        hash: u32,
    ) -> Result<(), HeaderIngestError> {
        let header_name =
            HeaderName::from_bytes(&lower_name).map_err(|_| HeaderIngestError::InvalidName)?;
        let header_value = HeaderValue::from_maybe_shared(value.clone())
            .map_err(|_| HeaderIngestError::InvalidValue)?;

        let known = known_headers()
            .get(&hash)
            .filter(|k| k.lower_name.as_bytes() == &lower_name[..]);

        if let Some(known) = known {
            match known.slot {
                HeaderSlot::Host => {
                    if let Ok(s) = std::str::from_utf8(&value) {
                        if self.bound_host.is_none() {
                            self.bound_host = Some(s.to_string());
                        }
                    }
                }
                HeaderSlot::Connection => {
                    if let Ok(s) = std::str::from_utf8(&value) {
                        for token in s.split(',') {
                            let token = token.trim();
                            if token.eq_ignore_ascii_case("close") {
                                self.connection_type = ConnectionType::Close;
                            } else if token.eq_ignore_ascii_case("keep-alive")
                                && self.connection_type != ConnectionType::Close
                            {
                                self.connection_type = ConnectionType::KeepAlive;
                            }
                        }
                    }
                }
                HeaderSlot::ContentLength => {
                    let s = std::str::from_utf8(&value)
                        .map_err(|_| HeaderIngestError::InvalidContentLength)?
                        .trim();
                    let n: i64 = s
                        .parse()
                        .map_err(|_| HeaderIngestError::InvalidContentLength)?;
                    if n < 0 {
                        return Err(HeaderIngestError::InvalidContentLength);
                    }
                    if self.content_length_n != -1 && self.content_length_n != n {
                        return Err(HeaderIngestError::DuplicateContentLength);
                    }
                    if self.chunked {
                        return Err(HeaderIngestError::ConflictingTransferEncodingAndContentLength);
                    }
                    self.content_length_n = n;
                }
                HeaderSlot::TransferEncoding => {
                    let is_chunked = value
                        .rsplit(|&b| b == b',')
                        .next()
                        .map(|tok| tok.trim_ascii().eq_ignore_ascii_case(b"chunked"))
                        .unwrap_or(false);
                    if is_chunked {
                        if self.content_length_n != -1 {
                            return Err(
                                HeaderIngestError::ConflictingTransferEncodingAndContentLength,
                            );
                        }
                        self.chunked = true;
                    }
                }
                HeaderSlot::KeepAlive => {
                    // `Keep-Alive: timeout=N` — client-advertised idle budget.
                    // Malformed/unknown tokens leave `keep_alive_n` at its -1
                    // "unspecified" default rather than erroring.
                    if let Ok(s) = std::str::from_utf8(&value) {
                        for tok in s.split(',') {
                            let tok = tok.trim();
                            if let Some(n) = tok.strip_prefix("timeout=") {
                                if let Ok(n) = n.trim().parse::<i64>() {
                                    self.keep_alive_n = n;
                                }
                            }
                        }
                    }
                }
                HeaderSlot::UserAgent => {
                    self.browser = BrowserFlags::detect(&value);
                }
                HeaderSlot::Multi => {}
            }
        }

        self.ordered_headers.push((name, value));
        self.headers.append(header_name, header_value);
        Ok(())
    }

    /// Acquire one more holder of this request's tree (body reader,
    /// upstream call, subrequest) — see §4.6 refcount rules.
    pub fn acquire(&self) -> Handle {
        self.refcount.acquire()
    }

    pub fn refcount(&self) -> usize {
        self.refcount.get()
    }

    pub fn is_subrequest(&self) -> bool {
        self.main.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::parser::RequestLine;
    use bytes::Bytes;

    /// Test-only convenience: computes the hash the line parser would have
    /// produced for `lower_name` so call sites don't have to repeat it.
    fn ingest(req: &mut Request, name: &'static [u8], lower_name: &'static [u8], value: &'static [u8]) -> Result<(), HeaderIngestError> {
        req.ingest_header(
            Bytes::from_static(name),
            Bytes::from_static(lower_name),
            Bytes::from_static(value),
            header_hash(lower_name),
        )
    }

    fn sample_request_line() -> RequestLine {
        RequestLine {
            request_line: Bytes::from_static(b"GET / HTTP/1.1"),
            method: Bytes::from_static(b"GET"),
            uri: Bytes::from_static(b"/"),
            http_major: 1,
            http_minor: 1,
            schema: None,
            host: None,
            port: None,
            args: None,
            complex_uri: false,
            quoted_uri: false,
            space_in_uri: false,
        }
    }

    #[test]
    fn main_request_starts_with_refcount_one() {
        let (req, handle) = Request::new_main(sample_request_line());
        assert_eq!(req.refcount(), 1);
        assert_eq!(req.content_length_n, -1);
        assert_eq!(req.keep_alive_n, -1);
        assert_eq!(req.state, RequestState::ReadingRequest);
        drop(handle);
        assert_eq!(req.refcount(), 0);
    }

    #[test]
    fn acquiring_a_handle_bumps_refcount() {
        let (req, main_handle) = Request::new_main(sample_request_line());
        let sub = req.acquire();
        assert_eq!(req.refcount(), 2);
        sub.release();
        assert_eq!(req.refcount(), 1);
        main_handle.release();
        assert_eq!(req.refcount(), 0);
    }

    #[test]
    fn method_uri_version_decode_from_request_line() {
        let (req, _h) = Request::new_main(sample_request_line());
        assert_eq!(req.method().unwrap(), Method::GET);
        assert_eq!(req.uri().unwrap().path(), "/");
        assert_eq!(req.version(), Version::HTTP_11);
    }

    #[test]
    fn uri_rejoins_query_string_split_off_by_the_parser() {
        let mut rl = sample_request_line();
        rl.uri = Bytes::from_static(b"/search");
        rl.args = Some(Bytes::from_static(b"q=rust&page=2"));
        let (req, _h) = Request::new_main(rl);
        assert_eq!(req.target().as_ref(), b"/search?q=rust&page=2");
        assert_eq!(req.uri().unwrap().path_and_query().unwrap(), "/search?q=rust&page=2");
    }

    #[test]
    fn host_header_sets_bound_host_once() {
        let (mut req, _h) = Request::new_main(sample_request_line());
        ingest(&mut req, b"Host", b"host", b"first.example").unwrap();
        ingest(&mut req, b"Host", b"host", b"second.example").unwrap();
        assert_eq!(req.bound_host.as_deref(), Some("first.example"));
    }

    #[test]
    fn connection_close_wins_over_keep_alive() {
        let (mut req, _h) = Request::new_main(sample_request_line());
        ingest(&mut req, b"Connection", b"connection", b"keep-alive").unwrap();
        ingest(&mut req, b"Connection", b"connection", b"close").unwrap();
        assert_eq!(req.connection_type, ConnectionType::Close);
    }

    #[test]
    fn content_length_parses_and_rejects_mismatch() {
        let (mut req, _h) = Request::new_main(sample_request_line());
        ingest(&mut req, b"Content-Length", b"content-length", b"42").unwrap();
        assert_eq!(req.content_length_n, 42);

        let err = ingest(&mut req, b"Content-Length", b"content-length", b"7").unwrap_err();
        assert_eq!(err, HeaderIngestError::DuplicateContentLength);
    }

    #[test]
    fn keep_alive_header_sets_timeout_budget() {
        let (mut req, _h) = Request::new_main(sample_request_line());
        assert_eq!(req.keep_alive_n, -1);
        ingest(&mut req, b"Keep-Alive", b"keep-alive", b"timeout=5, max=100").unwrap();
        assert_eq!(req.keep_alive_n, 5);
    }

    #[test]
    fn chunked_transfer_encoding_conflicts_with_content_length() {
        let (mut req, _h) = Request::new_main(sample_request_line());
        ingest(&mut req, b"Content-Length", b"content-length", b"10").unwrap();
        let err = ingest(&mut req, b"Transfer-Encoding", b"transfer-encoding", b"chunked")
            .unwrap_err();
        assert_eq!(
            err,
            HeaderIngestError::ConflictingTransferEncodingAndContentLength
        );
    }

    #[test]
    fn ordered_headers_preserve_arrival_order_for_repeats() {
        let (mut req, _h) = Request::new_main(sample_request_line());
        ingest(&mut req, b"Cookie", b"cookie", b"a=1").unwrap();
        ingest(&mut req, b"Cookie", b"cookie", b"b=2").unwrap();
        assert_eq!(req.ordered_headers.len(), 2);
        assert_eq!(req.headers.get_all("cookie").iter().count(), 2);
    }

    #[test]
    fn known_header_registry_dispatches_by_hash_not_name_chain() {
        // The table is keyed by `header_hash`, not by re-deriving a
        // `HeaderName` — a header whose hash collides with nothing in the
        // table (anything not in the §4.3 list) must pass through
        // untouched as a plain header rather than erroring.
        let (mut req, _h) = Request::new_main(sample_request_line());
        ingest(&mut req, b"X-Request-Id", b"x-request-id", b"abc123").unwrap();
        assert_eq!(req.headers.get("x-request-id").unwrap(), "abc123");
        assert_eq!(req.ordered_headers.len(), 1);
    }

    #[test]
    fn user_agent_detects_msie_and_not_gecko() {
        let (mut req, _h) = Request::new_main(sample_request_line());
        ingest(
            &mut req,
            b"User-Agent",
            b"user-agent",
            b"Mozilla/4.0 (compatible; MSIE 6.0; Windows NT 5.1)",
        )
        .unwrap();
        assert!(req.browser.msie);
        assert!(!req.browser.gecko);
        assert!(!req.browser.opera);
    }

    #[test]
    fn user_agent_detects_chrome_not_safari() {
        let (mut req, _h) = Request::new_main(sample_request_line());
        ingest(
            &mut req,
            b"User-Agent",
            b"user-agent",
            b"Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
        )
        .unwrap();
        assert!(req.browser.chrome);
        assert!(!req.browser.safari);
        assert!(!req.browser.gecko);
    }

    #[test]
    fn user_agent_detects_plain_gecko() {
        let (mut req, _h) = Request::new_main(sample_request_line());
        ingest(
            &mut req,
            b"User-Agent",
            b"user-agent",
            b"Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0",
        )
        .unwrap();
        assert!(req.browser.gecko);
        assert!(!req.browser.msie);
        assert!(!req.browser.chrome);
    }
}
