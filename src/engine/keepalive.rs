//! Keep-alive decision (component J, half of it).
//!
//! Pure function: given the just-finished request's `Connection` handling
//! and the listener's tuning, decide whether the connection driver loops
//! back to `wait_request` or tears the connection down. The buffer-reclaim
//! side of component J lives in `engine::buffer::BufferPool::reclaim`,
//! already called by the connection driver between requests.

use crate::config::types::ListenerConfig;
use crate::engine::request::{ConnectionType, Request};
use http::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    KeepAlive,
    Close,
}

/// `requests_served` counts this request (the caller increments before or
/// after calling — pass the post-increment count so `keepalive_requests ==
/// 1` closes after exactly one request).
pub fn decide(req: &Request, listener: &ListenerConfig, requests_served: u64) -> NextAction {
    if req.connection_type == ConnectionType::Close {
        return NextAction::Close;
    }

    let default_keepalive = match req.version() {
        Version::HTTP_11 => true,
        Version::HTTP_10 => req.connection_type == ConnectionType::KeepAlive,
        _ => false,
    };
    if !default_keepalive {
        return NextAction::Close;
    }

    if listener.keepalive_requests != 0 && requests_served >= listener.keepalive_requests {
        return NextAction::Close;
    }

    // `keep_alive_n` is populated from a `Keep-Alive: timeout=N` header if
    // the request carried one; `-1` means "not specified" (§4.6).
    if req.keep_alive_n == 0 {
        return NextAction::Close;
    }

    NextAction::KeepAlive
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::parser::{header_hash, RequestLine};
    use bytes::Bytes;

    fn listener() -> ListenerConfig {
        ListenerConfig::default()
    }

    fn request(major: u8, minor: u8) -> Request {
        let rl = RequestLine {
            request_line: Bytes::from_static(b"GET / HTTP/1.1"),
            method: Bytes::from_static(b"GET"),
            uri: Bytes::from_static(b"/"),
            http_major: major,
            http_minor: minor,
            schema: None,
            host: None,
            port: None,
            args: None,
            complex_uri: false,
            quoted_uri: false,
            space_in_uri: false,
        };
        Request::new_main(rl).0
    }

    #[test]
    fn http11_defaults_to_keepalive() {
        let req = request(1, 1);
        assert_eq!(decide(&req, &listener(), 1), NextAction::KeepAlive);
    }

    #[test]
    fn http10_defaults_to_close_without_keepalive_token() {
        let req = request(1, 0);
        assert_eq!(decide(&req, &listener(), 1), NextAction::Close);
    }

    #[test]
    fn http10_with_keepalive_token_stays_open() {
        let mut req = request(1, 0);
        req.ingest_header(
            Bytes::from_static(b"Connection"),
            Bytes::from_static(b"connection"),
            Bytes::from_static(b"keep-alive"),
            header_hash(b"connection"),
        )
        .unwrap();
        assert_eq!(decide(&req, &listener(), 1), NextAction::KeepAlive);
    }

    #[test]
    fn explicit_connection_close_always_wins() {
        let mut req = request(1, 1);
        req.ingest_header(
            Bytes::from_static(b"Connection"),
            Bytes::from_static(b"connection"),
            Bytes::from_static(b"close"),
            header_hash(b"connection"),
        )
        .unwrap();
        assert_eq!(decide(&req, &listener(), 1), NextAction::Close);
    }

    #[test]
    fn request_budget_exhausted_closes() {
        let req = request(1, 1);
        let mut cfg = listener();
        cfg.keepalive_requests = 5;
        assert_eq!(decide(&req, &cfg, 5), NextAction::Close);
        assert_eq!(decide(&req, &cfg, 4), NextAction::KeepAlive);
    }

    #[test]
    fn zero_request_budget_means_unlimited() {
        let req = request(1, 1);
        let mut cfg = listener();
        cfg.keepalive_requests = 0;
        assert_eq!(decide(&req, &cfg, 1_000_000), NextAction::KeepAlive);
    }
}
