//! Bridges the hand-rolled connection engine into the phase pipeline
//! (component G).
//!
//! `proxy::handler::handle_request_with_body` is already generic over the
//! request body type (`BoxBody`) specifically so this module doesn't need
//! its own copy of route-match/filter/upstream/response logic — it only
//! has to adapt `engine::request::Request` into an `http::Request<BoxBody>`.

use std::net::SocketAddr;

use bytes::Bytes;
use http::Request as HttpRequest;

use crate::engine::request::Request as EngineRequest;
use crate::proxy::{self, full_body, BoxBody};
use crate::server::GatewayState;

#[derive(Debug)]
pub enum DispatchError {
    InvalidMethod,
    InvalidUri,
    /// The phase pipeline itself only errors on body-stream faults, which
    /// can't happen here since the body is fully buffered already — kept
    /// for signature symmetry with `hyper::Error` and to surface it if the
    /// pipeline's contract ever changes.
    Upstream(hyper::Error),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::InvalidMethod => write!(f, "invalid request method"),
            DispatchError::InvalidUri => write!(f, "invalid request target"),
            DispatchError::Upstream(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Run `req` (with its already-read-off-the-wire `body`) through the
/// shared route-match → filter → upstream → response-filter → log
/// pipeline and return the response to hand to `engine::writer`.
pub async fn dispatch(
    req: &EngineRequest,
    body: Bytes,
    state: &GatewayState,
    peer_addr: SocketAddr,
) -> Result<http::Response<BoxBody>, DispatchError> {
    let http_req = build_http_request(req, body)?;
    proxy::handle_request_with_body(http_req, state.clone(), peer_addr)
        .await
        .map_err(DispatchError::Upstream)
}

fn build_http_request(
    req: &EngineRequest,
    body: Bytes,
) -> Result<HttpRequest<BoxBody>, DispatchError> {
    let method = req.method().map_err(|_| DispatchError::InvalidMethod)?;
    let uri = req.uri().map_err(|_| DispatchError::InvalidUri)?;

    let built = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .version(req.version())
        .body(full_body(body))
        .expect("method/uri/version already validated above");

    // `Request::builder()` starts with its own empty `HeaderMap`; swap in
    // the one the engine already merged duplicates into rather than
    // replaying `ordered_headers` through the builder one at a time.
    let (mut parts, body) = built.into_parts();
    parts.headers = req.headers.clone();
    Ok(HttpRequest::from_parts(parts, body))
}
