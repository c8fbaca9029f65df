//! Virtual-server resolution (component D).
//!
//! The route table (`routing::matcher::RouteTable`) already encodes the
//! exact → wildcard → regex → default lookup order per domain (the
//! domain *is* the virtual server in this model). This module owns the
//! two things upstream of that lookup that the spec calls out
//! separately: validating the `Host` value before using it, and
//! deciding what happens when no virtual server binds (decline to the
//! table's own default-server fallback; there's no separate SNI-bound
//! default to fall back to further once the route table has failed).

use crate::engine::host::{validate_host, HostError};
use crate::routing::{CompiledRoute, RouteTable};
use arc_swap::Guard;
use std::sync::Arc;

/// Resolve a request against the currently loaded route table.
///
/// `raw_host` is the as-received `Host` header value (or request-line
/// authority for absolute-form requests); empty is allowed for HTTP/1.0
/// requests with no Host, in which case resolution falls straight to
/// the default server via `RouteTable::match_route`'s own `"_"` domain.
pub fn resolve<'a>(
    table: &'a Guard<Arc<RouteTable>>,
    raw_host: &str,
    uri: &str,
    method: &str,
    headers: &http::HeaderMap,
) -> Result<Option<Arc<CompiledRoute>>, HostError> {
    let host = if raw_host.is_empty() {
        String::new()
    } else {
        validate_host(raw_host)?.into_owned()
    };
    Ok(table.match_route(&host, uri, method, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainConfig, RouteConfig, WeightedCluster};
    use arc_swap::ArcSwap;

    fn table_with_host(host: &str) -> ArcSwap<RouteTable> {
        let domain = DomainConfig {
            name: "d".to_string(),
            hosts: vec![host.to_string()],
            routes: vec![RouteConfig {
                id: "r".to_string(),
                name: "r".to_string(),
                uri: "/*".to_string(),
                methods: vec![],
                headers: vec![],
                priority: 0,
                clusters: vec![WeightedCluster {
                    name: "c".to_string(),
                    weight: 100,
                }],
                rate_limit: None,
                cluster_override_header: None,
                request_header_transforms: vec![],
                response_header_transforms: vec![],
                max_body_bytes: None,
                enable_compression: false,
                limit_rate_bytes_per_sec: None,
                status: 1,
                plugins: None,
            }],
        };
        ArcSwap::from_pointee(RouteTable::new(&[domain], None))
    }

    #[test]
    fn rejects_invalid_host_before_lookup() {
        let table = table_with_host("example.com");
        let guard = table.load();
        let err = resolve(&guard, "exa\0mple.com", "/", "GET", &http::HeaderMap::new())
            .unwrap_err();
        assert_eq!(err, HostError::Invalid);
    }

    #[test]
    fn resolves_matching_host() {
        let table = table_with_host("example.com");
        let guard = table.load();
        let route = resolve(&guard, "example.com", "/foo", "GET", &http::HeaderMap::new())
            .unwrap();
        assert!(route.is_some());
    }
}
