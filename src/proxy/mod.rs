pub mod context;
pub mod filter;
mod handler;

pub use context::{empty_body, full_body, BoxBody};

/// Phase helpers shared with `engine::dispatcher`, which drives them
/// directly off the hand-rolled HTTP/1.x engine's already-buffered body
/// instead of keeping a second copy of this pipeline.
pub(crate) use handler::{
    apply_header_transforms, apply_host_header, handle_request_with_body,
    inject_forwarded_headers, is_server_error, negotiate_encoding, phase_on_request,
    phase_on_response, phase_route_match, remove_hop_headers, select_healthy_node,
    select_weighted_cluster, try_compress_response, ClusterSelection,
};
