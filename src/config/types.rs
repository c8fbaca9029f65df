use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub consul: ConsulConfig,

    #[serde(default)]
    pub etcd: EtcdConfig,

    /// Self-registration to Consul so upstream gateways can discover us.
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Gateways register themselves in etcd and track peer count to split
    /// rate limits evenly across instances.
    #[serde(default)]
    pub instance_registry: InstanceRegistryConfig,

    /// Per-connection HTTP/1.x engine tuning (header buffers, timeouts,
    /// keep-alive, lingering close). See `engine::connection`.
    #[serde(default)]
    pub listener: ListenerConfig,
}

/// Tuning knobs for the hand-rolled per-connection HTTP/1.x engine
/// (`engine::connection::Connection`). Named and defaulted after the
/// directives enumerated in the request-engine contract this gateway
/// implements (`client_header_buffer_size`, `large_client_header_buffers`,
/// etc.) — mirrors a reverse proxy's `http { }` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Size of the primary per-connection header buffer, in bytes.
    pub client_header_buffer_size: usize,

    /// How many "large" header buffers a connection may grow into, and
    /// the size of each.
    pub large_client_header_buffers_num: usize,
    pub large_client_header_buffers_size: usize,

    /// Seconds to wait for the request line / headers to complete.
    pub client_header_timeout_secs: u64,

    /// Seconds to wait for each read while receiving the request body.
    pub client_body_timeout_secs: u64,

    /// Seconds a connection may sit idle between pipelined/keep-alive
    /// requests before being closed.
    pub keepalive_timeout_secs: u64,

    /// Max requests served on one keep-alive connection before forcing
    /// close. `0` means unlimited.
    pub keepalive_requests: u64,

    /// Seconds to wait for a single write to make progress.
    pub send_timeout_secs: u64,

    /// off: never linger. on: linger only when we believe the client has
    /// unsent body bytes. always: always linger after a non-2xx/inline
    /// finalize.
    pub lingering_close: String,

    /// Upper bound, in seconds, on total lingering-close drain time.
    pub lingering_time_secs: u64,

    /// Per-read timeout, in seconds, while lingering.
    pub lingering_timeout_secs: u64,

    pub tcp_nodelay: bool,
    pub tcp_nopush: bool,

    /// Reset (RST) rather than FIN-close a connection that timed out.
    pub reset_timedout_connection: bool,

    /// Collapse repeated `/` in the request-target during URI normalization.
    pub merge_slashes: bool,

    /// Accept header names containing `_` (off by default per RFC guidance).
    pub underscores_in_headers: bool,

    /// Silently drop malformed/duplicate headers instead of 400ing.
    pub ignore_invalid_headers: bool,

    /// Per-request arena size hint, in bytes (advisory — sizes the
    /// engine's initial per-request allocation).
    pub request_pool_size: usize,

    /// Request bodies larger than this are rejected with 413 before
    /// they are read off the wire. `0` means unlimited.
    pub client_max_body_size: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            client_header_buffer_size: 1024,
            large_client_header_buffers_num: 4,
            large_client_header_buffers_size: 8192,
            client_header_timeout_secs: 60,
            client_body_timeout_secs: 60,
            keepalive_timeout_secs: 75,
            keepalive_requests: 1000,
            send_timeout_secs: 60,
            lingering_close: "on".to_string(),
            lingering_time_secs: 30,
            lingering_timeout_secs: 5,
            tcp_nodelay: true,
            tcp_nopush: false,
            reset_timedout_connection: false,
            merge_slashes: true,
            underscores_in_headers: false,
            ignore_invalid_headers: true,
            request_pool_size: 4096,
            client_max_body_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    #[serde(default = "default_consul_addr")]
    pub address: String,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// How often to poll consul for service changes (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_addr(),
            datacenter: None,
            token: None,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_consul_addr() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,

    #[serde(default = "default_etcd_domain_prefix")]
    pub domain_prefix: String,

    #[serde(default = "default_etcd_cluster_prefix")]
    pub cluster_prefix: String,

    /// etcd key prefix for controller metadata (e.g. config_revision).
    #[serde(default)]
    pub meta_prefix: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
            domain_prefix: default_etcd_domain_prefix(),
            cluster_prefix: default_etcd_cluster_prefix(),
            meta_prefix: None,
            username: None,
            password: None,
        }
    }
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_etcd_domain_prefix() -> String {
    "/hermes/domains".to_string()
}

fn default_etcd_cluster_prefix() -> String {
    "/hermes/clusters".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,

    /// Host patterns. Supports exact (`api.example.com`),
    /// wildcard suffix (`*.example.com`), wildcard prefix (`api.*`).
    pub hosts: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

/// Routes reference `ClusterConfig` entries by name with weights,
/// enabling canary / blue-green / traffic-split at the routing layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// URI pattern. Supports exact match, prefix match (`/v1/api/*`), and `/*` for catch-all.
    pub uri: String,

    /// Allowed HTTP methods. Empty means all methods.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    /// Header matchers (AND semantics).
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub headers: Vec<HeaderMatcher>,

    /// Higher value = higher priority.
    #[serde(default)]
    pub priority: i32,

    /// Weighted cluster references for traffic distribution.
    pub clusters: Vec<WeightedCluster>,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// When set, the request header value overrides weighted cluster selection.
    #[serde(default)]
    pub cluster_override_header: Option<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub request_header_transforms: Vec<HeaderTransform>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub response_header_transforms: Vec<HeaderTransform>,

    /// Requests exceeding this limit are rejected with 413. `None` means no limit.
    #[serde(default)]
    pub max_body_bytes: Option<u64>,

    #[serde(default)]
    pub enable_compression: bool,

    /// Caps response write throughput for this route, in bytes/sec.
    /// `None` means unlimited. Enforced by `engine::writer`.
    #[serde(default)]
    pub limit_rate_bytes_per_sec: Option<u64>,

    /// 1 = enabled, 0 = disabled.
    #[serde(default = "default_status")]
    pub status: u8,

    #[serde(default)]
    pub plugins: Option<serde_json::Value>,
}

/// Supports exact (default), prefix, regex, and presence-only match.
/// Multiple matchers on a route use AND semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderMatcher {
    pub name: String,

    /// Ignored when `match_type` is "present".
    #[serde(default)]
    pub value: String,

    /// "exact" (default), "prefix", "regex", "present".
    #[serde(default = "default_header_match_type")]
    pub match_type: String,

    #[serde(default)]
    pub invert: bool,
}

fn default_header_match_type() -> String {
    "exact".to_string()
}

/// Operations: "set" (replace), "add" (append), "remove" (delete).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderTransform {
    pub name: String,

    #[serde(default)]
    pub value: String,

    /// "set" (default), "add", "remove".
    #[serde(default = "default_header_transform_action")]
    pub action: String,
}

fn default_header_transform_action() -> String {
    "set".to_string()
}

/// Weighted reference to a cluster for traffic splitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedCluster {
    pub name: String,

    #[serde(default = "default_cluster_weight")]
    pub weight: u32,
}

fn default_cluster_weight() -> u32 {
    100
}

fn default_status() -> u8 {
    1
}

/// Cluster (upstream) definition. Owns nodes, LB policy, timeouts,
/// health checks, circuit breakers, retries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,

    /// "roundrobin", "random", "least_request", "peak_ewma".
    #[serde(rename = "type", default = "default_upstream_type")]
    pub lb_type: String,

    #[serde(default)]
    pub timeout: TimeoutConfig,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// "pass" (use client host), "node" (use upstream host), "rewrite" + upstream_host.
    #[serde(default = "default_pass_host")]
    pub pass_host: String,

    #[serde(default)]
    pub upstream_host: Option<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub nodes: Vec<UpstreamNode>,

    #[serde(default)]
    pub discovery_type: Option<String>,

    #[serde(default)]
    pub service_name: Option<String>,

    #[serde(default)]
    pub discovery_args: Option<DiscoveryArgs>,

    #[serde(default)]
    pub keepalive_pool: KeepalivePoolConfig,

    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Default `false` — typical for internal services with self-signed certs.
    #[serde(default)]
    pub tls_verify: bool,
}

fn default_upstream_type() -> String {
    "roundrobin".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_pass_host() -> String {
    "pass".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout")]
    pub connect: f64,

    #[serde(default = "default_timeout")]
    pub send: f64,

    #[serde(default = "default_timeout")]
    pub read: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_timeout(),
            send: default_timeout(),
            read: default_timeout(),
        }
    }
}

fn default_timeout() -> f64 {
    6.0
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpstreamNode {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Consecutive failures (within `fail_timeout`) before the peer is
    /// quarantined by the smooth-weighted balancer. 0 disables quarantine.
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    /// Window, and subsequent quarantine duration, for `max_fails`.
    #[serde(default = "default_fail_timeout_secs")]
    pub fail_timeout_secs: u64,
    /// Only selected once every primary peer has been tried and failed.
    #[serde(default)]
    pub backup: bool,
    /// Administratively disabled; never selected, primary or backup.
    #[serde(default)]
    pub down: bool,
}

fn default_weight() -> u32 {
    100
}

fn default_max_fails() -> u32 {
    1
}

fn default_fail_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryArgs {
    #[serde(default)]
    pub metadata_match: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepalivePoolConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default = "default_requests")]
    pub requests: u64,

    #[serde(default = "default_pool_size")]
    pub size: usize,
}

impl Default for KeepalivePoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            requests: default_requests(),
            size: default_pool_size(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_requests() -> u64 {
    1000
}

fn default_pool_size() -> usize {
    320
}

/// Per-core token bucket to avoid cross-core contention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// "req" (request rate) or "count" (fixed window count).
    #[serde(default = "default_limit_mode")]
    pub mode: String,

    #[serde(default)]
    pub rate: Option<f64>,

    #[serde(default)]
    pub burst: Option<u64>,

    #[serde(default)]
    pub count: Option<u64>,

    #[serde(default)]
    pub time_window: Option<u64>,

    /// "remote_addr", "host_uri", "uri".
    #[serde(default = "default_limit_key")]
    pub key: String,

    #[serde(default = "default_rejected_code")]
    pub rejected_code: u16,
}

fn default_limit_mode() -> String {
    "req".to_string()
}

fn default_limit_key() -> String {
    "host_uri".to_string()
}

fn default_rejected_code() -> u16 {
    429
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub active: Option<ActiveHealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHealthCheck {
    #[serde(default = "default_hc_interval")]
    pub interval: u64,

    #[serde(default = "default_hc_path")]
    pub path: String,

    /// Override port for probes (when health endpoint runs on a separate port).
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_healthy_statuses")]
    pub healthy_statuses: Vec<u16>,

    #[serde(default = "default_hc_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_hc_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_hc_timeout")]
    pub timeout: u64,

    /// Prevents probe storms when a cluster has thousands of instances.
    #[serde(default = "default_hc_concurrency")]
    pub concurrency: usize,
}

fn default_hc_interval() -> u64 {
    10
}

fn default_hc_path() -> String {
    "/health".to_string()
}

fn default_healthy_statuses() -> Vec<u16> {
    vec![200]
}

fn default_hc_threshold() -> u32 {
    3
}

fn default_hc_timeout() -> u64 {
    3
}

fn default_hc_concurrency() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_registration_service_name")]
    pub service_name: String,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_deregister_after_secs")]
    pub deregister_after_secs: u64,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: default_registration_service_name(),
            ttl_secs: default_ttl_secs(),
            deregister_after_secs: default_deregister_after_secs(),
            metadata: HashMap::new(),
        }
    }
}

fn default_registration_service_name() -> String {
    "hermes-gateway".to_string()
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_deregister_after_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_count")]
    pub count: u32,

    #[serde(default = "default_retry_statuses")]
    pub retry_on_statuses: Vec<u16>,

    #[serde(default = "default_true")]
    pub retry_on_connect_failure: bool,

    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
}

fn default_retry_count() -> u32 {
    2
}

fn default_retry_statuses() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_true() -> bool {
    true
}

/// State machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cb_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_cb_open_duration")]
    pub open_duration_secs: u64,
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_open_duration() -> u64 {
    30
}

/// Each gateway registers under a shared etcd prefix with a lease.
/// All instances watch this prefix to know total peer count, then divide
/// rate/count limits evenly for decentralized distributed rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRegistryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_instance_prefix")]
    pub prefix: String,

    /// Lease TTL in seconds. Auto-expires if keepalive stops.
    #[serde(default = "default_instance_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl Default for InstanceRegistryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: default_instance_prefix(),
            lease_ttl_secs: default_instance_lease_ttl(),
        }
    }
}

fn default_instance_prefix() -> String {
    "/hermes/instances".to_string()
}

fn default_instance_lease_ttl() -> u64 {
    15
}
