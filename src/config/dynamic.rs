//! Dynamic configuration as produced by providers.
//!
//! Every provider sends a complete [`Configuration`]; the aggregator merges
//! them and qualifies names before the runtime model is built from it.

use super::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfiguration {
    #[serde(default)]
    pub routers: BTreeMap<String, Router>,

    #[serde(default)]
    pub services: BTreeMap<String, Service>,

    #[serde(default)]
    pub middlewares: BTreeMap<String, Middleware>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    #[serde(default)]
    pub entry_points: Vec<String>,

    #[serde(default)]
    pub middlewares: Vec<String>,

    pub service: String,

    pub rule: String,

    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTlsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterTlsConfig {
    #[serde(default)]
    pub options: String,

    #[serde(default)]
    pub cert_resolver: String,

    #[serde(default)]
    pub domains: Vec<Domain>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub main: String,

    #[serde(default)]
    pub sans: Vec<String>,
}

/// A service is either a load balancer over servers or a weighted set of
/// other services. Exactly one of the two must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<ServersLoadBalancer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weighted: Option<WeightedRoundRobin>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedRoundRobin {
    #[serde(default)]
    pub services: Vec<WeightedServiceRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky: Option<Sticky>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedServiceRef {
    pub name: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sticky {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<Cookie>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    /// Empty means "derive from the service name".
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub secure: bool,

    #[serde(default)]
    pub http_only: bool,

    #[serde(default)]
    pub same_site: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServersLoadBalancer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky: Option<Sticky>,

    #[serde(default)]
    pub servers: Vec<Server>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,

    #[serde(default = "default_true")]
    pub pass_host_header: bool,
}

impl Default for ServersLoadBalancer {
    fn default() -> Self {
        Self {
            sticky: None,
            servers: Vec::new(),
            health_check: None,
            pass_host_header: true,
        }
    }
}

impl ServersLoadBalancer {
    /// Structural equality over everything except the server list.
    ///
    /// Two providers describing the same service may contribute different
    /// servers; they can only be merged when the rest of the load balancer
    /// definition agrees.
    pub fn mergeable(&self, other: &ServersLoadBalancer) -> bool {
        self.sticky == other.sticky
            && self.health_check == other.health_check
            && self.pass_host_header == other.pass_host_header
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub url: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,

    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default = "default_health_interval")]
    pub interval: Duration,

    #[serde(default = "default_health_timeout")]
    pub timeout: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

// TCP

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpConfiguration {
    #[serde(default)]
    pub routers: BTreeMap<String, TcpRouter>,

    #[serde(default)]
    pub services: BTreeMap<String, TcpService>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpRouter {
    #[serde(default)]
    pub entry_points: Vec<String>,

    pub service: String,

    pub rule: String,

    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TcpRouterTlsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpRouterTlsConfig {
    #[serde(default)]
    pub passthrough: bool,

    #[serde(default)]
    pub options: String,

    #[serde(default)]
    pub cert_resolver: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<TcpServersLoadBalancer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weighted: Option<TcpWeightedRoundRobin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpServersLoadBalancer {
    /// Milliseconds granted to the peer after one side half-closes.
    /// Negative disables the deadline.
    #[serde(default = "default_termination_delay")]
    pub termination_delay: i64,

    #[serde(default)]
    pub servers: Vec<TcpServer>,
}

impl Default for TcpServersLoadBalancer {
    fn default() -> Self {
        Self {
            termination_delay: default_termination_delay(),
            servers: Vec::new(),
        }
    }
}

impl TcpServersLoadBalancer {
    pub fn termination_delay(&self) -> Option<std::time::Duration> {
        u64::try_from(self.termination_delay)
            .ok()
            .map(std::time::Duration::from_millis)
    }

    /// Structural equality over everything except the server list.
    pub fn mergeable(&self, other: &TcpServersLoadBalancer) -> bool {
        self.termination_delay == other.termination_delay
    }
}

fn default_termination_delay() -> i64 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpServer {
    pub address: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpWeightedRoundRobin {
    #[serde(default)]
    pub services: Vec<WeightedServiceRef>,
}

// Middlewares

/// Middleware options as written by providers: one optional field per kind.
/// Validation that exactly one is set happens when the middleware is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Middleware {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_prefix: Option<AddPrefix>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_prefix: Option<StripPrefix>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_path: Option<ReplacePath>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_path_regex: Option<ReplacePathRegex>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_query_regex: Option<ReplaceQueryRegex>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_allow_list: Option<IpAllowList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_auth: Option<ForwardAuth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight_req: Option<InFlightReq>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<Retry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffering: Option<Buffering>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreaker>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<Chain>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPrefix {
    pub prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StripPrefix {
    #[serde(default)]
    pub prefixes: Vec<String>,

    #[serde(default)]
    pub force_slash: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacePath {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacePathRegex {
    pub regex: String,

    #[serde(default)]
    pub replacement: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceQueryRegex {
    pub regex: String,

    #[serde(default)]
    pub replacement: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Headers {
    /// An empty value removes the header.
    #[serde(default)]
    pub custom_request_headers: BTreeMap<String, String>,

    #[serde(default)]
    pub custom_response_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpStrategy {
    /// Position from the right of X-Forwarded-For to use; 0 means the peer address.
    #[serde(default)]
    pub depth: usize,

    #[serde(default, rename = "excludedIPs")]
    pub excluded_ips: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAllowList {
    #[serde(default)]
    pub source_range: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_strategy: Option<IpStrategy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    /// `user:password` or `user:{SHA}base64digest`.
    #[serde(default)]
    pub users: Vec<String>,

    #[serde(default)]
    pub realm: String,

    #[serde(default)]
    pub remove_header: bool,

    /// Forward the authenticated user name in this request header.
    #[serde(default)]
    pub header_field: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardAuth {
    pub address: String,

    #[serde(default)]
    pub trust_forward_header: bool,

    #[serde(default)]
    pub auth_response_headers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCriterion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_strategy: Option<IpStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_header_name: Option<String>,

    #[serde(default)]
    pub request_host: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    /// Requests allowed per `period`, on average.
    pub average: u64,

    #[serde(default = "default_rate_period")]
    pub period: Duration,

    #[serde(default = "default_burst")]
    pub burst: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_criterion: Option<SourceCriterion>,
}

fn default_rate_period() -> Duration {
    Duration::from_secs(1)
}

fn default_burst() -> u64 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightReq {
    pub amount: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_criterion: Option<SourceCriterion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retry {
    /// 0 means one attempt per server of the target service.
    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub initial_interval: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Buffering {
    /// 0 means no limit.
    #[serde(default)]
    pub max_request_body_bytes: u64,

    #[serde(default)]
    pub mem_request_body_bytes: u64,

    #[serde(default)]
    pub max_response_body_bytes: u64,

    #[serde(default)]
    pub mem_response_body_bytes: u64,

    #[serde(default)]
    pub retry_expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreaker {
    pub expression: String,

    #[serde(default = "default_check_period")]
    pub check_period: Duration,

    #[serde(default = "default_fallback_duration")]
    pub fallback_duration: Duration,

    #[serde(default = "default_recovery_duration")]
    pub recovery_duration: Duration,
}

fn default_check_period() -> Duration {
    Duration::from_millis(100)
}

fn default_fallback_duration() -> Duration {
    Duration::from_secs(10)
}

fn default_recovery_duration() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    #[serde(default)]
    pub middlewares: Vec<String>,
}
