use crate::config::dynamic::{IpStrategy, SourceCriterion};
use crate::proxy::ClientInfo;
use crate::router::{parse_network, request_host};
use hyper::header::HeaderName;
use hyper::Request;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Picks the client IP from the peer address or from `X-Forwarded-For`.
#[derive(Debug, Clone, Default)]
pub struct IpExtractor {
    depth: usize,
    excluded: Vec<IpNetwork>,
}

impl IpExtractor {
    pub fn new(strategy: Option<&IpStrategy>) -> Result<Self, String> {
        let Some(strategy) = strategy else {
            return Ok(Self::default());
        };

        let excluded = strategy
            .excluded_ips
            .iter()
            .map(|s| parse_network(s).ok_or_else(|| format!("invalid excluded IP {:?}", s)))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            depth: strategy.depth,
            excluded,
        })
    }

    /// With a depth, the n-th address from the right of `X-Forwarded-For`.
    /// With exclusions, the rightmost address not excluded. Otherwise the
    /// peer address.
    pub fn client_ip<B>(&self, req: &Request<B>) -> Option<IpAddr> {
        if self.depth == 0 && self.excluded.is_empty() {
            return ClientInfo::of(req).map(|c| c.remote_addr.ip());
        }

        let forwarded: Vec<&str> = req
            .headers()
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if self.depth > 0 {
            let index = forwarded.len().checked_sub(self.depth)?;
            return forwarded[index].parse().ok();
        }

        forwarded
            .iter()
            .rev()
            .filter_map(|s| s.parse::<IpAddr>().ok())
            .find(|ip| !self.excluded.iter().any(|net| net.contains(*ip)))
    }
}

/// How requests are grouped for rate limiting and in-flight accounting.
#[derive(Debug, Clone)]
pub enum SourceExtractor {
    Ip(IpExtractor),
    Header(HeaderName),
    Host,
}

impl SourceExtractor {
    /// Header name wins over host, host over IP strategy. No criterion
    /// means the peer address.
    pub fn new(criterion: Option<&SourceCriterion>) -> Result<Self, String> {
        let Some(criterion) = criterion else {
            return Ok(SourceExtractor::Ip(IpExtractor::default()));
        };

        if let Some(name) = criterion.request_header_name.as_deref().filter(|n| !n.is_empty()) {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name {:?}", name))?;
            return Ok(SourceExtractor::Header(header));
        }

        if criterion.request_host {
            return Ok(SourceExtractor::Host);
        }

        IpExtractor::new(criterion.ip_strategy.as_ref()).map(SourceExtractor::Ip)
    }

    pub fn key<B>(&self, req: &Request<B>) -> Option<String> {
        match self {
            SourceExtractor::Ip(extractor) => extractor.client_ip(req).map(|ip| ip.to_string()),
            SourceExtractor::Header(name) => Some(
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string(),
            ),
            SourceExtractor::Host => Some(request_host(req).unwrap_or_default().to_string()),
        }
    }
}
