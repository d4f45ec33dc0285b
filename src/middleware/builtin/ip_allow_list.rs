use crate::config::dynamic::IpAllowList;
use crate::middleware::source::IpExtractor;
use crate::proxy::{status_response, BoxFuture, BoxHandler, Handler, HandlerResult, HttpBody};
use crate::router::parse_network;
use hyper::{Request, StatusCode};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::debug;

/// Rejects requests whose client IP is outside the configured ranges.
pub struct IpAllowListMiddleware {
    networks: Vec<IpNetwork>,
    extractor: IpExtractor,
    next: BoxHandler,
}

impl IpAllowListMiddleware {
    pub fn new(config: &IpAllowList, next: BoxHandler) -> Result<Self, String> {
        if config.source_range.is_empty() {
            return Err("sourceRange is empty, IPAllowLister not created".into());
        }

        let networks = config
            .source_range
            .iter()
            .map(|s| parse_network(s).ok_or_else(|| format!("parsing CIDR allow list {:?}", s)))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            networks,
            extractor: IpExtractor::new(config.ip_strategy.as_ref())?,
            next,
        })
    }

    #[inline]
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(ip))
    }
}

impl Handler for IpAllowListMiddleware {
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            match self.extractor.client_ip(&req) {
                Some(ip) if self.is_allowed(ip) => self.next.serve(req).await,
                ip => {
                    debug!("Rejecting request from {:?}: not in allow list", ip);
                    Ok(status_response(StatusCode::FORBIDDEN))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::IpStrategy;
    use crate::proxy::{empty_body, handler_fn, ClientInfo};
    use hyper::Response;

    fn ok() -> BoxHandler {
        handler_fn(|_req| async { Ok(Response::new(empty_body())) })
    }

    fn from(peer: &str, xff: Option<&str>) -> Request<HttpBody> {
        let mut builder = Request::builder();
        if let Some(xff) = xff {
            builder = builder.header("x-forwarded-for", xff);
        }
        let mut req = builder.body(empty_body()).unwrap();
        req.extensions_mut().insert(ClientInfo {
            remote_addr: format!("{}:1234", peer).parse().unwrap(),
            tls: false,
        });
        req
    }

    #[tokio::test]
    async fn test_allow_cidr_and_single_ip() {
        let config = IpAllowList {
            source_range: vec!["10.0.0.0/8".into(), "192.168.1.100".into()],
            ip_strategy: None,
        };
        let middleware = IpAllowListMiddleware::new(&config, ok()).unwrap();

        let status = |peer: &'static str| {
            let middleware = &middleware;
            async move { middleware.serve(from(peer, None)).await.unwrap().status() }
        };
        assert_eq!(status("10.1.2.3").await, StatusCode::OK);
        assert_eq!(status("192.168.1.100").await, StatusCode::OK);
        assert_eq!(status("192.168.1.101").await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_ip_strategy_depth() {
        let config = IpAllowList {
            source_range: vec!["203.0.113.0/24".into()],
            ip_strategy: Some(IpStrategy {
                depth: 1,
                excluded_ips: vec![],
            }),
        };
        let middleware = IpAllowListMiddleware::new(&config, ok()).unwrap();

        let response = middleware
            .serve(from("10.0.0.1", Some("198.51.100.1, 203.0.113.9")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = middleware.serve(from("203.0.113.9", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_invalid_config() {
        assert!(IpAllowListMiddleware::new(&IpAllowList::default(), ok()).is_err());
        let config = IpAllowList {
            source_range: vec!["not-an-ip".into()],
            ip_strategy: None,
        };
        assert!(IpAllowListMiddleware::new(&config, ok()).is_err());
    }

    #[test]
    fn test_ipv6() {
        let config = IpAllowList {
            source_range: vec!["::1".into(), "2001:db8::/32".into()],
            ip_strategy: None,
        };
        let middleware = IpAllowListMiddleware::new(&config, ok()).unwrap();
        assert!(middleware.is_allowed("::1".parse().unwrap()));
        assert!(middleware.is_allowed("2001:db8::1".parse().unwrap()));
        assert!(!middleware.is_allowed("2001:db9::1".parse().unwrap()));
    }
}
