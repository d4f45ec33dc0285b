use super::{BoxTcpHandler, Peeked, TcpRule};
use crate::router::RuleParseError;
use std::net::IpAddr;
use tracing::debug;

/// How a TCP router treats TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRouteTls {
    /// Plain TCP: only non-TLS rules (`HostSNI(`*`)`, `ClientIP`).
    None,
    /// Forward the raw TLS stream, matched on SNI.
    Passthrough,
    /// Terminate TLS at the entry point, then forward the decrypted stream.
    Terminate,
}

/// A resolved TCP route
pub struct TcpRoute {
    pub name: String,
    pub priority: i64,
    pub tls: TcpRouteTls,
    rule: TcpRule,
    handler: BoxTcpHandler,
}

impl TcpRoute {
    pub fn new(
        name: &str,
        rule: &str,
        priority: i32,
        tls: TcpRouteTls,
        handler: BoxTcpHandler,
    ) -> Result<Self, RuleParseError> {
        let parsed = TcpRule::parse(rule)?;
        if tls == TcpRouteTls::None && parsed.needs_sni() {
            return Err(RuleParseError::InvalidSyntax(format!(
                "{}: HostSNI with a server name requires TLS",
                rule
            )));
        }

        let priority = if priority == 0 {
            rule.len() as i64
        } else {
            priority as i64
        };

        Ok(Self {
            name: name.to_string(),
            priority,
            tls,
            rule: parsed,
            handler,
        })
    }

    pub fn handler(&self) -> &BoxTcpHandler {
        &self.handler
    }
}

/// The TCP routing table of one entry point.
#[derive(Default)]
pub struct TcpRouter {
    tls_routes: Vec<TcpRoute>,
    plain_routes: Vec<TcpRoute>,
}

impl TcpRouter {
    pub fn new(routes: Vec<TcpRoute>) -> Self {
        let (mut tls_routes, mut plain_routes): (Vec<_>, Vec<_>) =
            routes.into_iter().partition(|r| r.tls != TcpRouteTls::None);

        // Sort routers by priority (higher first), then by name
        for routes in [&mut tls_routes, &mut plain_routes] {
            routes.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        }

        Self {
            tls_routes,
            plain_routes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tls_routes.is_empty() && self.plain_routes.is_empty()
    }

    /// A plain `HostSNI(`*`)` router takes every connection of the entry
    /// point, so there is no need to look at the client's first bytes.
    pub fn catch_all(&self) -> Option<&TcpRoute> {
        self.plain_routes.iter().find(|r| r.rule.is_catch_all())
    }

    pub fn has_tls_routes(&self) -> bool {
        !self.tls_routes.is_empty()
    }

    /// Match a connection to a route
    pub fn match_connection(&self, peeked: &Peeked, client_ip: Option<IpAddr>) -> Option<&TcpRoute> {
        let tls_match = if peeked.is_tls() {
            self.tls_routes
                .iter()
                .find(|r| r.rule.matches(peeked.sni(), client_ip))
        } else {
            None
        };

        let route = tls_match.or_else(|| {
            self.plain_routes
                .iter()
                .find(|r| r.rule.matches(None, client_ip))
        })?;

        debug!(
            "TCP: Matched router '{}' (SNI: {:?}, client: {:?})",
            route.name,
            peeked.sni(),
            client_ip
        );
        Some(route)
    }
}
