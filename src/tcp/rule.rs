use crate::router::{find_operator, parse_network, split_call, RuleParseError};
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// TCP routing rules
#[derive(Debug, Clone)]
pub enum TcpRule {
    /// `HostSNI(`*`)`: match any connection
    CatchAll,
    /// Match by SNI hostname; `*.example.com` matches any subdomain
    HostSni(Vec<String>),
    /// Match by client IP (CIDR)
    ClientIp(Vec<IpNetwork>),
    And(Box<TcpRule>, Box<TcpRule>),
    Or(Box<TcpRule>, Box<TcpRule>),
}

impl TcpRule {
    pub fn parse(input: &str) -> Result<Self, RuleParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RuleParseError::InvalidSyntax("empty rule".into()));
        }

        if let Some(pos) = find_operator(input, "||") {
            return Ok(TcpRule::Or(
                Box::new(Self::parse(&input[..pos])?),
                Box::new(Self::parse(&input[pos + 2..])?),
            ));
        }
        if let Some(pos) = find_operator(input, "&&") {
            return Ok(TcpRule::And(
                Box::new(Self::parse(&input[..pos])?),
                Box::new(Self::parse(&input[pos + 2..])?),
            ));
        }
        if let Some(inner) = input.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
            return Self::parse(inner);
        }

        let (func_name, args) = split_call(input)?;
        if args.is_empty() {
            return Err(RuleParseError::InvalidSyntax(format!("{} requires an argument", func_name)));
        }

        match func_name {
            "HostSNI" => {
                if args.iter().any(|a| a == "*") {
                    if args.len() > 1 {
                        return Err(RuleParseError::InvalidArgument {
                            func: func_name.to_string(),
                            arg: args.join(", "),
                        });
                    }
                    return Ok(TcpRule::CatchAll);
                }
                Ok(TcpRule::HostSni(args.iter().map(|h| h.to_ascii_lowercase()).collect()))
            }
            "ClientIP" => {
                let networks = args
                    .iter()
                    .map(|s| {
                        parse_network(s).ok_or_else(|| RuleParseError::InvalidArgument {
                            func: func_name.to_string(),
                            arg: s.clone(),
                        })
                    })
                    .collect::<Result<_, _>>()?;
                Ok(TcpRule::ClientIp(networks))
            }
            _ => Err(RuleParseError::UnknownFunction(func_name.to_string())),
        }
    }

    /// Check if a connection matches this rule
    pub fn matches(&self, sni: Option<&str>, client_ip: Option<IpAddr>) -> bool {
        match self {
            TcpRule::CatchAll => true,
            TcpRule::HostSni(hosts) => {
                let Some(sni) = sni else {
                    return false;
                };
                hosts.iter().any(|h| match h.strip_prefix("*.") {
                    Some(domain) => sni
                        .strip_suffix(domain)
                        .is_some_and(|sub| sub.len() > 1 && sub.ends_with('.')),
                    None => h.eq_ignore_ascii_case(sni),
                })
            }
            TcpRule::ClientIp(networks) => client_ip
                .map(|ip| networks.iter().any(|net| net.contains(ip)))
                .unwrap_or(false),
            TcpRule::And(a, b) => a.matches(sni, client_ip) && b.matches(sni, client_ip),
            TcpRule::Or(a, b) => a.matches(sni, client_ip) || b.matches(sni, client_ip),
        }
    }

    /// Whether matching needs a server name, which only a TLS client sends.
    pub fn needs_sni(&self) -> bool {
        match self {
            TcpRule::HostSni(_) => true,
            TcpRule::CatchAll | TcpRule::ClientIp(_) => false,
            TcpRule::And(a, b) | TcpRule::Or(a, b) => a.needs_sni() || b.needs_sni(),
        }
    }

    pub fn is_catch_all(&self) -> bool {
        matches!(self, TcpRule::CatchAll)
    }
}
