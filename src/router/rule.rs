use hyper::header::{HeaderName, HOST};
use hyper::{Method, Request};
use ipnetwork::IpNetwork;
use regex::Regex;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleParseError {
    #[error("Invalid rule syntax: {0}")]
    InvalidSyntax(String),

    #[error("Invalid regex pattern: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Invalid argument for {func}: {arg}")]
    InvalidArgument { func: String, arg: String },
}

#[derive(Debug, Clone)]
pub enum Rule {
    Host(Vec<String>),
    HostRegexp(Vec<Regex>),
    Path(Vec<String>),
    PathPrefix(Vec<String>),
    PathRegexp(Vec<Regex>),
    Method(Vec<Method>),
    Headers(HeaderName, String),
    HeadersRegexp(HeaderName, Regex),
    /// `key=value` pairs; a bare key matches any value.
    Query(Vec<(String, Option<String>)>),
    ClientIp(Vec<IpNetwork>),
    And(Box<Rule>, Box<Rule>),
    Or(Box<Rule>, Box<Rule>),
    Not(Box<Rule>),
}

/// Host of the request without any port, from the Host header or, for
/// HTTP/2, the URI authority.
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;
    Some(strip_port(raw))
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6]:port
        return host.split(']').next().map(|h| &h[1..]).unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

impl Rule {
    pub fn matches<B>(&self, req: &Request<B>, client_ip: Option<IpAddr>) -> bool {
        match self {
            Rule::Host(hosts) => request_host(req)
                .map(|h| hosts.iter().any(|expected| h.eq_ignore_ascii_case(expected)))
                .unwrap_or(false),
            Rule::HostRegexp(patterns) => request_host(req)
                .map(|h| patterns.iter().any(|re| re.is_match(h)))
                .unwrap_or(false),
            Rule::Path(paths) => paths.iter().any(|p| req.uri().path() == p),
            Rule::PathPrefix(prefixes) => prefixes.iter().any(|p| req.uri().path().starts_with(p.as_str())),
            Rule::PathRegexp(patterns) => patterns.iter().any(|re| re.is_match(req.uri().path())),
            Rule::Method(methods) => methods.contains(req.method()),
            Rule::Headers(name, value) => req
                .headers()
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| v == value),
            Rule::HeadersRegexp(name, re) => req
                .headers()
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| re.is_match(v)),
            Rule::Query(pairs) => {
                let query: Vec<(String, String)> = req
                    .uri()
                    .query()
                    .map(|q| {
                        url::form_urlencoded::parse(q.as_bytes())
                            .into_owned()
                            .collect()
                    })
                    .unwrap_or_default();
                pairs.iter().all(|(key, value)| {
                    query
                        .iter()
                        .any(|(k, v)| k == key && value.as_ref().is_none_or(|expected| v == expected))
                })
            }
            Rule::ClientIp(networks) => client_ip
                .map(|ip| networks.iter().any(|n| n.contains(ip)))
                .unwrap_or(false),
            Rule::And(a, b) => a.matches(req, client_ip) && b.matches(req, client_ip),
            Rule::Or(a, b) => a.matches(req, client_ip) || b.matches(req, client_ip),
            Rule::Not(r) => !r.matches(req, client_ip),
        }
    }
}

pub struct RuleParser;

impl RuleParser {
    pub fn parse(input: &str) -> Result<Rule, RuleParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RuleParseError::InvalidSyntax("empty rule".into()));
        }
        Self::parse_or(input)
    }

    fn parse_or(input: &str) -> Result<Rule, RuleParseError> {
        // Find || at the top level (not inside parentheses)
        if let Some(pos) = find_operator(input, "||") {
            let left = Self::parse_or(&input[..pos])?;
            let right = Self::parse_or(&input[pos + 2..])?;
            return Ok(Rule::Or(Box::new(left), Box::new(right)));
        }
        Self::parse_and(input)
    }

    fn parse_and(input: &str) -> Result<Rule, RuleParseError> {
        if let Some(pos) = find_operator(input, "&&") {
            let left = Self::parse_and(&input[..pos])?;
            let right = Self::parse_and(&input[pos + 2..])?;
            return Ok(Rule::And(Box::new(left), Box::new(right)));
        }
        Self::parse_unary(input)
    }

    fn parse_unary(input: &str) -> Result<Rule, RuleParseError> {
        let input = input.trim();

        if let Some(rest) = input.strip_prefix('!') {
            let inner = Self::parse_unary(rest)?;
            return Ok(Rule::Not(Box::new(inner)));
        }

        Self::parse_primary(input)
    }

    fn parse_primary(input: &str) -> Result<Rule, RuleParseError> {
        let input = input.trim();

        if let Some(inner) = input.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
            return Self::parse_or(inner);
        }

        Self::parse_function(input)
    }

    fn parse_function(input: &str) -> Result<Rule, RuleParseError> {
        let (func_name, args) = split_call(input)?;

        let one_or_more = |args: Vec<String>| {
            if args.is_empty() {
                Err(RuleParseError::InvalidSyntax(format!("{} requires an argument", func_name)))
            } else {
                Ok(args)
            }
        };
        let exactly_two = |args: &[String]| {
            if args.len() != 2 {
                Err(RuleParseError::InvalidSyntax(format!("{} requires two arguments", func_name)))
            } else {
                Ok(())
            }
        };
        let invalid = |arg: &str| RuleParseError::InvalidArgument {
            func: func_name.to_string(),
            arg: arg.to_string(),
        };

        match func_name {
            "Host" => Ok(Rule::Host(one_or_more(args)?)),
            "HostRegexp" => {
                let patterns = one_or_more(args)?
                    .iter()
                    .map(|p| Regex::new(p))
                    .collect::<Result<_, _>>()?;
                Ok(Rule::HostRegexp(patterns))
            }
            "Path" => Ok(Rule::Path(one_or_more(args)?)),
            "PathPrefix" => Ok(Rule::PathPrefix(one_or_more(args)?)),
            "PathRegexp" => {
                let patterns = one_or_more(args)?
                    .iter()
                    .map(|p| Regex::new(p))
                    .collect::<Result<_, _>>()?;
                Ok(Rule::PathRegexp(patterns))
            }
            "Method" => {
                let methods = one_or_more(args)?
                    .iter()
                    .map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| invalid(m)))
                    .collect::<Result<_, _>>()?;
                Ok(Rule::Method(methods))
            }
            "Headers" => {
                exactly_two(&args)?;
                let name = HeaderName::from_bytes(args[0].as_bytes()).map_err(|_| invalid(&args[0]))?;
                Ok(Rule::Headers(name, args[1].clone()))
            }
            "HeadersRegexp" => {
                exactly_two(&args)?;
                let name = HeaderName::from_bytes(args[0].as_bytes()).map_err(|_| invalid(&args[0]))?;
                Ok(Rule::HeadersRegexp(name, Regex::new(&args[1])?))
            }
            "Query" => {
                let pairs = one_or_more(args)?
                    .into_iter()
                    .map(|arg| match arg.split_once('=') {
                        Some((k, v)) => (k.to_string(), Some(v.to_string())),
                        None => (arg, None),
                    })
                    .collect();
                Ok(Rule::Query(pairs))
            }
            "ClientIP" => {
                let networks = one_or_more(args)?
                    .iter()
                    .map(|s| parse_network(s).ok_or_else(|| invalid(s)))
                    .collect::<Result<_, _>>()?;
                Ok(Rule::ClientIp(networks))
            }
            _ => Err(RuleParseError::UnknownFunction(func_name.to_string())),
        }
    }
}

/// Split `Name(`a`, `b`)` into its name and backtick-quoted arguments.
pub(crate) fn split_call(input: &str) -> Result<(&str, Vec<String>), RuleParseError> {
    let input = input.trim();

    let paren_start = input
        .find('(')
        .ok_or_else(|| RuleParseError::InvalidSyntax(input.to_string()))?;

    if !input.ends_with(')') {
        return Err(RuleParseError::InvalidSyntax(input.to_string()));
    }

    let func_name = input[..paren_start].trim();
    let args = parse_args(&input[paren_start + 1..input.len() - 1])?;
    Ok((func_name, args))
}

fn parse_args(input: &str) -> Result<Vec<String>, RuleParseError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_backtick = false;

    for c in input.chars() {
        match c {
            '`' => {
                if in_backtick {
                    args.push(std::mem::take(&mut current));
                }
                in_backtick = !in_backtick;
            }
            _ if in_backtick => current.push(c),
            ',' | ' ' => {}
            _ => {
                return Err(RuleParseError::InvalidSyntax(format!(
                    "unexpected {:?} in arguments: {}",
                    c, input
                )))
            }
        }
    }

    if in_backtick {
        return Err(RuleParseError::InvalidSyntax(format!("unterminated argument: {}", input)));
    }

    Ok(args)
}

/// Byte offset of the first top-level occurrence of `op`, ignoring text
/// inside backticks and parentheses.
pub(crate) fn find_operator(input: &str, op: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_backtick = false;

    for (i, c) in input.char_indices() {
        match c {
            '`' => in_backtick = !in_backtick,
            '(' if !in_backtick => depth += 1,
            ')' if !in_backtick => depth -= 1,
            _ if !in_backtick && depth == 0 && input[i..].starts_with(op) => return Some(i),
            _ => {}
        }
    }
    None
}

/// Parse an IP address or CIDR notation into IpNetwork
pub(crate) fn parse_network(s: &str) -> Option<IpNetwork> {
    if let Ok(network) = s.parse::<IpNetwork>() {
        return Some(network);
    }
    s.parse::<IpAddr>().ok().map(IpNetwork::from)
}
