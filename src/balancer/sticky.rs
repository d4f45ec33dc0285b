use crate::config::dynamic::Cookie;
use hyper::header::{HeaderValue, COOKIE, SET_COOKIE};
use hyper::{Request, Response};

/// Session affinity cookie settings for one balancer.
#[derive(Debug, Clone)]
pub struct StickyCookie {
    name: String,
    secure: bool,
    http_only: bool,
    same_site: Option<&'static str>,
}

impl StickyCookie {
    pub fn new(config: &Cookie, service_name: &str) -> Self {
        let name = if config.name.is_empty() {
            default_cookie_name(service_name)
        } else {
            config.name.clone()
        };

        let same_site = match config.same_site.to_ascii_lowercase().as_str() {
            "none" => Some("None"),
            "lax" => Some("Lax"),
            "strict" => Some("Strict"),
            _ => None,
        };

        Self {
            name,
            secure: config.secure,
            http_only: config.http_only,
            same_site,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of this cookie in the request, if present.
    pub fn value_of<B>(&self, req: &Request<B>) -> Option<String> {
        req.headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|h| h.to_str().ok())
            .flat_map(|h| h.split(';'))
            .filter_map(|cookie| {
                let (name, value) = cookie.trim().split_once('=')?;
                (name.trim() == self.name).then(|| value.trim().to_string())
            })
            .next()
    }

    /// Get the Set-Cookie header value for a session pinned to `value`.
    pub fn set_cookie_header(&self, value: &str) -> String {
        let mut cookie = format!("{}={}; Path=/", self.name, value);

        if self.http_only {
            cookie.push_str("; HttpOnly");
        }

        if self.secure {
            cookie.push_str("; Secure");
        }

        if let Some(same_site) = self.same_site {
            cookie.push_str(&format!("; SameSite={}", same_site));
        }

        cookie
    }

    pub fn add_cookie_to_response<B>(&self, response: &mut Response<B>, value: &str) {
        if let Ok(header) = HeaderValue::from_str(&self.set_cookie_header(value)) {
            response.headers_mut().append(SET_COOKIE, header);
        }
    }
}

/// `_` followed by the first six hex digits of SHA-1(service name).
pub fn default_cookie_name(service_name: &str) -> String {
    let digest = sha1_smol::Sha1::from(service_name).digest().to_string();
    format!("_{}", &digest[..6])
}

/// Opaque cookie value identifying a backend without exposing its address.
pub fn cookie_token(key: &str) -> String {
    let digest = sha1_smol::Sha1::from(key).digest().to_string();
    digest[..16].to_string()
}
