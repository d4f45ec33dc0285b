use crate::config::dynamic::{AddPrefix, ReplacePath, ReplacePathRegex, ReplaceQueryRegex, StripPrefix};
use crate::proxy::{BoxFuture, BoxHandler, Handler, HandlerResult, HttpBody, ProxyError};
use hyper::header::HeaderValue;
use hyper::{Request, Uri};
use regex::Regex;

const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";
const X_REPLACED_PATH: &str = "x-replaced-path";

/// Rewrites the request path (and query) before passing it on.
pub struct PathRewrite {
    op: PathOp,
    next: BoxHandler,
}

enum PathOp {
    AddPrefix(String),
    StripPrefix(Vec<String>),
    ReplacePath(String),
    ReplacePathRegex(Regex, String),
    ReplaceQueryRegex(Regex, String),
}

impl PathRewrite {
    pub fn add_prefix(config: &AddPrefix, next: BoxHandler) -> Result<Self, String> {
        if config.prefix.is_empty() {
            return Err("prefix cannot be empty".into());
        }
        let prefix = if config.prefix.starts_with('/') {
            config.prefix.clone()
        } else {
            format!("/{}", config.prefix)
        };
        Ok(Self::with(PathOp::AddPrefix(prefix), next))
    }

    pub fn strip_prefix(config: &StripPrefix, next: BoxHandler) -> Self {
        Self::with(PathOp::StripPrefix(config.prefixes.clone()), next)
    }

    pub fn replace_path(config: &ReplacePath, next: BoxHandler) -> Self {
        Self::with(PathOp::ReplacePath(config.path.clone()), next)
    }

    pub fn replace_path_regex(config: &ReplacePathRegex, next: BoxHandler) -> Result<Self, String> {
        let pattern = Regex::new(&config.regex).map_err(|e| e.to_string())?;
        Ok(Self::with(
            PathOp::ReplacePathRegex(pattern, config.replacement.clone()),
            next,
        ))
    }

    pub fn replace_query_regex(config: &ReplaceQueryRegex, next: BoxHandler) -> Result<Self, String> {
        let pattern = Regex::new(&config.regex).map_err(|e| e.to_string())?;
        Ok(Self::with(
            PathOp::ReplaceQueryRegex(pattern, config.replacement.clone()),
            next,
        ))
    }

    fn with(op: PathOp, next: BoxHandler) -> Self {
        Self { op, next }
    }

    /// Apply the rewrite to `req`, recording the original path in the
    /// usual forwarding headers.
    fn rewrite(&self, req: &mut Request<HttpBody>) -> Result<(), ProxyError> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        let (new_path, new_query, header) = match &self.op {
            PathOp::AddPrefix(prefix) => (format!("{}{}", prefix, path), query, None),
            PathOp::StripPrefix(prefixes) => {
                let Some(prefix) = prefixes.iter().find(|p| path.starts_with(p.as_str())) else {
                    return Ok(());
                };
                let stripped = &path[prefix.len()..];
                let new_path = format!("/{}", stripped.trim_start_matches('/'));
                (new_path, query, Some((X_FORWARDED_PREFIX, prefix.clone())))
            }
            PathOp::ReplacePath(replacement) => {
                (replacement.clone(), query, Some((X_REPLACED_PATH, path.clone())))
            }
            PathOp::ReplacePathRegex(pattern, replacement) => {
                if !pattern.is_match(&path) {
                    return Ok(());
                }
                let new_path = pattern.replace_all(&path, replacement.as_str()).into_owned();
                (new_path, query, Some((X_REPLACED_PATH, path.clone())))
            }
            PathOp::ReplaceQueryRegex(pattern, replacement) => {
                let current = query.unwrap_or_default();
                if !pattern.is_match(&current) {
                    return Ok(());
                }
                let replaced = pattern.replace_all(&current, replacement.as_str()).into_owned();
                (path.clone(), Some(replaced).filter(|q| !q.is_empty()), None)
            }
        };

        if let Some((name, value)) = header {
            if let Ok(value) = HeaderValue::from_str(&value) {
                req.headers_mut().insert(name, value);
            }
        }

        *req.uri_mut() = rebuild_uri(req.uri(), &new_path, new_query.as_deref())?;
        Ok(())
    }
}

impl Handler for PathRewrite {
    fn serve(&self, mut req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            self.rewrite(&mut req)?;
            self.next.serve(req).await
        })
    }
}

/// Rebuild a URI with a new path and query, keeping scheme and authority
fn rebuild_uri(uri: &Uri, path: &str, query: Option<&str>) -> Result<Uri, ProxyError> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    let path_and_query = match query {
        Some(query) => format!("{}?{}", path, query),
        None => path,
    };

    let mut builder = Uri::builder();
    if let Some(scheme) = uri.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = uri.authority() {
        builder = builder.authority(authority.clone());
    }

    builder
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::InvalidUri(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{empty_body, full_body, handler_fn};
    use http_body_util::BodyExt;
    use hyper::Response;

    /// Echoes the received path, query and rewrite headers.
    fn echo() -> BoxHandler {
        handler_fn(|req| async move {
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-")
                    .to_string()
            };
            let body = format!(
                "{} {} {} {}",
                req.uri().path(),
                req.uri().query().unwrap_or("-"),
                header(X_FORWARDED_PREFIX),
                header(X_REPLACED_PATH)
            );
            Ok(Response::new(full_body(body)))
        })
    }

    async fn run(handler: PathRewrite, uri: &str) -> String {
        let req = Request::builder().uri(uri).body(empty_body()).unwrap();
        let response = handler.serve(req).await.unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_strip_prefix() {
        let config = StripPrefix {
            prefixes: vec!["/api".into(), "/v1".into()],
            force_slash: true,
        };
        assert_eq!(
            run(PathRewrite::strip_prefix(&config, echo()), "/api/users?page=1").await,
            "/users page=1 /api -"
        );
        assert_eq!(run(PathRewrite::strip_prefix(&config, echo()), "/api").await, "/ - /api -");
        assert_eq!(run(PathRewrite::strip_prefix(&config, echo()), "/other").await, "/other - - -");
    }

    #[tokio::test]
    async fn test_add_prefix() {
        let config = AddPrefix { prefix: "/api/v1".into() };
        let handler = PathRewrite::add_prefix(&config, echo()).unwrap();
        assert_eq!(run(handler, "/users?id=1").await, "/api/v1/users id=1 - -");

        assert!(PathRewrite::add_prefix(&AddPrefix::default(), echo()).is_err());
    }

    #[tokio::test]
    async fn test_replace_path() {
        let config = ReplacePath { path: "/new/path".into() };
        assert_eq!(
            run(PathRewrite::replace_path(&config, echo()), "/old/path").await,
            "/new/path - - /old/path"
        );
    }

    #[tokio::test]
    async fn test_replace_path_regex() {
        let config = ReplacePathRegex {
            regex: r"^/api/(.*)".into(),
            replacement: "/v2/$1".into(),
        };
        let handler = PathRewrite::replace_path_regex(&config, echo()).unwrap();
        assert_eq!(run(handler, "/api/users/1").await, "/v2/users/1 - - /api/users/1");

        let handler = PathRewrite::replace_path_regex(&config, echo()).unwrap();
        assert_eq!(run(handler, "/other").await, "/other - - -");
    }

    #[tokio::test]
    async fn test_replace_query_regex() {
        let config = ReplaceQueryRegex {
            regex: r"^token=[^&]*&?(.*)$".into(),
            replacement: "$1".into(),
        };
        let handler = PathRewrite::replace_query_regex(&config, echo()).unwrap();
        assert_eq!(run(handler, "/p?token=abc&page=2").await, "/p page=2 - -");

        let handler = PathRewrite::replace_query_regex(&config, echo()).unwrap();
        assert_eq!(run(handler, "/p?token=abc").await, "/p - - -");
    }

    #[test]
    fn test_invalid_regex() {
        let config = ReplacePathRegex {
            regex: "[".into(),
            replacement: String::new(),
        };
        assert!(PathRewrite::replace_path_regex(&config, echo()).is_err());
    }
}
