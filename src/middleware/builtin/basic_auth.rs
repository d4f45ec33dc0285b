use crate::config::dynamic::BasicAuth;
use crate::proxy::{status_response, BoxFuture, BoxHandler, Handler, HandlerResult, HttpBody};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::{Request, StatusCode};
use std::collections::HashMap;
use tracing::debug;

const DEFAULT_REALM: &str = "edgeroute";

/// Basic authentication middleware.
/// Passwords are stored as plain text or as `{SHA}` followed by the base64
/// encoded SHA-1 digest.
pub struct BasicAuthMiddleware {
    /// Map of username -> stored password
    users: HashMap<String, String>,
    www_authenticate: HeaderValue,
    remove_header: bool,
    header_field: Option<HeaderName>,
    next: BoxHandler,
}

impl BasicAuthMiddleware {
    pub fn new(config: &BasicAuth, next: BoxHandler) -> Result<Self, String> {
        let mut users = HashMap::new();
        for entry in &config.users {
            let (user, pass) = entry
                .split_once(':')
                .ok_or_else(|| format!("error parsing user {:?}: expected user:password", entry))?;
            users.insert(user.to_string(), pass.to_string());
        }

        let realm = if config.realm.is_empty() {
            DEFAULT_REALM
        } else {
            config.realm.as_str()
        };
        let www_authenticate = HeaderValue::from_str(&format!("Basic realm=\"{}\"", realm))
            .map_err(|_| format!("invalid realm {:?}", realm))?;

        let header_field = if config.header_field.is_empty() {
            None
        } else {
            Some(
                HeaderName::try_from(config.header_field.as_str())
                    .map_err(|_| format!("invalid headerField {:?}", config.header_field))?,
            )
        };

        Ok(Self {
            users,
            www_authenticate,
            remove_header: config.remove_header,
            header_field,
            next,
        })
    }

    /// The authenticated user, if the request carries valid credentials.
    pub fn authenticate<B>(&self, req: &Request<B>) -> Option<String> {
        let auth = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
        let encoded = auth.strip_prefix("Basic ")?;
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;

        self.verify(user, password).then(|| user.to_string())
    }

    fn verify(&self, username: &str, password: &str) -> bool {
        let Some(stored) = self.users.get(username) else {
            return false;
        };

        match stored.strip_prefix("{SHA}") {
            Some(digest) => {
                let computed = STANDARD.encode(sha1_smol::Sha1::from(password).digest().bytes());
                constant_time_compare(digest, &computed)
            }
            None => constant_time_compare(stored, password),
        }
    }
}

impl Handler for BasicAuthMiddleware {
    fn serve(&self, mut req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            let Some(user) = self.authenticate(&req) else {
                debug!("Basic authentication failed");
                let mut response = status_response(StatusCode::UNAUTHORIZED);
                response
                    .headers_mut()
                    .insert(WWW_AUTHENTICATE, self.www_authenticate.clone());
                return Ok(response);
            };

            if let Some(field) = &self.header_field {
                if let Ok(value) = HeaderValue::from_str(&user) {
                    req.headers_mut().insert(field.clone(), value);
                }
            }
            if self.remove_header {
                req.headers_mut().remove(AUTHORIZATION);
            }

            self.next.serve(req).await
        })
    }
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{empty_body, full_body, handler_fn};
    use http_body_util::BodyExt;
    use hyper::Response;

    fn config() -> BasicAuth {
        BasicAuth {
            users: vec![
                "admin:secret123".to_string(),
                // password: "password"
                "user:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=".to_string(),
            ],
            realm: "Test Realm".to_string(),
            remove_header: true,
            header_field: "X-Auth-User".to_string(),
        }
    }

    fn middleware() -> BasicAuthMiddleware {
        let next = handler_fn(|req| async move {
            assert!(req.headers().get(AUTHORIZATION).is_none());
            let user = req.headers()["x-auth-user"].to_str().unwrap().to_string();
            Ok(Response::new(full_body(user)))
        });
        BasicAuthMiddleware::new(&config(), next).unwrap()
    }

    fn with_credentials(user: &str, password: &str) -> Request<HttpBody> {
        Request::builder()
            .header(AUTHORIZATION, format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password))))
            .body(empty_body())
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_credentials() {
        let middleware = middleware();
        for (user, password) in [("admin", "secret123"), ("user", "password")] {
            let response = middleware.serve(with_credentials(user, password)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(body, user.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let middleware = middleware();

        let response = middleware.serve(with_credentials("admin", "wrong")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response.headers()[WWW_AUTHENTICATE].to_str().unwrap();
        assert_eq!(challenge, "Basic realm=\"Test Realm\"");

        let response = middleware.serve(with_credentials("nobody", "x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bearer = Request::builder()
            .header(AUTHORIZATION, "Bearer token123")
            .body(empty_body())
            .unwrap();
        let response = middleware.serve(bearer).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_malformed_user_entry() {
        let config = BasicAuth {
            users: vec!["no-colon".into()],
            ..Default::default()
        };
        let next = handler_fn(|_| async { Ok(Response::new(empty_body())) });
        assert!(BasicAuthMiddleware::new(&config, next).is_err());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("test", "test"));
        assert!(!constant_time_compare("test", "Test"));
        assert!(!constant_time_compare("test", "test1"));
    }
}
