mod rule;

pub use rule::{request_host, Rule, RuleParseError, RuleParser};
pub(crate) use rule::{find_operator, parse_network, split_call};

use crate::proxy::{status_response, BoxFuture, BoxHandler, ClientInfo, Handler, HandlerResult, HttpBody};
use hyper::{Request, StatusCode};
use tracing::debug;

/// A router installed in an entry point's table.
pub struct Route {
    pub name: String,
    pub priority: i64,
    rule: Rule,
    handler: BoxHandler,
}

impl Route {
    /// Parse `rule` and bind it to `handler`. A priority of 0 means the
    /// length of the rule, so more specific rules are tried first.
    pub fn new(name: &str, rule: &str, priority: i32, handler: BoxHandler) -> Result<Self, RuleParseError> {
        let parsed = RuleParser::parse(rule)?;
        let priority = if priority == 0 {
            rule.len() as i64
        } else {
            priority as i64
        };

        Ok(Self {
            name: name.to_string(),
            priority,
            rule: parsed,
            handler,
        })
    }

    pub fn matches<B>(&self, req: &Request<B>) -> bool {
        let client_ip = ClientInfo::of(req).map(|c| c.remote_addr.ip());
        self.rule.matches(req, client_ip)
    }
}

/// The HTTP routing table of one entry point (TLS or plain).
#[derive(Default)]
pub struct HttpRouter {
    routes: Vec<Route>,
}

impl HttpRouter {
    pub fn new(mut routes: Vec<Route>) -> Self {
        // Sort by priority (higher first), then by name
        routes.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Self { routes }
    }

    pub fn match_route<B>(&self, req: &Request<B>) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(req))
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    async fn dispatch(&self, req: Request<HttpBody>) -> HandlerResult {
        match self.match_route(&req) {
            Some(route) => {
                debug!("Request {} matched router '{}'", req.uri(), route.name);
                route.handler.serve(req).await
            }
            None => Ok(status_response(StatusCode::NOT_FOUND)),
        }
    }
}

impl Handler for HttpRouter {
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(self.dispatch(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{empty_body, full_body, handler_fn};
    use http_body_util::BodyExt;
    use hyper::header::HOST;
    use hyper::Response;

    fn named(name: &'static str) -> BoxHandler {
        handler_fn(move |_req| async move { Ok(Response::new(full_body(name))) })
    }

    fn get(host: &str, path: &str) -> Request<HttpBody> {
        Request::builder()
            .uri(path)
            .header(HOST, host)
            .body(empty_body())
            .unwrap()
    }

    async fn served_by(router: &HttpRouter, req: Request<HttpBody>) -> String {
        let response = router.serve(req).await.unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_default_priority_is_rule_length() {
        let route = Route::new("r@file", "Host(`a.com`)", 0, named("a")).unwrap();
        assert_eq!(route.priority, 13);
        let route = Route::new("r@file", "Host(`a.com`)", 5, named("a")).unwrap();
        assert_eq!(route.priority, 5);
    }

    #[tokio::test]
    async fn test_longer_rule_wins() {
        let router = HttpRouter::new(vec![
            Route::new("site@file", "Host(`a.com`)", 0, named("site")).unwrap(),
            Route::new("api@file", "Host(`a.com`) && PathPrefix(`/api`)", 0, named("api")).unwrap(),
        ]);

        assert_eq!(served_by(&router, get("a.com", "/api/x")).await, "api");
        assert_eq!(served_by(&router, get("a.com", "/index")).await, "site");
    }

    #[tokio::test]
    async fn test_explicit_priority_and_name_tiebreak() {
        let router = HttpRouter::new(vec![
            Route::new("b@file", "PathPrefix(`/`)", 10, named("b")).unwrap(),
            Route::new("a@file", "PathPrefix(`/`)", 10, named("a")).unwrap(),
            Route::new("long@file", "Host(`a.com`) && PathPrefix(`/`)", 1, named("long")).unwrap(),
        ]);

        assert_eq!(served_by(&router, get("a.com", "/")).await, "a");
    }

    #[tokio::test]
    async fn test_no_match_is_not_found() {
        let router = HttpRouter::new(vec![Route::new("a@file", "Host(`a.com`)", 0, named("a")).unwrap()]);
        let response = router.serve(get("b.com", "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_client_ip_from_extension() {
        let router = HttpRouter::new(vec![
            Route::new("internal@file", "ClientIP(`10.0.0.0/8`)", 0, named("internal")).unwrap(),
        ]);

        let mut req = get("a.com", "/");
        req.extensions_mut().insert(ClientInfo {
            remote_addr: "10.0.0.9:5000".parse().unwrap(),
            tls: false,
        });
        assert_eq!(served_by(&router, req).await, "internal");

        let response = router.serve(get("a.com", "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
