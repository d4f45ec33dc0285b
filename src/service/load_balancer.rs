use crate::balancer::{Balancer, StickyCookie};
use crate::proxy::{BoxFuture, BoxHandler, Handler, HandlerResult, HttpBody, ProxyError};
use hyper::Request;
use tracing::{debug, warn};

/// Weighted selection over child handlers: backend forwarders for a
/// `loadBalancer` service, sub-service handlers for a `weighted` one.
pub struct BalancedHandler {
    service: String,
    balancer: Balancer<BoxHandler>,
}

impl BalancedHandler {
    pub fn new(
        service: &str,
        members: Vec<(String, BoxHandler, u32)>,
        sticky: Option<StickyCookie>,
    ) -> Self {
        Self {
            service: service.to_string(),
            balancer: Balancer::new(members, sticky),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Flip availability of the member registered under `key`.
    pub fn set_server_up(&self, key: &str, up: bool) {
        if !self.balancer.set_up(key, up) {
            debug!("Service '{}' has no member '{}'", self.service, key);
        }
    }

    pub fn len(&self) -> usize {
        self.balancer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balancer.is_empty()
    }

    async fn dispatch(&self, req: Request<HttpBody>) -> HandlerResult {
        let Some(pick) = self.balancer.pick(&req) else {
            warn!("No available server for service '{}'", self.service);
            return Err(ProxyError::NoAvailableServer);
        };

        debug!("Service '{}' selected '{}'", self.service, pick.member.key);
        let handler = pick.member.item.clone();
        let new_cookie = pick.set_cookie;

        let mut response = handler.serve(req).await?;

        if let (Some(value), Some(sticky)) = (new_cookie, self.balancer.sticky()) {
            sticky.add_cookie_to_response(&mut response, value);
        }

        Ok(response)
    }
}

impl Handler for BalancedHandler {
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(self.dispatch(req))
    }
}
