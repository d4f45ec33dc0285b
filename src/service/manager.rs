use super::{BalancedHandler, BuildContext, BuildError};
use crate::balancer::StickyCookie;
use crate::config::dynamic::{HealthCheck, ServersLoadBalancer, Sticky, WeightedRoundRobin};
use crate::proxy::{BoxHandler, Forwarder, HttpClient};
use crate::runtime::ServiceInfo;
use dashmap::DashMap;
use hyper::Uri;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// A load balancer whose servers need active health checking.
pub struct HealthTarget {
    pub service: String,
    pub info: Arc<ServiceInfo>,
    pub balancer: Arc<BalancedHandler>,
    pub config: HealthCheck,
    pub servers: Vec<String>,
    pub client: HttpClient,
}

/// Builds HTTP service handlers for one configuration generation.
///
/// Each qualified service is materialized at most once per manager, so every
/// router sharing a service shares one balancer and its round-robin state.
pub struct ServiceManager {
    services: BTreeMap<String, Arc<ServiceInfo>>,
    client: HttpClient,
    cache: DashMap<String, Result<BoxHandler, BuildError>>,
    health_targets: Mutex<Vec<HealthTarget>>,
}

impl ServiceManager {
    pub fn new(services: BTreeMap<String, Arc<ServiceInfo>>, client: HttpClient) -> Self {
        Self {
            services,
            client,
            cache: DashMap::new(),
            health_targets: Mutex::new(Vec::new()),
        }
    }

    /// Build (or fetch the already built) handler for service `name`.
    /// A bare name is qualified with the provider carried by `ctx`.
    pub fn build(&self, ctx: &BuildContext, name: &str) -> Result<BoxHandler, BuildError> {
        let qualified = ctx.qualify(name);

        if let Some(cached) = self.cache.get(&qualified) {
            return cached.clone();
        }

        let Some(info) = self.services.get(&qualified).cloned() else {
            return Err(BuildError::ServiceNotFound(qualified));
        };

        let result = ctx
            .enter(&qualified)
            .and_then(|ctx| self.build_service(&ctx, &qualified, &info));

        match &result {
            Ok(_) => debug!("Built service '{}'", qualified),
            Err(e) => {
                error!("Failed to build service '{}': {}", qualified, e);
                info.add_error(e, true);
            }
        }

        self.cache.insert(qualified, result.clone());
        result
    }

    /// Number of backends behind `name`: servers for a load balancer,
    /// sub-services for a weighted service.
    pub fn server_count(&self, ctx: &BuildContext, name: &str) -> usize {
        let Some(info) = self.services.get(&ctx.qualify(name)) else {
            return 0;
        };
        match (&info.service.load_balancer, &info.service.weighted) {
            (Some(lb), _) => lb.servers.len(),
            (None, Some(w)) => w.services.len(),
            (None, None) => 0,
        }
    }

    /// Health check registrations collected while building.
    pub fn take_health_targets(&self) -> Vec<HealthTarget> {
        std::mem::take(&mut *self.health_targets.lock())
    }

    fn build_service(
        &self,
        ctx: &BuildContext,
        name: &str,
        info: &Arc<ServiceInfo>,
    ) -> Result<BoxHandler, BuildError> {
        match (&info.service.load_balancer, &info.service.weighted) {
            (Some(lb), None) => self.build_load_balancer(name, info, lb),
            (None, Some(weighted)) => self.build_weighted(ctx, name, weighted),
            _ => Err(BuildError::InvalidServiceVariant(name.to_string())),
        }
    }

    fn build_load_balancer(
        &self,
        name: &str,
        info: &Arc<ServiceInfo>,
        lb: &ServersLoadBalancer,
    ) -> Result<BoxHandler, BuildError> {
        let mut members: Vec<(String, BoxHandler, u32)> = Vec::with_capacity(lb.servers.len());

        for server in &lb.servers {
            let invalid = |reason: String| BuildError::InvalidServerUrl {
                service: name.to_string(),
                url: server.url.clone(),
                reason,
            };

            let uri: Uri = server
                .url
                .parse()
                .map_err(|e: hyper::http::uri::InvalidUri| invalid(e.to_string()))?;
            if uri.host().is_none() {
                return Err(invalid("missing host".to_string()));
            }
            if uri.port().is_none() {
                return Err(BuildError::MissingPort {
                    service: name.to_string(),
                    address: server.url.clone(),
                });
            }

            let forwarder = Forwarder::new(&server.url, lb.pass_host_header, self.client.clone())
                .map_err(|e| invalid(e.to_string()))?;

            info.update_server_status(&server.url, "UP");
            members.push((server.url.clone(), Arc::new(forwarder) as BoxHandler, server.weight));
        }

        info!("Service '{}' balancing across {} servers", name, members.len());

        let sticky = sticky_cookie(lb.sticky.as_ref(), name);
        let balancer = Arc::new(BalancedHandler::new(name, members, sticky));

        if let Some(health_check) = &lb.health_check {
            self.health_targets.lock().push(HealthTarget {
                service: name.to_string(),
                info: info.clone(),
                balancer: balancer.clone(),
                config: health_check.clone(),
                servers: lb.servers.iter().map(|s| s.url.clone()).collect(),
                client: self.client.clone(),
            });
        }

        Ok(balancer as BoxHandler)
    }

    fn build_weighted(
        &self,
        ctx: &BuildContext,
        name: &str,
        weighted: &WeightedRoundRobin,
    ) -> Result<BoxHandler, BuildError> {
        let mut members: Vec<(String, BoxHandler, u32)> = Vec::with_capacity(weighted.services.len());

        for child in &weighted.services {
            let handler = self.build(ctx, &child.name)?;
            members.push((ctx.qualify(&child.name), handler, child.weight));
        }

        let sticky = sticky_cookie(weighted.sticky.as_ref(), name);
        Ok(Arc::new(BalancedHandler::new(name, members, sticky)) as BoxHandler)
    }
}

fn sticky_cookie(sticky: Option<&Sticky>, service: &str) -> Option<StickyCookie> {
    sticky
        .and_then(|s| s.cookie.as_ref())
        .map(|cookie| StickyCookie::new(cookie, service))
}
