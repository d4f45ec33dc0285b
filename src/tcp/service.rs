use super::{BoxConnection, BoxTcpHandler, TcpHandler, TcpProxy};
use crate::balancer::WeightedRoundRobin;
use crate::config::dynamic::{TcpServersLoadBalancer, TcpWeightedRoundRobin};
use crate::proxy::BoxFuture;
use crate::runtime::TcpServiceInfo;
use crate::service::{BuildContext, BuildError};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Builds TCP service handlers for one configuration generation.
pub struct TcpServiceManager {
    services: BTreeMap<String, Arc<TcpServiceInfo>>,
    dial_timeout: Duration,
    cache: DashMap<String, Result<BoxTcpHandler, BuildError>>,
}

impl TcpServiceManager {
    pub fn new(services: BTreeMap<String, Arc<TcpServiceInfo>>, dial_timeout: Duration) -> Self {
        Self {
            services,
            dial_timeout,
            cache: DashMap::new(),
        }
    }

    pub fn build(&self, ctx: &BuildContext, name: &str) -> Result<BoxTcpHandler, BuildError> {
        let qualified = ctx.qualify(name);

        if let Some(cached) = self.cache.get(&qualified) {
            return cached.clone();
        }

        let Some(info) = self.services.get(&qualified).cloned() else {
            return Err(BuildError::ServiceNotFound(qualified));
        };

        let result = ctx.enter(&qualified).and_then(|ctx| {
            match (&info.service.load_balancer, &info.service.weighted) {
                (Some(lb), None) => self.build_load_balancer(&qualified, lb),
                (None, Some(weighted)) => self.build_weighted(&ctx, &qualified, weighted),
                _ => Err(BuildError::InvalidServiceVariant(qualified.clone())),
            }
        });

        if let Err(e) = &result {
            error!("Failed to build TCP service '{}': {}", qualified, e);
            info.add_error(e, true);
        }

        self.cache.insert(qualified, result.clone());
        result
    }

    fn build_load_balancer(&self, name: &str, lb: &TcpServersLoadBalancer) -> Result<BoxTcpHandler, BuildError> {
        let mut members = Vec::with_capacity(lb.servers.len());

        for server in &lb.servers {
            if !has_port(&server.address) {
                return Err(BuildError::MissingPort {
                    service: name.to_string(),
                    address: server.address.clone(),
                });
            }

            let proxy = TcpProxy::new(&server.address, lb.termination_delay(), self.dial_timeout);
            members.push((Arc::new(proxy) as BoxTcpHandler, server.weight));
        }

        info!("TCP service '{}' balancing across {} servers", name, members.len());
        Ok(Arc::new(TcpBalancer::new(name, members)) as BoxTcpHandler)
    }

    fn build_weighted(
        &self,
        ctx: &BuildContext,
        name: &str,
        weighted: &TcpWeightedRoundRobin,
    ) -> Result<BoxTcpHandler, BuildError> {
        let mut members = Vec::with_capacity(weighted.services.len());
        for child in &weighted.services {
            members.push((self.build(ctx, &child.name)?, child.weight));
        }
        Ok(Arc::new(TcpBalancer::new(name, members)) as BoxTcpHandler)
    }
}

/// `host:port`, `ip:port` or `[v6]:port`.
fn has_port(address: &str) -> bool {
    if address.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Weighted selection over TCP handlers.
struct TcpBalancer {
    service: String,
    wrr: WeightedRoundRobin<BoxTcpHandler>,
}

impl TcpBalancer {
    fn new(service: &str, members: Vec<(BoxTcpHandler, u32)>) -> Self {
        Self {
            service: service.to_string(),
            wrr: WeightedRoundRobin::new(members),
        }
    }
}

impl TcpHandler for TcpBalancer {
    fn serve_tcp(&self, conn: BoxConnection) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match self.wrr.next() {
                Some((index, handler)) => {
                    debug!("TCP service '{}' selected member {}", self.service, index);
                    let handler = handler.clone();
                    handler.serve_tcp(conn).await;
                }
                None => error!("TCP: No available server for service '{}'", self.service),
            }
        })
    }
}
