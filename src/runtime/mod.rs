//! Runtime view of the merged dynamic configuration.
//!
//! A [`RuntimeConfiguration`] is built from scratch on every reload, annotated
//! by the builders, and then published as an immutable snapshot.

mod info;
pub mod names;

pub use info::{
    MiddlewareInfo, RouterInfo, RuntimeStatus, ServiceInfo, TcpRouterInfo, TcpServiceInfo,
};

use crate::config::dynamic::{Configuration, Middleware, Router, Service, TcpRouter, TcpService};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

pub type EntryPointRouters<T> = BTreeMap<String, BTreeMap<String, Arc<T>>>;

#[derive(Debug, Default)]
pub struct RuntimeConfiguration {
    pub routers: BTreeMap<String, Arc<RouterInfo>>,
    pub services: BTreeMap<String, Arc<ServiceInfo>>,
    pub middlewares: BTreeMap<String, Arc<MiddlewareInfo>>,
    pub tcp_routers: BTreeMap<String, Arc<TcpRouterInfo>>,
    pub tcp_services: BTreeMap<String, Arc<TcpServiceInfo>>,
}

impl RuntimeConfiguration {
    /// Wrap every entity of an already merged and qualified configuration.
    /// Every entity starts enabled.
    pub fn new(conf: Configuration) -> Self {
        let mut runtime = RuntimeConfiguration::default();

        if let Some(http) = conf.http {
            runtime.routers = wrap(http.routers, RouterInfo::new);
            runtime.services = wrap(http.services, ServiceInfo::new);
            runtime.middlewares = wrap(http.middlewares, MiddlewareInfo::new);
        }

        if let Some(tcp) = conf.tcp {
            runtime.tcp_routers = wrap(tcp.routers, TcpRouterInfo::new);
            runtime.tcp_services = wrap(tcp.services, TcpServiceInfo::new);
        }

        runtime
    }

    /// Link services and middlewares back to the routers that use them.
    ///
    /// References are qualified with the router's provider. Dangling
    /// references are skipped here; the builders report them.
    pub fn populate_used_by(&self) {
        for (router_name, info) in &self.routers {
            let Some(provider) = names::provider_of(router_name) else {
                error!("Router name '{}' is not fully qualified", router_name);
                continue;
            };

            for middleware in &info.router.middlewares {
                let qualified = names::qualify(provider, middleware);
                if let Some(target) = self.middlewares.get(&qualified) {
                    target.push_used_by(router_name);
                }
            }

            let service = names::qualify(provider, &info.router.service);
            if let Some(target) = self.services.get(&service) {
                target.push_used_by(router_name);
            }
        }

        for (router_name, info) in &self.tcp_routers {
            let Some(provider) = names::provider_of(router_name) else {
                error!("TCP router name '{}' is not fully qualified", router_name);
                continue;
            };

            let service = names::qualify(provider, &info.router.service);
            if let Some(target) = self.tcp_services.get(&service) {
                target.push_used_by(router_name);
            }
        }

        self.services.values().for_each(|s| s.sort_used_by());
        self.middlewares.values().for_each(|m| m.sort_used_by());
        self.tcp_services.values().for_each(|s| s.sort_used_by());
    }

    /// HTTP routers grouped by entry point.
    ///
    /// Only routers whose TLS setting matches `tls` are returned. A router
    /// without entry points is attached to all of `entry_points`; unknown
    /// entry point names are reported on the router and dropped.
    pub fn get_routers_by_entry_points(
        &self,
        entry_points: &[String],
        tls: bool,
    ) -> EntryPointRouters<RouterInfo> {
        let mut result: EntryPointRouters<RouterInfo> = BTreeMap::new();

        for (name, info) in &self.routers {
            if info.is_tls() != tls {
                continue;
            }
            for ep in attached_entry_points(&info.router.entry_points, entry_points) {
                if !entry_points.contains(ep) {
                    error!("Router '{}': entry point '{}' doesn't exist", name, ep);
                    info.add_error(format!("entryPoint {:?} doesn't exist", ep), false);
                    continue;
                }
                result
                    .entry(ep.clone())
                    .or_default()
                    .insert(name.clone(), info.clone());
            }
        }

        result
    }

    /// TCP routers grouped by entry point, with the same attachment rules
    /// as [`get_routers_by_entry_points`](Self::get_routers_by_entry_points).
    pub fn get_tcp_routers_by_entry_points(
        &self,
        entry_points: &[String],
    ) -> EntryPointRouters<TcpRouterInfo> {
        let mut result: EntryPointRouters<TcpRouterInfo> = BTreeMap::new();

        for (name, info) in &self.tcp_routers {
            for ep in attached_entry_points(&info.router.entry_points, entry_points) {
                if !entry_points.contains(ep) {
                    error!("TCP router '{}': entry point '{}' doesn't exist", name, ep);
                    info.add_error(format!("entryPoint {:?} doesn't exist", ep), false);
                    continue;
                }
                result
                    .entry(ep.clone())
                    .or_default()
                    .insert(name.clone(), info.clone());
            }
        }

        result
    }

    /// Serializable view for introspection.
    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            routers: view(&self.routers, |name, info| RouterView {
                router: info.router.clone(),
                provider: provider(name),
                status: info.status(),
                errors: info.errors(),
            }),
            services: view(&self.services, |name, info| ServiceView {
                service: info.service.clone(),
                provider: provider(name),
                status: info.status(),
                errors: info.errors(),
                used_by: info.used_by(),
                server_status: info.get_all_status(),
            }),
            middlewares: view(&self.middlewares, |name, info| MiddlewareView {
                middleware: info.middleware.clone(),
                provider: provider(name),
                status: info.status(),
                errors: info.errors(),
                used_by: info.used_by(),
            }),
            tcp_routers: view(&self.tcp_routers, |name, info| TcpRouterView {
                router: info.router.clone(),
                provider: provider(name),
                status: info.status(),
                errors: info.errors(),
            }),
            tcp_services: view(&self.tcp_services, |name, info| TcpServiceView {
                service: info.service.clone(),
                provider: provider(name),
                status: info.status(),
                errors: info.errors(),
                used_by: info.used_by(),
            }),
        }
    }
}

fn wrap<C, I>(entities: BTreeMap<String, C>, new: impl Fn(C) -> I) -> BTreeMap<String, Arc<I>> {
    entities
        .into_iter()
        .map(|(name, conf)| (name, Arc::new(new(conf))))
        .collect()
}

fn attached_entry_points<'a>(declared: &'a [String], all: &'a [String]) -> &'a [String] {
    if declared.is_empty() { all } else { declared }
}

fn provider(name: &str) -> String {
    names::provider_of(name).unwrap_or_default().to_string()
}

fn view<I, V>(
    entities: &BTreeMap<String, Arc<I>>,
    f: impl Fn(&str, &I) -> V,
) -> BTreeMap<String, V> {
    entities
        .iter()
        .map(|(name, info)| (name.clone(), f(name, info)))
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSnapshot {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, RouterView>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceView>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: BTreeMap<String, MiddlewareView>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tcp_routers: BTreeMap<String, TcpRouterView>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tcp_services: BTreeMap<String, TcpServiceView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterView {
    #[serde(flatten)]
    pub router: Router,
    pub provider: String,
    pub status: RuntimeStatus,
    #[serde(rename = "error", skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    #[serde(flatten)]
    pub service: Service,
    pub provider: String,
    pub status: RuntimeStatus,
    #[serde(rename = "error", skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub used_by: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub server_status: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareView {
    #[serde(flatten)]
    pub middleware: Middleware,
    pub provider: String,
    pub status: RuntimeStatus,
    #[serde(rename = "error", skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub used_by: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpRouterView {
    #[serde(flatten)]
    pub router: TcpRouter,
    pub provider: String,
    pub status: RuntimeStatus,
    #[serde(rename = "error", skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpServiceView {
    #[serde(flatten)]
    pub service: TcpService,
    pub provider: String,
    pub status: RuntimeStatus,
    #[serde(rename = "error", skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub used_by: Vec<String>,
}
