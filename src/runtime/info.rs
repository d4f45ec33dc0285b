use crate::config::dynamic::{Middleware, Router, Service, TcpRouter, TcpService};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    #[default]
    Enabled,
    Warning,
    Disabled,
}

impl RuntimeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeStatus::Enabled => "enabled",
            RuntimeStatus::Warning => "warning",
            RuntimeStatus::Disabled => "disabled",
        }
    }
}

/// Build-time annotations shared by every runtime entity.
#[derive(Debug, Default)]
pub(crate) struct Annotations {
    state: Mutex<AnnotationState>,
}

#[derive(Debug, Default)]
struct AnnotationState {
    errors: Vec<String>,
    status: RuntimeStatus,
    used_by: Vec<String>,
}

impl Annotations {
    /// Record `err` once. Critical errors disable the entity; other errors
    /// only move an enabled entity to warning.
    fn add_error(&self, entity: &str, err: &dyn Display, critical: bool) {
        let message = err.to_string();
        let mut state = self.state.lock();
        if state.errors.iter().any(|e| *e == message) {
            return;
        }
        state.errors.push(message);

        let next = if critical {
            RuntimeStatus::Disabled
        } else {
            RuntimeStatus::Warning
        };
        if next > state.status {
            warn!("{} status is now {}: {}", entity, next.as_str(), err);
            state.status = next;
        }
    }

    fn status(&self) -> RuntimeStatus {
        self.state.lock().status
    }

    fn errors(&self) -> Vec<String> {
        self.state.lock().errors.clone()
    }

    fn used_by(&self) -> Vec<String> {
        self.state.lock().used_by.clone()
    }

    fn push_used_by(&self, name: &str) {
        self.state.lock().used_by.push(name.to_string());
    }

    fn sort_used_by(&self) {
        self.state.lock().used_by.sort();
    }
}

macro_rules! annotated {
    ($ty:ident, $kind:literal) => {
        impl $ty {
            pub fn add_error(&self, err: impl Display, critical: bool) {
                self.annotations.add_error($kind, &err, critical);
            }

            pub fn status(&self) -> RuntimeStatus {
                self.annotations.status()
            }

            pub fn errors(&self) -> Vec<String> {
                self.annotations.errors()
            }

            pub fn used_by(&self) -> Vec<String> {
                self.annotations.used_by()
            }

            pub(crate) fn push_used_by(&self, name: &str) {
                self.annotations.push_used_by(name);
            }

            pub(crate) fn sort_used_by(&self) {
                self.annotations.sort_used_by();
            }
        }
    };
}

#[derive(Debug)]
pub struct RouterInfo {
    pub router: Router,
    annotations: Annotations,
}

impl RouterInfo {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            annotations: Annotations::default(),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.router.tls.is_some()
    }
}

annotated!(RouterInfo, "router");

#[derive(Debug)]
pub struct MiddlewareInfo {
    pub middleware: Middleware,
    annotations: Annotations,
}

impl MiddlewareInfo {
    pub fn new(middleware: Middleware) -> Self {
        Self {
            middleware,
            annotations: Annotations::default(),
        }
    }
}

annotated!(MiddlewareInfo, "middleware");

#[derive(Debug)]
pub struct ServiceInfo {
    pub service: Service,
    annotations: Annotations,
    /// Keyed by server URL.
    server_status: RwLock<BTreeMap<String, String>>,
}

impl ServiceInfo {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            annotations: Annotations::default(),
            server_status: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn update_server_status(&self, server: &str, status: &str) {
        self.server_status
            .write()
            .insert(server.to_string(), status.to_string());
    }

    /// Copy of the per-server status map. Callers never see the live map.
    pub fn get_all_status(&self) -> BTreeMap<String, String> {
        self.server_status.read().clone()
    }
}

annotated!(ServiceInfo, "service");

#[derive(Debug)]
pub struct TcpRouterInfo {
    pub router: TcpRouter,
    annotations: Annotations,
}

impl TcpRouterInfo {
    pub fn new(router: TcpRouter) -> Self {
        Self {
            router,
            annotations: Annotations::default(),
        }
    }
}

annotated!(TcpRouterInfo, "tcp router");

#[derive(Debug)]
pub struct TcpServiceInfo {
    pub service: TcpService,
    annotations: Annotations,
}

impl TcpServiceInfo {
    pub fn new(service: TcpService) -> Self {
        Self {
            service,
            annotations: Annotations::default(),
        }
    }
}

annotated!(TcpServiceInfo, "tcp service");

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> RouterInfo {
        RouterInfo::new(Router {
            service: "app".into(),
            rule: "Path(`/`)".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_add_error_deduplicates() {
        let info = router();
        info.add_error("boom", false);
        info.add_error("boom", false);
        assert_eq!(info.errors(), vec!["boom"]);
        assert_eq!(info.status(), RuntimeStatus::Warning);
    }

    #[test]
    fn test_status_never_improves() {
        let info = router();
        assert_eq!(info.status(), RuntimeStatus::Enabled);

        info.add_error("fatal", true);
        assert_eq!(info.status(), RuntimeStatus::Disabled);

        info.add_error("minor", false);
        assert_eq!(info.status(), RuntimeStatus::Disabled);
        assert_eq!(info.errors().len(), 2);
    }

    #[test]
    fn test_get_all_status_returns_copy() {
        let info = ServiceInfo::new(Service::default());
        info.update_server_status("http://10.0.0.1:80", "UP");

        let mut copy = info.get_all_status();
        copy.insert("http://10.0.0.2:80".into(), "DOWN".into());

        assert_eq!(info.get_all_status().len(), 1);
        assert_eq!(info.get_all_status()["http://10.0.0.1:80"], "UP");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RuntimeStatus::Disabled).unwrap(),
            "\"disabled\""
        );
    }
}
