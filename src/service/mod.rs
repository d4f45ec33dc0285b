mod load_balancer;
mod manager;

pub use load_balancer::BalancedHandler;
pub use manager::{HealthTarget, ServiceManager};

use crate::runtime::names;
use thiserror::Error;

/// Errors raised while turning configuration into handlers. They are
/// recorded on the runtime entity they concern rather than aborting a reload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("the service {0:?} does not exist")]
    ServiceNotFound(String),

    #[error("the middleware {0:?} does not exist")]
    MiddlewareNotFound(String),

    #[error("service {0:?} must define exactly one of loadBalancer or weighted")]
    InvalidServiceVariant(String),

    #[error("in service {service}: address {address}: missing port in address")]
    MissingPort { service: String, address: String },

    #[error("in service {service}: invalid server URL {url:?}: {reason}")]
    InvalidServerUrl {
        service: String,
        url: String,
        reason: String,
    },

    #[error("recursion detected in {0}")]
    Recursion(String),

    #[error("middleware {name:?}: {reason}")]
    InvalidMiddleware { name: String, reason: String },

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("service {0:?} is disabled")]
    Disabled(String),
}

/// Where a build is happening: the provider used to qualify bare names and
/// the chain of entities currently being built, for recursion detection.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    provider: Option<String>,
    stack: Vec<String>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for building on behalf of the entity `name`, whose provider
    /// qualifies any bare reference it makes.
    pub fn for_entity(name: &str) -> Self {
        Self {
            provider: names::provider_of(name).map(str::to_string),
            stack: Vec::new(),
        }
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn qualify(&self, name: &str) -> String {
        match &self.provider {
            Some(provider) => names::qualify(provider, name),
            None => name.to_string(),
        }
    }

    /// Descend into `name`, failing if it is already being built.
    pub fn enter(&self, name: &str) -> Result<BuildContext, BuildError> {
        if self.stack.iter().any(|n| n == name) {
            let mut path = self.stack.clone();
            path.push(name.to_string());
            return Err(BuildError::Recursion(path.join(" -> ")));
        }

        let mut stack = self.stack.clone();
        stack.push(name.to_string());
        Ok(BuildContext {
            provider: names::provider_of(name)
                .map(str::to_string)
                .or_else(|| self.provider.clone()),
            stack,
        })
    }
}
