pub mod balancer;
pub mod config;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod provider;
pub mod proxy;
pub mod router;
pub mod runtime;
pub mod server;
pub mod service;
pub mod tcp;
pub mod tls;

pub use config::{Configuration, StaticConfig};
pub use runtime::RuntimeConfiguration;
