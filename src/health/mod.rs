//! Active health checks for load-balancer services.

mod checker;

pub use checker::{HealthChecker, STATUS_DOWN, STATUS_UP};

use crate::service::HealthTarget;
use tokio::task::JoinHandle;

/// The running checkers of one configuration generation. Dropping the
/// group stops them.
#[derive(Default)]
pub struct HealthChecks {
    tasks: Vec<JoinHandle<()>>,
}

impl HealthChecks {
    pub fn start(targets: Vec<HealthTarget>) -> Self {
        let tasks = targets
            .into_iter()
            .map(|target| tokio::spawn(HealthChecker::new(target).start()))
            .collect();
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for HealthChecks {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
