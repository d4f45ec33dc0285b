use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Counts the open connections of one entry point so shutdown can wait for
/// them to finish.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: AtomicUsize,
    draining: AtomicBool,
    idle: Notify,
}

/// Held for the lifetime of one connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new connection. Refused once draining has started.
    pub fn connection_start(self: &Arc<Self>) -> Option<ConnectionGuard> {
        if self.draining.load(Ordering::Acquire) {
            return None;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        Some(ConnectionGuard {
            tracker: Arc::clone(self),
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Refuse new connections and wait up to `grace` for the open ones.
    /// Returns true when every connection finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.draining.store(true, Ordering::Release);
        let deadline = Instant::now() + grace;

        loop {
            let idle = self.idle.notified();
            if self.active() == 0 {
                return true;
            }
            if timeout_at(deadline, idle).await.is_err() {
                return self.active() == 0;
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_waits_for_connections() {
        let tracker = ConnectionTracker::new();
        let first = tracker.connection_start().unwrap();
        let second = tracker.connection_start().unwrap();
        assert_eq!(tracker.active(), 2);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(first);
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(second);
        });

        assert!(tracker.drain(Duration::from_secs(5)).await);
        assert_eq!(tracker.active(), 0);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_refuses_new_connections_and_times_out() {
        let tracker = ConnectionTracker::new();
        let _held = tracker.connection_start().unwrap();

        assert!(!tracker.drain(Duration::from_millis(50)).await);
        assert!(tracker.is_draining());
        assert!(tracker.connection_start().is_none());
        assert_eq!(tracker.active(), 1);
    }

    #[tokio::test]
    async fn test_drain_with_nothing_open() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.drain(Duration::from_millis(10)).await);
    }
}
