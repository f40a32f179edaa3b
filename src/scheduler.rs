//! Named interval jobs running on background tokio tasks.
//!
//! Each registered job loops sleep → run → sleep on its own task; the first
//! tick fires after one full period. Cancellation aborts the task between
//! (or during) ticks.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
pub struct Scheduler {
    jobs: HashMap<String, JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named periodic job. Re-registering a name replaces the
    /// previous job.
    pub fn register_interval<F, Fut>(&mut self, name: &str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(name);
        let job_name = name.to_string();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                debug!(job = %job_name, "running scheduled job");
                job().await;
            }
        });
        self.jobs.insert(name.to_string(), handle);
    }

    /// Cancel a registered job. Returns false when the name is unknown.
    pub fn cancel(&mut self, name: &str) -> bool {
        match self.jobs.remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn registered(&self) -> Vec<&str> {
        self.jobs.keys().map(String::as_str).collect()
    }

    pub fn shutdown(&mut self) {
        for (_, handle) in self.jobs.drain() {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn interval_job_fires_repeatedly() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        let c = counter.clone();
        scheduler.register_interval("tick", Duration::from_secs(60), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(185)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        assert!(scheduler.cancel("tick"));
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_false() {
        let mut scheduler = Scheduler::new();
        assert!(!scheduler.cancel("missing"));

        scheduler.register_interval("noop", Duration::from_secs(3600), || async {});
        assert_eq!(scheduler.registered(), vec!["noop"]);
        assert!(scheduler.cancel("noop"));
        assert!(scheduler.registered().is_empty());
    }
}
