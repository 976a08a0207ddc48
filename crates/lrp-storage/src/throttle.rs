//! Request spacing and bounded worker pools.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum delay between consecutive callers.
#[derive(Debug)]
pub struct MinIntervalGate {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl MinIntervalGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until at least `interval` has passed since the previous caller was released.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Runs a batch of jobs with at most `workers` in flight.
///
/// When a gate is attached each job waits on it before starting. Clients that already space
/// their own requests (see [`crate::HttpFetcher`]) are usually driven through an ungated pool.
#[derive(Debug, Clone)]
pub struct RateLimitedPool {
    workers: usize,
    gate: Option<Arc<MinIntervalGate>>,
}

impl RateLimitedPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<MinIntervalGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Results come back in completion order; pair them with their input inside `job`.
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, job: F) -> Vec<R>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = R>,
    {
        stream::iter(items)
            .map(|item| {
                let gate = self.gate.clone();
                let fut = job(item);
                async move {
                    if let Some(gate) = gate {
                        gate.wait().await;
                    }
                    fut.await
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await
    }
}
