use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{trace, warn};

/// Caps simultaneous outbound requests.
///
/// Waiters are admitted in the order they started waiting (the semaphore is
/// fair); completion order is whatever the network gives.
#[derive(Debug, Clone)]
pub struct Limiter {
    permits: Arc<Semaphore>,
    max: usize,
}

impl Limiter {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        self.max - self.permits.available_permits()
    }

    /// Runs `fut` once a slot is free. The future is not polled before then.
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        match self.permits.acquire().await {
            Ok(_permit) => {
                trace!(in_flight = self.in_flight(), "limiter slot taken");
                fut.await
            }
            Err(_) => {
                warn!("limiter closed; running unthrottled");
                fut.await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_cap() {
        let limiter = Limiter::new(4);
        let current = Cell::new(0usize);
        let peak = Cell::new(0usize);
        let (current, peak) = (&current, &peak);
        let jobs = (0..10u64).map(|i| {
            limiter.run(async move {
                current.set(current.get() + 1);
                peak.set(peak.get().max(current.get()));
                tokio::time::sleep(Duration::from_millis(5 + i % 3)).await;
                current.set(current.get() - 1);
                i
            })
        });
        let out = join_all(jobs).await;
        assert_eq!(out, (0..10).collect::<Vec<_>>());
        assert_eq!(peak.get(), 4);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn queued_calls_start_in_arrival_order() {
        let limiter = Limiter::new(1);
        let started = RefCell::new(Vec::new());
        let started = &started;
        let jobs = (0..5).map(|i| {
            limiter.run(async move {
                started.borrow_mut().push(i);
                tokio::time::sleep(Duration::from_millis(1)).await;
            })
        });
        join_all(jobs).await;
        assert_eq!(*started.borrow(), vec![0, 1, 2, 3, 4]);
    }
}
