use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::Config;
use crate::error::Error;

/// Request budget against the reporting API, shared by every pipeline in the
/// process.
///
/// Bounds the number of in-flight calls and enforces a minimum spacing
/// between call starts. Cloning yields a handle onto the same budget.
#[derive(Clone)]
pub struct ApiBudget {
    permits: Arc<Semaphore>,
    next_slot: Arc<Mutex<Instant>>,
    min_interval: Duration,
}

impl ApiBudget {
    pub fn new(max_in_flight: usize, min_interval: Duration) -> Self {
        ApiBudget {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            next_slot: Arc::new(Mutex::new(Instant::now())),
            min_interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_concurrent_requests, config.min_request_interval())
    }

    /// Waits for a call slot. The returned permit must be held for the
    /// duration of the request.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, Error> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Configuration("API budget closed".to_string()))?;

        let wait_until = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next_slot).max(now);
            *next_slot = slot + self.min_interval;
            slot
        };

        if wait_until > Instant::now() {
            debug!(
                "throttling API call for {}ms",
                (wait_until - Instant::now()).as_millis()
            );
            tokio::time::sleep_until(wait_until).await;
        }

        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_budget_bounds_in_flight_calls() {
        let budget = ApiBudget::new(2, Duration::ZERO);

        let first = budget.acquire().await.unwrap();
        let _second = budget.acquire().await.unwrap();
        assert_eq!(budget.permits.available_permits(), 0);

        let shared = budget.clone();
        let waiter = tokio::spawn(async move { shared.acquire().await.map(|_| ()) });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_spaces_call_starts() {
        let budget = ApiBudget::new(4, Duration::from_millis(500));
        let started = Instant::now();

        for _ in 0..3 {
            let _permit = budget.acquire().await.unwrap();
        }

        assert!(started.elapsed() >= Duration::from_millis(1000));
    }
}
