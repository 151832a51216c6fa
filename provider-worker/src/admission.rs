use std::sync::{Arc, Mutex, PoisonError};
use std::time;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::error;

use crate::error::WorkerError;

/// Number of lookups dispatched but not yet drained.
///
/// Only feeds the backpressure decision. Whether a lookup may start at all is
/// decided by the token pool.
#[derive(Default)]
pub struct InFlightCounter {
    count: Mutex<usize>,
}

impl InFlightCounter {
    pub fn increment(&self) -> usize {
        let mut count = self.lock();
        *count += 1;
        *count
    }

    /// Saturates at zero: a decrement without a matching increment is a bug we
    /// report rather than let wrap around.
    pub fn decrement(&self) -> usize {
        let mut count = self.lock();
        match count.checked_sub(1) {
            Some(decremented) => *count = decremented,
            None => error!("in-flight counter decremented below zero"),
        }
        *count
    }

    pub fn get(&self) -> usize {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Gates how much resolution work the pipeline takes on.
///
/// Two independent knobs:
/// * a token pool of fixed capacity, one token per admitted entry, held until
///   the entry reaches a terminal state;
/// * a coarse pause: every `batch_size` dispatches, if more than
///   `wait_threshold` lookups are still in flight, intake stops for
///   `pause_duration` even though tokens may be available.
pub struct AdmissionController {
    tokens: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<InFlightCounter>,
    batch_size: usize,
    wait_threshold: usize,
    pause_duration: time::Duration,
    dispatched: usize,
}

impl AdmissionController {
    pub fn new(
        capacity: usize,
        batch_size: usize,
        wait_threshold: usize,
        pause_duration: time::Duration,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            tokens: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(InFlightCounter::default()),
            batch_size,
            wait_threshold,
            pause_duration,
            dispatched: 0,
        }
    }

    /// Wait for a token. The token is released when the returned permit is dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, WorkerError> {
        let permit = self.tokens.clone().acquire_owned().await?;
        self.report_utilization();
        Ok(permit)
    }

    pub fn in_flight(&self) -> Arc<InFlightCounter> {
        self.in_flight.clone()
    }

    pub fn available_tokens(&self) -> usize {
        self.tokens.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Count an entry that went through the dedup decision, looked up or not.
    pub fn record_dispatch(&mut self) {
        self.dispatched += 1;
    }

    /// Returns how long intake should pause, if at all.
    ///
    /// The dispatch count restarts every time a full batch is checked, whether
    /// or not that check results in a pause.
    pub fn check_backpressure(&mut self) -> Option<time::Duration> {
        if self.batch_size == 0 || self.dispatched < self.batch_size {
            return None;
        }
        self.dispatched = 0;

        let in_flight = self.in_flight.get();
        metrics::gauge!("provider_in_flight_lookups").set(in_flight as f64);

        (in_flight > self.wait_threshold).then_some(self.pause_duration)
    }

    pub fn report_utilization(&self) {
        metrics::gauge!("provider_worker_saturation_percent")
            .set(1f64 - self.available_tokens() as f64 / self.capacity as f64);
    }
}
