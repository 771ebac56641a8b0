//! Bounds simultaneous portal fetches and spaces successive requests.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Duration, Instant};

/// Admission gate for portal requests: a fixed number of slots plus a minimum
/// spacing between consecutive request starts.
///
/// Admission is FIFO-ish; completion order across concurrent fetches is not
/// guaranteed, and callers must not rely on it.
#[derive(Clone)]
pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
    next_slot: Arc<Mutex<Option<Instant>>>,
    spacing: Duration,
}

/// Held for the duration of one fetch; the slot frees on drop, on every exit
/// path including task failure.
pub struct ScopedPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(max_in_flight: usize, spacing: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            next_slot: Arc::new(Mutex::new(None)),
            spacing,
        }
    }

    /// Suspends until a slot is free and the pacing interval has elapsed.
    pub async fn acquire(&self) -> ScopedPermit {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("gate semaphore closed");

        // Claim the next start time under the lock, then sleep outside it so
        // waiting here never blocks other acquirers from claiming later slots.
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let at = next.map_or(now, |slot| slot.max(now));
            *next = Some(at + self.spacing);
            at.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }

        ScopedPermit { _permit: permit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn bounds_in_flight_requests() {
        let gate = ConcurrencyGate::new(1, Duration::ZERO);
        let held = gate.acquire().await;

        let denied = timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(denied.is_err(), "second permit granted while first held");

        drop(held);
        let granted = timeout(Duration::from_millis(200), gate.acquire()).await;
        assert!(granted.is_ok(), "permit not released on drop");
    }

    #[tokio::test(start_paused = true)]
    async fn spacing_is_enforced_between_starts() {
        let gate = ConcurrencyGate::new(4, Duration::from_millis(100));
        let started = Instant::now();
        let _first = gate.acquire().await;
        let _second = gate.acquire().await;
        let _third = gate.acquire().await;
        assert!(
            started.elapsed() >= Duration::from_millis(200),
            "third request started after {:?}",
            started.elapsed()
        );
    }
}
