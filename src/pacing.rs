//! Global request pacing
//!
//! The RequestPacer enforces a minimum spacing between request starts across all
//! download workers, using lock-free slot reservation on a shared atomic clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global request pacer shared across all workers
///
/// Each call to [`acquire`](RequestPacer::acquire) reserves the next free start
/// slot and sleeps until it arrives. Slots are `interval` apart, so no two
/// requests start closer together than the configured spacing no matter how many
/// workers are running.
///
/// # Implementation
///
/// - `interval_nanos`: minimum spacing in nanoseconds (0 = unpaced)
/// - `next_slot`: earliest start time of the next request (nanoseconds since an
///   arbitrary process-local epoch)
#[derive(Clone, Debug)]
pub struct RequestPacer {
    /// Minimum spacing in nanoseconds (0 = unpaced)
    interval_nanos: Arc<AtomicU64>,
    /// Earliest start of the next request
    next_slot: Arc<AtomicU64>,
}

impl RequestPacer {
    /// Create a pacer with the given minimum spacing (None = unpaced)
    ///
    /// # Examples
    ///
    /// ```
    /// use filing_dl::pacing::RequestPacer;
    /// use std::time::Duration;
    ///
    /// let pacer = RequestPacer::new(Some(Duration::from_millis(500)));
    /// assert_eq!(pacer.interval(), Some(Duration::from_millis(500)));
    ///
    /// let unpaced = RequestPacer::new(None);
    /// assert_eq!(unpaced.interval(), None);
    /// ```
    #[must_use]
    pub fn new(interval: Option<Duration>) -> Self {
        let nanos = interval.map(|d| d.as_nanos() as u64).unwrap_or(0);
        Self {
            interval_nanos: Arc::new(AtomicU64::new(nanos)),
            next_slot: Arc::new(AtomicU64::new(Self::now_nanos())),
        }
    }

    /// Current spacing, None when unpaced
    pub fn interval(&self) -> Option<Duration> {
        let nanos = self.interval_nanos.load(Ordering::Relaxed);
        if nanos == 0 {
            None
        } else {
            Some(Duration::from_nanos(nanos))
        }
    }

    /// Wait for this caller's request slot
    pub async fn acquire(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Reserve the next slot and return how long to wait for it
    fn reserve(&self) -> Duration {
        loop {
            let interval = self.interval_nanos.load(Ordering::Relaxed);
            if interval == 0 {
                return Duration::ZERO;
            }

            let now = Self::now_nanos();
            let slot = self.next_slot.load(Ordering::SeqCst);
            let start = slot.max(now);
            if self
                .next_slot
                .compare_exchange(slot, start + interval, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Duration::from_nanos(start - now);
            }
            // Another worker took the slot, try the next one
        }
    }

    /// Monotonic nanoseconds since the first call in this process
    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unpaced_returns_immediately() {
        let pacer = RequestPacer::new(None);

        let start = Instant::now();
        for _ in 0..100 {
            pacer.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn test_reservations_are_spaced() {
        let pacer = RequestPacer::new(Some(Duration::from_millis(100)));

        let first = pacer.reserve();
        let second = pacer.reserve();
        let third = pacer.reserve();

        assert!(first <= Duration::from_millis(1), "first slot is immediate");
        assert!(second > Duration::from_millis(90) && second <= Duration::from_millis(100));
        assert!(third > Duration::from_millis(190) && third <= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_concurrent_workers_share_spacing() {
        let pacer = RequestPacer::new(Some(Duration::from_millis(20)));
        let start = Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let pacer = pacer.clone();
                tokio::spawn(async move {
                    pacer.acquire().await;
                    Instant::now()
                })
            })
            .collect();
        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap());
        }

        // five starts at 20ms spacing span at least 80ms
        let last = starts.iter().max().unwrap();
        assert!(last.duration_since(start) >= Duration::from_millis(80));
    }

    #[test]
    fn test_clones_share_one_schedule() {
        let pacer = RequestPacer::new(Some(Duration::from_millis(100)));
        let shared = pacer.clone();

        assert!(pacer.reserve() <= Duration::from_millis(1));
        let next = shared.reserve();
        assert!(next > Duration::from_millis(90) && next <= Duration::from_millis(100));
    }
}
