//! Minimum spacing between synthesis requests.
//!
//! Every fetch, across every turn, takes the next free slot from one shared
//! [`RequestPacer`].  A rate-limit response pushes the next free slot
//! further out so that the re-queued request (and everyone behind it) backs
//! off together.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

pub struct RequestPacer {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(None),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Sleep until a request slot is free, then take it.
    ///
    /// Nothing is reserved while sleeping, so a caller dropped mid-wait
    /// leaves the schedule as it found it.
    pub async fn wait_turn(&self) {
        loop {
            let free_at = {
                let mut next = self.lock();
                let now = Instant::now();
                match *next {
                    Some(at) if at > now => at,
                    _ => {
                        *next = Some(now + self.spacing);
                        return;
                    }
                }
            };
            tokio::time::sleep_until(free_at).await;
        }
    }

    /// Hold back every request until at least `delay` from now.
    pub fn defer(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut next = self.lock();
        if next.map_or(true, |at| at < until) {
            *next = Some(until);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instant>> {
        self.next_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_request_is_immediate() {
        let pacer = RequestPacer::new(Duration::from_millis(250));
        let start = Instant::now();
        pacer.wait_turn().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_requests_are_spaced() {
        let pacer = RequestPacer::new(Duration::from_millis(250));
        let start = Instant::now();
        for _ in 0..3 {
            pacer.wait_turn().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn defer_pushes_next_slot_out() {
        let pacer = RequestPacer::new(Duration::from_millis(250));
        pacer.wait_turn().await;
        pacer.defer(Duration::from_secs(2));

        let start = Instant::now();
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_defer_never_pulls_slot_in() {
        let pacer = RequestPacer::new(Duration::from_millis(250));
        pacer.defer(Duration::from_secs(2));
        pacer.defer(Duration::from_millis(10));

        let start = Instant::now();
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waits_do_not_delay_later_requests() {
        let pacer = RequestPacer::new(Duration::from_millis(250));
        let start = Instant::now();
        pacer.wait_turn().await;

        for _ in 0..2 {
            let gave_up =
                tokio::time::timeout(Duration::from_millis(1), pacer.wait_turn()).await;
            assert!(gave_up.is_err());
        }

        pacer.wait_turn().await;
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }
}
