use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SLOTS: u64 = 60;

#[derive(Clone, Copy, Default)]
struct Slot {
    tick: u64,
    count: u64,
}

/// Counts events over a trailing window, bucketed into 60 slots.
pub(crate) struct RateCounter {
    slots: Mutex<[Slot; SLOTS as usize]>,
    resolution: Duration,
    started: Instant,
}

impl RateCounter {
    pub(crate) fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    pub(crate) fn new(window: Duration) -> Self {
        let resolution = (window / SLOTS as u32).max(Duration::from_millis(1));
        Self {
            slots: Mutex::new([Slot::default(); SLOTS as usize]),
            resolution,
            started: Instant::now(),
        }
    }

    fn tick(&self) -> u64 {
        (self.started.elapsed().as_nanos() / self.resolution.as_nanos()) as u64
    }

    pub(crate) fn incr(&self, n: u64) {
        let tick = self.tick();
        let mut slots = self.slots.lock();
        let slot = &mut slots[(tick % SLOTS) as usize];
        if slot.tick != tick {
            *slot = Slot { tick, count: 0 };
        }
        slot.count += n;
    }

    /// Events recorded within the trailing window.
    pub(crate) fn rate(&self) -> u64 {
        let tick = self.tick();
        self.slots
            .lock()
            .iter()
            .filter(|s| s.count > 0 && tick.saturating_sub(s.tick) < SLOTS)
            .map(|s| s.count)
            .sum()
    }
}

/// Caps how many messages a pipe queues per window. Once the cap is hit the
/// caller sleeps out the remainder of the window, or until `shutdown` fires.
pub(crate) struct SlidingWindow {
    rate: usize,
    duration: Duration,
    start: Instant,
    count: usize,
}

impl SlidingWindow {
    /// Returns `None` for a limit that cannot be enforced.
    pub(crate) fn new(rate: usize, duration: Duration) -> Option<Self> {
        if rate == 0 || duration.is_zero() {
            return None;
        }
        Some(Self {
            rate,
            duration,
            start: Instant::now(),
            count: 0,
        })
    }

    /// Records one queued message. Returns true if the window was full and
    /// the call slept.
    pub(crate) async fn record(&mut self, shutdown: &CancellationToken) -> bool {
        if self.start.elapsed() >= self.duration {
            self.start = Instant::now();
            self.count = 0;
        }

        self.count += 1;
        if self.count < self.rate {
            return false;
        }

        let wait = self.duration.saturating_sub(self.start.elapsed());
        info!(
            rate = self.rate,
            window_secs = self.duration.as_secs_f64(),
            wait_ms = wait.as_millis() as u64,
            "sliding window limit reached, pausing"
        );
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.cancelled() => {}
        }

        self.start = Instant::now();
        self.count = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_counts_within_window() {
        let counter = RateCounter::per_minute();
        counter.incr(3);
        tokio::time::advance(Duration::from_secs(10)).await;
        counter.incr(2);
        assert_eq!(counter.rate(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_forgets_old_slots() {
        let counter = RateCounter::per_minute();
        counter.incr(4);
        tokio::time::advance(Duration::from_secs(61)).await;
        counter.incr(1);
        assert_eq!(counter.rate(), 1);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(counter.rate(), 0);
    }

    #[test]
    fn test_window_rejects_unusable_limits() {
        assert!(SlidingWindow::new(0, Duration::from_secs(1)).is_none());
        assert!(SlidingWindow::new(5, Duration::ZERO).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_sleeps_each_time_the_cap_is_hit() {
        let mut window = SlidingWindow::new(5, Duration::from_secs(1)).unwrap();
        let token = CancellationToken::new();
        let started = Instant::now();

        let mut sleeps = 0;
        for _ in 0..12 {
            if window.record(&token).await {
                sleeps += 1;
            }
        }

        assert_eq!(sleeps, 2);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_it_elapses() {
        let mut window = SlidingWindow::new(3, Duration::from_secs(1)).unwrap();
        let token = CancellationToken::new();
        assert!(!window.record(&token).await);
        assert!(!window.record(&token).await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!window.record(&token).await);
        assert!(!window.record(&token).await);
        assert!(window.record(&token).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_sleep_ends_on_shutdown() {
        let mut window = SlidingWindow::new(2, Duration::from_secs(3600)).unwrap();
        let token = CancellationToken::new();
        assert!(!window.record(&token).await);

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        assert!(window.record(&token).await);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
