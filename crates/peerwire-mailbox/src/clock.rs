use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peerwire_proto::{wall_clock_millis, Stamp};

/// Source of wall-clock milliseconds for the store.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> Stamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Stamp {
        wall_clock_millis()
    }
}

/// Hand-driven clock for exercising retention and sweep windows.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Stamp) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start),
        })
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Stamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Hands out strictly increasing stamps: `max(now, last + 1)`.
pub struct StampClock {
    source: Arc<dyn Clock>,
    last: AtomicU64,
}

impl StampClock {
    pub fn new(source: Arc<dyn Clock>) -> Self {
        Self {
            source,
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> Stamp {
        let now = self.source.now_millis();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(observed) => last = observed,
            }
        }
    }

    /// Wall-clock reading without consuming a stamp.
    pub fn now(&self) -> Stamp {
        self.source.now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn stamps_increase_even_when_clock_stalls() {
        let clock = ManualClock::new(1_000);
        let stamps = StampClock::new(clock.clone());
        let first = stamps.next();
        let second = stamps.next();
        assert_eq!(first, 1_000);
        assert_eq!(second, 1_001);

        clock.advance(Duration::from_millis(500));
        assert_eq!(stamps.next(), 1_500);
    }
}
