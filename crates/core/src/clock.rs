//! Time source abstraction.
//!
//! Breaker timers and lease deadlines use the monotonic `now()`; persisted
//! records use `utc_now()`. Tests drive both through [`ManualClock`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant.
    fn now(&self) -> Instant;

    /// Wall-clock time for record timestamps.
    fn utc_now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualTime>>,
}

#[derive(Debug)]
struct ManualTime {
    instant: Instant,
    utc: DateTime<Utc>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualTime {
                instant: Instant::now(),
                utc: Utc::now(),
            })),
        }
    }

    /// Move both the monotonic and the wall-clock time forward.
    pub fn advance(&self, by: Duration) {
        let mut t = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        t.instant += by;
        t.utc += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
    }

    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).instant
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).utc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_on_advance() {
        let clock = ManualClock::new();
        let start = clock.now();
        let start_utc = clock.utc_now();
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(11));
        assert_eq!(clock.now() - start, Duration::from_secs(11));
        assert_eq!((clock.utc_now() - start_utc).num_seconds(), 11);
    }

    #[test]
    fn shared_handles_observe_the_same_time() {
        let clock = ManualClock::new();
        let shared = clock.shared();
        clock.advance(Duration::from_millis(250));
        assert_eq!(shared.now(), clock.now());
    }
}
