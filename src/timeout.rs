//! One-shot wake-up tokens handed to host event loops.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

/// A "call me after this long" token.
///
/// The connection registers one per pending call through the timeout hooks.
/// The host arranges a wake-up [`Timeout::interval`] after registration (or
/// after the last restart) and calls `Connection::handle_timeout` when it
/// fires; a disabled timeout must not fire. Clones share one state.
#[derive(Clone)]
pub struct Timeout {
    inner: Arc<TimeoutInner>,
}

struct TimeoutInner {
    interval: Duration,
    enabled: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

impl Timeout {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            inner: Arc::new(TimeoutInner {
                interval,
                enabled: AtomicBool::new(true),
                deadline: Mutex::new(Some(Instant::now() + interval)),
            }),
        }
    }

    /// The requested delay.
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Whether the timeout is still armed.
    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// The absolute point the timeout should fire at, while armed.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.enabled() {
            return None;
        }
        self.inner.deadline.lock().ok().and_then(|d| *d)
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline(), Some(deadline) if deadline <= now)
    }

    pub(crate) fn disarm(&self) {
        self.inner.enabled.store(false, Ordering::Release);
        if let Ok(mut deadline) = self.inner.deadline.lock() {
            *deadline = None;
        }
    }

    /// Identity comparison: two clones of the same timeout.
    pub fn same_as(&self, other: &Timeout) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("interval", &self.inner.interval)
            .field("enabled", &self.enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_tracks_interval() {
        let timeout = Timeout::new(Duration::from_millis(50));
        let deadline = timeout.deadline().unwrap();
        assert!(deadline > Instant::now());
        assert!(!timeout.is_expired(Instant::now()));
        assert!(timeout.is_expired(Instant::now() + Duration::from_millis(60)));
    }

    #[test]
    fn disarm_clears_the_deadline() {
        let timeout = Timeout::new(Duration::from_millis(5));
        let clone = timeout.clone();
        timeout.disarm();
        assert!(!clone.enabled());
        assert_eq!(clone.deadline(), None);
        assert!(!clone.is_expired(Instant::now() + Duration::from_secs(1)));
    }
}
